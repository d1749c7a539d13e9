//! configuration: retry/backoff policy, analysis cadence and provider setup.
//!
//! defaults follow a single canonical policy: 3 attempts, 5s initial backoff,
//! replies cut at 150 chars, analysis every 2nd user turn over the last 4 turns.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: f64 = 5.0;
pub const DEFAULT_REPLY_MAX_CHARS: usize = 150;
pub const DEFAULT_ANALYSIS_CADENCE: usize = 2;
pub const DEFAULT_ANALYSIS_WINDOW: usize = 4;
pub const DEFAULT_BACKEND: &str = "google";
pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{field}` must be at least 1")]
    MustBePositive { field: &'static str },
    #[error("invalid value for `{key}`: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("GOOGLE_API_KEY (or LLM_API_KEY) is not set")]
    MissingApiKey,
}

/// retry policy for a single reply fetch.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchConfig {
    /// upper bound on remote calls per fetch, retries included.
    pub max_retries: u32,
    /// wait before the first retry; doubles after every rate-limited attempt.
    pub initial_delay: Duration,
    /// cut replies to this many chars; `None` keeps them whole.
    pub max_reply_chars: Option<usize>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: Duration::from_secs_f64(DEFAULT_RETRY_DELAY_SECS),
            max_reply_chars: Some(DEFAULT_REPLY_MAX_CHARS),
        }
    }
}

impl FetchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::MustBePositive { field: "max_retries" });
        }
        if self.max_reply_chars == Some(0) {
            return Err(ConfigError::MustBePositive { field: "reply_max_chars" });
        }
        Ok(())
    }

    /// delay before retry number `retry` (1-based): `initial_delay * 2^(retry-1)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalyzerConfig {
    /// how many trailing turns the summary covers.
    pub window: usize,
    /// analyze on every `cadence`-th user turn.
    pub cadence: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_ANALYSIS_WINDOW,
            cadence: DEFAULT_ANALYSIS_CADENCE,
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window == 0 {
            return Err(ConfigError::MustBePositive { field: "analysis_window" });
        }
        if self.cadence == 0 {
            return Err(ConfigError::MustBePositive { field: "analysis_cadence" });
        }
        Ok(())
    }
}

/// everything needed to stand up a chat session: provider + policies.
///
/// loads from a json file (missing fields take defaults) or from env vars.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub backend: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub system: Option<String>,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    /// `None` disables truncation.
    pub reply_max_chars: Option<usize>,
    pub analysis_cadence: usize,
    pub analysis_window: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            system: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            reply_max_chars: Some(DEFAULT_REPLY_MAX_CHARS),
            analysis_cadence: DEFAULT_ANALYSIS_CADENCE,
            analysis_window: DEFAULT_ANALYSIS_WINDOW,
        }
    }
}

impl ChatConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = lookup("LLM_BACKEND") {
            cfg.backend = v;
        }
        if let Some(v) = lookup("LLM_MODEL") {
            cfg.model = v;
        }
        cfg.api_key = lookup("GOOGLE_API_KEY")
            .or_else(|| lookup("LLM_API_KEY"))
            .filter(|k| !k.trim().is_empty());
        cfg.system = lookup("LLM_SYSTEM_PROMPT").filter(|s| !s.trim().is_empty());
        if let Some(v) = lookup("LLM_MAX_RETRIES") {
            cfg.max_retries = parse_value("LLM_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("LLM_RETRY_DELAY_SECS") {
            cfg.retry_delay_secs = parse_value("LLM_RETRY_DELAY_SECS", &v)?;
        }
        if let Some(v) = lookup("LLM_REPLY_MAX_CHARS") {
            let chars: usize = parse_value("LLM_REPLY_MAX_CHARS", &v)?;
            cfg.reply_max_chars = (chars > 0).then_some(chars);
        }
        if let Some(v) = lookup("ANALYSIS_CADENCE") {
            cfg.analysis_cadence = parse_value("ANALYSIS_CADENCE", &v)?;
        }
        if let Some(v) = lookup("ANALYSIS_WINDOW") {
            cfg.analysis_window = parse_value("ANALYSIS_WINDOW", &v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fetch_config()?.validate()?;
        self.analyzer_config().validate()
    }

    /// the api key, or `MissingApiKey` when none was provided.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key.as_deref().ok_or(ConfigError::MissingApiKey)
    }

    pub fn fetch_config(&self) -> Result<FetchConfig, ConfigError> {
        let initial_delay = Duration::try_from_secs_f64(self.retry_delay_secs).map_err(|_| {
            ConfigError::InvalidValue {
                key: "retry_delay_secs".into(),
                value: self.retry_delay_secs.to_string(),
            }
        })?;
        Ok(FetchConfig {
            max_retries: self.max_retries,
            initial_delay,
            max_reply_chars: self.reply_max_chars,
        })
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            window: self.analysis_window,
            cadence: self.analysis_cadence,
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_canonical_policy() {
        let cfg = ChatConfig::default();
        let fetch = cfg.fetch_config().unwrap();
        assert_eq!(fetch, FetchConfig::default());
        assert_eq!(fetch.max_retries, 3);
        assert_eq!(fetch.initial_delay, Duration::from_secs(5));
        assert_eq!(fetch.max_reply_chars, Some(150));
        assert_eq!(cfg.analyzer_config(), AnalyzerConfig { window: 4, cadence: 2 });
    }

    #[test]
    fn delay_doubles_per_retry() {
        let fetch = FetchConfig::default();
        assert_eq!(fetch.delay_for(1), Duration::from_secs(5));
        assert_eq!(fetch.delay_for(2), Duration::from_secs(10));
        assert_eq!(fetch.delay_for(3), Duration::from_secs(20));
    }

    #[test]
    fn env_lookup_overrides_defaults() {
        let cfg = ChatConfig::from_lookup(lookup_from(&[
            ("LLM_MODEL", "gemini-2.0-flash"),
            ("LLM_API_KEY", "secret"),
            ("LLM_MAX_RETRIES", "5"),
            ("LLM_RETRY_DELAY_SECS", "0.5"),
            ("LLM_REPLY_MAX_CHARS", "0"),
            ("ANALYSIS_CADENCE", "4"),
        ]))
        .unwrap();
        assert_eq!(cfg.backend, "google");
        assert_eq!(cfg.model, "gemini-2.0-flash");
        assert_eq!(cfg.api_key.as_deref(), Some("secret"));
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.reply_max_chars, None);
        assert_eq!(cfg.analysis_cadence, 4);
        assert_eq!(cfg.fetch_config().unwrap().initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn google_key_wins_over_generic_key() {
        let cfg = ChatConfig::from_lookup(lookup_from(&[
            ("GOOGLE_API_KEY", "g"),
            ("LLM_API_KEY", "generic"),
        ]))
        .unwrap();
        assert_eq!(cfg.api_key.as_deref(), Some("g"));
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let cfg = ChatConfig::from_lookup(lookup_from(&[("GOOGLE_API_KEY", "   ")])).unwrap();
        let err = cfg.require_api_key().unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiKey));
        assert_eq!(err.to_string(), "GOOGLE_API_KEY (or LLM_API_KEY) is not set");

        let cfg = ChatConfig::from_lookup(lookup_from(&[("LLM_API_KEY", "k")])).unwrap();
        assert_eq!(cfg.require_api_key().unwrap(), "k");
    }

    #[test]
    fn rejects_zero_retries_and_garbage() {
        let err = ChatConfig::from_lookup(lookup_from(&[("LLM_MAX_RETRIES", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { field: "max_retries" }));

        let err = ChatConfig::from_lookup(lookup_from(&[("ANALYSIS_CADENCE", "often")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = ChatConfig::from_lookup(lookup_from(&[("LLM_RETRY_DELAY_SECS", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn loads_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "model": "gemini-1.5-flash", "analysis_cadence": 4 }}"#).unwrap();

        let cfg = ChatConfig::load(file.path()).unwrap();
        assert_eq!(cfg.model, "gemini-1.5-flash");
        assert_eq!(cfg.analysis_cadence, 4);
        assert_eq!(cfg.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        match ChatConfig::load(&path) {
            Err(ConfigError::Io { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn api_key_is_never_serialized() {
        let cfg = ChatConfig {
            api_key: Some("secret".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret"));
    }
}
