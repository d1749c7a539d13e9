//! provider wiring: build `llm` providers from config and keep the set of
//! reply sources sessions can pick from.

use crate::config::ChatConfig;
use crate::fetcher::{LlmReplySource, ReplySource};
use bevy::prelude::*;
use llm::{
    builder::{LLMBackend, LLMBuilder},
    error::LLMError,
    LLMProvider,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown llm backend `{0}`")]
    UnknownBackend(String),
    #[error("failed to build provider: {0}")]
    Build(#[from] LLMError),
}

/// build an `llm` provider from config. the api key is never logged.
pub fn build_provider(cfg: &ChatConfig) -> Result<Arc<dyn LLMProvider>, ProviderError> {
    info!(
        target: "bevy_chat_analyst",
        "build_provider: backend='{}', model='{}', key_present={}",
        cfg.backend, cfg.model, cfg.api_key.is_some()
    );

    let backend = LLMBackend::from_str(&cfg.backend)
        .map_err(|_| ProviderError::UnknownBackend(cfg.backend.clone()))?;
    let mut b = LLMBuilder::new().backend(backend).model(cfg.model.clone());
    if let Some(key) = &cfg.api_key {
        b = b.api_key(key.clone());
    }
    if let Some(system) = &cfg.system {
        b = b.system(system.clone());
    }
    Ok(b.build()?.into())
}

/// a map of ready-to-use reply sources.
///
/// - `default`: used when a `ChatSession` doesn't specify a `key`
/// - `per_key`: named sources if you want multiple backends/models
#[derive(Resource, Clone)]
pub struct Providers {
    pub default: Arc<dyn ReplySource>,
    pub per_key: HashMap<String, Arc<dyn ReplySource>>,
}

impl Providers {
    pub fn new(default: Arc<dyn ReplySource>) -> Self {
        Self { default, per_key: HashMap::new() }
    }

    pub fn from_llm(provider: Arc<dyn LLMProvider>) -> Self {
        Self::new(Arc::new(LlmReplySource::new(provider)))
    }

    pub fn with(mut self, key: impl Into<String>, source: Arc<dyn ReplySource>) -> Self {
        self.per_key.insert(key.into(), source);
        self
    }

    pub fn get(&self, key: Option<&String>) -> Arc<dyn ReplySource> {
        if let Some(k) = key {
            self.per_key.get(k).cloned().unwrap_or_else(|| self.default.clone())
        } else {
            self.default.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSource;

    #[test]
    fn keyed_lookup_falls_back_to_default() {
        let default = ScriptedSource::new(vec![]);
        let flash = ScriptedSource::new(vec![]);
        let providers = Providers::new(default.clone()).with("flash", flash.clone());

        let call = |key: Option<&str>| {
            let key = key.map(str::to_string);
            let _ = pollster::block_on(providers.get(key.as_ref()).generate("ping"));
        };

        call(Some("flash"));
        assert_eq!((default.calls(), flash.calls()), (0, 1));
        call(Some("missing"));
        call(None);
        assert_eq!((default.calls(), flash.calls()), (2, 1));
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let cfg = ChatConfig {
            backend: "carrier-pigeon".into(),
            ..Default::default()
        };
        assert!(matches!(build_provider(&cfg), Err(ProviderError::UnknownBackend(b)) if b == "carrier-pigeon"));
    }
}
