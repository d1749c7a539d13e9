//! turn analyzer: summarize the tail of a conversation and pre-fetch a
//! predicted next reply, every `cadence` user turns.

use crate::config::{AnalyzerConfig, ConfigError};
use crate::fetcher::{FetchOutcome, ResponseFetcher, RetryNotice};
use crate::transcript::{Transcript, Turn};
use bevy::log::info;
use tokio_util::sync::CancellationToken;

pub const NOT_ENOUGH_DATA_TEXT: &str = "Not enough conversation to analyze yet.";
pub const LIMIT_REACHED_TEXT: &str = "API limit reached. Try again later.";
const SUMMARY_PREFIX: &str = "Analysis of the last few messages: ";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Analysis {
    pub summary: String,
    /// the summarized turns, verbatim and in order.
    pub summarized: Vec<Turn>,
    /// `None` when there wasn't enough history to ask the provider.
    pub prediction: Option<FetchOutcome>,
}

impl Analysis {
    fn not_enough_data() -> Self {
        Self {
            summary: NOT_ENOUGH_DATA_TEXT.to_string(),
            summarized: Vec::new(),
            prediction: None,
        }
    }

    /// predicted reply as shown to the user. quota exhaustion gets its own
    /// message instead of the fetcher's.
    pub fn prediction_text(&self) -> String {
        match &self.prediction {
            None => String::new(),
            Some(FetchOutcome::RateLimited { .. }) => LIMIT_REACHED_TEXT.to_string(),
            Some(outcome) => outcome.display_text(),
        }
    }
}

pub fn render_summary(turns: &[Turn]) -> String {
    let joined = turns.iter().map(Turn::to_string).collect::<Vec<_>>().join(", ");
    format!("{SUMMARY_PREFIX}{joined}")
}

#[derive(Clone, Debug, Default)]
pub struct TurnAnalyzer {
    config: AnalyzerConfig,
}

impl TurnAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// true on every positive multiple of the cadence.
    pub fn should_analyze(&self, user_turns: usize) -> bool {
        user_turns > 0 && user_turns % self.config.cadence == 0
    }

    pub async fn analyze(
        &self,
        transcript: &Transcript,
        fetcher: &ResponseFetcher,
        cancel: &CancellationToken,
        on_retry: impl FnMut(RetryNotice) + Send,
    ) -> Analysis {
        if transcript.len() < self.config.window {
            info!(target: "bevy_chat_analyst",
                "analysis skipped: {} turns < window {}", transcript.len(), self.config.window
            );
            return Analysis::not_enough_data();
        }

        let summarized = transcript.last(self.config.window).to_vec();
        let summary = render_summary(&summarized);
        let prediction = fetcher.fetch(transcript, cancel, on_retry).await;
        info!(target: "bevy_chat_analyst",
            "analysis done: window={} prediction_ok={}", summarized.len(), prediction.is_reply()
        );

        Analysis {
            summary,
            summarized,
            prediction: Some(prediction),
        }
    }
}
