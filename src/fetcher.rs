//! response fetcher: one transcript in, one tagged outcome out.
//!
//! rate-limited calls (http 429 and friends) are retried with exponential
//! backoff; every other failure ends the fetch after a single attempt. the
//! remote error never escapes: callers match on [`FetchOutcome`].

use crate::config::{ConfigError, FetchConfig};
use crate::transcript::Transcript;
use async_trait::async_trait;
use bevy::log::{debug, error, info, warn};
use llm::{
    chat::{ChatMessage, ChatProvider},
    error::LLMError,
    LLMProvider,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const EMPTY_RESULT_TEXT: &str = "Oops, something went wrong.";
pub const QUOTA_EXCEEDED_TEXT: &str = "Error: API limit exceeded. Try again later.";
pub const CANCELLED_TEXT: &str = "Request cancelled.";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Llm(#[from] LLMError),
    #[error("{0}")]
    Remote(String),
}

impl SourceError {
    /// providers surface 429s as text, so classify by message.
    pub fn is_rate_limited(&self) -> bool {
        let msg = self.to_string().to_ascii_lowercase();
        msg.contains("429")
            || msg.contains("rate limit")
            || msg.contains("resource_exhausted")
            || msg.contains("too many requests")
    }
}

/// the remote generation call. `Ok(None)` means the call succeeded but
/// yielded no candidate text.
#[async_trait]
pub trait ReplySource: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Option<String>, SourceError>;
}

/// [`ReplySource`] over an `llm` provider; the prompt goes out as one user message.
#[derive(Clone)]
pub struct LlmReplySource {
    provider: Arc<dyn LLMProvider>,
}

impl LlmReplySource {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ReplySource for LlmReplySource {
    async fn generate(&self, prompt: &str) -> Result<Option<String>, SourceError> {
        let messages = vec![ChatMessage::user().content(prompt).build()];
        let resp = self.provider.chat(&messages).await?;
        Ok(resp.text())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Reply(String),
    RateLimited { attempts: u32 },
    EmptyResult,
    OtherError(String),
    Cancelled,
}

impl FetchOutcome {
    pub fn is_reply(&self) -> bool {
        matches!(self, FetchOutcome::Reply(_))
    }

    /// user-facing text. never empty.
    pub fn display_text(&self) -> String {
        match self {
            FetchOutcome::Reply(text) => text.clone(),
            FetchOutcome::RateLimited { .. } => QUOTA_EXCEEDED_TEXT.to_string(),
            FetchOutcome::EmptyResult => EMPTY_RESULT_TEXT.to_string(),
            FetchOutcome::OtherError(msg) => format!("Error: {msg}"),
            FetchOutcome::Cancelled => CANCELLED_TEXT.to_string(),
        }
    }
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_text())
    }
}

/// emitted right before a backoff wait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryNotice {
    /// the attempt that was rate limited (1-based).
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
}

impl fmt::Display for RetryNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rate limit exceeded. Retrying in {:.1} seconds... ({}/{})",
            self.delay.as_secs_f64(),
            self.attempt,
            self.max_retries
        )
    }
}

#[derive(Clone)]
pub struct ResponseFetcher {
    source: Arc<dyn ReplySource>,
    config: FetchConfig,
}

impl ResponseFetcher {
    pub fn new(source: Arc<dyn ReplySource>, config: FetchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { source, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// fetch a reply for `transcript`.
    ///
    /// makes at most `max_retries` remote calls. `cancel` is checked before
    /// every attempt and interrupts backoff waits; `on_retry` is called once
    /// per backoff.
    pub async fn fetch(
        &self,
        transcript: &Transcript,
        cancel: &CancellationToken,
        mut on_retry: impl FnMut(RetryNotice) + Send,
    ) -> FetchOutcome {
        let prompt = transcript.to_prompt();
        let max_retries = self.config.max_retries;
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                info!(target: "bevy_chat_analyst", "fetch cancelled before attempt {}", attempt + 1);
                return FetchOutcome::Cancelled;
            }
            attempt += 1;
            debug!(target: "bevy_chat_analyst",
                "fetch attempt {}/{} (turns={}, prompt_len={})",
                attempt, max_retries, transcript.len(), prompt.len()
            );

            match self.source.generate(&prompt).await {
                Ok(Some(text)) => {
                    let text = text.trim();
                    if text.is_empty() {
                        warn!(target: "bevy_chat_analyst", "provider returned blank text");
                        return FetchOutcome::EmptyResult;
                    }
                    let text = match self.config.max_reply_chars {
                        Some(max) => truncate_chars(text, max),
                        None => text.to_string(),
                    };
                    return FetchOutcome::Reply(text);
                }
                Ok(None) => {
                    warn!(target: "bevy_chat_analyst", "provider returned no candidates");
                    return FetchOutcome::EmptyResult;
                }
                Err(err) if err.is_rate_limited() => {
                    if attempt >= max_retries {
                        error!(target: "bevy_chat_analyst",
                            "rate limited after {} attempts: {}", attempt, err
                        );
                        return FetchOutcome::RateLimited { attempts: attempt };
                    }
                    let delay = self.config.delay_for(attempt);
                    let notice = RetryNotice { attempt, max_retries, delay };
                    warn!(target: "bevy_chat_analyst", "{}", notice);
                    on_retry(notice);

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(target: "bevy_chat_analyst", "backoff cancelled after attempt {}", attempt);
                            return FetchOutcome::Cancelled;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    error!(target: "bevy_chat_analyst", "fetch failed: {}", err);
                    return FetchOutcome::OtherError(err.to_string());
                }
            }
        }
    }
}

/// cut to at most `max` chars without splitting a code point.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}
