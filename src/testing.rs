//! scripted reply sources shared by unit tests.

use crate::fetcher::{ReplySource, SourceError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type Step = Result<Option<String>, SourceError>;

pub fn rate_limited() -> Step {
    Err(SourceError::Remote("429 Too Many Requests".into()))
}

/// plays back `steps` in order, then `fallback` forever.
pub struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    fallback: fn() -> Step,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            fallback: || Err(SourceError::Remote("script exhausted".into())),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn always(step: fn() -> Step) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: step,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplySource for ScriptedSource {
    async fn generate(&self, prompt: &str) -> Result<Option<String>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        let next = self.steps.lock().unwrap().pop_front();
        next.unwrap_or_else(self.fallback)
    }
}

/// panics on its first call, then answers `reply` forever.
pub struct PanicOnceSource {
    reply: &'static str,
    calls: AtomicUsize,
}

impl PanicOnceSource {
    pub fn new(reply: &'static str) -> Arc<Self> {
        Arc::new(Self { reply, calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl ReplySource for PanicOnceSource {
    async fn generate(&self, _prompt: &str) -> Result<Option<String>, SourceError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("source blew up");
        }
        Ok(Some(self.reply.to_string()))
    }
}
