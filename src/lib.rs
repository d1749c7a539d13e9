//! bevy_chat_analyst: a bevy chat plugin over the `llm` crate that keeps a
//! role-tagged transcript, fetches replies with 429 backoff, and every few
//! user turns summarizes recent history and pre-fetches a predicted reply.
//!
//! - the session entity owns its state (`Conversation`, `ConversationAnalysis`).
//! - every request sends the whole transcript as one prompt.
//! - never blocks the main thread: requests run on a tiny tokio runtime and
//!   report back through a bounded inbox drained once per frame.
//! - failures come back as a tagged [`FetchOutcome`], not as error strings.
//!
//! api docs for the provider side: https://docs.rs/llm

use bevy::log::warn_once;
use bevy::prelude::*;
use bevy::tasks::AsyncComputeTaskPool;
use flume::{Receiver, Sender};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod analyzer;
pub mod config;
pub mod fetcher;
pub mod provider;
pub mod transcript;

#[cfg(test)]
mod testing;

pub use analyzer::{Analysis, TurnAnalyzer};
pub use config::{AnalyzerConfig, ChatConfig, ConfigError, FetchConfig};
pub use fetcher::{
    FetchOutcome, LlmReplySource, ReplySource, ResponseFetcher, RetryNotice, SourceError,
};
pub use provider::{build_provider, ProviderError, Providers};
pub use transcript::{Role, Transcript, Turn};

/// re-export the llm types so downstream code can build providers directly.
pub use llm::{
    builder::{LLMBackend, LLMBuilder},
    error::LLMError,
    LLMProvider,
};

/// on native we keep a tiny tokio runtime to drive `llm` futures and
/// backoff timers. we spawn onto this rt from compute tasks so neither the
/// main thread nor bevy's compute pools block.
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_chat_analyst", "ChatAnalyst: initializing Tokio multi-thread runtime");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// fetch + analysis policy shared by every session.
#[derive(Resource, Clone, Debug, Default)]
pub struct ChatSettings {
    pub fetch: FetchConfig,
    pub analyzer: TurnAnalyzer,
}

impl ChatSettings {
    pub fn from_config(cfg: &ChatConfig) -> Result<Self, ConfigError> {
        let fetch = cfg.fetch_config()?;
        fetch.validate()?;
        Ok(Self {
            fetch,
            analyzer: TurnAnalyzer::new(cfg.analyzer_config())?,
        })
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum ChatSet {
    /// resets are applied and Chat* events emitted here (in `Update`)
    Drain,
}

/// attach this to an entity you want to chat on. the conversation state
/// components come along with it.
#[derive(Component, Clone, Debug, Default)]
#[require(Conversation, ConversationAnalysis, ChatQueue)]
pub struct ChatSession {
    /// optional key to pick a source from `Providers::per_key`.
    pub key: Option<String>,
}

/// the session transcript. appended as turns complete, cleared on reset.
#[derive(Component, Clone, Debug, Default)]
pub struct Conversation(pub Transcript);

/// latest analysis; each trigger replaces the previous one.
#[derive(Component, Clone, Debug, Default)]
pub struct ConversationAnalysis(pub Option<Analysis>);

/// submitted user texts waiting for the in-flight request to finish.
#[derive(Component, Clone, Debug, Default)]
pub struct ChatQueue(pub VecDeque<String>);

/// marks a session with a running request chain.
#[derive(Component, Clone, Debug)]
pub struct InFlight {
    pub id: u64,
    cancel: CancellationToken,
}

/// insert to clear a session; handled in `ChatSet::Drain`.
#[derive(Component, Clone, Debug, Default)]
pub struct ResetRequest;

/// queue a user message on a session entity. messages are sent one at a time.
pub fn send_user_text(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let text = text.into();
    info!(target: "bevy_chat_analyst", "send_user_text -> '{}' (len={})", text, text.len());
    commands.queue(move |world: &mut World| {
        let Ok(mut entity) = world.get_entity_mut(target) else {
            warn!(target: "bevy_chat_analyst", "send_user_text: entity {:?} is gone", target);
            return;
        };
        match entity.get_mut::<ChatQueue>() {
            Some(mut queue) => queue.0.push_back(text),
            None => warn!(target: "bevy_chat_analyst", "send_user_text: {:?} is not a chat session", target),
        }
    });
}

/// clear a session's transcript and analysis, cancelling any running request.
pub fn reset_session(commands: &mut Commands, target: Entity) {
    info!(target: "bevy_chat_analyst", "reset_session -> {:?}", target);
    commands.entity(target).insert(ResetRequest);
}

/// events emitted by the plugin during/after a chat turn.
#[derive(Event, Debug)]
pub struct ChatStarted {
    pub entity: Entity,
}
/// a rate-limited attempt is about to back off.
#[derive(Event, Debug)]
pub struct ChatRetryEvt {
    pub entity: Entity,
    pub notice: RetryNotice,
}
#[derive(Event, Debug)]
pub struct ChatCompletedEvt {
    pub entity: Entity,
    pub outcome: FetchOutcome,
    /// what was appended to the transcript (the outcome's display text).
    pub text: String,
}
#[derive(Event, Debug)]
pub struct ChatAnalysisEvt {
    pub entity: Entity,
    pub analysis: Analysis,
}
#[derive(Event, Debug)]
pub struct ChatResetEvt {
    pub entity: Entity,
}

#[derive(Resource, Default)]
struct RequestCounter(u64);

/// cross-thread inbox; request tasks send, main thread drains.
/// bounded to avoid unbounded growth when the frame stalls briefly.
#[derive(Resource, Clone)]
struct ChatInbox {
    tx: Sender<InboxMsg>,
    rx: Receiver<InboxMsg>,
}

impl Default for ChatInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

#[derive(Debug)]
enum InboxMsg {
    Retry { entity: Entity, id: u64, notice: RetryNotice },
    Done { entity: Entity, id: u64, outcome: FetchOutcome },
    Analysis { entity: Entity, id: u64, analysis: Analysis },
    Finished { entity: Entity, id: u64 },
}

impl InboxMsg {
    fn target(&self) -> (Entity, u64) {
        match self {
            InboxMsg::Retry { entity, id, .. }
            | InboxMsg::Done { entity, id, .. }
            | InboxMsg::Analysis { entity, id, .. }
            | InboxMsg::Finished { entity, id } => (*entity, *id),
        }
    }
}

/// send to inbox (ignore full/disconnected)
fn push_inbox(tx: &Sender<InboxMsg>, msg: InboxMsg) {
    let _ = tx.send(msg);
}

/// bevy plugin: wires systems, events, resources.
/// requires a `Providers` resource; `ChatSettings` defaults if absent.
pub struct ChatAnalystPlugin;

impl Plugin for ChatAnalystPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_chat_analyst", "ChatAnalystPlugin: build()");
        app.init_resource::<ChatInbox>()
            .init_resource::<RequestCounter>()
            .init_resource::<ChatSettings>()
            .add_event::<ChatStarted>()
            .add_event::<ChatRetryEvt>()
            .add_event::<ChatCompletedEvt>()
            .add_event::<ChatAnalysisEvt>()
            .add_event::<ChatResetEvt>()
            .configure_sets(Update, ChatSet::Drain)
            .add_systems(
                Update,
                (apply_resets, drain_chat_inbox).chain().in_set(ChatSet::Drain),
            )
            .add_systems(Update, spawn_chat_requests.after(ChatSet::Drain));

        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

fn apply_resets(
    mut commands: Commands,
    mut q: Query<
        (
            Entity,
            &mut Conversation,
            &mut ConversationAnalysis,
            &mut ChatQueue,
            Option<&InFlight>,
        ),
        With<ResetRequest>,
    >,
    mut ev_reset: EventWriter<ChatResetEvt>,
) {
    for (e, mut convo, mut analysis, mut queue, in_flight) in q.iter_mut() {
        if let Some(flight) = in_flight {
            info!(target: "bevy_chat_analyst", "reset: cancelling request {} on {:?}", flight.id, e);
            flight.cancel.cancel();
        }
        convo.0.clear();
        analysis.0 = None;
        queue.0.clear();
        commands.entity(e).remove::<(ResetRequest, InFlight)>();
        ev_reset.write(ChatResetEvt { entity: e });
    }
}

/// starts the next queued message for every idle session.
fn spawn_chat_requests(
    mut commands: Commands,
    providers: Option<Res<Providers>>,
    settings: Res<ChatSettings>,
    inbox: Res<ChatInbox>,
    rt: Res<TokioRt>,
    mut counter: ResMut<RequestCounter>,
    mut q: Query<(Entity, &ChatSession, &mut Conversation, &mut ChatQueue), Without<InFlight>>,
    mut ev_start: EventWriter<ChatStarted>,
) {
    for (e, session, mut convo, mut queue) in q.iter_mut() {
        if queue.0.is_empty() {
            continue;
        }
        let Some(providers) = providers.as_ref() else {
            warn_once!(target: "bevy_chat_analyst", "message queued on {:?} but no Providers resource", e);
            continue;
        };
        let Some(text) = queue.0.pop_front() else { continue };

        convo.0.push_user(text);
        let transcript = convo.0.clone();
        counter.0 += 1;
        let id = counter.0;
        let cancel = CancellationToken::new();
        let tx = inbox.tx.clone();

        commands.entity(e).insert(InFlight { id, cancel: cancel.clone() });
        ev_start.write(ChatStarted { entity: e });

        let fetcher = match ResponseFetcher::new(providers.get(session.key.as_ref()), settings.fetch.clone()) {
            Ok(f) => f,
            Err(err) => {
                // settle the turn through the inbox so the session keeps moving
                error!(target: "bevy_chat_analyst", "request {} on {:?}: invalid fetch settings: {}", id, e, err);
                push_inbox(&tx, InboxMsg::Done { entity: e, id, outcome: FetchOutcome::OtherError(err.to_string()) });
                push_inbox(&tx, InboxMsg::Finished { entity: e, id });
                continue;
            }
        };

        info!(target: "bevy_chat_analyst",
            "spawn_chat_requests: entity={:?} request={} turns={} (user={}) queued={}",
            e, id, transcript.len(), transcript.user_turn_count(), queue.0.len()
        );

        let analyzer = settings.analyzer.clone();
        let rt = rt.0.clone();
        AsyncComputeTaskPool::get()
            .spawn(async move {
                let finished_tx = tx.clone();
                let run = run_request(e, id, transcript, fetcher, analyzer, cancel, tx);
                // hand off to tokio so bevy pools stay free.
                if let Err(err) = rt.spawn(run).await {
                    error!(target: "bevy_chat_analyst", "request {} on {:?} aborted: {}", id, e, err);
                    push_inbox(&finished_tx, InboxMsg::Finished { entity: e, id });
                }
            })
            .detach();
    }
}

/// reply fetch, then (on cadence) the analysis fetch, strictly in sequence.
async fn run_request(
    entity: Entity,
    id: u64,
    mut transcript: Transcript,
    fetcher: ResponseFetcher,
    analyzer: TurnAnalyzer,
    cancel: CancellationToken,
    tx: Sender<InboxMsg>,
) {
    let notify = |notice: RetryNotice| push_inbox(&tx, InboxMsg::Retry { entity, id, notice });

    let outcome = fetcher.fetch(&transcript, &cancel, notify).await;
    let cancelled = outcome == FetchOutcome::Cancelled;
    if !cancelled {
        transcript.push_bot(outcome.display_text());
    }
    push_inbox(&tx, InboxMsg::Done { entity, id, outcome });

    if !cancelled && analyzer.should_analyze(transcript.user_turn_count()) {
        let analysis = analyzer.analyze(&transcript, &fetcher, &cancel, notify).await;
        if analysis.prediction != Some(FetchOutcome::Cancelled) {
            push_inbox(&tx, InboxMsg::Analysis { entity, id, analysis });
        }
    }
    push_inbox(&tx, InboxMsg::Finished { entity, id });
}

/// drains the inbox in arrival order and emits user-facing events.
/// messages from cancelled or superseded requests are dropped.
fn drain_chat_inbox(
    mut commands: Commands,
    inbox: Res<ChatInbox>,
    mut q: Query<(&mut Conversation, &mut ConversationAnalysis, Option<&InFlight>)>,
    mut ev_retry: EventWriter<ChatRetryEvt>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
    mut ev_analysis: EventWriter<ChatAnalysisEvt>,
) {
    // drain up to a cap per frame to avoid long frames on bursts
    const MAX_PER_FRAME: usize = 512;
    for msg in inbox.rx.try_iter().take(MAX_PER_FRAME) {
        let (entity, id) = msg.target();
        let Ok((mut convo, mut cached, in_flight)) = q.get_mut(entity) else {
            debug!(target: "bevy_chat_analyst", "dropping message for missing session {:?}", entity);
            continue;
        };
        if in_flight.map(|f| f.id) != Some(id) {
            debug!(target: "bevy_chat_analyst", "dropping stale message for request {} on {:?}", id, entity);
            continue;
        }

        match msg {
            InboxMsg::Retry { notice, .. } => {
                ev_retry.write(ChatRetryEvt { entity, notice });
            }
            InboxMsg::Done { outcome, .. } => {
                let text = outcome.display_text();
                if outcome != FetchOutcome::Cancelled {
                    convo.0.push_bot(text.clone());
                }
                info!(target: "bevy_chat_analyst",
                    "reply {} on {:?}: ok={} len={}", id, entity, outcome.is_reply(), text.len()
                );
                ev_done.write(ChatCompletedEvt { entity, outcome, text });
            }
            InboxMsg::Analysis { analysis, .. } => {
                cached.0 = Some(analysis.clone());
                ev_analysis.write(ChatAnalysisEvt { entity, analysis });
            }
            InboxMsg::Finished { .. } => {
                commands.entity(entity).remove::<InFlight>();
            }
        }
    }
}
