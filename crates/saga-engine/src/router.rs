use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use saga_core::settings::EngineSettings;
use saga_core::{
    AgentError, AgentRequest, Message, MessageStatus, NewMessage, OutboundFrame, RequestId,
    Session,
};
use saga_store::{SessionStore, StoreError};
use saga_telemetry::MetricsRecorder;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::registry::{AgentRegistry, ResolvedAgent};
use crate::retry::Backoff;
use crate::sink::StreamSink;

/// Seen-request entries are pruned once the table grows past this.
const DEDUPE_PRUNE_THRESHOLD: usize = 1024;

#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Hard cap on one agent's generation time.
    pub agent_timeout: Duration,
    /// Messages of prior history handed to agents.
    pub history_limit: usize,
    pub session_retry: Backoff,
    pub dedupe_window: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for RouterConfig {
    fn from(s: &EngineSettings) -> Self {
        Self {
            agent_timeout: s.agent_timeout(),
            history_limit: s.history_limit,
            session_retry: Backoff {
                attempts: s.session_retry_attempts.max(1),
                base_delay: s.session_retry_base_delay(),
                ..Backoff::default()
            },
            dedupe_window: s.dedupe_window(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    ResolvingSession,
    Dispatching,
    Streaming,
    Persisting,
    Complete,
    Failed,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::ResolvingSession => "resolving_session",
            Self::Dispatching => "dispatching",
            Self::Streaming => "streaming",
            Self::Persisting => "persisting",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one agent in a batch ended.
#[derive(Clone, Debug)]
pub struct AgentOutcome {
    pub name: String,
    pub status: MessageStatus,
    pub chunks: usize,
    pub error: Option<AgentError>,
}

#[derive(Clone, Debug)]
pub struct DispatchOutcome {
    pub request_id: RequestId,
    pub session: Session,
    pub agents: Vec<AgentOutcome>,
    /// Messages as stored, with final sequence numbers. Empty when
    /// persistence failed.
    pub persisted: Vec<Message>,
    /// Set when the transcript could not be saved.
    pub warning: Option<String>,
    /// Whether the caller was still listening at the end.
    pub delivered: bool,
}

struct AgentRun {
    text: String,
    chunks: usize,
    error: Option<AgentError>,
}

/// Drives one request from receipt to completion: session lookup, agent
/// resolution, streaming, persistence.
pub struct Router {
    store: Arc<dyn SessionStore>,
    registry: Arc<AgentRegistry>,
    metrics: Arc<MetricsRecorder>,
    config: RouterConfig,
    seen: DashMap<RequestId, Instant>,
}

impl Router {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<AgentRegistry>,
        metrics: Arc<MetricsRecorder>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            registry,
            metrics,
            config,
            seen: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Run one request. Frames go to `sink`; the outcome is also returned.
    ///
    /// On failure a terminal error frame is sent (if the caller is still
    /// listening) before the error is returned.
    #[instrument(skip_all, fields(session_id = %request.session_id, request_id = %request.request_id))]
    pub async fn dispatch(
        &self,
        request: AgentRequest,
        sink: &dyn StreamSink,
    ) -> Result<DispatchOutcome, EngineError> {
        let started = Instant::now();
        debug!(state = %DispatchState::Received, "request received");

        if !self.claim(&request.request_id) {
            let err = EngineError::DuplicateRequest(request.request_id.to_string());
            return Err(self.fail(&request, sink, err, started).await);
        }

        match self.run(&request, sink).await {
            Ok(outcome) => {
                self.metrics
                    .counter_inc("saga.dispatch.total", &[("outcome", "complete")], 1);
                self.observe_duration(started);
                debug!(state = %DispatchState::Complete, "request complete");
                Ok(outcome)
            }
            Err(err) => {
                // Agents never ran, so the caller may retry under the same id.
                self.seen.remove(&request.request_id);
                Err(self.fail(&request, sink, err, started).await)
            }
        }
    }

    async fn run(
        &self,
        request: &AgentRequest,
        sink: &dyn StreamSink,
    ) -> Result<DispatchOutcome, EngineError> {
        debug!(state = %DispatchState::ResolvingSession);
        // Held until the transcript is written so the idle reaper skips it.
        let _hold = self.store.hold(&request.session_id);
        let session = self
            .config
            .session_retry
            .retry("get_or_create", || self.store.get_or_create(&request.session_id))
            .await?;
        let history = self
            .config
            .session_retry
            .retry("history", || {
                self.store
                    .history(&request.session_id, Some(self.config.history_limit))
            })
            .await?;

        debug!(state = %DispatchState::Dispatching);
        let batch = self.registry.resolve(request)?;
        let names: Vec<&str> = batch.iter().map(|a| a.name.as_str()).collect();
        info!(agents = ?names, history = history.len(), "dispatching");

        debug!(state = %DispatchState::Streaming);
        let mut context = history;
        let mut next_sequence = session.message_count + 1;
        let mut transcript = vec![NewMessage::user(request.raw_text.clone())];
        let mut agents = Vec::with_capacity(batch.len());
        let mut forwarding = sink.is_open();

        for agent in &batch {
            let run = self.run_agent(agent, request, &context, sink, &mut forwarding).await;
            let status = if run.error.is_some() {
                MessageStatus::Partial
            } else {
                MessageStatus::Complete
            };
            let message = NewMessage::agent(agent.name.clone(), run.text, status);

            // Later agents see this output before it has a real sequence.
            next_sequence += 1;
            context.push(message.clone().into_message(next_sequence, Utc::now()));
            transcript.push(message);
            agents.push(AgentOutcome {
                name: agent.name.clone(),
                status,
                chunks: run.chunks,
                error: run.error,
            });
        }

        debug!(state = %DispatchState::Persisting, messages = transcript.len());
        let (persisted, warning) = match self
            .config
            .session_retry
            .retry_when("append_batch", StoreError::is_resendable, || {
                self.store.append_batch(&request.session_id, transcript.clone())
            })
            .await
        {
            Ok(persisted) => (persisted, None),
            Err(e) => {
                let failure = EngineError::PersistenceFailure(e.to_string());
                warn!(error = %e, "transcript not persisted");
                self.metrics.counter_inc("saga.persist.failures", &[], 1);
                (Vec::new(), Some(failure.to_string()))
            }
        };

        let delivered = sink.is_open()
            && sink
                .send(
                    OutboundFrame::complete(warning.clone())
                        .with_request_id(request.request_id.as_str()),
                )
                .await;
        if !delivered {
            debug!("caller gone before completion; transcript kept");
        }

        Ok(DispatchOutcome {
            request_id: request.request_id.clone(),
            session,
            agents,
            persisted,
            warning,
            delivered,
        })
    }

    /// Stream one agent under the hard cap. A failure ends only this agent.
    ///
    /// The cap covers generation only; time spent waiting on a slow caller
    /// is not charged to the agent.
    async fn run_agent(
        &self,
        agent: &ResolvedAgent,
        request: &AgentRequest,
        context: &[Message],
        sink: &dyn StreamSink,
        forwarding: &mut bool,
    ) -> AgentRun {
        let cap = self.config.agent_timeout;
        let mut budget = cap;
        let mut text = String::new();
        let mut chunks = 0;

        let result = async {
            let started = within_budget(&mut budget, cap, agent.capability.stream(request, context));
            let mut stream = started.await??;
            while let Some(item) = within_budget(&mut budget, cap, stream.next()).await? {
                let chunk = item?;
                text.push_str(&chunk);
                chunks += 1;
                if *forwarding {
                    let frame = OutboundFrame::partial(agent.name.as_str(), chunk)
                        .with_request_id(request.request_id.as_str());
                    if !sink.send(frame).await {
                        *forwarding = false;
                        debug!(agent = %agent.name, "caller gone; no longer forwarding");
                    }
                }
            }
            Ok::<(), AgentError>(())
        }
        .await;

        let error = match result {
            Ok(()) => None,
            Err(e) => {
                warn!(agent = %agent.name, error = %e, chunks, "agent failed");
                self.metrics.counter_inc(
                    "saga.agent.failures",
                    &[("agent", agent.name.as_str())],
                    1,
                );
                if *forwarding {
                    let frame = OutboundFrame::agent_error(
                        agent.name.as_str(),
                        e.error_kind(),
                        e.to_string(),
                    )
                    .with_request_id(request.request_id.as_str());
                    *forwarding = sink.send(frame).await;
                }
                Some(e)
            }
        };

        AgentRun {
            text,
            chunks,
            error,
        }
    }

    /// Record the request id. False if it was already dispatched within the
    /// dedupe window.
    fn claim(&self, id: &RequestId) -> bool {
        let now = Instant::now();
        let window = self.config.dedupe_window;
        if self.seen.len() > DEDUPE_PRUNE_THRESHOLD {
            self.seen.retain(|_, at| now.duration_since(*at) < window);
        }
        match self.seen.entry(id.clone()) {
            Entry::Occupied(mut seen) => {
                if now.duration_since(*seen.get()) < window {
                    return false;
                }
                seen.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    async fn fail(
        &self,
        request: &AgentRequest,
        sink: &dyn StreamSink,
        err: EngineError,
        started: Instant,
    ) -> EngineError {
        warn!(
            state = %DispatchState::Failed,
            error = %err,
            kind = err.error_kind(),
            retryable = err.is_retryable(),
            "request failed"
        );
        self.metrics
            .counter_inc("saga.dispatch.total", &[("outcome", err.error_kind())], 1);
        self.observe_duration(started);
        if sink.is_open() {
            let frame = OutboundFrame::failure(err.error_kind(), err.to_string(), err.is_retryable())
                .with_request_id(request.request_id.as_str());
            sink.send(frame).await;
        }
        err
    }

    fn observe_duration(&self, started: Instant) {
        self.metrics.histogram_observe(
            "saga.dispatch.duration_ms",
            &[],
            started.elapsed().as_secs_f64() * 1000.0,
        );
    }
}

/// Await one generation step against what is left of the agent's budget.
async fn within_budget<T>(
    budget: &mut Duration,
    cap: Duration,
    step: impl std::future::Future<Output = T>,
) -> Result<T, AgentError> {
    let started = Instant::now();
    let out = tokio::time::timeout(*budget, step)
        .await
        .map_err(|_| AgentError::Timeout(cap))?;
    *budget = budget.saturating_sub(started.elapsed());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{RecordingSink, ScriptedAgent};
    use async_trait::async_trait;
    use saga_core::settings::TieBreak;
    use saga_core::{AgentKind, Capability, Content, FrameType, Role, SessionId, StoreMode};
    use saga_store::{EphemeralStore, StoreHealth};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> RouterConfig {
        RouterConfig {
            agent_timeout: Duration::from_secs(5),
            history_limit: 50,
            session_retry: Backoff {
                attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                jitter_factor: 0.0,
            },
            dedupe_window: Duration::from_secs(60),
        }
    }

    fn router_with(store: Arc<dyn SessionStore>, agents: Vec<Arc<dyn Capability>>) -> Router {
        let registry = AgentRegistry::new(TieBreak::RegistrationOrder);
        for agent in agents {
            registry.register(agent.name().to_string(), agent);
        }
        Router::new(
            store,
            Arc::new(registry),
            Arc::new(MetricsRecorder::new()),
            config(),
        )
    }

    fn story_agents(plot: ScriptedAgent) -> (Arc<ScriptedAgent>, Arc<ScriptedAgent>) {
        let plot = Arc::new(plot.accepting_keywords());
        let characters = Arc::new(
            ScriptedAgent::new("characters", AgentKind::Characters, &["Vera, ", "a pilot."])
                .accepting_keywords(),
        );
        (plot, characters)
    }

    fn request(text: &str) -> AgentRequest {
        AgentRequest::new(SessionId::from_raw("story"), text)
    }

    fn summary(frames: &[OutboundFrame]) -> Vec<(FrameType, Option<&str>, &str)> {
        frames
            .iter()
            .map(|f| (f.frame_type, f.agent_name.as_deref(), f.content.as_str()))
            .collect()
    }

    #[tokio::test]
    async fn single_agent_streams_and_persists() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let plot = Arc::new(ScriptedAgent::new("plot", AgentKind::Plot, &["Once ", "upon"]));
        let router = router_with(Arc::clone(&store), vec![plot.clone()]);
        let sink = RecordingSink::new();

        let outcome = router.dispatch(request("a plot please"), &sink).await.unwrap();

        let frames = sink.frames();
        assert_eq!(
            summary(&frames),
            vec![
                (FrameType::Partial, Some("plot"), "Once "),
                (FrameType::Partial, Some("plot"), "upon"),
                (FrameType::Complete, None, ""),
            ]
        );
        assert!(frames.iter().all(|f| f.request_id.is_some()));
        assert!(outcome.delivered);
        assert!(outcome.warning.is_none());

        let history = store.history(&SessionId::from_raw("story"), None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, Content::text("Once upon"));
        assert_eq!(history[1].status, MessageStatus::Complete);
        assert_eq!(
            router
                .metrics()
                .counter_get("saga.dispatch.total", &[("outcome", "complete")]),
            1
        );
    }

    #[tokio::test]
    async fn failing_agent_does_not_cancel_siblings() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let (plot, characters) = story_agents(
            ScriptedAgent::new("plot", AgentKind::Plot, &["A heist"])
                .then_fail(AgentError::Failed("model crashed".into())),
        );
        let router = router_with(Arc::clone(&store), vec![characters.clone(), plot.clone()]);
        let sink = RecordingSink::new();

        let outcome = router
            .dispatch(request("create a plot and a matching character"), &sink)
            .await
            .unwrap();

        let frames = sink.frames();
        assert_eq!(
            summary(&frames),
            vec![
                (FrameType::Partial, Some("plot"), "A heist"),
                (FrameType::Error, Some("plot"), "agent failed: model crashed"),
                (FrameType::Partial, Some("characters"), "Vera, "),
                (FrameType::Partial, Some("characters"), "a pilot."),
                (FrameType::Complete, None, ""),
            ]
        );
        assert_eq!(frames[1].error_kind.as_deref(), Some("agent_failed"));
        assert!(!frames[1].is_terminal());

        assert_eq!(outcome.agents.len(), 2);
        assert_eq!(outcome.agents[0].status, MessageStatus::Partial);
        assert_eq!(outcome.agents[1].status, MessageStatus::Complete);

        let history = store.history(&SessionId::from_raw("story"), None).await.unwrap();
        let shape: Vec<(u64, Option<&str>, MessageStatus)> = history
            .iter()
            .map(|m| (m.sequence, m.agent_name.as_deref(), m.status))
            .collect();
        assert_eq!(
            shape,
            vec![
                (1, None, MessageStatus::Complete),
                (2, Some("plot"), MessageStatus::Partial),
                (3, Some("characters"), MessageStatus::Complete),
            ]
        );
        assert_eq!(history[1].content, Content::text("A heist"));
        assert_eq!(
            router
                .metrics()
                .counter_get("saga.agent.failures", &[("agent", "plot")]),
            1
        );
    }

    #[tokio::test]
    async fn later_agents_see_earlier_outputs() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let (plot, characters) =
            story_agents(ScriptedAgent::new("plot", AgentKind::Plot, &["Moon heist."]));
        let router = router_with(store, vec![plot.clone(), characters.clone()]);

        router
            .dispatch(request("create a plot and a matching character"), &RecordingSink::new())
            .await
            .unwrap();

        assert!(plot.histories()[0].is_empty());
        let seen = &characters.histories()[0];
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].agent_name.as_deref(), Some("plot"));
        assert_eq!(seen[0].content, Content::text("Moon heist."));
    }

    #[tokio::test]
    async fn history_is_passed_to_agents() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let plot = Arc::new(ScriptedAgent::new("plot", AgentKind::Plot, &["ok"]));
        let router = router_with(store, vec![plot.clone()]);

        router.dispatch(request("first"), &RecordingSink::new()).await.unwrap();
        router.dispatch(request("second"), &RecordingSink::new()).await.unwrap();

        let second_call = &plot.histories()[1];
        let seqs: Vec<u64> = second_call.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(second_call[0].content, Content::text("first"));
    }

    #[tokio::test]
    async fn no_capable_agent_sends_terminal_error() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let router = router_with(
            Arc::clone(&store),
            vec![Arc::new(
                ScriptedAgent::new("plot", AgentKind::Plot, &["x"]).never_accepts(),
            )],
        );
        let sink = RecordingSink::new();

        let err = router.dispatch(request("hello"), &sink).await.unwrap_err();
        assert!(matches!(err, EngineError::NoCapableAgent));

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_terminal());
        assert_eq!(frames[0].error_kind.as_deref(), Some("no_capable_agent"));
        assert_eq!(frames[0].retryable, Some(false));
        assert_eq!(frames[0].content, "no agent can handle this request");
        // Nothing was generated, so nothing is stored.
        assert!(store
            .history(&SessionId::from_raw("story"), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn duplicate_request_is_rejected_without_running_agents() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let plot = Arc::new(ScriptedAgent::new("plot", AgentKind::Plot, &["once"]));
        let router = router_with(store, vec![plot.clone()]);
        let req = request("a plot");

        router.dispatch(req.clone(), &RecordingSink::new()).await.unwrap();
        let sink = RecordingSink::new();
        let err = router.dispatch(req, &sink).await.unwrap_err();

        assert!(matches!(err, EngineError::DuplicateRequest(_)));
        assert_eq!(plot.call_count(), 1);
        assert_eq!(sink.frames()[0].error_kind.as_deref(), Some("duplicate_request"));
    }

    #[tokio::test]
    async fn failed_request_can_be_retried_under_same_id() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let router = router_with(store, vec![]);
        let req = request("a plot");

        assert!(router.dispatch(req.clone(), &RecordingSink::new()).await.is_err());
        router.registry().register(
            "plot",
            Arc::new(ScriptedAgent::new("plot", AgentKind::Plot, &["once"])),
        );
        assert!(router.dispatch(req, &RecordingSink::new()).await.is_ok());
    }

    #[tokio::test]
    async fn closed_caller_stops_forwarding_but_keeps_persisting() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let (plot, characters) =
            story_agents(ScriptedAgent::new("plot", AgentKind::Plot, &["one ", "two"]));
        let router = router_with(Arc::clone(&store), vec![plot.clone(), characters.clone()]);
        let sink = RecordingSink::closing_after(1);

        let outcome = router
            .dispatch(request("create a plot and a matching character"), &sink)
            .await
            .unwrap();

        assert_eq!(sink.frames().len(), 1);
        assert!(!outcome.delivered);
        assert_eq!(characters.call_count(), 1);
        let history = store.history(&SessionId::from_raw("story"), None).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].content, Content::text("one two"));
        assert_eq!(history[2].content, Content::text("Vera, a pilot."));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_cap_aborts_slow_agent() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let slow = Arc::new(
            ScriptedAgent::new("plot", AgentKind::Plot, &["a", "b", "c"])
                .with_chunk_delay(Duration::from_secs(2)),
        );
        let router = router_with(Arc::clone(&store), vec![slow]);
        let sink = RecordingSink::new();

        let outcome = router.dispatch(request("a plot"), &sink).await.unwrap();

        // 5s cap: chunks at 2s and 4s arrive, the third would land at 6s.
        assert_eq!(outcome.agents[0].chunks, 2);
        assert!(matches!(outcome.agents[0].error, Some(AgentError::Timeout(_))));
        let frames = sink.frames();
        assert_eq!(frames[2].error_kind.as_deref(), Some("agent_timeout"));
        assert_eq!(frames.last().unwrap().frame_type, FrameType::Complete);
        let history = store.history(&SessionId::from_raw("story"), None).await.unwrap();
        assert_eq!(history[1].content, Content::text("ab"));
        assert_eq!(history[1].status, MessageStatus::Partial);
    }

    #[tokio::test]
    async fn agent_failing_to_start_is_isolated() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let (plot, characters) = story_agents(
            ScriptedAgent::new("plot", AgentKind::Plot, &[])
                .failing_to_start(AgentError::Unavailable("no generator".into())),
        );
        let router = router_with(store, vec![plot, characters]);

        let outcome = router
            .dispatch(
                request("create a plot and a matching character"),
                &RecordingSink::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.persisted.len(), 3);
        assert_eq!(outcome.persisted[1].status, MessageStatus::Partial);
        assert_eq!(outcome.persisted[1].content, Content::text(""));
        assert_eq!(outcome.persisted[2].status, MessageStatus::Complete);
    }

    /// Store wrapper that fails selected calls.
    struct FlakyStore {
        inner: EphemeralStore,
        get_failures: AtomicUsize,
        append_error: Option<fn() -> StoreError>,
        lost_replies: AtomicUsize,
    }

    impl FlakyStore {
        fn new(get_failures: usize, append_error: Option<fn() -> StoreError>) -> Self {
            Self {
                inner: EphemeralStore::new(),
                get_failures: AtomicUsize::new(get_failures),
                append_error,
                lost_replies: AtomicUsize::new(0),
            }
        }

        /// Commit the next `n` appends but answer them with a gateway timeout.
        fn losing_replies(self, n: usize) -> Self {
            self.lost_replies.store(n, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        fn mode(&self) -> StoreMode {
            StoreMode::Ephemeral
        }

        async fn get_or_create(&self, id: &SessionId) -> Result<Session, StoreError> {
            let remaining = self.get_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.get_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("warming up".into()));
            }
            self.inner.get_or_create(id).await
        }

        async fn append_batch(
            &self,
            id: &SessionId,
            messages: Vec<NewMessage>,
        ) -> Result<Vec<Message>, StoreError> {
            if let Some(make) = self.append_error {
                return Err(make());
            }
            let stored = self.inner.append_batch(id, messages).await?;
            let lost = self.lost_replies.load(Ordering::SeqCst);
            if lost > 0 {
                self.lost_replies.store(lost - 1, Ordering::SeqCst);
                return Err(StoreError::Remote {
                    status: 504,
                    body: "gateway timeout".into(),
                });
            }
            Ok(stored)
        }

        async fn history(
            &self,
            id: &SessionId,
            limit: Option<usize>,
        ) -> Result<Vec<Message>, StoreError> {
            self.inner.history(id, limit).await
        }

        async fn close(&self, id: &SessionId) -> Result<bool, StoreError> {
            self.inner.close(id).await
        }

        async fn reap_idle(&self, max_idle: Duration) -> Result<usize, StoreError> {
            self.inner.reap_idle(max_idle).await
        }

        async fn health(&self) -> StoreHealth {
            StoreHealth::live(StoreMode::Ephemeral)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_session_errors_are_retried() {
        let store: Arc<dyn SessionStore> = Arc::new(FlakyStore::new(2, None));
        let plot = Arc::new(ScriptedAgent::new("plot", AgentKind::Plot, &["ok"]));
        let router = router_with(store, vec![plot]);

        let outcome = router.dispatch(request("a plot"), &RecordingSink::new()).await;
        assert!(outcome.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_session_errors_fail_retryable() {
        let store: Arc<dyn SessionStore> = Arc::new(FlakyStore::new(10, None));
        let plot = Arc::new(ScriptedAgent::new("plot", AgentKind::Plot, &["ok"]));
        let router = router_with(store, vec![plot.clone()]);
        let sink = RecordingSink::new();

        let err = router.dispatch(request("a plot"), &sink).await.unwrap_err();
        assert!(matches!(err, EngineError::Session(StoreError::Unavailable(_))));
        assert_eq!(plot.call_count(), 0);
        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].error_kind.as_deref(), Some("session_error"));
        assert_eq!(frames[0].retryable, Some(true));
    }

    #[tokio::test]
    async fn persistence_failure_becomes_warning() {
        let store: Arc<dyn SessionStore> = Arc::new(FlakyStore::new(
            0,
            Some(|| StoreError::Database("disk full".into())),
        ));
        let plot = Arc::new(ScriptedAgent::new("plot", AgentKind::Plot, &["kept"]));
        let router = router_with(store, vec![plot]);
        let sink = RecordingSink::new();

        let outcome = router.dispatch(request("a plot"), &sink).await.unwrap();

        assert!(outcome.persisted.is_empty());
        let frames = sink.frames();
        assert_eq!(frames[0].content, "kept");
        let complete = frames.last().unwrap();
        assert_eq!(complete.frame_type, FrameType::Complete);
        assert!(complete
            .warning
            .as_deref()
            .is_some_and(|w| w.contains("transcript could not be saved")));
        assert_eq!(router.metrics().counter_get("saga.persist.failures", &[]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transcript_with_unknown_write_outcome_is_not_resent() {
        let store = Arc::new(FlakyStore::new(0, None).losing_replies(1));
        let plot = Arc::new(ScriptedAgent::new("plot", AgentKind::Plot, &["abc"]));
        let router = router_with(store.clone(), vec![plot]);
        let sink = RecordingSink::new();

        let outcome = router.dispatch(request("a plot"), &sink).await.unwrap();

        let history = store
            .history(&SessionId::from_raw("story"), None)
            .await
            .unwrap();
        let stored: Vec<(u64, String)> = history
            .iter()
            .map(|m| (m.sequence, m.content.as_text()))
            .collect();
        assert_eq!(stored, vec![(1, "a plot".to_string()), (2, "abc".to_string())]);
        assert!(outcome.warning.is_some());
        assert_eq!(router.metrics().counter_get("saga.persist.failures", &[]), 1);
    }

    #[tokio::test]
    async fn idle_reaping_skips_session_mid_dispatch() {
        let store = Arc::new(EphemeralStore::new());
        let plot = Arc::new(
            ScriptedAgent::new("plot", AgentKind::Plot, &["a", "b", "c"])
                .with_chunk_delay(Duration::from_millis(100)),
        );
        let router = router_with(store.clone(), vec![plot]);
        let sink = RecordingSink::new();

        let (outcome, reaped) = tokio::join!(router.dispatch(request("a plot"), &sink), async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            store.reap_idle(Duration::from_millis(50)).await.unwrap()
        });

        assert_eq!(reaped, 0);
        let outcome = outcome.unwrap();
        assert!(outcome.warning.is_none());
        assert_eq!(outcome.persisted.len(), 2);
        assert_eq!(outcome.persisted[1].content, Content::text("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_caller_is_not_charged_to_agent() {
        let store: Arc<dyn SessionStore> = Arc::new(EphemeralStore::new());
        let plot = Arc::new(ScriptedAgent::new("plot", AgentKind::Plot, &["a", "b", "c"]));
        let router = router_with(store, vec![plot]);
        // Three partial frames at 3s each outlast the 5s cap.
        let sink = RecordingSink::new().with_send_delay(Duration::from_secs(3));

        let outcome = router.dispatch(request("a plot"), &sink).await.unwrap();

        assert!(outcome.agents[0].error.is_none());
        assert_eq!(outcome.agents[0].chunks, 3);
        assert_eq!(outcome.persisted[1].status, MessageStatus::Complete);
    }

    #[test]
    fn config_from_settings() {
        let settings = EngineSettings::default();
        let config = RouterConfig::from(&settings);
        assert_eq!(config.agent_timeout, settings.agent_timeout());
        assert_eq!(config.history_limit, settings.history_limit);
        assert_eq!(config.session_retry.attempts, settings.session_retry_attempts.max(1));
    }
}
