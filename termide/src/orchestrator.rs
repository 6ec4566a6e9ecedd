use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::{BackendError, BackendEvent, ModelBackend, ModelRequest};
use crate::context::ConversationContext;
use crate::rate_limit::RateLimitHandler;
use crate::registry::AgentRegistry;
use crate::trace::{TraceSink, TraceSpan, TraceStatus};

/// Max wait for a stream to open or yield its next event.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(120);

pub const STREAMING_WORKFLOW: &str = "streaming_response";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub output: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffInfo {
    pub from_agent: String,
    pub to_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Events delivered to the UI while a response is produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta { text: String },
    ToolCall(ToolCallInfo),
    ToolResult(ToolResultInfo),
    Handoff(HandoffInfo),
    Error { message: String },
}

impl StreamEvent {
    /// UI-facing form of a backend event. `None` for events the UI never sees.
    fn from_backend(event: BackendEvent) -> Option<Self> {
        match event {
            BackendEvent::TextDelta(text) => Some(StreamEvent::TextDelta { text }),
            BackendEvent::ToolCall { name, arguments } => {
                Some(StreamEvent::ToolCall(ToolCallInfo { name, arguments }))
            }
            BackendEvent::ToolCallOutput { tool_name, output } => {
                Some(StreamEvent::ToolResult(ToolResultInfo { tool_name, output }))
            }
            BackendEvent::Handoff {
                source_agent,
                target_agent,
                reason,
            } => Some(StreamEvent::Handoff(HandoffInfo {
                from_agent: source_agent,
                to_agent: target_agent,
                reason,
            })),
            BackendEvent::Other(what) => {
                tracing::trace!(event = %what, "ignoring stream event");
                None
            }
        }
    }
}

/// UI hooks, each optional. Called in event order on the responding task.
#[derive(Default)]
pub struct StreamCallbacks {
    on_text_delta: Option<Box<dyn FnMut(&str) + Send>>,
    on_tool_call: Option<Box<dyn FnMut(&ToolCallInfo) + Send>>,
    on_tool_result: Option<Box<dyn FnMut(&ToolResultInfo) + Send>>,
    on_handoff: Option<Box<dyn FnMut(&HandoffInfo) + Send>>,
    on_error: Option<Box<dyn FnMut(&str) + Send>>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_text_delta(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_text_delta = Some(Box::new(f));
        self
    }

    pub fn on_tool_call(mut self, f: impl FnMut(&ToolCallInfo) + Send + 'static) -> Self {
        self.on_tool_call = Some(Box::new(f));
        self
    }

    pub fn on_tool_result(mut self, f: impl FnMut(&ToolResultInfo) + Send + 'static) -> Self {
        self.on_tool_result = Some(Box::new(f));
        self
    }

    pub fn on_handoff(mut self, f: impl FnMut(&HandoffInfo) + Send + 'static) -> Self {
        self.on_handoff = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Forward every event over a channel. A closed receiver drops events silently.
    pub fn forward_to(tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        let text_tx = tx.clone();
        let call_tx = tx.clone();
        let result_tx = tx.clone();
        let handoff_tx = tx.clone();
        Self::new()
            .on_text_delta(move |text| {
                let _ = text_tx.send(StreamEvent::TextDelta {
                    text: text.to_string(),
                });
            })
            .on_tool_call(move |info| {
                let _ = call_tx.send(StreamEvent::ToolCall(info.clone()));
            })
            .on_tool_result(move |info| {
                let _ = result_tx.send(StreamEvent::ToolResult(info.clone()));
            })
            .on_handoff(move |info| {
                let _ = handoff_tx.send(StreamEvent::Handoff(info.clone()));
            })
            .on_error(move |message| {
                let _ = tx.send(StreamEvent::Error {
                    message: message.to_string(),
                });
            })
    }

    pub fn dispatch(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { text } => {
                if let Some(f) = &mut self.on_text_delta {
                    f(text);
                }
            }
            StreamEvent::ToolCall(info) => {
                if let Some(f) = &mut self.on_tool_call {
                    f(info);
                }
            }
            StreamEvent::ToolResult(info) => {
                if let Some(f) = &mut self.on_tool_result {
                    f(info);
                }
            }
            StreamEvent::Handoff(info) => {
                if let Some(f) = &mut self.on_handoff {
                    f(info);
                }
            }
            StreamEvent::Error { message } => {
                if let Some(f) = &mut self.on_error {
                    f(message);
                }
            }
        }
    }
}

/// Result of one step of the fallback chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attempt {
    Ok(String),
    /// Try the next strategy.
    NeedsFallback(String),
    /// Stop the chain; no later strategy can succeed.
    Failed(String),
}

impl Attempt {
    fn from_error(error: &BackendError) -> Self {
        if error.is_fatal() {
            Attempt::Failed(error.to_string())
        } else {
            Attempt::NeedsFallback(error.to_string())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    Stream,
    BaseCompletion,
    NamedCompletion,
}

impl Strategy {
    const CHAIN: [Strategy; 3] = [
        Strategy::Stream,
        Strategy::BaseCompletion,
        Strategy::NamedCompletion,
    ];

    fn label(self) -> &'static str {
        match self {
            Strategy::Stream => "stream",
            Strategy::BaseCompletion => "base_completion",
            Strategy::NamedCompletion => "named_completion",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RespondError {
    #[error("Too many requests. Please try again in {:.1} seconds.", .wait.as_secs_f64())]
    RateLimited { wait: Duration },
    #[error("Sorry, I couldn't get a response. Error processing request: {last_error}")]
    Exhausted { last_error: String },
}

/// Drives one model call per user turn: rate check, streaming, then fallbacks.
pub struct StreamingOrchestrator {
    backend: Arc<dyn ModelBackend>,
    registry: Arc<AgentRegistry>,
    rate_limiter: Arc<RateLimitHandler>,
    trace: Arc<dyn TraceSink>,
    stream_timeout: Duration,
    generation: AtomicU64,
    call_lock: tokio::sync::Mutex<()>,
}

impl StreamingOrchestrator {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        registry: Arc<AgentRegistry>,
        rate_limiter: Arc<RateLimitHandler>,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            backend,
            registry,
            rate_limiter,
            trace,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            generation: AtomicU64::new(0),
            call_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn rate_limiter(&self) -> &RateLimitHandler {
        &self.rate_limiter
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn trace_sink(&self) -> &dyn TraceSink {
        self.trace.as_ref()
    }

    /// Generation of the most recently started call.
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Never fails: errors come back as a user-facing message.
    pub async fn generate_streaming_response(
        &self,
        prompt: &str,
        context: &ConversationContext,
        callbacks: &mut StreamCallbacks,
    ) -> String {
        match self.respond(prompt, context, callbacks).await {
            Ok(text) => text,
            Err(e) => e.to_string(),
        }
    }

    /// Like [`generate_streaming_response`](Self::generate_streaming_response), but
    /// reports a denied or exhausted call as an error.
    ///
    /// Starting a call mutes the callbacks of any call still in flight. Calls run one
    /// at a time in arrival order.
    pub async fn respond(
        &self,
        prompt: &str,
        context: &ConversationContext,
        callbacks: &mut StreamCallbacks,
    ) -> Result<String, RespondError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut span = TraceSpan::start(self.trace.as_ref(), STREAMING_WORKFLOW);
        span.meta("prompt_chars", prompt.chars().count());

        if !self.rate_limiter.can_make_request() {
            let wait = self.rate_limiter.time_until_next_request();
            tracing::info!(wait_secs = wait.as_secs_f64(), "model call rate limited");
            span.meta("attempt", "rate_limited");
            span.finish(TraceStatus::Error);
            return Err(RespondError::RateLimited { wait });
        }

        let _turn = self.call_lock.lock().await;
        let request = ModelRequest::new(prompt, context.to_prompt_context());
        let mut last_error = String::from("no response strategy available");

        for strategy in Strategy::CHAIN {
            let attempt = match strategy {
                Strategy::Stream => self.attempt_stream(generation, &request, callbacks).await,
                Strategy::BaseCompletion => {
                    self.attempt_complete(self.registry.base().name.as_str(), &request)
                        .await
                }
                Strategy::NamedCompletion => {
                    self.attempt_complete(self.registry.fallback_name(), &request)
                        .await
                }
            };

            match attempt {
                Attempt::Ok(text) => {
                    tracing::debug!(attempt = strategy.label(), "model call succeeded");
                    span.meta("attempt", strategy.label());
                    span.finish(TraceStatus::Success);
                    return Ok(text);
                }
                Attempt::NeedsFallback(reason) => {
                    tracing::warn!(attempt = strategy.label(), "falling back: {reason}");
                    self.emit(
                        generation,
                        callbacks,
                        StreamEvent::Error {
                            message: format!("{} failed: {reason}", strategy.label()),
                        },
                    );
                    last_error = reason;
                }
                Attempt::Failed(reason) => {
                    tracing::warn!(attempt = strategy.label(), "giving up: {reason}");
                    self.emit(
                        generation,
                        callbacks,
                        StreamEvent::Error {
                            message: format!("{} failed: {reason}", strategy.label()),
                        },
                    );
                    last_error = reason;
                    break;
                }
            }
        }

        span.meta("error", last_error.clone());
        span.finish(TraceStatus::Error);
        Err(RespondError::Exhausted { last_error })
    }

    fn emit(&self, generation: u64, callbacks: &mut StreamCallbacks, event: StreamEvent) {
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::trace!(generation, "dropping event from superseded turn");
            return;
        }
        callbacks.dispatch(&event);
    }

    async fn attempt_stream(
        &self,
        generation: u64,
        request: &ModelRequest,
        callbacks: &mut StreamCallbacks,
    ) -> Attempt {
        let timeout = self.stream_timeout;
        let agent = self.registry.base();
        let mut stream =
            match tokio::time::timeout(timeout, self.backend.stream(agent, request)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Attempt::from_error(&e),
                Err(_) => return Attempt::from_error(&BackendError::Timeout(timeout)),
            };

        let mut text = String::new();
        loop {
            let next = match tokio::time::timeout(timeout, stream.next_event()).await {
                Ok(next) => next,
                Err(_) => return Attempt::from_error(&BackendError::Timeout(timeout)),
            };
            let Some(next) = next else {
                break;
            };
            match next {
                Ok(event) => {
                    if let BackendEvent::TextDelta(delta) = &event {
                        text.push_str(delta);
                    }
                    if let Some(event) = StreamEvent::from_backend(event) {
                        self.emit(generation, callbacks, event);
                    }
                }
                Err(e) if e.is_skippable() => {
                    tracing::warn!("skipping stream event: {e}");
                }
                Err(e) => return Attempt::from_error(&e),
            }
        }

        if !text.is_empty() {
            return Attempt::Ok(text);
        }
        match stream.final_output().await {
            Ok(output) if !output.is_empty() => Attempt::Ok(output),
            Ok(_) => Attempt::NeedsFallback("stream produced no output".into()),
            Err(e) => Attempt::from_error(&e),
        }
    }

    async fn attempt_complete(&self, agent_name: &str, request: &ModelRequest) -> Attempt {
        let Some(agent) = self.registry.get(agent_name) else {
            return Attempt::NeedsFallback(format!("no agent named {agent_name:?}"));
        };
        match tokio::time::timeout(self.stream_timeout, self.backend.complete(agent, request)).await
        {
            Ok(Ok(text)) if !text.is_empty() => Attempt::Ok(text),
            Ok(Ok(_)) => Attempt::NeedsFallback(format!("{} returned an empty completion", agent.name)),
            Ok(Err(e)) => Attempt::from_error(&e),
            Err(_) => Attempt::from_error(&BackendError::Timeout(self.stream_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CallKind, ScriptedBackend, StreamScript};
    use crate::registry::AgentProfile;
    use crate::trace::MemoryTraceSink;
    use std::sync::Mutex;

    struct Harness {
        backend: Arc<ScriptedBackend>,
        trace: Arc<MemoryTraceSink>,
        orchestrator: Arc<StreamingOrchestrator>,
    }

    fn harness_with(registry: AgentRegistry, limiter: RateLimitHandler) -> Harness {
        let backend = Arc::new(ScriptedBackend::new());
        let trace = Arc::new(MemoryTraceSink::default());
        let orchestrator = Arc::new(
            StreamingOrchestrator::new(
                backend.clone(),
                Arc::new(registry),
                Arc::new(limiter),
                trace.clone(),
            )
            .with_stream_timeout(Duration::from_secs(5)),
        );
        Harness {
            backend,
            trace,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(AgentRegistry::with_defaults(), RateLimitHandler::default())
    }

    fn collect() -> (StreamCallbacks, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamCallbacks::forward_to(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn text(s: &str) -> StreamEvent {
        StreamEvent::TextDelta { text: s.into() }
    }

    // ── Streaming ──

    #[tokio::test]
    async fn streams_deltas_in_order_and_returns_text() {
        let h = harness();
        h.backend
            .push_stream(StreamScript::new().text("Hel").text("lo").text("!"));
        let (mut callbacks, mut rx) = collect();

        let reply = h
            .orchestrator
            .generate_streaming_response("hi", &ConversationContext::default(), &mut callbacks)
            .await;
        assert_eq!(reply, "Hello!");
        assert_eq!(drain(&mut rx), vec![text("Hel"), text("lo"), text("!")]);
    }

    #[tokio::test]
    async fn routes_tool_and_handoff_events() {
        let h = harness();
        h.backend.push_stream(
            StreamScript::new()
                .event(BackendEvent::ToolCall {
                    name: "read_file".into(),
                    arguments: "{}".into(),
                })
                .event(BackendEvent::ToolCallOutput {
                    tool_name: Some("read_file".into()),
                    output: "contents".into(),
                })
                .event(BackendEvent::Handoff {
                    source_agent: "assistant".into(),
                    target_agent: "test_writer".into(),
                    reason: None,
                })
                .event(BackendEvent::Other("role: assistant".into()))
                .text("done"),
        );

        let calls = Arc::new(Mutex::new(Vec::new()));
        let handoffs = Arc::new(Mutex::new(Vec::new()));
        let results = Arc::new(Mutex::new(Vec::new()));
        let (c, hd, r) = (calls.clone(), handoffs.clone(), results.clone());
        let mut callbacks = StreamCallbacks::new()
            .on_tool_call(move |info| c.lock().unwrap().push(info.name.clone()))
            .on_tool_result(move |info| r.lock().unwrap().push(info.output.clone()))
            .on_handoff(move |info| hd.lock().unwrap().push(info.to_agent.clone()));

        let reply = h
            .orchestrator
            .respond("hi", &ConversationContext::default(), &mut callbacks)
            .await
            .unwrap();
        assert_eq!(reply, "done");
        assert_eq!(*calls.lock().unwrap(), vec!["read_file"]);
        assert_eq!(*results.lock().unwrap(), vec!["contents"]);
        assert_eq!(*handoffs.lock().unwrap(), vec!["test_writer"]);
    }

    #[tokio::test]
    async fn malformed_events_are_skipped() {
        let h = harness();
        h.backend.push_stream(
            StreamScript::new()
                .text("a")
                .error(BackendError::MalformedEvent("{bad".into()))
                .text("b"),
        );
        let (mut callbacks, mut rx) = collect();
        let reply = h
            .orchestrator
            .respond("hi", &ConversationContext::default(), &mut callbacks)
            .await
            .unwrap();
        assert_eq!(reply, "ab");
        assert_eq!(drain(&mut rx), vec![text("a"), text("b")]);
        assert_eq!(h.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_stream_uses_final_output() {
        let h = harness();
        h.backend
            .push_stream(StreamScript::new().final_output("from final"));
        let reply = h
            .orchestrator
            .respond("hi", &ConversationContext::default(), &mut StreamCallbacks::new())
            .await
            .unwrap();
        assert_eq!(reply, "from final");
    }

    #[tokio::test]
    async fn request_carries_serialised_context() {
        let h = harness();
        h.backend.push_stream(StreamScript::new().text("ok"));
        let mut ctx = ConversationContext::new(Some("/proj".into()));
        ctx.update_current_file(crate::context::FileState::new("/proj/a.rs", "fn a() {}"));

        h.orchestrator
            .respond("explain", &ctx, &mut StreamCallbacks::new())
            .await
            .unwrap();
        let call = &h.backend.calls()[0];
        assert_eq!(call.request.prompt, "explain");
        assert_eq!(call.request.context["language"], "rust");
        assert_eq!(call.agent, "assistant");
    }

    // ── Fallback chain ──

    #[tokio::test]
    async fn mid_stream_error_falls_back_to_base_completion() {
        let h = harness();
        h.backend.push_stream(
            StreamScript::new()
                .text("partial")
                .error(BackendError::Upstream("connection reset".into())),
        );
        h.backend.push_completion("full answer");
        let (mut callbacks, mut rx) = collect();

        let reply = h
            .orchestrator
            .generate_streaming_response("hi", &ConversationContext::default(), &mut callbacks)
            .await;
        assert_eq!(reply, "full answer");

        let events = drain(&mut rx);
        assert_eq!(events[0], text("partial"));
        assert!(matches!(&events[1], StreamEvent::Error { message } if message.contains("connection reset")));

        let calls = h.backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].kind, CallKind::Complete);
        assert_eq!(calls[1].agent, "assistant");

        let records = h.trace.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].workflow, STREAMING_WORKFLOW);
        assert_eq!(records[0].status, TraceStatus::Success);
        assert_eq!(records[0].metadata["attempt"], "base_completion");
    }

    #[tokio::test]
    async fn base_failure_falls_back_to_named_agent() {
        let mut registry = AgentRegistry::with_defaults();
        registry.set_fallback("code_analyzer");
        let h = harness_with(registry, RateLimitHandler::default());
        h.backend
            .push_stream_error(BackendError::Status {
                status: 503,
                message: "unavailable".into(),
            })
            .push_completion_error(BackendError::Upstream("overloaded".into()))
            .push_completion("named answer");

        let reply = h
            .orchestrator
            .respond("hi", &ConversationContext::default(), &mut StreamCallbacks::new())
            .await
            .unwrap();
        assert_eq!(reply, "named answer");
        let agents: Vec<_> = h.backend.calls().into_iter().map(|c| c.agent).collect();
        assert_eq!(agents, vec!["assistant", "assistant", "code_analyzer"]);
    }

    #[tokio::test]
    async fn exhausted_chain_returns_apology() {
        let mut registry = AgentRegistry::new(AgentProfile::new("assistant", ""));
        registry.set_fallback("missing");
        let h = harness_with(registry, RateLimitHandler::default());
        h.backend
            .push_stream_error(BackendError::Upstream("down".into()))
            .push_completion_error(BackendError::Upstream("still down".into()));

        let err = h
            .orchestrator
            .respond("hi", &ConversationContext::default(), &mut StreamCallbacks::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, RespondError::Exhausted { last_error } if last_error.contains("missing")));
        assert!(err.to_string().contains("Error processing request"));
        assert_eq!(h.trace.records()[0].status, TraceStatus::Error);
    }

    #[tokio::test]
    async fn fatal_error_stops_chain() {
        let h = harness();
        h.backend
            .push_stream_error(BackendError::Auth("invalid key".into()))
            .push_completion("never used");

        let reply = h
            .orchestrator
            .generate_streaming_response("hi", &ConversationContext::default(), &mut StreamCallbacks::new())
            .await;
        assert!(reply.contains("invalid key"));
        assert_eq!(h.backend.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out_and_falls_back() {
        let h = harness();
        h.backend.push_stream(StreamScript::new().text("a").hang());
        h.backend.push_completion("recovered");

        let reply = h
            .orchestrator
            .respond("hi", &ConversationContext::default(), &mut StreamCallbacks::new())
            .await
            .unwrap();
        assert_eq!(reply, "recovered");
    }

    // ── Rate limiting ──

    #[tokio::test(start_paused = true)]
    async fn rate_limited_call_never_reaches_backend() {
        let h = harness_with(
            AgentRegistry::with_defaults(),
            RateLimitHandler::new(1, Duration::from_secs(60)),
        );
        h.backend.push_stream(StreamScript::new().text("first"));
        let ctx = ConversationContext::default();

        let first = h
            .orchestrator
            .generate_streaming_response("one", &ctx, &mut StreamCallbacks::new())
            .await;
        assert_eq!(first, "first");

        let second = h
            .orchestrator
            .generate_streaming_response("two", &ctx, &mut StreamCallbacks::new())
            .await;
        assert!(second.starts_with("Too many requests. Please try again in"));
        assert!(second.ends_with("seconds."));
        assert_eq!(h.backend.call_count(), 1);

        let err = h
            .orchestrator
            .respond("three", &ctx, &mut StreamCallbacks::new())
            .await
            .unwrap_err();
        let RespondError::RateLimited { wait } = err else {
            panic!("expected rate limit");
        };
        assert!(wait <= Duration::from_secs(60));
        assert!(wait > Duration::from_secs(59));
    }

    #[test]
    fn rate_limit_message_has_one_decimal() {
        let err = RespondError::RateLimited {
            wait: Duration::from_millis(12_340),
        };
        assert_eq!(
            err.to_string(),
            "Too many requests. Please try again in 12.3 seconds."
        );
    }

    // ── Supersession ──

    #[tokio::test(start_paused = true)]
    async fn newer_turn_mutes_older_callbacks() {
        let h = harness();
        h.backend.push_stream(
            StreamScript::new()
                .text("a1")
                .delay(Duration::from_secs(1))
                .text("a2"),
        );
        h.backend.push_stream(StreamScript::new().text("b1"));

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let orch = h.orchestrator.clone();
        let first = tokio::spawn(async move {
            let mut callbacks = StreamCallbacks::forward_to(a_tx);
            orch.respond("a", &ConversationContext::default(), &mut callbacks)
                .await
        });
        assert_eq!(a_rx.recv().await, Some(text("a1")));

        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let orch = h.orchestrator.clone();
        let second = tokio::spawn(async move {
            let mut callbacks = StreamCallbacks::forward_to(b_tx);
            orch.respond("b", &ConversationContext::default(), &mut callbacks)
                .await
        });

        assert_eq!(first.await.unwrap().unwrap(), "a1a2");
        assert_eq!(second.await.unwrap().unwrap(), "b1");
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx), vec![text("b1")]);
        assert_eq!(h.orchestrator.current_generation(), 2);
    }

    // ── StreamEvent ──

    #[test]
    fn stream_event_serialises_tagged() {
        let v = serde_json::to_value(StreamEvent::Handoff(HandoffInfo {
            from_agent: "a".into(),
            to_agent: "b".into(),
            reason: Some("specialist".into()),
        }))
        .unwrap();
        assert_eq!(v["type"], "handoff");
        assert_eq!(v["to_agent"], "b");
        assert_eq!(v["reason"], "specialist");
    }
}
