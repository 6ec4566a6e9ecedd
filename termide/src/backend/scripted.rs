use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{BackendError, BackendEvent, ModelBackend, ModelRequest, ResponseStream};
use crate::registry::AgentProfile;

/// One step of a scripted stream.
#[derive(Debug)]
pub enum ScriptStep {
    Event(BackendEvent),
    Error(BackendError),
    /// Sleep before the next step (tokio time, so paused clocks apply).
    Delay(Duration),
    /// Never yield again.
    Hang,
}

/// A queued streaming response.
#[derive(Debug, Default)]
pub struct StreamScript {
    steps: VecDeque<ScriptStep>,
    final_output: Option<String>,
}

impl StreamScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, delta: impl Into<String>) -> Self {
        self.steps
            .push_back(ScriptStep::Event(BackendEvent::TextDelta(delta.into())));
        self
    }

    pub fn event(mut self, event: BackendEvent) -> Self {
        self.steps.push_back(ScriptStep::Event(event));
        self
    }

    pub fn error(mut self, error: BackendError) -> Self {
        self.steps.push_back(ScriptStep::Error(error));
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push_back(ScriptStep::Delay(duration));
        self
    }

    pub fn hang(mut self) -> Self {
        self.steps.push_back(ScriptStep::Hang);
        self
    }

    /// Returned by `final_output()`. Defaults to the concatenated text deltas.
    pub fn final_output(mut self, output: impl Into<String>) -> Self {
        self.final_output = Some(output.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Stream,
    Complete,
}

/// A call the backend received, for assertions.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub agent: String,
    pub request: ModelRequest,
}

/// Deterministic in-memory backend. Replays queued scripts in order.
///
/// With an empty queue the call fails, unless the backend was built with
/// [`offline`](Self::offline), which echoes the prompt back instead.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    streams: Mutex<VecDeque<Result<StreamScript, BackendError>>>,
    completions: Mutex<VecDeque<Result<String, BackendError>>>,
    calls: Mutex<Vec<RecordedCall>>,
    echo: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo backend for running without network access.
    pub fn offline() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    pub fn push_stream(&self, script: StreamScript) -> &Self {
        lock(&self.streams).push_back(Ok(script));
        self
    }

    /// Make the next `stream()` call fail to open.
    pub fn push_stream_error(&self, error: BackendError) -> &Self {
        lock(&self.streams).push_back(Err(error));
        self
    }

    pub fn push_completion(&self, text: impl Into<String>) -> &Self {
        lock(&self.completions).push_back(Ok(text.into()));
        self
    }

    pub fn push_completion_error(&self, error: BackendError) -> &Self {
        lock(&self.completions).push_back(Err(error));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    fn record(&self, kind: CallKind, agent: &AgentProfile, request: &ModelRequest) {
        lock(&self.calls).push(RecordedCall {
            kind,
            agent: agent.name.clone(),
            request: request.clone(),
        });
    }

    fn echo_reply(request: &ModelRequest) -> String {
        format!("[offline] {}", request.prompt)
    }
}

#[async_trait::async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        agent: &AgentProfile,
        request: &ModelRequest,
    ) -> Result<Box<dyn ResponseStream>, BackendError> {
        self.record(CallKind::Stream, agent, request);
        let next = lock(&self.streams).pop_front();
        let script = match next {
            Some(script) => script?,
            None if self.echo => StreamScript::new().text(Self::echo_reply(request)),
            None => return Err(BackendError::Upstream("no scripted stream queued".into())),
        };
        Ok(Box::new(ScriptedStream {
            steps: script.steps,
            final_output: script.final_output,
            text: String::new(),
        }))
    }

    async fn complete(
        &self,
        agent: &AgentProfile,
        request: &ModelRequest,
    ) -> Result<String, BackendError> {
        self.record(CallKind::Complete, agent, request);
        let next = lock(&self.completions).pop_front();
        match next {
            Some(result) => result,
            None if self.echo => Ok(Self::echo_reply(request)),
            None => Err(BackendError::Upstream("no scripted completion queued".into())),
        }
    }
}

struct ScriptedStream {
    steps: VecDeque<ScriptStep>,
    final_output: Option<String>,
    text: String,
}

#[async_trait::async_trait]
impl ResponseStream for ScriptedStream {
    async fn next_event(&mut self) -> Option<Result<BackendEvent, BackendError>> {
        loop {
            match self.steps.pop_front()? {
                ScriptStep::Event(event) => {
                    if let BackendEvent::TextDelta(delta) = &event {
                        self.text.push_str(delta);
                    }
                    return Some(Ok(event));
                }
                ScriptStep::Error(error) => return Some(Err(error)),
                ScriptStep::Delay(duration) => tokio::time::sleep(duration).await,
                ScriptStep::Hang => std::future::pending::<()>().await,
            }
        }
    }

    async fn final_output(&mut self) -> Result<String, BackendError> {
        Ok(self
            .final_output
            .clone()
            .unwrap_or_else(|| self.text.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent() -> AgentProfile {
        AgentProfile::new("assistant", "")
    }

    #[tokio::test]
    async fn replays_stream_in_order() {
        let backend = ScriptedBackend::new();
        backend.push_stream(StreamScript::new().text("a").text("b").final_output("done"));

        let mut stream = backend
            .stream(&agent(), &ModelRequest::new("hi", json!({})))
            .await
            .unwrap();
        assert_eq!(
            stream.next_event().await.unwrap().unwrap(),
            BackendEvent::TextDelta("a".into())
        );
        assert_eq!(
            stream.next_event().await.unwrap().unwrap(),
            BackendEvent::TextDelta("b".into())
        );
        assert!(stream.next_event().await.is_none());
        assert_eq!(stream.final_output().await.unwrap(), "done");
        assert_eq!(backend.calls()[0].kind, CallKind::Stream);
    }

    #[tokio::test]
    async fn empty_queue_fails_unless_offline() {
        let backend = ScriptedBackend::new();
        assert!(backend.complete(&agent(), &ModelRequest::default()).await.is_err());

        let offline = ScriptedBackend::offline();
        let reply = offline
            .complete(&agent(), &ModelRequest::new("ping", json!({})))
            .await
            .unwrap();
        assert_eq!(reply, "[offline] ping");
    }

    #[tokio::test]
    async fn queued_open_error_is_returned() {
        let backend = ScriptedBackend::new();
        backend.push_stream_error(BackendError::Auth("bad key".into()));
        let err = backend
            .stream(&agent(), &ModelRequest::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::Auth(_)));
        assert_eq!(backend.call_count(), 1);
    }
}
