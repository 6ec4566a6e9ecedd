//! The LLM boundary. Wire formats are decoded into [`BackendEvent`] here and
//! nowhere else.

mod openai;
mod scripted;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::AgentProfile;

pub use openai::{DEFAULT_BASE_URL, DEFAULT_MODEL, MAX_TOOL_ROUNDS, OpenAiBackend, SseParser};
pub use scripted::{CallKind, RecordedCall, ScriptStep, ScriptedBackend, StreamScript};

/// One model call: the user-facing prompt plus the serialised conversation context.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub prompt: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            prompt: prompt.into(),
            context,
        }
    }

    /// Agent instructions with the context appended, for backends that take a
    /// single system message.
    pub fn system_message(&self, agent: &AgentProfile) -> String {
        let has_context = match &self.context {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => !map.is_empty(),
            _ => true,
        };
        if !has_context {
            return agent.instructions.clone();
        }
        let context = serde_json::to_string_pretty(&self.context).unwrap_or_default();
        format!("{}\n\nContext:\n{}", agent.instructions, context)
    }
}

/// A decoded streaming event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    TextDelta(String),
    ToolCall {
        name: String,
        arguments: String,
    },
    ToolCallOutput {
        tool_name: Option<String>,
        output: String,
    },
    Handoff {
        source_agent: String,
        target_agent: String,
        reason: Option<String>,
    },
    /// Recognised frame with nothing for the UI (role headers, keep-alives).
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("malformed stream event: {0}")]
    MalformedEvent(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("no stream event for {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("backend not configured: {0}")]
    NotConfigured(String),
}

impl BackendError {
    /// Errors that affect one event only. The stream continues after them.
    pub fn is_skippable(&self) -> bool {
        matches!(self, BackendError::MalformedEvent(_))
    }

    /// Errors no other attempt can recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Auth(_) | BackendError::NotConfigured(_))
    }
}

/// An open streaming call.
#[async_trait::async_trait]
pub trait ResponseStream: Send {
    /// Next event, or `None` once the stream has ended.
    async fn next_event(&mut self) -> Option<Result<BackendEvent, BackendError>>;

    /// Final output of the call. Read after the stream is exhausted.
    async fn final_output(&mut self) -> Result<String, BackendError>;
}

#[async_trait::async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(
        &self,
        agent: &AgentProfile,
        request: &ModelRequest,
    ) -> Result<Box<dyn ResponseStream>, BackendError>;

    async fn complete(
        &self,
        agent: &AgentProfile,
        request: &ModelRequest,
    ) -> Result<String, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_message_without_context_is_instructions() {
        let agent = AgentProfile::new("a", "Be brief.");
        let req = ModelRequest::new("hi", json!({}));
        assert_eq!(req.system_message(&agent), "Be brief.");
    }

    #[test]
    fn system_message_appends_context() {
        let agent = AgentProfile::new("a", "Be brief.");
        let req = ModelRequest::new("hi", json!({"language": "rust"}));
        let msg = req.system_message(&agent);
        assert!(msg.starts_with("Be brief.\n\nContext:\n"));
        assert!(msg.contains("\"language\": \"rust\""));
    }

    #[test]
    fn error_classification() {
        assert!(BackendError::MalformedEvent("x".into()).is_skippable());
        assert!(!BackendError::Upstream("x".into()).is_skippable());
        assert!(BackendError::Auth("bad key".into()).is_fatal());
        assert!(!BackendError::Timeout(Duration::from_secs(1)).is_fatal());
    }
}
