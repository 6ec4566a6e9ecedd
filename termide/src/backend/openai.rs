use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Value, json};

use super::{BackendError, BackendEvent, ModelBackend, ModelRequest, ResponseStream};
use crate::registry::AgentProfile;
use crate::tools::{ToolDefinition, ToolProvider, ToolResult};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Follow-up requests allowed per call after the model asks for tools.
pub const MAX_TOOL_ROUNDS: usize = 8;

/// OpenAI-compatible `/chat/completions` client.
///
/// With a [`ToolProvider`] attached, tool calls the model makes are executed here,
/// reported as [`BackendEvent::ToolCallOutput`], and answered in a follow-up request.
#[derive(Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    organization: Option<String>,
    default_model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    tools: Option<Arc<dyn ToolProvider>>,
}

impl OpenAiBackend {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            organization: None,
            default_model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: None,
            tools: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_organization(mut self, organization: Option<String>) -> Self {
        self.organization = organization;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolProvider>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Tools sent with every request. Empty without a provider.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .as_ref()
            .map(|t| t.definitions())
            .unwrap_or_default()
    }

    fn body(&self, agent: &AgentProfile, messages: &[Value], stream: bool) -> Value {
        let mut body = json!({
            "model": agent.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
            "temperature": self.temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        let tools: Vec<Value> = self
            .tool_definitions()
            .iter()
            .map(ToolDefinition::to_openai)
            .collect();
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, BackendError> {
        let Some(api_key) = &self.api_key else {
            return Err(BackendError::NotConfigured(
                "no API key; set OPENAI_API_KEY or pass --api-key".into(),
            ));
        };
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(body);
        if let Some(org) = &self.organization {
            req = req.header("OpenAI-Organization", org);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or(text);
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            Err(BackendError::Auth(message))
        } else {
            Err(BackendError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

fn initial_messages(agent: &AgentProfile, request: &ModelRequest) -> Vec<Value> {
    vec![
        json!({"role": "system", "content": request.system_message(agent)}),
        json!({"role": "user", "content": request.prompt}),
    ]
}

fn byte_stream(resp: reqwest::Response) -> BoxStream<'static, reqwest::Result<Vec<u8>>> {
    resp.bytes_stream()
        .map(|chunk| chunk.map(|b| b.to_vec()))
        .boxed()
}

/// Run `calls`, append the assistant turn and one tool message per call to
/// `messages`, and return the outputs in call order.
async fn run_tool_calls(
    tools: &dyn ToolProvider,
    calls: Vec<ToolCallRequest>,
    content: &str,
    context: &Value,
    messages: &mut Vec<Value>,
) -> Vec<BackendEvent> {
    let requested: Vec<Value> = calls
        .iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {"name": call.name, "arguments": call.arguments},
            })
        })
        .collect();
    let content = if content.is_empty() {
        Value::Null
    } else {
        json!(content)
    };
    messages.push(json!({"role": "assistant", "content": content, "tool_calls": requested}));

    let mut outputs = Vec::with_capacity(calls.len());
    for call in calls {
        let raw = if call.arguments.trim().is_empty() {
            "{}"
        } else {
            call.arguments.as_str()
        };
        let result = match serde_json::from_str::<Value>(raw) {
            Ok(args) => tools.execute(&call.name, &args, context).await,
            Err(e) => ToolResult::err(format_args!("invalid arguments for {}: {e}", call.name)),
        };
        messages.push(json!({
            "role": "tool",
            "tool_call_id": call.id,
            "content": result.output,
        }));
        outputs.push(BackendEvent::ToolCallOutput {
            tool_name: Some(call.name),
            output: result.output,
        });
    }
    outputs
}

/// `tool_calls` of a non-streaming response message.
fn message_tool_calls(message: &Value) -> Vec<ToolCallRequest> {
    message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(i, call)| ToolCallRequest {
                    id: call["id"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{i}")),
                    name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                    arguments: call["function"]["arguments"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ModelBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(
        &self,
        agent: &AgentProfile,
        request: &ModelRequest,
    ) -> Result<Box<dyn ResponseStream>, BackendError> {
        let messages = initial_messages(agent, request);
        let resp = self.post(&self.body(agent, &messages, true)).await?;
        tracing::debug!(agent = %agent.name, "opened chat completion stream");
        Ok(Box::new(OpenAiStream {
            backend: self.clone(),
            agent: agent.clone(),
            context: request.context.clone(),
            messages,
            bytes: byte_stream(resp),
            parser: SseParser::default(),
            pending: VecDeque::new(),
            text: String::new(),
            round_text: String::new(),
            rounds: 0,
            finished: false,
        }))
    }

    async fn complete(
        &self,
        agent: &AgentProfile,
        request: &ModelRequest,
    ) -> Result<String, BackendError> {
        let mut messages = initial_messages(agent, request);
        let mut rounds = 0;
        loop {
            let resp = self.post(&self.body(agent, &messages, false)).await?;
            let body: Value = resp.json().await?;
            let message = &body["choices"][0]["message"];

            let calls = message_tool_calls(message);
            if let Some(tools) = &self.tools
                && !calls.is_empty()
                && rounds < MAX_TOOL_ROUNDS
            {
                rounds += 1;
                let content = message["content"].as_str().unwrap_or_default();
                run_tool_calls(tools.as_ref(), calls, content, &request.context, &mut messages).await;
                continue;
            }

            return message["content"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| {
                    BackendError::MalformedResponse("missing choices[0].message.content".into())
                });
        }
    }
}

struct OpenAiStream {
    backend: OpenAiBackend,
    agent: AgentProfile,
    context: Value,
    messages: Vec<Value>,
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    parser: SseParser,
    pending: VecDeque<Result<BackendEvent, BackendError>>,
    text: String,
    /// Text of the current request only. Sent back alongside its tool calls.
    round_text: String,
    rounds: usize,
    finished: bool,
}

impl OpenAiStream {
    fn absorb(&mut self, events: Vec<Result<BackendEvent, BackendError>>) {
        for event in &events {
            if let Ok(BackendEvent::TextDelta(delta)) = event {
                self.round_text.push_str(delta);
            }
        }
        self.pending.extend(events);
    }

    /// The current request has ended. If it asked for tools, run them and open
    /// the follow-up stream.
    async fn end_round(&mut self) -> Result<(), BackendError> {
        self.finished = true;
        let calls = self.parser.take_tool_calls();
        let Some(tools) = self.backend.tools.clone() else {
            return Ok(());
        };
        if calls.is_empty() {
            return Ok(());
        }
        if self.rounds >= MAX_TOOL_ROUNDS {
            tracing::warn!(rounds = self.rounds, "tool round limit reached; ending stream");
            return Ok(());
        }
        self.rounds += 1;

        let content = std::mem::take(&mut self.round_text);
        let outputs =
            run_tool_calls(tools.as_ref(), calls, &content, &self.context, &mut self.messages).await;
        self.pending.extend(outputs.into_iter().map(Ok));

        let resp = self
            .backend
            .post(&self.backend.body(&self.agent, &self.messages, true))
            .await?;
        tracing::debug!(round = self.rounds, "continuing stream after tool calls");
        self.bytes = byte_stream(resp);
        self.parser = SseParser::default();
        self.finished = false;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResponseStream for OpenAiStream {
    async fn next_event(&mut self) -> Option<Result<BackendEvent, BackendError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if let Ok(BackendEvent::TextDelta(delta)) = &event {
                    self.text.push_str(delta);
                }
                return Some(event);
            }
            if self.finished {
                return None;
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = self.parser.feed(&chunk);
                    self.absorb(events);
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
                None => {
                    let events = self.parser.finish();
                    self.absorb(events);
                    if let Err(e) = self.end_round().await {
                        self.pending.push_back(Err(e));
                    }
                }
            }
        }
    }

    async fn final_output(&mut self) -> Result<String, BackendError> {
        Ok(self.text.clone())
    }
}

/// A tool call, complete or still being assembled from stream fragments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ToolCallRequest {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental parser for chat-completion SSE frames.
///
/// Bytes are buffered until a frame is complete, so a UTF-8 sequence split across
/// chunks decodes intact. Tool-call fragments are assembled per index and emitted
/// once the choice finishes (or the stream ends).
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    tool_calls: BTreeMap<u64, ToolCallRequest>,
    completed: Vec<ToolCallRequest>,
}

/// Start and length of the first blank line ending a frame.
fn frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    (0..buffer.len()).find_map(|i| {
        let rest = &buffer[i..];
        if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else {
            None
        }
    })
}

impl SseParser {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<BackendEvent, BackendError>> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some((end, separator)) = frame_end(&self.buffer) {
            let frame = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
            self.buffer.drain(..end + separator);

            let Some(payload) = extract_data_payload(&frame) else {
                continue;
            };
            if payload == "[DONE]" {
                events.extend(self.flush_tool_calls());
                continue;
            }
            match serde_json::from_str::<Value>(&payload) {
                Ok(value) => self.map_chunk(&value, &mut events),
                Err(e) => events.push(Err(BackendError::MalformedEvent(format!("{e}: {payload}")))),
            }
        }
        events
    }

    /// Drain whatever the stream left behind when it closed.
    pub fn finish(&mut self) -> Vec<Result<BackendEvent, BackendError>> {
        let mut events = Vec::new();
        let mut rest = std::mem::take(&mut self.buffer);
        if !rest.iter().all(u8::is_ascii_whitespace) {
            rest.extend_from_slice(b"\n\n");
            events.extend(self.feed(&rest));
        }
        events.extend(self.flush_tool_calls());
        events
    }

    /// Calls emitted so far, with their ids, for answering them.
    pub(crate) fn take_tool_calls(&mut self) -> Vec<ToolCallRequest> {
        std::mem::take(&mut self.completed)
    }

    fn flush_tool_calls(&mut self) -> Vec<Result<BackendEvent, BackendError>> {
        let mut events = Vec::new();
        for (index, mut call) in std::mem::take(&mut self.tool_calls) {
            if call.id.is_empty() {
                call.id = format!("call_{index}");
            }
            events.push(Ok(BackendEvent::ToolCall {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            }));
            self.completed.push(call);
        }
        events
    }

    fn map_chunk(&mut self, value: &Value, events: &mut Vec<Result<BackendEvent, BackendError>>) {
        if let Some(error) = value.get("error") {
            let message = error["message"].as_str().unwrap_or("unknown error");
            events.push(Err(BackendError::Upstream(message.to_string())));
            return;
        }
        let Some(choice) = value["choices"].get(0) else {
            events.push(Ok(BackendEvent::Other("chunk without choices".into())));
            return;
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str()
            && !text.is_empty()
        {
            events.push(Ok(BackendEvent::TextDelta(text.to_string())));
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0);
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    entry.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    entry.name.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    entry.arguments.push_str(args);
                }
            }
        }
        if let Some(role) = delta["role"].as_str() {
            events.push(Ok(BackendEvent::Other(format!("role: {role}"))));
        }
        if choice["finish_reason"].is_string() {
            events.extend(self.flush_tool_calls());
        }
    }
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}
