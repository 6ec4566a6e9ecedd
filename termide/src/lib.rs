pub mod assistant;
pub mod backend;
pub mod command;
pub mod config;
pub mod context;
pub mod diff;
pub mod gate;
pub mod orchestrator;
pub mod rate_limit;
pub mod registry;
pub mod search;
pub mod tools;
pub mod trace;

// Re-exports
pub use assistant::{Assistant, TurnOutcome};
pub use backend::{
    BackendError, BackendEvent, ModelBackend, ModelRequest, OpenAiBackend, ResponseStream,
    ScriptedBackend, StreamScript,
};
pub use command::{Command, ParsedCommand, parse_command};
pub use config::{Config, ConfigError};
pub use context::{ConversationContext, FileState, TerminalState};
pub use diff::{
    DiffChange, DiffStyle, PatchError, apply_patch, generate_diff, get_changes, highlight_diff,
};
pub use gate::{
    ChangeReviewer, ChannelReviewer, CodeChangeGate, Decision, DocumentWriter, FixedReviewer,
    FsWriter, GateOutcome, PendingChange, ReviewRequest,
};
pub use orchestrator::{
    Attempt, HandoffInfo, RespondError, StreamCallbacks, StreamEvent, StreamingOrchestrator,
    ToolCallInfo, ToolResultInfo,
};
pub use rate_limit::{RateLimitConfig, RateLimitHandler};
pub use registry::{AgentProfile, AgentRegistry};
pub use search::{PendingSearch, ProjectSearch, SearchError, SearchHit};
pub use tools::{ProjectTools, ToolDefinition, ToolProvider, ToolResult};
pub use trace::{
    JsonlTraceSink, MemoryTraceSink, NoopTraceSink, TraceError, TraceRecord, TraceSink,
    TraceStatus, read_traces, summarize,
};
