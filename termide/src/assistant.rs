use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

use crate::backend::ModelBackend;
use crate::command::{Command, help_text, parse_command};
use crate::config::Config;
use crate::context::{ConversationContext, FileState};
use crate::gate::{ChangeReviewer, CodeChangeGate, DocumentWriter, FsWriter, GateOutcome};
use crate::orchestrator::{StreamCallbacks, StreamingOrchestrator};
use crate::rate_limit::RateLimitHandler;
use crate::registry::AgentRegistry;
use crate::search::{PendingSearch, ProjectSearch, Selection, format_results};
use crate::trace::TraceSink;

/// Longest command output kept in the terminal snapshot sent to the model.
const MAX_TERMINAL_OUTPUT: usize = 2000;

/// What one user turn produced.
#[derive(Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    Ignored,
    Help(String),
    /// Chat answer (or the degraded message when the model was unavailable).
    Reply(String),
    SearchResults { listing: String, count: usize },
    Opened { path: PathBuf, language: String },
    OpenFailed { message: String },
    Code(GateOutcome),
}

impl fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnOutcome::Ignored => Ok(()),
            TurnOutcome::Help(text) | TurnOutcome::Reply(text) => f.write_str(text),
            TurnOutcome::SearchResults { listing, .. } => f.write_str(listing),
            TurnOutcome::Opened { path, language } => {
                write!(f, "Opened {} ({language}).", path.display())
            }
            TurnOutcome::OpenFailed { message } => f.write_str(message),
            TurnOutcome::Code(outcome) => match outcome {
                GateOutcome::Explained { text } => f.write_str(text),
                GateOutcome::NoFileOpen => f.write_str("No file is open. Use /open <path> first."),
                GateOutcome::ModelUnavailable { message } => f.write_str(message),
                GateOutcome::ExtractionFailed { raw_response } => write!(
                    f,
                    "Couldn't find a code block in the response. Nothing was changed.\n\n{raw_response}"
                ),
                GateOutcome::NoChanges { explanation } => {
                    write!(f, "No changes proposed.\n\n{explanation}")
                }
                GateOutcome::Applied {
                    path,
                    explanation,
                    file_synced,
                    ..
                } => match file_synced {
                    Ok(()) => write!(f, "Applied changes to {}.\n\n{explanation}", path.display()),
                    Err(e) => write!(f, "Applied changes in the editor, but {e}.\n\n{explanation}"),
                },
                GateOutcome::Cancelled { path } => {
                    write!(f, "Changes to {} discarded.", path.display())
                }
                GateOutcome::NotACodeCommand(command) => {
                    write!(f, "{} does not call the model.", command.token())
                }
            },
        }
    }
}

/// The application context: every component, built once and passed by value to
/// the task running the current turn.
pub struct Assistant {
    orchestrator: Arc<StreamingOrchestrator>,
    gate: CodeChangeGate,
    search: Option<ProjectSearch>,
    pending_search: PendingSearch,
    context: ConversationContext,
}

impl Assistant {
    pub fn new(
        config: &Config,
        backend: Arc<dyn ModelBackend>,
        reviewer: Arc<dyn ChangeReviewer>,
        trace: Arc<dyn TraceSink>,
        project_root: Option<PathBuf>,
    ) -> Self {
        Self::with_writer(
            config,
            backend,
            reviewer,
            Arc::new(FsWriter),
            trace,
            project_root,
        )
    }

    pub fn with_writer(
        config: &Config,
        backend: Arc<dyn ModelBackend>,
        reviewer: Arc<dyn ChangeReviewer>,
        writer: Arc<dyn DocumentWriter>,
        trace: Arc<dyn TraceSink>,
        project_root: Option<PathBuf>,
    ) -> Self {
        let mut registry = AgentRegistry::with_defaults();
        registry.set_fallback(config.fallback_agent.clone());

        let orchestrator = Arc::new(
            StreamingOrchestrator::new(
                backend,
                Arc::new(registry),
                Arc::new(RateLimitHandler::from_config(&config.rate_limit)),
                trace,
            )
            .with_stream_timeout(config.stream_timeout()),
        );
        let gate = CodeChangeGate::new(orchestrator.clone(), reviewer, writer);

        Self {
            orchestrator,
            gate,
            search: project_root.clone().map(ProjectSearch::new),
            pending_search: PendingSearch::default(),
            context: ConversationContext::new(project_root),
        }
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ConversationContext {
        &mut self.context
    }

    pub fn orchestrator(&self) -> &StreamingOrchestrator {
        &self.orchestrator
    }

    pub fn pending_search(&self) -> &PendingSearch {
        &self.pending_search
    }

    /// Model requests admitted so far.
    pub fn requests_used(&self) -> u64 {
        self.orchestrator.rate_limiter().request_count()
    }

    /// Run one user turn to completion. Streaming output goes to `callbacks`.
    ///
    /// Slash commands and what they printed become the context's terminal snapshot.
    pub async fn handle_input(&mut self, input: &str, callbacks: &mut StreamCallbacks) -> TurnOutcome {
        let input = input.trim();
        if input.is_empty() {
            return TurnOutcome::Ignored;
        }
        let outcome = self.dispatch(input, callbacks).await;
        if input.starts_with('/') {
            let output: String = outcome.to_string().chars().take(MAX_TERMINAL_OUTPUT).collect();
            self.context.update_terminal(input, output);
        }
        outcome
    }

    async fn dispatch(&mut self, input: &str, callbacks: &mut StreamCallbacks) -> TurnOutcome {
        if self.pending_search.is_pending() {
            match self.pending_search.select(input) {
                Selection::Chosen(hit) => {
                    let path = self.resolve(&hit.path);
                    return self.open_file(&path, hit.line).await;
                }
                Selection::OutOfRange { index, available } => {
                    tracing::debug!(index, available, "number outside search results; not a selection");
                }
                Selection::NotASelection => {}
            }
        }

        let parsed = parse_command(input);
        let Some(command) = parsed.kind() else {
            let reply = self
                .orchestrator
                .generate_streaming_response(input, &self.context, callbacks)
                .await;
            return TurnOutcome::Reply(reply);
        };

        match command {
            Command::Help => TurnOutcome::Help(help_text()),
            Command::Open => {
                if parsed.args.is_empty() {
                    return TurnOutcome::OpenFailed {
                        message: "Usage: /open <path>".into(),
                    };
                }
                let path = self.resolve(Path::new(&parsed.args));
                self.open_file(&path, None).await
            }
            Command::Search => self.search(&parsed.args).await,
            _ => TurnOutcome::Code(
                self.gate
                    .process_command(command, &parsed.args, &mut self.context, callbacks)
                    .await,
            ),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.context.project_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    async fn search(&mut self, query: &str) -> TurnOutcome {
        let Some(search) = &self.search else {
            return TurnOutcome::Reply("No project is open, so there is nothing to search.".into());
        };
        if query.is_empty() {
            return TurnOutcome::Reply("Usage: /search <text or glob>".into());
        }
        match search.search_async(query).await {
            Ok(hits) => {
                let listing = format_results(query, &hits);
                let count = hits.len();
                self.context
                    .set_metadata("last_search", json!({"query": query, "results": count}));
                self.pending_search.set(hits);
                TurnOutcome::SearchResults { listing, count }
            }
            Err(e) => TurnOutcome::Reply(format!("Search failed: {e}")),
        }
    }

    /// Load `path` into the editor. `line` is 1-based.
    pub async fn open_file(&mut self, path: &Path, line: Option<usize>) -> TurnOutcome {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                return TurnOutcome::OpenFailed {
                    message: format!("Could not open {}: {e}", path.display()),
                };
            }
        };
        let mut file = FileState::new(path, content);
        if let Some(line) = line {
            let offset: usize = file
                .content()
                .split_inclusive('\n')
                .take(line.saturating_sub(1))
                .map(str::len)
                .sum();
            file.set_cursor(offset);
        }
        let language = file.language.clone();
        tracing::debug!(path = %path.display(), language = %language, "opened file");
        self.context.update_current_file(file);
        TurnOutcome::Opened {
            path: path.to_path_buf(),
            language,
        }
    }
}
