use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::sync::{mpsc, oneshot};

use crate::command::{Command, build_prompt};
use crate::context::ConversationContext;
use crate::diff::{highlight_diff, unified_diff};
use crate::orchestrator::{StreamCallbacks, StreamingOrchestrator};
use crate::trace::traced;

pub const APPLY_WORKFLOW: &str = "apply_change";

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([\w+#.-]*)[^\n]*\n(.*?)\n?```").expect("code fence regex")
});

/// The first fenced block of a model response and the prose around it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedCode {
    pub code: String,
    pub language: Option<String>,
    /// Response with the block removed, trimmed.
    pub explanation: String,
}

/// CRLF line endings are normalised first, so the code never carries `\r`.
pub fn extract_code_block(response: &str) -> Option<ExtractedCode> {
    let normalised;
    let response = if response.contains("\r\n") {
        normalised = response.replace("\r\n", "\n");
        normalised.as_str()
    } else {
        response
    };
    let caps = CODE_FENCE.captures(response)?;
    let whole = caps.get(0)?;
    let language = caps
        .get(1)
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let code = caps.get(2).map(|m| m.as_str()).unwrap_or_default().to_string();

    let mut explanation = String::with_capacity(response.len());
    explanation.push_str(&response[..whole.start()]);
    explanation.push_str(&response[whole.end()..]);

    Some(ExtractedCode {
        code,
        language,
        explanation: explanation.trim().to_string(),
    })
}

/// Extracted blocks never end in a newline. Match the original's trailing newline.
fn as_document(code: &str, original: &str) -> String {
    if original.ends_with('\n') && !code.ends_with('\n') && !code.is_empty() {
        format!("{code}\n")
    } else {
        code.to_string()
    }
}

/// A proposed edit awaiting the user's decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingChange {
    pub command: Command,
    pub path: PathBuf,
    pub original_code: String,
    pub proposed_code: String,
    pub diff_text: String,
    pub explanation: String,
}

impl PendingChange {
    /// (removed, added) line counts.
    pub fn line_counts(&self) -> (usize, usize) {
        let (removed, added) = highlight_diff(&self.original_code, &self.proposed_code);
        (removed.len(), added.len())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Cancel,
}

/// Shows a [`PendingChange`] to the user and waits for Accept or Cancel.
#[async_trait::async_trait]
pub trait ChangeReviewer: Send + Sync {
    async fn review(&self, change: &PendingChange) -> Decision;
}

/// Sent to the UI by [`ChannelReviewer`].
#[derive(Debug)]
pub struct ReviewRequest {
    pub change: PendingChange,
    pub respond_to: oneshot::Sender<Decision>,
}

/// Hands each review to the UI over a channel. A dropped request counts as Cancel.
#[derive(Clone)]
pub struct ChannelReviewer {
    tx: mpsc::UnboundedSender<ReviewRequest>,
}

impl ChannelReviewer {
    pub fn new(tx: mpsc::UnboundedSender<ReviewRequest>) -> Self {
        Self { tx }
    }
}

#[async_trait::async_trait]
impl ChangeReviewer for ChannelReviewer {
    async fn review(&self, change: &PendingChange) -> Decision {
        let (respond_to, rx) = oneshot::channel();
        let request = ReviewRequest {
            change: change.clone(),
            respond_to,
        };
        if self.tx.send(request).is_err() {
            tracing::warn!("review channel closed; cancelling change");
            return Decision::Cancel;
        }
        rx.await.unwrap_or(Decision::Cancel)
    }
}

/// Answers every review the same way (`--yes`, headless runs).
pub struct FixedReviewer(pub Decision);

#[async_trait::async_trait]
impl ChangeReviewer for FixedReviewer {
    async fn review(&self, _change: &PendingChange) -> Decision {
        self.0
    }
}

/// Write-through for accepted changes.
#[async_trait::async_trait]
pub trait DocumentWriter: Send + Sync {
    async fn write(&self, path: &Path, content: &str) -> std::io::Result<()>;
}

#[derive(Default)]
pub struct FsWriter;

#[async_trait::async_trait]
impl DocumentWriter for FsWriter {
    async fn write(&self, path: &Path, content: &str) -> std::io::Result<()> {
        tokio::fs::write(path, content).await
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum GateOutcome {
    /// `/explain` answer.
    Explained { text: String },
    NoFileOpen,
    /// The call was rate limited or every fallback failed.
    ModelUnavailable { message: String },
    ExtractionFailed { raw_response: String },
    NoChanges { explanation: String },
    Applied {
        path: PathBuf,
        diff_text: String,
        explanation: String,
        /// In-memory state is updated even when this is `Err`.
        file_synced: Result<(), String>,
    },
    Cancelled { path: PathBuf },
    /// Help, search and open never reach the model.
    NotACodeCommand(Command),
}

/// Turns code commands into reviewed edits of the open document.
pub struct CodeChangeGate {
    orchestrator: Arc<StreamingOrchestrator>,
    reviewer: Arc<dyn ChangeReviewer>,
    writer: Arc<dyn DocumentWriter>,
}

impl CodeChangeGate {
    pub fn new(
        orchestrator: Arc<StreamingOrchestrator>,
        reviewer: Arc<dyn ChangeReviewer>,
        writer: Arc<dyn DocumentWriter>,
    ) -> Self {
        Self {
            orchestrator,
            reviewer,
            writer,
        }
    }

    pub async fn process_command(
        &self,
        command: Command,
        args: &str,
        context: &mut ConversationContext,
        callbacks: &mut StreamCallbacks,
    ) -> GateOutcome {
        if command.is_local() {
            return GateOutcome::NotACodeCommand(command);
        }

        let (code, language) = match &context.current_file {
            Some(file) => (file.content().to_string(), file.language.clone()),
            None if command == Command::Explain && !args.is_empty() => {
                (String::new(), "text".to_string())
            }
            None => return GateOutcome::NoFileOpen,
        };
        let prompt = build_prompt(command, args, &code, &language);

        let response = match self.orchestrator.respond(&prompt, context, callbacks).await {
            Ok(text) => text,
            Err(e) => {
                return GateOutcome::ModelUnavailable {
                    message: e.to_string(),
                };
            }
        };

        if !command.is_mutating() {
            return GateOutcome::Explained { text: response };
        }

        let Some(extracted) = extract_code_block(&response) else {
            tracing::info!(command = command.token(), "no code block in response");
            return GateOutcome::ExtractionFailed {
                raw_response: response,
            };
        };
        let proposed = as_document(&extracted.code, &code);
        if proposed == code {
            return GateOutcome::NoChanges {
                explanation: extracted.explanation,
            };
        }

        let Some(path) = context.current_file.as_ref().map(|f| f.path.clone()) else {
            return GateOutcome::NoFileOpen;
        };
        let change = PendingChange {
            command,
            path,
            diff_text: unified_diff(&code, &proposed),
            original_code: code,
            proposed_code: proposed,
            explanation: extracted.explanation,
        };

        match self.reviewer.review(&change).await {
            Decision::Cancel => {
                tracing::debug!(path = %change.path.display(), "change cancelled");
                GateOutcome::Cancelled { path: change.path }
            }
            Decision::Accept => self.commit(change, context).await,
        }
    }

    async fn commit(&self, change: PendingChange, context: &mut ConversationContext) -> GateOutcome {
        let (removed, added) = change.line_counts();
        let mut metadata = serde_json::Map::new();
        metadata.insert("path".into(), change.path.display().to_string().into());
        metadata.insert("command".into(), change.command.token().into());
        metadata.insert("lines_removed".into(), removed.into());
        metadata.insert("lines_added".into(), added.into());

        if let Some(file) = context.current_file.as_mut() {
            file.replace_content(change.proposed_code.clone());
        }

        let file_synced = traced(self.orchestrator.trace_sink(), APPLY_WORKFLOW, metadata, async {
            self.writer
                .write(&change.path, &change.proposed_code)
                .await
                .map_err(|e| format!("failed to write {}: {e}", change.path.display()))
        })
        .await;
        if let Err(e) = &file_synced {
            tracing::warn!("{e}");
        }

        GateOutcome::Applied {
            path: change.path,
            diff_text: change.diff_text,
            explanation: change.explanation,
            file_synced,
        }
    }
}
