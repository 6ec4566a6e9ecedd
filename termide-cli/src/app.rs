use std::path::PathBuf;

use termide_core::{
    Decision, GateOutcome, PendingChange, ReviewRequest, StreamEvent, TurnOutcome,
};
use tokio::sync::oneshot;

/// A renderable block in the scrollable history.
#[derive(Debug, PartialEq)]
pub enum DisplayBlock {
    UserInput(String),
    AssistantText(String),
    ToolCall {
        name: String,
        arguments: String,
    },
    ToolResult {
        tool_name: Option<String>,
        output: String,
    },
    Handoff {
        from: String,
        to: String,
    },
    /// A reviewed change. `accepted` is false for discarded proposals.
    Diff {
        path: String,
        diff_text: String,
        accepted: bool,
    },
    Error(String),
    /// Informational message (help, search results, apply confirmations).
    SystemMessage(String),
    Splash,
}

/// How many visual rows a single line of text takes when wrapped to `width`.
fn wrapped_line_height(line: &str, width: usize) -> usize {
    if width == 0 {
        return 1;
    }
    let len = unicode_width::UnicodeWidthStr::width(line);
    if len == 0 { 1 } else { len.div_ceil(width) }
}

/// Sum of wrapped visual rows for a multi-line string, with a prefix width per line.
pub fn wrapped_text_height(text: &str, width: usize, prefix_chars: usize) -> usize {
    let effective = width.saturating_sub(prefix_chars);
    let h: usize = text
        .lines()
        .map(|line| wrapped_line_height(line, effective))
        .sum();
    h.max(1)
}

pub const SPLASH_LINES: usize = 4;

impl DisplayBlock {
    /// Visual rows this block takes when rendered at `width` columns.
    /// Must stay in step with `ui::render_block`.
    pub fn height(&self, width: usize) -> usize {
        match self {
            DisplayBlock::UserInput(s) | DisplayBlock::Error(s) => {
                wrapped_text_height(s, width, 2) + 1
            }
            DisplayBlock::AssistantText(s) | DisplayBlock::SystemMessage(s) => {
                wrapped_text_height(s, width, 0) + 1
            }
            DisplayBlock::ToolCall { .. }
            | DisplayBlock::ToolResult { .. }
            | DisplayBlock::Handoff { .. } => 1,
            DisplayBlock::Diff { diff_text, .. } => {
                // header + body + blank
                1 + wrapped_text_height(diff_text, width, 2) + 1
            }
            DisplayBlock::Splash => SPLASH_LINES,
        }
    }
}

/// The change on screen in the review modal.
pub struct ReviewState {
    pub change: PendingChange,
    respond_to: Option<oneshot::Sender<Decision>>,
    pub scroll: usize,
}

pub struct App {
    pub blocks: Vec<DisplayBlock>,
    pub input: String,
    pub cursor_pos: usize,
    pub scroll_offset: usize,
    /// Auto-scroll to bottom on new output. Disabled when the user scrolls up.
    pub follow_output: bool,
    pub running: bool,
    pub model: String,
    /// Display name of the open file, if any.
    pub open_file: Option<String>,
    /// Requests admitted in the current rate-limit window.
    pub requests_used: usize,
    pub max_requests: usize,
    pub offline: bool,
    pub input_history: Vec<String>,
    pub input_history_idx: Option<usize>,
    /// Spinner frame counter
    pub tick: usize,
    /// Streamed text of the turn in flight. Replaced by the final outcome on completion.
    pub pending_text: String,
    /// Latest fallback notice of the turn in flight.
    pub status_text: Option<String>,
    /// Inputs submitted while a turn is running, sent in order afterwards.
    pub message_queue: Vec<String>,
    pub review: Option<ReviewState>,
    pub dirty: bool,
}

impl App {
    pub fn new(model: String, max_requests: usize, offline: bool) -> Self {
        Self {
            blocks: vec![DisplayBlock::Splash],
            input: String::new(),
            cursor_pos: 0,
            scroll_offset: 0,
            follow_output: true,
            running: false,
            model,
            open_file: None,
            requests_used: 0,
            max_requests,
            offline,
            input_history: Vec::new(),
            input_history_idx: None,
            tick: 0,
            pending_text: String::new(),
            status_text: None,
            message_queue: Vec::new(),
            review: None,
            dirty: true,
        }
    }

    /// Get the current input text and reset input state.
    pub fn take_input(&mut self) -> String {
        let text = std::mem::take(&mut self.input);
        if !text.trim().is_empty() {
            self.input_history.push(text.clone());
        }
        self.cursor_pos = 0;
        self.input_history_idx = None;
        self.follow_output = true;
        text
    }

    /// Record the user's input and mark a turn as running.
    pub fn begin_turn(&mut self, input: &str) {
        self.blocks.push(DisplayBlock::UserInput(input.to_string()));
        self.pending_text.clear();
        self.status_text = None;
        self.running = true;
        self.scroll_to_bottom();
    }

    pub fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TextDelta { text } => self.pending_text.push_str(&text),
            StreamEvent::ToolCall(info) => {
                self.flush_pending_text();
                self.blocks.push(DisplayBlock::ToolCall {
                    name: info.name,
                    arguments: info.arguments,
                });
            }
            StreamEvent::ToolResult(info) => {
                self.flush_pending_text();
                self.blocks.push(DisplayBlock::ToolResult {
                    tool_name: info.tool_name,
                    output: info.output,
                });
            }
            StreamEvent::Handoff(info) => {
                self.flush_pending_text();
                self.blocks.push(DisplayBlock::Handoff {
                    from: info.from_agent,
                    to: info.to_agent,
                });
            }
            // Fallback notices. The turn keeps going, so they stay on the status bar.
            StreamEvent::Error { message } => self.status_text = Some(message),
        }
        self.scroll_to_bottom();
    }

    /// Text streamed before a tool call or handoff is kept as its own block.
    fn flush_pending_text(&mut self) {
        if !self.pending_text.is_empty() {
            let text = std::mem::take(&mut self.pending_text);
            self.blocks.push(DisplayBlock::AssistantText(text));
        }
    }

    /// Replace the streamed text with the turn's final result.
    pub fn finish_turn(&mut self, outcome: &TurnOutcome, open_file: Option<String>, requests_used: usize) {
        self.running = false;
        self.status_text = None;
        self.open_file = open_file;
        self.requests_used = requests_used;
        let streamed = std::mem::take(&mut self.pending_text);

        match outcome {
            TurnOutcome::Ignored => {}
            TurnOutcome::Reply(text) => {
                let text = if text.is_empty() { streamed } else { text.clone() };
                self.blocks.push(DisplayBlock::AssistantText(text));
            }
            TurnOutcome::Code(GateOutcome::Explained { text }) => {
                self.blocks.push(DisplayBlock::AssistantText(text.clone()));
            }
            TurnOutcome::Code(GateOutcome::Applied { path, diff_text, .. }) => {
                self.blocks.push(DisplayBlock::Diff {
                    path: path.display().to_string(),
                    diff_text: diff_text.clone(),
                    accepted: true,
                });
                self.blocks.push(DisplayBlock::SystemMessage(outcome.to_string()));
            }
            TurnOutcome::Code(GateOutcome::ModelUnavailable { .. })
            | TurnOutcome::Code(GateOutcome::NoFileOpen)
            | TurnOutcome::OpenFailed { .. } => {
                self.blocks.push(DisplayBlock::Error(outcome.to_string()));
            }
            _ => self.blocks.push(DisplayBlock::SystemMessage(outcome.to_string())),
        }
        self.scroll_to_bottom();
    }

    // ── Review modal ──

    pub fn open_review(&mut self, request: ReviewRequest) {
        // A second request while one is open cannot happen with one turn at a time;
        // if it does, the older one is cancelled.
        self.answer_review(Decision::Cancel);
        self.review = Some(ReviewState {
            change: request.change,
            respond_to: Some(request.respond_to),
            scroll: 0,
        });
    }

    pub fn has_review(&self) -> bool {
        self.review.is_some()
    }

    /// Send the decision to the waiting turn and close the modal.
    pub fn answer_review(&mut self, decision: Decision) {
        let Some(mut review) = self.review.take() else {
            return;
        };
        if decision == Decision::Cancel {
            self.blocks.push(DisplayBlock::Diff {
                path: review.change.path.display().to_string(),
                diff_text: review.change.diff_text.clone(),
                accepted: false,
            });
        }
        if let Some(tx) = review.respond_to.take() {
            let _ = tx.send(decision);
        }
        self.scroll_to_bottom();
    }

    pub fn review_scroll(&mut self, delta: isize) {
        if let Some(review) = &mut self.review {
            let max = review.change.diff_text.lines().count().saturating_sub(1);
            review.scroll = review.scroll.saturating_add_signed(delta).min(max);
        }
    }

    // ── Queue ──

    pub fn queue_message(&mut self, msg: String) {
        self.message_queue.push(msg);
    }

    pub fn take_queued_message(&mut self) -> Option<String> {
        if self.message_queue.is_empty() {
            None
        } else {
            Some(self.message_queue.remove(0))
        }
    }

    pub fn unqueue_last(&mut self) -> Option<String> {
        self.message_queue.pop()
    }

    // ── Scrolling ──

    pub fn total_content_height(&self, width: usize) -> usize {
        let blocks: usize = self.blocks.iter().map(|b| b.height(width)).sum();
        let streaming = if self.pending_text.is_empty() {
            0
        } else {
            wrapped_text_height(&self.pending_text, width, 0)
        };
        blocks + streaming
    }

    pub fn scroll_up(&mut self, amount: usize) {
        self.scroll_offset = self.scroll_offset.saturating_sub(amount);
        self.follow_output = false;
    }

    pub fn scroll_down(&mut self, amount: usize, viewport_height: usize, viewport_width: usize) {
        let max_scroll = self
            .total_content_height(viewport_width)
            .saturating_sub(viewport_height);
        self.scroll_offset = self.scroll_offset.saturating_add(amount).min(max_scroll);
        if self.scroll_offset >= max_scroll {
            self.follow_output = true;
        }
    }

    pub fn scroll_to_bottom(&mut self) {
        if self.follow_output {
            // Clamped before drawing, once the viewport is known.
            self.scroll_offset = usize::MAX;
        }
    }

    pub fn clamp_scroll(&mut self, viewport_height: usize, viewport_width: usize) {
        let max_scroll = self
            .total_content_height(viewport_width)
            .saturating_sub(viewport_height);
        self.scroll_offset = self.scroll_offset.min(max_scroll);
    }

    // ── Input editing ──

    pub fn history_up(&mut self) {
        if self.input_history.is_empty() {
            return;
        }
        let idx = match self.input_history_idx {
            None => self.input_history.len() - 1,
            Some(i) => i.saturating_sub(1),
        };
        self.input_history_idx = Some(idx);
        self.input = self.input_history[idx].clone();
        self.cursor_pos = self.input.len();
    }

    pub fn history_down(&mut self) {
        match self.input_history_idx {
            None => {}
            Some(i) if i + 1 >= self.input_history.len() => {
                self.input_history_idx = None;
                self.input.clear();
                self.cursor_pos = 0;
            }
            Some(i) => {
                self.input_history_idx = Some(i + 1);
                self.input = self.input_history[i + 1].clone();
                self.cursor_pos = self.input.len();
            }
        }
    }

    pub fn insert_char(&mut self, c: char) {
        self.input.insert(self.cursor_pos, c);
        self.cursor_pos += c.len_utf8();
    }

    pub fn backspace(&mut self) {
        if self.cursor_pos > 0 {
            let prev = self.input[..self.cursor_pos]
                .char_indices()
                .next_back()
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.input.drain(prev..self.cursor_pos);
            self.cursor_pos = prev;
        }
    }

    pub fn delete(&mut self) {
        if self.cursor_pos < self.input.len() {
            let next = self.input[self.cursor_pos..]
                .char_indices()
                .nth(1)
                .map(|(i, _)| self.cursor_pos + i)
                .unwrap_or(self.input.len());
            self.input.drain(self.cursor_pos..next);
        }
    }

    pub fn move_cursor_left(&mut self) {
        if self.cursor_pos > 0 {
            self.cursor_pos = self.input[..self.cursor_pos]
                .char_indices()
                .next_back()
                .map(|(i, _)| i)
                .unwrap_or(0);
        }
    }

    pub fn move_cursor_right(&mut self) {
        if self.cursor_pos < self.input.len() {
            self.cursor_pos = self.input[self.cursor_pos..]
                .char_indices()
                .nth(1)
                .map(|(i, _)| self.cursor_pos + i)
                .unwrap_or(self.input.len());
        }
    }

    pub fn move_cursor_home(&mut self) {
        self.cursor_pos = 0;
    }

    pub fn move_cursor_end(&mut self) {
        self.cursor_pos = self.input.len();
    }
}

/// File name shown in the status bar.
pub fn display_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Path argument as given, resolved against `root` when relative.
pub fn resolve_path(root: &std::path::Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() { path } else { root.join(path) }
}
