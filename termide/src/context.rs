use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Map a file extension (without the dot) to a language tag.
pub fn detect_language(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "py" => "python",
        "js" => "javascript",
        "ts" => "typescript",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "md" => "markdown",
        "sh" => "bash",
        "java" => "java",
        "c" => "c",
        "cpp" | "h" => "cpp",
        "go" => "go",
        "rs" => "rust",
        "rb" => "ruby",
        "php" => "php",
        "sql" => "sql",
        "yaml" | "yml" => "yaml",
        "xml" => "xml",
        "toml" => "toml",
        _ => "text",
    }
}

/// An open document. The cursor is a byte offset and always lies within `content`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub path: PathBuf,
    content: String,
    pub language: String,
    cursor: usize,
}

impl FileState {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        let path = path.into();
        let language = detect_language(&path).to_string();
        Self {
            path,
            content: content.into(),
            language,
            cursor: 0,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn set_cursor(&mut self, offset: usize) {
        self.cursor = offset.min(self.content.len());
    }

    /// Replace the whole document, clamping the cursor.
    pub fn replace_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.cursor = self.cursor.min(self.content.len());
    }

    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn extension(&self) -> String {
        self.path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalState {
    pub last_command: Option<String>,
    pub last_output: Option<String>,
    pub current_directory: Option<PathBuf>,
}

impl TerminalState {
    fn is_empty(&self) -> bool {
        self.last_command.is_none() && self.last_output.is_none() && self.current_directory.is_none()
    }
}

/// What the assistant knows about the session: open file, project, terminal.
#[derive(Clone, Debug, Default)]
pub struct ConversationContext {
    pub current_file: Option<FileState>,
    pub project_root: Option<PathBuf>,
    pub terminal: TerminalState,
    pub metadata: BTreeMap<String, Value>,
}

impl ConversationContext {
    pub fn new(project_root: Option<PathBuf>) -> Self {
        Self {
            project_root,
            ..Default::default()
        }
    }

    pub fn update_current_file(&mut self, file: FileState) {
        self.current_file = Some(file);
    }

    pub fn update_terminal(&mut self, command: impl Into<String>, output: impl Into<String>) {
        self.terminal.last_command = Some(command.into());
        self.terminal.last_output = Some(output.into());
    }

    /// Last write wins.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// JSON object handed to the backend alongside the prompt. Absent values are omitted.
    pub fn to_prompt_context(&self) -> Value {
        let mut obj = Map::new();
        if let Some(file) = &self.current_file {
            obj.insert("file_path".into(), json!(file.path.display().to_string()));
            obj.insert("file_content".into(), json!(file.content()));
            obj.insert("language".into(), json!(file.language));
            obj.insert("cursor_position".into(), json!(file.cursor()));
        }
        if let Some(root) = &self.project_root {
            obj.insert("project_root".into(), json!(root.display().to_string()));
        }
        if !self.terminal.is_empty() {
            obj.insert("terminal".into(), json!(self.terminal));
        }
        if !self.metadata.is_empty() {
            obj.insert("metadata".into(), json!(self.metadata));
        }
        Value::Object(obj)
    }
}
