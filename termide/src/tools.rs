//! Tools the model may call while it answers. All of them are read-only and every
//! path argument must resolve inside the project root. Edits reach the disk only
//! through the review gate.

use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use crate::search::ProjectSearch;

const MAX_READ_BYTES: usize = 100_000;
const MAX_ENTRIES: usize = 500;
const DEFAULT_FIND_RESULTS: usize = 20;

/// A function the model can call, with its JSON Schema parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    /// Chat-completions `tools` entry.
    pub fn to_openai(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Result of executing a tool. Failures are reported to the model, not raised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn err(message: impl fmt::Display) -> Self {
        Self {
            success: false,
            output: format!("Error: {message}"),
        }
    }
}

/// Tools offered to the model. `context` is the prompt context of the request
/// being answered.
#[async_trait::async_trait]
pub trait ToolProvider: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;
    async fn execute(&self, name: &str, args: &Value, context: &Value) -> ToolResult;
}

/// Extract a required non-empty string arg, or return ToolResult::err.
fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolResult> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolResult::err(format_args!("missing required parameter: {key}")))
}

/// `read_file`, `list_directory`, `find_in_project` and `get_current_file` over
/// one project tree.
#[derive(Clone, Debug)]
pub struct ProjectTools {
    search: ProjectSearch,
}

impl ProjectTools {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            search: ProjectSearch::new(root),
        }
    }

    pub fn root(&self) -> &Path {
        self.search.root()
    }

    /// Resolve `raw` against the root and refuse anything that lands outside it,
    /// symlinks included.
    async fn confine(&self, raw: &str) -> Result<PathBuf, ToolResult> {
        let root = tokio::fs::canonicalize(self.root())
            .await
            .map_err(|e| ToolResult::err(format_args!("project root unavailable: {e}")))?;
        let joined = root.join(raw);
        let resolved = tokio::fs::canonicalize(&joined)
            .await
            .map_err(|e| ToolResult::err(format_args!("{raw}: {e}")))?;
        if !resolved.starts_with(&root) {
            tracing::warn!(path = raw, "tool path outside project root refused");
            return Err(ToolResult::err(format_args!("{raw} is outside the project")));
        }
        Ok(resolved)
    }

    async fn read_file(&self, args: &Value) -> ToolResult {
        let raw = match require_str(args, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let path = match self.confine(raw).await {
            Ok(p) => p,
            Err(e) => return e,
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => return ToolResult::err(format_args!("failed to read {raw}: {e}")),
        };
        let truncated = bytes.len() > MAX_READ_BYTES;
        let mut text = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_READ_BYTES)]).into_owned();
        if truncated {
            text.push_str(&format!("\n... truncated at {MAX_READ_BYTES} bytes"));
        }
        ToolResult::ok(text)
    }

    async fn list_directory(&self, args: &Value) -> ToolResult {
        let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let show_hidden = args.get("show_hidden").and_then(Value::as_bool).unwrap_or(false);
        let dir = match self.confine(raw).await {
            Ok(p) => p,
            Err(e) => return e,
        };
        if !dir.is_dir() {
            return ToolResult::err(format_args!("not a directory: {raw}"));
        }

        let listing = tokio::task::spawn_blocking(move || {
            let walker = ignore::WalkBuilder::new(&dir)
                .hidden(!show_hidden)
                .git_ignore(true)
                .max_depth(Some(1))
                .sort_by_file_path(|a, b| a.cmp(b))
                .build();
            let mut entries = Vec::new();
            for entry in walker.flatten() {
                if entry.depth() == 0 {
                    continue;
                }
                if entries.len() >= MAX_ENTRIES {
                    entries.push(format!("... truncated at {MAX_ENTRIES} entries"));
                    break;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().is_some_and(|t| t.is_dir()) {
                    entries.push(format!("{name}/"));
                } else {
                    entries.push(name);
                }
            }
            entries.join("\n")
        })
        .await;
        match listing {
            Ok(listing) => ToolResult::ok(listing),
            Err(e) => ToolResult::err(e),
        }
    }

    async fn find_in_project(&self, args: &Value) -> ToolResult {
        let query = match require_str(args, "query") {
            Ok(q) => q,
            Err(e) => return e,
        };
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n.clamp(1, 100) as usize)
            .unwrap_or(DEFAULT_FIND_RESULTS);
        let search = self.search.clone().with_max_results(max_results);
        match search.search_async(query).await {
            Ok(hits) if hits.is_empty() => ToolResult::ok(format!("No matches for {query:?}.")),
            Ok(hits) => ToolResult::ok(
                hits.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            Err(e) => ToolResult::err(e),
        }
    }
}

fn current_file(context: &Value) -> ToolResult {
    let Some(path) = context.get("file_path").and_then(Value::as_str) else {
        return ToolResult::ok("No file is open.");
    };
    let info = json!({
        "path": path,
        "language": context.get("language").cloned().unwrap_or(Value::Null),
        "cursor_position": context.get("cursor_position").cloned().unwrap_or(Value::Null),
        "content": context.get("file_content").cloned().unwrap_or(Value::Null),
    });
    ToolResult::ok(info.to_string())
}

#[async_trait::async_trait]
impl ToolProvider for ProjectTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "read_file".into(),
                description: "Read a file in the project. Paths are relative to the project root.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "File path relative to the project root"}
                    },
                    "required": ["path"],
                }),
            },
            ToolDefinition {
                name: "list_directory".into(),
                description: "List the entries of a project directory, respecting .gitignore. Directories end in '/'.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Directory relative to the project root (default: root)"},
                        "show_hidden": {"type": "boolean", "description": "Include dotfiles"}
                    },
                }),
            },
            ToolDefinition {
                name: "find_in_project".into(),
                description: "Search the project. A glob (e.g. '*.rs') matches file names; other text is matched case-insensitively against names and contents.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Text or glob pattern"},
                        "max_results": {"type": "integer", "description": "Maximum results (default 20)"}
                    },
                    "required": ["query"],
                }),
            },
            ToolDefinition {
                name: "get_current_file".into(),
                description: "Path, language, cursor offset and content of the file open in the editor.".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
        ]
    }

    async fn execute(&self, name: &str, args: &Value, context: &Value) -> ToolResult {
        let result = match name {
            "read_file" => self.read_file(args).await,
            "list_directory" => self.list_directory(args).await,
            "find_in_project" => self.find_in_project(args).await,
            "get_current_file" => current_file(context),
            other => ToolResult::err(format_args!("unknown tool: {other}")),
        };
        tracing::debug!(tool = name, success = result.success, "tool executed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {\n    run();\n}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# Demo\nrun it\n").unwrap();
        std::fs::write(dir.path().join(".env"), "SECRET=1\n").unwrap();
        dir
    }

    async fn run(tools: &ProjectTools, name: &str, args: Value) -> ToolResult {
        tools.execute(name, &args, &json!({})).await
    }

    // ── Definitions ──

    #[test]
    fn definitions_serialise_as_functions() {
        let tools = ProjectTools::new("/tmp");
        let defs = tools.definitions();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["read_file", "list_directory", "find_in_project", "get_current_file"]
        );
        let v = defs[0].to_openai();
        assert_eq!(v["type"], "function");
        assert_eq!(v["function"]["name"], "read_file");
        assert_eq!(v["function"]["parameters"]["required"][0], "path");
    }

    // ── read_file ──

    #[tokio::test]
    async fn reads_relative_path() {
        let dir = project();
        let tools = ProjectTools::new(dir.path());
        let result = run(&tools, "read_file", json!({"path": "src/main.rs"})).await;
        assert!(result.success);
        assert!(result.output.contains("run();"));
    }

    #[tokio::test]
    async fn refuses_paths_outside_root() {
        let outer = TempDir::new().unwrap();
        std::fs::write(outer.path().join("secret.txt"), "nope").unwrap();
        std::fs::create_dir(outer.path().join("proj")).unwrap();
        let tools = ProjectTools::new(outer.path().join("proj"));

        let result = run(&tools, "read_file", json!({"path": "../secret.txt"})).await;
        assert!(!result.success);
        assert!(result.output.contains("outside the project"));

        let secret = outer.path().join("secret.txt");
        let result = run(&tools, "read_file", json!({"path": secret.to_str().unwrap()})).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn missing_path_is_reported() {
        let dir = project();
        let tools = ProjectTools::new(dir.path());
        let result = run(&tools, "read_file", json!({})).await;
        assert_eq!(result, ToolResult::err("missing required parameter: path"));
        let result = run(&tools, "read_file", json!({"path": "nope.rs"})).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn large_files_are_truncated() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(MAX_READ_BYTES + 10)).unwrap();
        let tools = ProjectTools::new(dir.path());
        let result = run(&tools, "read_file", json!({"path": "big.txt"})).await;
        assert!(result.output.ends_with(&format!("truncated at {MAX_READ_BYTES} bytes")));
    }

    // ── list_directory ──

    #[tokio::test]
    async fn lists_one_level_sorted() {
        let dir = project();
        let tools = ProjectTools::new(dir.path());
        let result = run(&tools, "list_directory", json!({})).await;
        assert_eq!(result, ToolResult::ok("README.md\nsrc/"));

        let result = run(&tools, "list_directory", json!({"show_hidden": true})).await;
        assert!(result.output.contains(".env"));

        let result = run(&tools, "list_directory", json!({"path": "src"})).await;
        assert_eq!(result.output, "main.rs");
    }

    #[tokio::test]
    async fn listing_a_file_fails() {
        let dir = project();
        let tools = ProjectTools::new(dir.path());
        let result = run(&tools, "list_directory", json!({"path": "README.md"})).await;
        assert!(!result.success);
        assert!(result.output.contains("not a directory"));
    }

    // ── find_in_project ──

    #[tokio::test]
    async fn finds_content_and_globs() {
        let dir = project();
        let tools = ProjectTools::new(dir.path());
        let result = run(&tools, "find_in_project", json!({"query": "run"})).await;
        assert!(result.output.contains("README.md:2: run it"));
        assert!(result.output.contains("main.rs:2: run();"));

        let result = run(&tools, "find_in_project", json!({"query": "*.md"})).await;
        assert_eq!(result.output, "README.md");

        let result = run(&tools, "find_in_project", json!({"query": "zzz"})).await;
        assert_eq!(result.output, "No matches for \"zzz\".");
    }

    // ── get_current_file ──

    #[tokio::test]
    async fn current_file_comes_from_request_context() {
        let tools = ProjectTools::new("/tmp");
        let none = tools.execute("get_current_file", &json!({}), &json!({})).await;
        assert_eq!(none.output, "No file is open.");

        let context = json!({
            "file_path": "/proj/a.py",
            "file_content": "print(1)\n",
            "language": "python",
            "cursor_position": 3,
        });
        let result = tools.execute("get_current_file", &json!({}), &context).await;
        let info: Value = serde_json::from_str(&result.output).unwrap();
        assert_eq!(info["path"], "/proj/a.py");
        assert_eq!(info["content"], "print(1)\n");
        assert_eq!(info["cursor_position"], 3);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let tools = ProjectTools::new("/tmp");
        let result = tools.execute("write_file", &json!({}), &json!({})).await;
        assert!(!result.success);
        assert!(result.output.contains("unknown tool: write_file"));
    }
}
