use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};

const MAX_RESULTS: usize = 100;
const MAX_PREVIEW_LEN: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid glob pattern: {0}")]
    InvalidGlob(#[from] globset::Error),
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("search task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One search result. `line` is 1-based; `None` means the filename matched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchHit {
    pub path: PathBuf,
    pub line: Option<usize>,
    pub preview: String,
}

impl std::fmt::Display for SearchHit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.path.display(), line, self.preview),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

enum Query {
    Glob(GlobMatcher),
    Text(String),
}

impl Query {
    fn parse(query: &str) -> Result<Self, SearchError> {
        if query.contains(['*', '?', '[']) {
            let glob = GlobBuilder::new(query)
                .case_insensitive(true)
                .literal_separator(false)
                .build()?;
            Ok(Query::Glob(glob.compile_matcher()))
        } else {
            Ok(Query::Text(query.to_lowercase()))
        }
    }
}

/// Filename and content search over a project tree. Honours `.gitignore`.
#[derive(Clone, Debug)]
pub struct ProjectSearch {
    root: PathBuf,
    max_results: usize,
}

impl ProjectSearch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_results: MAX_RESULTS,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Glob queries (`*.rs`) match file names. Anything else is a case-insensitive
    /// substring matched against file names and then file contents.
    pub fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        if !self.root.is_dir() {
            return Err(SearchError::NotADirectory(self.root.clone()));
        }
        let query = Query::parse(query.trim())?;

        let walker = ignore::WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .sort_by_file_path(|a, b| a.cmp(b))
            .build();

        let mut hits = Vec::new();
        for entry in walker {
            if hits.len() >= self.max_results {
                break;
            }
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let rel = path.strip_prefix(&self.root).unwrap_or(path).to_path_buf();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();

            match &query {
                Query::Glob(glob) => {
                    if glob.is_match(&name) || glob.is_match(&rel) {
                        hits.push(SearchHit {
                            path: rel,
                            line: None,
                            preview: String::new(),
                        });
                    }
                }
                Query::Text(needle) => {
                    if name.contains(needle.as_str()) {
                        hits.push(SearchHit {
                            path: rel.clone(),
                            line: None,
                            preview: String::new(),
                        });
                    }
                    let remaining = self.max_results.saturating_sub(hits.len());
                    hits.extend(search_file(path, &rel, needle, remaining));
                }
            }
        }
        hits.truncate(self.max_results);
        tracing::debug!(root = %self.root.display(), hits = hits.len(), "project search");
        Ok(hits)
    }

    /// [`search`](Self::search) on the blocking pool.
    pub async fn search_async(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let this = self.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || this.search(&query)).await?
    }
}

fn search_file(path: &Path, rel: &Path, needle: &str, limit: usize) -> Vec<SearchHit> {
    // Binary and unreadable files are skipped.
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return vec![],
    };
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| line.to_lowercase().contains(needle))
        .take(limit)
        .map(|(i, line)| SearchHit {
            path: rel.to_path_buf(),
            line: Some(i + 1),
            preview: truncate(line.trim(), MAX_PREVIEW_LEN),
        })
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Outcome of offering user input to a pending result list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    Chosen(SearchHit),
    /// A number with no matching result. The input is handled as ordinary text and
    /// the results stay pending.
    OutOfRange { index: usize, available: usize },
    /// Not a number. The pending results have been dropped.
    NotASelection,
}

/// Results of the last `/search`, waiting for a numeric reply.
#[derive(Debug, Default)]
pub struct PendingSearch {
    results: Vec<SearchHit>,
}

impl PendingSearch {
    pub fn set(&mut self, results: Vec<SearchHit>) {
        self.results = results;
    }

    pub fn is_pending(&self) -> bool {
        !self.results.is_empty()
    }

    pub fn results(&self) -> &[SearchHit] {
        &self.results
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }

    /// A 1-based number in range picks that result and clears the list. An out of
    /// range number is not a selection but keeps the list. Anything else clears it.
    pub fn select(&mut self, input: &str) -> Selection {
        let Ok(index) = input.trim().parse::<usize>() else {
            self.results.clear();
            return Selection::NotASelection;
        };
        if index == 0 || index > self.results.len() {
            return Selection::OutOfRange {
                index,
                available: self.results.len(),
            };
        }
        let hit = self.results.swap_remove(index - 1);
        self.results.clear();
        Selection::Chosen(hit)
    }
}

/// Numbered listing shown after `/search`.
pub fn format_results(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No results for \"{query}\".");
    }
    let mut out = format!("{} result(s) for \"{query}\":\n", hits.len());
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!("{:>3}. {hit}\n", i + 1));
    }
    out.push_str("Reply with a number to open that file.");
    out
}
