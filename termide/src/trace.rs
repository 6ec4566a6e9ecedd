use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace log I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode trace record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Success,
    Error,
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceStatus::Success => f.write_str("success"),
            TraceStatus::Error => f.write_str("error"),
        }
    }
}

/// One line of the trace log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub workflow: String,
    pub status: TraceStatus,
    pub duration_ms: u64,
    pub timestamp: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {}  {} ({}ms)",
            self.timestamp, self.workflow, self.status, self.duration_ms
        )
    }
}

/// UTC ISO-8601 with microseconds and a `Z` suffix.
pub fn utc_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

/// Where trace records go. Recording never fails the traced operation.
pub trait TraceSink: Send + Sync {
    fn record(&self, record: TraceRecord);
}

/// Appends JSON lines to a file.
pub struct JsonlTraceSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlTraceSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TraceError> {
        let path = path.into();
        let io_err = |source| TraceError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, record: &TraceRecord) -> Result<(), TraceError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(line.as_bytes()).map_err(|source| TraceError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, record: TraceRecord) {
        if let Err(e) = self.write(&record) {
            tracing::warn!(workflow = %record.workflow, "dropping trace record: {e}");
        }
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemoryTraceSink {
    records: Mutex<Vec<TraceRecord>>,
}

impl MemoryTraceSink {
    fn lock(&self) -> MutexGuard<'_, Vec<TraceRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.lock().clone()
    }
}

impl TraceSink for MemoryTraceSink {
    fn record(&self, record: TraceRecord) {
        self.lock().push(record);
    }
}

#[derive(Default)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn record(&self, _record: TraceRecord) {}
}

/// A timed workflow. Dropping it without [`finish`](Self::finish) records nothing.
pub struct TraceSpan<'a> {
    sink: &'a dyn TraceSink,
    workflow: String,
    started: Instant,
    metadata: Map<String, Value>,
}

impl<'a> TraceSpan<'a> {
    pub fn start(sink: &'a dyn TraceSink, workflow: impl Into<String>) -> Self {
        Self {
            sink,
            workflow: workflow.into(),
            started: Instant::now(),
            metadata: Map::new(),
        }
    }

    pub fn meta(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn finish(self, status: TraceStatus) {
        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.sink.record(TraceRecord {
            workflow: self.workflow,
            status,
            duration_ms,
            timestamp: utc_timestamp(),
            metadata: self.metadata,
        });
    }
}

/// Run `fut` as a traced workflow. `Err` records an error status with the message.
pub async fn traced<T, E, F>(
    sink: &dyn TraceSink,
    workflow: &str,
    metadata: Map<String, Value>,
    fut: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut span = TraceSpan::start(sink, workflow);
    span.metadata = metadata;
    let result = fut.await;
    match &result {
        Ok(_) => span.finish(TraceStatus::Success),
        Err(e) => {
            span.meta("error", e.to_string());
            span.finish(TraceStatus::Error);
        }
    }
    result
}

/// `~/.termide/logs/trace.log`
pub fn default_trace_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".termide").join("logs").join("trace.log"))
}

/// The most recent `limit` records. Missing file reads as empty; malformed lines are skipped.
pub fn read_traces(path: &Path, limit: usize) -> Result<Vec<TraceRecord>, TraceError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(TraceError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let mut records: Vec<TraceRecord> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    if records.len() > limit {
        records.drain(..records.len() - limit);
    }
    Ok(records)
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowSummary {
    pub workflow: String,
    pub count: usize,
    pub errors: usize,
    pub mean_duration_ms: f64,
}

/// Per-workflow counts and mean duration, ordered by workflow name.
pub fn summarize(records: &[TraceRecord]) -> Vec<WorkflowSummary> {
    let mut by_workflow: BTreeMap<&str, (usize, usize, u64)> = BTreeMap::new();
    for r in records {
        let entry = by_workflow.entry(&r.workflow).or_default();
        entry.0 += 1;
        if r.status == TraceStatus::Error {
            entry.1 += 1;
        }
        entry.2 = entry.2.saturating_add(r.duration_ms);
    }
    by_workflow
        .into_iter()
        .map(|(workflow, (count, errors, total))| WorkflowSummary {
            workflow: workflow.to_string(),
            count,
            errors,
            mean_duration_ms: total as f64 / count as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(workflow: &str, status: TraceStatus, duration_ms: u64) -> TraceRecord {
        TraceRecord {
            workflow: workflow.into(),
            status,
            duration_ms,
            timestamp: utc_timestamp(),
            metadata: Map::new(),
        }
    }

    // ── Records ──

    #[test]
    fn record_serialises_to_log_shape() {
        let r = record("streaming_response", TraceStatus::Success, 12);
        let v: Value = serde_json::to_value(&r).unwrap();
        assert_eq!(v["workflow"], "streaming_response");
        assert_eq!(v["status"], "success");
        assert_eq!(v["duration_ms"], 12);
        assert!(v["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(v["metadata"], json!({}));
    }

    #[test]
    fn display_is_one_line() {
        let mut r = record("apply_change", TraceStatus::Error, 5);
        r.timestamp = "2026-01-01T00:00:00.000000Z".into();
        assert_eq!(
            r.to_string(),
            "2026-01-01T00:00:00.000000Z  apply_change  error (5ms)"
        );
    }

    // ── Sinks ──

    #[test]
    fn jsonl_sink_appends_and_reader_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("trace.log");
        let sink = JsonlTraceSink::open(&path).unwrap();
        sink.record(record("a", TraceStatus::Success, 1));
        sink.record(record("b", TraceStatus::Error, 2));

        let records = read_traces(&path, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].workflow, "b");
        assert_eq!(records[1].status, TraceStatus::Error);
    }

    #[test]
    fn reader_skips_malformed_and_keeps_latest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.log");
        let mut lines = Vec::new();
        for i in 0..5 {
            lines.push(serde_json::to_string(&record(&format!("w{i}"), TraceStatus::Success, i)).unwrap());
        }
        lines.insert(2, "not json".into());
        std::fs::write(&path, lines.join("\n")).unwrap();

        let records = read_traces(&path, 2).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.workflow.as_str()).collect();
        assert_eq!(names, vec!["w3", "w4"]);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_traces(&dir.path().join("none.log"), 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn traced_records_status_and_metadata() {
        let sink = MemoryTraceSink::default();
        let mut meta = Map::new();
        meta.insert("file".into(), json!("a.rs"));

        let ok: Result<u8, String> = traced(&sink, "apply_change", meta, async { Ok(1) }).await;
        assert_eq!(ok, Ok(1));
        let err: Result<u8, String> =
            traced(&sink, "apply_change", Map::new(), async { Err("disk full".to_string()) }).await;
        assert!(err.is_err());

        let records = sink.records();
        assert_eq!(records[0].status, TraceStatus::Success);
        assert_eq!(records[0].metadata["file"], "a.rs");
        assert_eq!(records[1].status, TraceStatus::Error);
        assert_eq!(records[1].metadata["error"], "disk full");
    }

    #[test]
    fn noop_sink_accepts_records() {
        NoopTraceSink.record(record("x", TraceStatus::Success, 0));
    }

    // ── summarize ──

    #[test]
    fn summary_groups_by_workflow() {
        let records = vec![
            record("b", TraceStatus::Success, 10),
            record("a", TraceStatus::Error, 4),
            record("b", TraceStatus::Error, 20),
        ];
        let summary = summarize(&records);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].workflow, "a");
        assert_eq!(summary[1].count, 2);
        assert_eq!(summary[1].errors, 1);
        assert_eq!(summary[1].mean_duration_ms, 15.0);
    }
}
