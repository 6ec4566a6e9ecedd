use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffOp, DiffTag, TextDiff};

/// Context lines used when the caller has no preference.
pub const DEFAULT_CONTEXT_LINES: usize = 3;

const ORIGINAL_LABEL: &str = "Original";
const MODIFIED_LABEL: &str = "Modified";

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk header regex")
});

/// Output format for [`generate_diff`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffStyle {
    #[default]
    Unified,
    Context,
    /// Every line, prefixed with `"  "`, `"- "` or `"+ "`. No intraline hints.
    Ndiff,
}

/// A single inserted or deleted line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiffChange {
    /// Index into the original (deletions) or modified (additions) lines.
    pub line_index: usize,
    pub content: String,
    pub is_addition: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("malformed hunk header: {0}")]
    MalformedHeader(String),
    #[error("hunk at original line {line} overlaps the previous hunk")]
    OutOfOrder { line: usize },
    #[error("hunk at original line {line} is past the end of the text ({len} lines)")]
    OutOfRange { line: usize, len: usize },
    #[error("patch does not match original at line {line}: expected {expected:?}, found {found:?}")]
    Mismatch {
        line: usize,
        expected: String,
        found: String,
    },
    #[error("hunk at original line {line} ended before its line counts were met")]
    Truncated { line: usize },
    #[error("hunk at original line {line} has more lines than its header declares")]
    CountMismatch { line: usize },
    #[error("unexpected line in hunk at original line {line}: {content:?}")]
    UnexpectedLine { line: usize, content: String },
}

/// Diff two text snapshots. Identical inputs produce an empty string.
pub fn generate_diff(
    original: &str,
    modified: &str,
    style: DiffStyle,
    context_lines: usize,
) -> String {
    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_lines(original, modified);

    match style {
        DiffStyle::Unified => diff
            .unified_diff()
            .context_radius(context_lines)
            .header(ORIGINAL_LABEL, MODIFIED_LABEL)
            .to_string(),
        DiffStyle::Context => context_diff(&diff, context_lines),
        DiffStyle::Ndiff => {
            if original == modified {
                return String::new();
            }
            let mut out = String::new();
            for change in diff.iter_all_changes() {
                let prefix = match change.tag() {
                    similar::ChangeTag::Equal => "  ",
                    similar::ChangeTag::Delete => "- ",
                    similar::ChangeTag::Insert => "+ ",
                };
                out.push_str(prefix);
                out.push_str(change.value());
                if change.missing_newline() {
                    out.push('\n');
                }
            }
            out
        }
    }
}

/// Unified diff with the default labels and context.
pub fn unified_diff(original: &str, modified: &str) -> String {
    generate_diff(original, modified, DiffStyle::Unified, DEFAULT_CONTEXT_LINES)
}

fn context_range(start: usize, end: usize) -> String {
    let len = end - start;
    let mut beginning = start + 1;
    if len == 0 {
        beginning -= 1;
    }
    if len <= 1 {
        beginning.to_string()
    } else {
        format!("{},{}", beginning, beginning + len - 1)
    }
}

fn push_line(out: &mut String, prefix: &str, line: &str) {
    out.push_str(prefix);
    out.push_str(line);
    if !line.ends_with('\n') {
        out.push('\n');
    }
}

fn context_diff(diff: &TextDiff<'_, '_, '_, str>, context_lines: usize) -> String {
    let old = diff.old_slices();
    let new = diff.new_slices();
    let groups = diff.grouped_ops(context_lines);
    if groups.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    let _ = writeln!(out, "*** {ORIGINAL_LABEL}");
    let _ = writeln!(out, "--- {MODIFIED_LABEL}");

    for group in &groups {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        out.push_str("***************\n");

        let old_span = first.old_range().start..last.old_range().end;
        let _ = writeln!(out, "*** {} ****", context_range(old_span.start, old_span.end));
        if group
            .iter()
            .any(|op| matches!(op.tag(), DiffTag::Delete | DiffTag::Replace))
        {
            for op in group {
                let prefix = match op.tag() {
                    DiffTag::Equal => "  ",
                    DiffTag::Delete => "- ",
                    DiffTag::Replace => "! ",
                    DiffTag::Insert => continue,
                };
                for line in &old[op.old_range()] {
                    push_line(&mut out, prefix, line);
                }
            }
        }

        let new_span = first.new_range().start..last.new_range().end;
        let _ = writeln!(out, "--- {} ----", context_range(new_span.start, new_span.end));
        if group
            .iter()
            .any(|op| matches!(op.tag(), DiffTag::Insert | DiffTag::Replace))
        {
            for op in group {
                let prefix = match op.tag() {
                    DiffTag::Equal => "  ",
                    DiffTag::Insert => "+ ",
                    DiffTag::Replace => "! ",
                    DiffTag::Delete => continue,
                };
                for line in &new[op.new_range()] {
                    push_line(&mut out, prefix, line);
                }
            }
        }
    }
    out
}

fn line_ops(original_lines: &[&str], modified_lines: &[&str]) -> Vec<DiffOp> {
    similar::capture_diff_slices(Algorithm::Myers, original_lines, modified_lines)
}

/// Ordered insertions and deletions. A replaced region is its deletions
/// followed by its insertions.
pub fn get_changes(original: &str, modified: &str) -> Vec<DiffChange> {
    let old: Vec<&str> = original.lines().collect();
    let new: Vec<&str> = modified.lines().collect();

    let mut changes = Vec::new();
    for op in line_ops(&old, &new) {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        if matches!(tag, DiffTag::Delete | DiffTag::Replace) {
            for i in old_range {
                changes.push(DiffChange {
                    line_index: i,
                    content: old[i].to_string(),
                    is_addition: false,
                });
            }
        }
        if matches!(tag, DiffTag::Insert | DiffTag::Replace) {
            for j in new_range {
                changes.push(DiffChange {
                    line_index: j,
                    content: new[j].to_string(),
                    is_addition: true,
                });
            }
        }
    }
    changes
}

/// Lines removed and lines added, each in order.
pub fn highlight_diff(original: &str, modified: &str) -> (Vec<String>, Vec<String>) {
    get_changes(original, modified)
        .into_iter()
        .fold((Vec::new(), Vec::new()), |(mut removed, mut added), c| {
            if c.is_addition {
                added.push(c.content);
            } else {
                removed.push(c.content);
            }
            (removed, added)
        })
}

struct HunkHeader {
    old_start: usize,
    old_count: usize,
    new_count: usize,
}

fn parse_count(m: Option<regex::Match<'_>>) -> Result<usize, ()> {
    match m {
        Some(m) => m.as_str().parse().map_err(|_| ()),
        None => Ok(1),
    }
}

fn parse_header(line: &str) -> Result<HunkHeader, PatchError> {
    let malformed = || PatchError::MalformedHeader(line.to_string());
    let caps = HUNK_HEADER.captures(line).ok_or_else(malformed)?;
    let old_start: usize = caps[1].parse().map_err(|_| malformed())?;
    let old_count = parse_count(caps.get(2)).map_err(|_| malformed())?;
    let new_count = parse_count(caps.get(4)).map_err(|_| malformed())?;
    if old_start == 0 && old_count > 0 {
        return Err(malformed());
    }
    Ok(HunkHeader {
        old_start,
        old_count,
        new_count,
    })
}

fn strip_eol(line: &str) -> &str {
    line.strip_suffix('\n').unwrap_or(line)
}

fn same_line(found: &str, expected: &str) -> bool {
    strip_eol(found) == expected
}

/// Rebuild the modified text from `original` and a unified diff.
///
/// Context and deletion lines are checked against `original`. Any mismatch is an
/// error, and no partial text is ever returned.
pub fn apply_patch(original: &str, patch: &str) -> Result<String, PatchError> {
    let source: Vec<&str> = original.split_inclusive('\n').collect();
    let lines: Vec<&str> = patch.split_inclusive('\n').collect();

    let mut out = String::with_capacity(original.len());
    let mut cursor = 0usize;
    let mut i = 0usize;

    while i < lines.len() {
        let header_line = strip_eol(lines[i]);
        i += 1;
        // File headers, blank separators and anything outside a hunk.
        if !header_line.starts_with("@@") {
            continue;
        }
        let header = parse_header(header_line)?;
        let start = if header.old_count == 0 {
            header.old_start
        } else {
            header.old_start - 1
        };
        if start < cursor {
            return Err(PatchError::OutOfOrder {
                line: header.old_start,
            });
        }
        if start > source.len() {
            return Err(PatchError::OutOfRange {
                line: header.old_start,
                len: source.len(),
            });
        }
        for line in &source[cursor..start] {
            out.push_str(line);
        }
        cursor = start;

        let (mut old_seen, mut new_seen) = (0usize, 0usize);
        while old_seen < header.old_count || new_seen < header.new_count {
            let Some(raw) = lines.get(i) else {
                return Err(PatchError::Truncated {
                    line: header.old_start,
                });
            };
            i += 1;
            let body = strip_eol(raw);
            let missing_newline = lines.get(i).is_some_and(|next| next.starts_with('\\'));
            if missing_newline {
                i += 1;
            }

            let (tag, text) = match body.chars().next() {
                // Editors sometimes strip the lone space off an empty context line.
                None => (' ', ""),
                Some(c @ (' ' | '-' | '+')) => (c, &body[1..]),
                Some(_) => {
                    return Err(PatchError::UnexpectedLine {
                        line: header.old_start,
                        content: body.to_string(),
                    });
                }
            };

            if tag == '+' {
                if new_seen >= header.new_count {
                    return Err(PatchError::CountMismatch {
                        line: header.old_start,
                    });
                }
                out.push_str(text);
                if !missing_newline {
                    out.push('\n');
                }
                new_seen += 1;
                continue;
            }

            if old_seen >= header.old_count || (tag == ' ' && new_seen >= header.new_count) {
                return Err(PatchError::CountMismatch {
                    line: header.old_start,
                });
            }
            let found = source.get(cursor).copied().unwrap_or_default();
            if cursor >= source.len() || !same_line(found, text) {
                return Err(PatchError::Mismatch {
                    line: cursor + 1,
                    expected: text.to_string(),
                    found: strip_eol(found).to_string(),
                });
            }
            if tag == ' ' {
                out.push_str(found);
                new_seen += 1;
            }
            old_seen += 1;
            cursor += 1;
        }
    }

    for line in &source[cursor..] {
        out.push_str(line);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ── generate_diff ──

    #[test]
    fn identical_text_has_empty_diff() {
        let text = "fn main() {\n    println!(\"hi\");\n}\n";
        for style in [DiffStyle::Unified, DiffStyle::Context, DiffStyle::Ndiff] {
            assert_eq!(generate_diff(text, text, style, 3), "");
        }
        assert!(get_changes(text, text).is_empty());
    }

    #[test]
    fn unified_has_labels_and_hunk() {
        let diff = unified_diff("a\nb\nc\n", "a\nx\nc\n");
        assert!(diff.starts_with("--- Original\n+++ Modified\n"));
        assert!(diff.contains("@@ -1,3 +1,3 @@"));
        assert!(diff.contains("-b\n"));
        assert!(diff.contains("+x\n"));
        assert!(diff.contains(" a\n"));
    }

    #[test]
    fn unified_respects_context_lines() {
        let original: String = (1..=20).map(|i| format!("line{i}\n")).collect();
        let modified = original.replace("line10\n", "changed\n");
        let narrow = generate_diff(&original, &modified, DiffStyle::Unified, 1);
        assert!(narrow.contains("@@ -9,3 +9,3 @@"));
        assert!(!narrow.contains("line7"));
        let wide = generate_diff(&original, &modified, DiffStyle::Unified, 5);
        assert!(wide.contains("line5"));
    }

    #[test]
    fn diff_is_deterministic() {
        let a = "one\ntwo\nthree\n";
        let b = "one\n2\nthree\nfour\n";
        assert_eq!(unified_diff(a, b), unified_diff(a, b));
    }

    #[test]
    fn ndiff_marks_every_line() {
        let diff = generate_diff("a\nb\n", "a\nc\n", DiffStyle::Ndiff, 0);
        assert_eq!(diff, "  a\n- b\n+ c\n");
    }

    #[test]
    fn context_style_uses_bang_for_replacements() {
        let diff = generate_diff("a\nb\nc\n", "a\nx\nc\n", DiffStyle::Context, 1);
        assert!(diff.starts_with("*** Original\n--- Modified\n***************\n"));
        assert!(diff.contains("*** 1,3 ****\n  a\n! b\n  c\n"));
        assert!(diff.contains("--- 1,3 ----\n  a\n! x\n  c\n"));
    }

    #[test]
    fn context_style_pure_insertion_omits_old_body() {
        let diff = generate_diff("a\n", "a\nb\n", DiffStyle::Context, 0);
        assert!(diff.contains("*** 1 ****\n--- 2 ----\n+ b\n"));
    }

    // ── get_changes ──

    #[test]
    fn replace_is_deletions_then_insertions() {
        let changes = get_changes("a\nb\nc\nd", "a\nX\nY\nd");
        assert_eq!(
            changes,
            vec![
                DiffChange {
                    line_index: 1,
                    content: "b".into(),
                    is_addition: false
                },
                DiffChange {
                    line_index: 2,
                    content: "c".into(),
                    is_addition: false
                },
                DiffChange {
                    line_index: 1,
                    content: "X".into(),
                    is_addition: true
                },
                DiffChange {
                    line_index: 2,
                    content: "Y".into(),
                    is_addition: true
                },
            ]
        );
    }

    #[test]
    fn pure_insert_and_delete() {
        let added = get_changes("", "x\ny");
        assert_eq!(added.len(), 2);
        assert!(added.iter().all(|c| c.is_addition));

        let removed = get_changes("x\ny", "");
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|c| !c.is_addition));
    }

    #[test]
    fn highlight_splits_sides() {
        let (removed, added) = highlight_diff("keep\nold\n", "keep\nnew\nmore\n");
        assert_eq!(removed, vec!["old"]);
        assert_eq!(added, vec!["new", "more"]);
    }

    // ── apply_patch ──

    #[test]
    fn applies_simple_patch() {
        let original = "a\nb\nc\n";
        let modified = "a\nx\nc\nd\n";
        let patch = unified_diff(original, modified);
        assert_eq!(apply_patch(original, &patch).unwrap(), modified);
    }

    #[test]
    fn empty_original_is_pure_insertion() {
        let patch = unified_diff("", "first\nsecond\n");
        assert!(patch.contains("@@ -0,0 +1,2 @@"));
        assert_eq!(apply_patch("", &patch).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn empty_modified_is_pure_deletion() {
        let patch = unified_diff("first\nsecond\n", "");
        assert_eq!(apply_patch("first\nsecond\n", &patch).unwrap(), "");
    }

    #[test]
    fn missing_trailing_newline_round_trips() {
        let original = "a\nb";
        let modified = "a\nb\nc";
        let patch = unified_diff(original, modified);
        assert!(patch.contains("\\ No newline at end of file"));
        assert_eq!(apply_patch(original, &patch).unwrap(), modified);
    }

    #[test]
    fn handwritten_patch_without_counts() {
        let patch = "@@ -2 +2 @@\n-b\n+B\n";
        assert_eq!(apply_patch("a\nb\nc\n", patch).unwrap(), "a\nB\nc\n");
    }

    #[test]
    fn mismatched_context_fails() {
        let patch = unified_diff("a\nb\nc\n", "a\nx\nc\n");
        let err = apply_patch("a\nzzz\nc\n", &patch).unwrap_err();
        assert!(matches!(err, PatchError::Mismatch { line: 2, .. }));
    }

    #[test]
    fn out_of_range_hunk_fails() {
        let patch = "@@ -10,1 +10,1 @@\n-a\n+b\n";
        assert!(matches!(
            apply_patch("a\n", patch),
            Err(PatchError::OutOfRange { line: 10, len: 1 })
        ));
    }

    #[test]
    fn overlapping_hunks_fail() {
        let patch = "@@ -2,1 +2,1 @@\n-b\n+B\n@@ -1,1 +1,1 @@\n-a\n+A\n";
        assert!(matches!(
            apply_patch("a\nb\n", patch),
            Err(PatchError::OutOfOrder { line: 1 })
        ));
    }

    #[test]
    fn truncated_hunk_fails() {
        let patch = "@@ -1,3 +1,3 @@\n a\n-b\n";
        assert!(matches!(
            apply_patch("a\nb\nc\n", patch),
            Err(PatchError::Truncated { line: 1 })
        ));
    }

    #[test]
    fn malformed_header_fails() {
        let patch = "@@ -x +1 @@\n+a\n";
        assert!(matches!(
            apply_patch("", patch),
            Err(PatchError::MalformedHeader(_))
        ));
    }

    #[test]
    fn patch_without_hunks_is_identity() {
        assert_eq!(apply_patch("keep\n", "").unwrap(), "keep\n");
    }

    fn text() -> impl Strategy<Value = String> {
        (prop::collection::vec("[abc ]{0,3}", 0..12), any::<bool>()).prop_map(
            |(lines, trailing)| {
                let mut s = lines.join("\n");
                if trailing && !s.is_empty() {
                    s.push('\n');
                }
                s
            },
        )
    }

    proptest! {
        #[test]
        fn patch_round_trips(original in text(), modified in text(), context in 0usize..4) {
            let patch = generate_diff(&original, &modified, DiffStyle::Unified, context);
            prop_assert_eq!(apply_patch(&original, &patch).unwrap(), modified);
        }
    }
}
