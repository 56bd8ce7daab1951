//! Unified-diff parsing, validation, and application.
//!
//! The engine accepts the narrow diff subset produced by the coder agent:
//! `--- a/` / `+++ b/` header pairs, `@@` hunk headers, body lines prefixed
//! with ` `, `+`, or `-`, and a mandatory `COMMIT: <message>` trailer.
//! Application is exact: every context and deletion line must match the
//! target file verbatim at the hunk's position or the whole patch is
//! rejected before any file is written.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of text lines a diff may contain.
pub const MAX_DIFF_LINES: usize = 50;

/// Files that a patch may never delete or empty out.
pub const CRITICAL_FILES: &[&str] = &[
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "requirements.txt",
    "setup.py",
    "pyproject.toml",
    ".gitignore",
    "README.md",
    "Dockerfile",
];

/// Errors produced while parsing, validating, or applying a diff.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("diff has no '--- a/' file header")]
    MissingOldHeader,

    #[error("diff has no '+++ b/' file header")]
    MissingNewHeader,

    #[error("diff has no '@@' hunk header")]
    NoHunks,

    #[error("diff has no 'COMMIT:' trailer")]
    MissingCommit,

    #[error("diff is {lines} lines, limit is {MAX_DIFF_LINES}")]
    TooLong { lines: usize },

    #[error("critical file modification blocked: {path}")]
    CriticalFile { path: String },

    #[error("malformed hunk header: {line:?}")]
    MalformedHunkHeader { line: String },

    #[error("unexpected line outside any hunk: {line:?}")]
    UnexpectedLine { line: String },

    #[error("patch context does not match {path} at line {line}")]
    ContextMismatch { path: String, line: usize },

    #[error("hunk range out of bounds in {path} (start {start}, file has {file_lines} lines)")]
    OutOfBounds {
        path: String,
        start: usize,
        file_lines: usize,
    },

    #[error("unsafe path in diff: {path:?}")]
    UnsafePath { path: String },

    #[error("failed to write patched file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One body line of a hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A single `@@` hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based start line in the old file (0 for pure insertions into an
    /// empty file).
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

/// All hunks targeting one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// Path relative to the workspace root (the `a/` / `b/` prefix is
    /// stripped).
    pub path: String,
    /// True when the `+++` side is `/dev/null` (a deletion).
    pub deletes_file: bool,
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    fn additions(&self) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| &h.lines)
            .filter(|l| matches!(l, HunkLine::Add(_)))
            .count()
    }

    fn deletions(&self) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| &h.lines)
            .filter(|l| matches!(l, HunkLine::Remove(_)))
            .count()
    }
}

/// A fully parsed and validated diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDiff {
    pub files: Vec<FileDiff>,
    pub commit_message: String,
}

/// Line-count summary of an applied diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_modified: usize,
    pub additions: usize,
    pub deletions: usize,
    pub net_change: i64,
}

impl DiffStats {
    fn from_files(files: &[FileDiff]) -> Self {
        let additions: usize = files.iter().map(FileDiff::additions).sum();
        let deletions: usize = files.iter().map(FileDiff::deletions).sum();
        Self {
            files_modified: files.len(),
            additions,
            deletions,
            net_change: additions as i64 - deletions as i64,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing and validation
// ---------------------------------------------------------------------------

/// Parse and validate a diff, without touching the filesystem.
///
/// All structural checks happen here: header presence, hunk presence, the
/// `COMMIT:` trailer, the 50-line bound, path safety, and critical-file
/// protection.
pub fn parse_and_validate(diff_text: &str) -> Result<ParsedDiff, DiffError> {
    let line_count = diff_text.lines().count();
    if line_count > MAX_DIFF_LINES {
        return Err(DiffError::TooLong { lines: line_count });
    }
    if !diff_text.lines().any(|l| l.starts_with("--- a/")) {
        return Err(DiffError::MissingOldHeader);
    }
    if !diff_text
        .lines()
        .any(|l| l.starts_with("+++ b/") || l.starts_with("+++ /dev/null"))
    {
        return Err(DiffError::MissingNewHeader);
    }
    if !diff_text.lines().any(|l| l.starts_with("@@")) {
        return Err(DiffError::NoHunks);
    }

    let mut files: Vec<FileDiff> = Vec::new();
    let mut commit_message: Option<String> = None;

    let mut lines = diff_text.lines();
    while let Some(line) = lines.next() {
        if let Some(message) = line.strip_prefix("COMMIT:") {
            commit_message = Some(message.trim().to_string());
            continue;
        }
        if let Some(old_path) = line.strip_prefix("--- a/") {
            let new_line = lines.next().unwrap_or("");
            let (path, deletes_file) = if new_line == "+++ /dev/null" {
                (old_path.to_string(), true)
            } else if let Some(new_path) = new_line.strip_prefix("+++ b/") {
                (new_path.to_string(), false)
            } else {
                return Err(DiffError::MissingNewHeader);
            };
            check_path_safety(&path)?;
            files.push(FileDiff {
                path,
                deletes_file,
                hunks: Vec::new(),
            });
            continue;
        }
        if line.starts_with("@@") {
            let file = files.last_mut().ok_or(DiffError::MissingOldHeader)?;
            file.hunks.push(parse_hunk_header(line)?);
            continue;
        }
        // Body lines belong to the current hunk.
        let hunk = files
            .last_mut()
            .and_then(|f| f.hunks.last_mut())
            .ok_or_else(|| DiffError::UnexpectedLine {
                line: line.to_string(),
            })?;
        let body = match line.as_bytes().first() {
            // Tolerate context lines whose trailing space was stripped.
            None => HunkLine::Context(String::new()),
            Some(b' ') => HunkLine::Context(line[1..].to_string()),
            Some(b'+') => HunkLine::Add(line[1..].to_string()),
            Some(b'-') => HunkLine::Remove(line[1..].to_string()),
            Some(_) => {
                return Err(DiffError::UnexpectedLine {
                    line: line.to_string(),
                });
            }
        };
        hunk.lines.push(body);
    }

    let commit_message = commit_message.ok_or(DiffError::MissingCommit)?;
    if files.iter().all(|f| f.hunks.is_empty()) {
        return Err(DiffError::NoHunks);
    }

    check_critical_files(&files)?;

    Ok(ParsedDiff {
        files,
        commit_message,
    })
}

/// Parse `@@ -old[,olen] +new[,nlen] @@`.
fn parse_hunk_header(line: &str) -> Result<Hunk, DiffError> {
    let malformed = || DiffError::MalformedHunkHeader {
        line: line.to_string(),
    };

    let inner = line
        .strip_prefix("@@")
        .and_then(|rest| rest.find("@@").map(|idx| rest[..idx].trim()))
        .ok_or_else(malformed)?;

    let mut parts = inner.split_whitespace();
    let old = parts.next().ok_or_else(malformed)?;
    let new = parts.next().ok_or_else(malformed)?;

    let parse_range = |range: &str, sign: char| -> Result<(usize, usize), DiffError> {
        let range = range.strip_prefix(sign).ok_or_else(malformed)?;
        let (start, len) = match range.split_once(',') {
            Some((s, l)) => (s, l),
            None => (range, "1"),
        };
        Ok((
            start.parse().map_err(|_| malformed())?,
            len.parse().map_err(|_| malformed())?,
        ))
    };

    let (old_start, old_len) = parse_range(old, '-')?;
    let (new_start, new_len) = parse_range(new, '+')?;

    Ok(Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
        lines: Vec::new(),
    })
}

/// Reject absolute paths and parent-directory traversal.
fn check_path_safety(path: &str) -> Result<(), DiffError> {
    let p = Path::new(path);
    let unsafe_path = p.is_absolute()
        || p.components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if unsafe_path || path.is_empty() {
        return Err(DiffError::UnsafePath {
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Reject a diff that would delete or empty out a critical file.
///
/// A critical file block trips the guard when its target is `/dev/null` or
/// when it contains deletions but not a single added line.
fn check_critical_files(files: &[FileDiff]) -> Result<(), DiffError> {
    for file in files {
        let name = Path::new(&file.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&file.path);
        if !CRITICAL_FILES.contains(&name) {
            continue;
        }
        if file.deletes_file || (file.deletions() > 0 && file.additions() == 0) {
            return Err(DiffError::CriticalFile {
                path: file.path.clone(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Apply an already-validated diff under `root`, returning its stats.
///
/// Every file is patched in memory first; the filesystem is only written
/// once all hunks of that file applied cleanly. Rollback across files is
/// the sandbox's responsibility (it snapshots before calling this).
pub fn apply(root: &Path, diff: &ParsedDiff) -> Result<DiffStats, DiffError> {
    for file in &diff.files {
        let target: PathBuf = root.join(&file.path);

        let existing = std::fs::read_to_string(&target).unwrap_or_default();
        let patched = apply_to_content(&existing, file)?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DiffError::Io {
                path: file.path.clone(),
                source: e,
            })?;
        }
        std::fs::write(&target, patched).map_err(|e| DiffError::Io {
            path: file.path.clone(),
            source: e,
        })?;
    }
    Ok(DiffStats::from_files(&diff.files))
}

/// Apply one file's hunks to its current content, in memory.
///
/// Hunks are applied in order; the line offset introduced by earlier hunks
/// is carried forward so later hunk positions stay exact.
pub fn apply_to_content(content: &str, file: &FileDiff) -> Result<String, DiffError> {
    let had_trailing_newline = content.is_empty() || content.ends_with('\n');
    let mut result: Vec<String> = content.lines().map(str::to_string).collect();
    let mut offset: i64 = 0;

    for hunk in &file.hunks {
        let old_lines: Vec<&str> = hunk
            .lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect();
        let new_lines: Vec<String> = hunk
            .lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.clone()),
                HunkLine::Remove(_) => None,
            })
            .collect();

        // For pure insertions `old_start` names the line the insertion
        // follows; otherwise it names the first replaced line (1-based).
        let base = if old_lines.is_empty() {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let start = usize::try_from(base as i64 + offset).map_err(|_| DiffError::OutOfBounds {
            path: file.path.clone(),
            start: hunk.old_start,
            file_lines: result.len(),
        })?;

        if start + old_lines.len() > result.len() {
            return Err(DiffError::OutOfBounds {
                path: file.path.clone(),
                start: hunk.old_start,
                file_lines: result.len(),
            });
        }

        for (i, expected) in old_lines.iter().enumerate() {
            if result[start + i] != *expected {
                return Err(DiffError::ContextMismatch {
                    path: file.path.clone(),
                    line: hunk.old_start + i,
                });
            }
        }

        let new_len = new_lines.len() as i64;
        let old_len = old_lines.len() as i64;
        result.splice(start..start + old_lines.len(), new_lines);
        offset += new_len - old_len;
    }

    let mut joined = result.join("\n");
    if had_trailing_newline && !joined.is_empty() {
        joined.push('\n');
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_DIFF: &str = "\
--- a/main.py
+++ b/main.py
@@ -1,3 +1,6 @@
 def add(a, b):
     return a + b

+def multiply(a, b):
+    return a * b
+
COMMIT: Add multiply function
";

    const SIMPLE_CONTENT: &str = "def add(a, b):\n    return a + b\n\n";

    #[test]
    fn parses_headers_hunks_and_commit() {
        let parsed = parse_and_validate(SIMPLE_DIFF).expect("should parse");
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].path, "main.py");
        assert_eq!(parsed.files[0].hunks.len(), 1);
        assert_eq!(parsed.commit_message, "Add multiply function");
    }

    #[test]
    fn stats_net_change_law() {
        let parsed = parse_and_validate(SIMPLE_DIFF).unwrap();
        let stats = DiffStats::from_files(&parsed.files);
        assert_eq!(stats.additions, 3);
        assert_eq!(stats.deletions, 0);
        assert_eq!(stats.net_change, stats.additions as i64 - stats.deletions as i64);
    }

    #[test]
    fn rejects_missing_commit_trailer() {
        let diff = SIMPLE_DIFF.replace("COMMIT: Add multiply function\n", "");
        assert!(matches!(
            parse_and_validate(&diff),
            Err(DiffError::MissingCommit)
        ));
    }

    #[test]
    fn rejects_missing_file_headers() {
        assert!(matches!(
            parse_and_validate("@@ -1,1 +1,1 @@\n x\nCOMMIT: x\n"),
            Err(DiffError::MissingOldHeader)
        ));
        assert!(matches!(
            parse_and_validate("--- a/x\n@@ -1,1 +1,1 @@\n x\nCOMMIT: x\n"),
            Err(DiffError::MissingNewHeader)
        ));
    }

    #[test]
    fn rejects_diff_without_hunks() {
        let diff = "--- a/x.txt\n+++ b/x.txt\nCOMMIT: nothing\n";
        assert!(matches!(parse_and_validate(diff), Err(DiffError::NoHunks)));
    }

    #[test]
    fn rejects_fifty_one_lines() {
        // 4 fixed lines + 47 added = 51 lines total.
        let mut diff = String::from("--- a/big.txt\n+++ b/big.txt\n@@ -0,0 +1,47 @@\n");
        for i in 0..47 {
            diff.push_str(&format!("+line {i}\n"));
        }
        diff.push_str("COMMIT: too big\n");
        assert_eq!(diff.lines().count(), 51);
        assert!(matches!(
            parse_and_validate(&diff),
            Err(DiffError::TooLong { lines: 51 })
        ));
    }

    #[test]
    fn fifty_lines_is_accepted() {
        let mut diff = String::from("--- a/big.txt\n+++ b/big.txt\n@@ -0,0 +1,46 @@\n");
        for i in 0..46 {
            diff.push_str(&format!("+line {i}\n"));
        }
        diff.push_str("COMMIT: just fits\n");
        assert_eq!(diff.lines().count(), 50);
        assert!(parse_and_validate(&diff).is_ok());
    }

    #[test]
    fn rejects_critical_file_pure_deletion() {
        let diff = "\
--- a/package.json
+++ b/package.json
@@ -1,2 +0,0 @@
-{
-}
COMMIT: remove manifest
";
        assert!(matches!(
            parse_and_validate(diff),
            Err(DiffError::CriticalFile { .. })
        ));
    }

    #[test]
    fn rejects_critical_file_dev_null() {
        let diff = "\
--- a/README.md
+++ /dev/null
@@ -1,1 +0,0 @@
-# readme
COMMIT: drop readme
";
        assert!(matches!(
            parse_and_validate(diff),
            Err(DiffError::CriticalFile { .. })
        ));
    }

    #[test]
    fn critical_file_edit_with_additions_is_allowed() {
        let diff = "\
--- a/package.json
+++ b/package.json
@@ -1,2 +1,3 @@
 {
+  \"name\": \"demo\",
 }
COMMIT: name the package
";
        assert!(parse_and_validate(diff).is_ok());
    }

    #[test]
    fn rejects_traversal_paths() {
        let diff = "\
--- a/../escape.txt
+++ b/../escape.txt
@@ -0,0 +1,1 @@
+boom
COMMIT: escape
";
        assert!(matches!(
            parse_and_validate(diff),
            Err(DiffError::UnsafePath { .. })
        ));
    }

    #[test]
    fn applies_simple_addition() {
        let parsed = parse_and_validate(SIMPLE_DIFF).unwrap();
        let patched = apply_to_content(SIMPLE_CONTENT, &parsed.files[0]).unwrap();
        assert!(patched.contains("def multiply(a, b):"));
        assert!(patched.starts_with("def add(a, b):"));
        assert!(patched.ends_with('\n'));
    }

    #[test]
    fn rejects_context_mismatch() {
        let parsed = parse_and_validate(SIMPLE_DIFF).unwrap();
        let wrong = "def add(x, y):\n    return x + y\n\n";
        let err = apply_to_content(wrong, &parsed.files[0]).expect_err("context differs");
        assert!(matches!(err, DiffError::ContextMismatch { line: 1, .. }));
    }

    #[test]
    fn rejects_hunk_past_end_of_file() {
        let diff = "\
--- a/short.txt
+++ b/short.txt
@@ -10,2 +10,3 @@
 line ten
+inserted
 line eleven
COMMIT: off the end
";
        let parsed = parse_and_validate(diff).unwrap();
        let err = apply_to_content("only one line\n", &parsed.files[0]).unwrap_err();
        assert!(matches!(err, DiffError::OutOfBounds { .. }));
    }

    #[test]
    fn creates_new_file_from_empty_content() {
        let diff = "\
--- a/src/util.js
+++ b/src/util.js
@@ -0,0 +1,3 @@
+function noop() {
+  return null;
+}
COMMIT: add util
";
        let parsed = parse_and_validate(diff).unwrap();
        let patched = apply_to_content("", &parsed.files[0]).unwrap();
        assert_eq!(patched, "function noop() {\n  return null;\n}\n");
    }

    #[test]
    fn preserves_missing_trailing_newline() {
        let diff = "\
--- a/no_eol.txt
+++ b/no_eol.txt
@@ -1,1 +1,2 @@
 first
+second
COMMIT: extend
";
        let parsed = parse_and_validate(diff).unwrap();
        let patched = apply_to_content("first", &parsed.files[0]).unwrap();
        assert_eq!(patched, "first\nsecond");
    }

    #[test]
    fn removal_lines_are_dropped() {
        let diff = "\
--- a/swap.txt
+++ b/swap.txt
@@ -1,3 +1,3 @@
 keep
-old middle
+new middle
 tail
COMMIT: swap middle
";
        let parsed = parse_and_validate(diff).unwrap();
        let patched = apply_to_content("keep\nold middle\ntail\n", &parsed.files[0]).unwrap();
        assert_eq!(patched, "keep\nnew middle\ntail\n");
    }

    #[test]
    fn later_hunks_track_offset_from_earlier_ones() {
        let diff = "\
--- a/two.txt
+++ b/two.txt
@@ -1,2 +1,4 @@
 alpha
+alpha2
+alpha3
 beta
@@ -4,1 +6,2 @@
 delta
+epsilon
COMMIT: two hunks
";
        let parsed = parse_and_validate(diff).unwrap();
        let patched =
            apply_to_content("alpha\nbeta\ngamma\ndelta\n", &parsed.files[0]).unwrap();
        assert_eq!(
            patched,
            "alpha\nalpha2\nalpha3\nbeta\ngamma\ndelta\nepsilon\n"
        );
    }

    #[test]
    fn apply_writes_files_under_root() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.py"), SIMPLE_CONTENT).unwrap();

        let parsed = parse_and_validate(SIMPLE_DIFF).unwrap();
        let stats = apply(dir.path(), &parsed).unwrap();

        assert_eq!(stats.files_modified, 1);
        assert_eq!(stats.net_change, 3);
        let written = std::fs::read_to_string(dir.path().join("main.py")).unwrap();
        assert!(written.contains("multiply"));
    }
}
