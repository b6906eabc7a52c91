use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BugListError {
    #[error("failed to read bug list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid bug list {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("bug list {path} repeats bug id {bug_id}")]
    DuplicateBug { path: PathBuf, bug_id: String },
}

/// One bug of the evaluation dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugRecord {
    pub bug_id: String,
    /// Commit the index is synced to before ranking this bug.
    pub commit: String,
    pub report: String,
    #[serde(default)]
    pub reported_at: Option<String>,
    #[serde(default)]
    pub fixed_files: Vec<String>,
}

/// Reads the bug list, ordered by `reported_at`. ISO-8601 timestamps order
/// correctly as text; bugs without one keep their place after the dated ones.
pub fn load_bugs(path: &Path) -> Result<Vec<BugRecord>, BugListError> {
    let raw = fs::read_to_string(path).map_err(|source| BugListError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut bugs: Vec<BugRecord> = serde_json::from_str(&raw).map_err(|source| BugListError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    {
        let mut seen = HashSet::new();
        for bug in &bugs {
            if !seen.insert(bug.bug_id.as_str()) {
                return Err(BugListError::DuplicateBug {
                    path: path.to_path_buf(),
                    bug_id: bug.bug_id.clone(),
                });
            }
        }
    }

    bugs.sort_by(|a, b| match (&a.reported_at, &b.reported_at) {
        (Some(left), Some(right)) => left.cmp(right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    Ok(bugs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bugs.json");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn bugs_are_ordered_by_report_time() {
        let (_dir, path) = write(
            r#"[
                {"bug_id": "3", "commit": "c3", "report": "late", "reported_at": "2021-05-01T00:00:00Z"},
                {"bug_id": "x", "commit": "cx", "report": "undated"},
                {"bug_id": "1", "commit": "c1", "report": "early", "reported_at": "2019-01-02T10:00:00Z",
                 "fixed_files": ["pkg/a.py"]},
                {"bug_id": "2", "commit": "c2", "report": "tie", "reported_at": "2021-05-01T00:00:00Z"}
            ]"#,
        );
        let bugs = load_bugs(&path).unwrap();
        let ids: Vec<&str> = bugs.iter().map(|bug| bug.bug_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3", "2", "x"]);
        assert_eq!(bugs[0].fixed_files, vec!["pkg/a.py"]);
        assert!(bugs[3].fixed_files.is_empty());
    }

    #[test]
    fn duplicate_ids_and_bad_json_are_rejected() {
        let (_dir, path) = write(
            r#"[{"bug_id": "1", "commit": "a", "report": "r"},
                {"bug_id": "1", "commit": "b", "report": "r"}]"#,
        );
        assert!(matches!(load_bugs(&path), Err(BugListError::DuplicateBug { .. })));

        let (_dir, path) = write(r#"{"bug_id": "1"}"#);
        assert!(matches!(load_bugs(&path), Err(BugListError::Json { .. })));
    }
}
