use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::parser::SourceLanguage;

const TEST_PREFIX: &str = "test";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to resolve repository root '{path}': {source}")]
    InvalidRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to walk '{path}': {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// A source file read from the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Forward-slash path relative to the repository root.
    pub path: String,
    pub content: String,
}

/// True when any directory component starts with `test` (case-insensitive),
/// or the path itself does. Used by both full scans and diffs so the two
/// agree on which files are indexed.
pub fn is_test_path(path: &str) -> bool {
    let normalized = path.replace('\\', "/");
    if normalized.to_lowercase().starts_with(TEST_PREFIX) {
        return true;
    }
    let mut components: Vec<&str> = normalized.split('/').collect();
    components.pop();
    components
        .iter()
        .any(|component| component.to_lowercase().starts_with(TEST_PREFIX))
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name == ".git" || name.to_lowercase().starts_with(TEST_PREFIX)
}

/// Every non-test source file of `language` under `root`, sorted by path.
pub fn scan_source_files(root: &Path, language: SourceLanguage) -> Result<Vec<SourceFile>, ScanError> {
    let root = root.canonicalize().map_err(|source| ScanError::InvalidRoot {
        path: root.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry));

    for entry in walker {
        let entry = entry.map_err(|source| ScanError::Walk {
            path: root.clone(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(&root) else {
            continue;
        };
        let path = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !language.is_source_path(&path) || is_test_path(&path) {
            continue;
        }

        match fs::read(entry.path()) {
            Ok(bytes) => files.push(SourceFile {
                path,
                content: String::from_utf8_lossy(&bytes).into_owned(),
            }),
            Err(error) => warn!(path, error = %error, "Skipping unreadable source file"),
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(root = %root.display(), files = files.len(), "Scanned source files");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directories_and_prefixes_are_excluded() {
        assert!(is_test_path("tests/test_models.py"));
        assert!(is_test_path("pkg/Testing/helpers.py"));
        assert!(is_test_path("test_setup.py"));
        assert!(is_test_path("src/test/java/org/FooTest.java"));
        assert!(!is_test_path("pkg/contest.py"));
        assert!(!is_test_path("pkg/module/test_like_name.py"));
        assert!(!is_test_path("src/main/java/org/Foo.java"));
    }

    #[test]
    fn scan_collects_relative_source_paths() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path();
        fs::create_dir_all(root.join("pkg/sub")).unwrap();
        fs::create_dir_all(root.join("Tests")).unwrap();
        fs::write(root.join("pkg/a.py"), "def a(): pass\n").unwrap();
        fs::write(root.join("pkg/sub/b.py"), "def b(): pass\n").unwrap();
        fs::write(root.join("pkg/readme.md"), "# docs\n").unwrap();
        fs::write(root.join("Tests/test_a.py"), "def test_a(): pass\n").unwrap();

        let files = scan_source_files(root, SourceLanguage::Python).unwrap();
        let paths: Vec<&str> = files.iter().map(|file| file.path.as_str()).collect();
        assert_eq!(paths, vec!["pkg/a.py", "pkg/sub/b.py"]);
        assert_eq!(files[0].content, "def a(): pass\n");
    }
}
