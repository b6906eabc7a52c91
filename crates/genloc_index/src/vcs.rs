use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("failed to resolve repository root '{path}': {source}")]
    InvalidRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("git repository not found at '{path}': {message}")]
    NotAGitRepository { path: PathBuf, message: String },
    #[error("git command failed: {0}")]
    Git(String),
    #[error("unexpected git output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Add,
    Delete,
    Modify,
    Rename,
}

/// One changed file between two commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub change_type: ChangeType,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    /// Content at the target commit. Absent for deletions and pure renames.
    pub new_content: Option<String>,
}

impl ChangeRecord {
    pub fn add(path: &str, content: &str) -> Self {
        Self {
            change_type: ChangeType::Add,
            old_path: None,
            new_path: Some(path.to_string()),
            new_content: Some(content.to_string()),
        }
    }

    pub fn modify(path: &str, content: &str) -> Self {
        Self {
            change_type: ChangeType::Modify,
            old_path: Some(path.to_string()),
            new_path: Some(path.to_string()),
            new_content: Some(content.to_string()),
        }
    }

    pub fn delete(path: &str) -> Self {
        Self {
            change_type: ChangeType::Delete,
            old_path: Some(path.to_string()),
            new_path: None,
            new_content: None,
        }
    }

    pub fn rename(old_path: &str, new_path: &str, content: Option<&str>) -> Self {
        Self {
            change_type: ChangeType::Rename,
            old_path: Some(old_path.to_string()),
            new_path: Some(new_path.to_string()),
            new_content: content.map(str::to_string),
        }
    }

    /// The path the change lands on: the new path, or the old one for
    /// deletions.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }
}

pub trait VersionControl: Send {
    fn worktree(&self) -> &Path;

    fn checkout(&mut self, commit: &str) -> Result<(), VcsError>;

    fn diff(&self, from_commit: &str, to_commit: &str) -> Result<Vec<ChangeRecord>, VcsError>;

    /// File content at `commit`.
    fn show(&self, commit: &str, path: &str) -> Result<String, VcsError>;
}

/// `git` CLI driver for a local clone.
#[derive(Debug, Clone)]
pub struct GitRepository {
    root: PathBuf,
    content_extension: Option<String>,
}

impl GitRepository {
    pub fn open(path: &Path) -> Result<Self, VcsError> {
        let metadata = std::fs::metadata(path).map_err(|source| VcsError::InvalidRoot {
            path: path.to_path_buf(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(VcsError::InvalidRoot {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "path is not a directory"),
            });
        }

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--show-toplevel")
            .current_dir(path)
            .output()
            .map_err(|error| VcsError::Git(error.to_string()))?;
        if !output.status.success() {
            return Err(VcsError::NotAGitRepository {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let root = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        Ok(Self {
            root,
            content_extension: None,
        })
    }

    /// Only fetch new content for paths with this extension.
    pub fn with_content_extension(mut self, extension: &str) -> Self {
        self.content_extension = Some(extension.to_string());
        self
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>, VcsError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|error| VcsError::Git(error.to_string()))?;
        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(VcsError::Git(format!("git {}: {message}", args.join(" "))));
        }
        Ok(output.stdout)
    }

    fn wants_content(&self, path: &str) -> bool {
        self.content_extension
            .as_deref()
            .map_or(true, |extension| path.ends_with(extension))
    }
}

impl VersionControl for GitRepository {
    fn worktree(&self) -> &Path {
        &self.root
    }

    fn checkout(&mut self, commit: &str) -> Result<(), VcsError> {
        self.run(&["checkout", "--force", "--quiet", commit])?;
        info!(commit, root = %self.root.display(), "Checked out commit");
        Ok(())
    }

    fn diff(&self, from_commit: &str, to_commit: &str) -> Result<Vec<ChangeRecord>, VcsError> {
        let raw = self.run(&["diff", "--name-status", "-M", "-z", from_commit, to_commit])?;

        let mut records = Vec::new();
        for entry in parse_name_status(&String::from_utf8_lossy(&raw))? {
            let content = match entry.change_type {
                ChangeType::Delete => None,
                ChangeType::Rename if entry.similarity == Some(100) => None,
                _ => {
                    let path = entry.new_path.as_deref().unwrap_or_default();
                    if self.wants_content(path) {
                        Some(self.show(to_commit, path)?)
                    } else {
                        None
                    }
                }
            };
            records.push(ChangeRecord {
                change_type: entry.change_type,
                old_path: entry.old_path,
                new_path: entry.new_path,
                new_content: content,
            });
        }
        debug!(from_commit, to_commit, changes = records.len(), "Computed diff");
        Ok(records)
    }

    fn show(&self, commit: &str, path: &str) -> Result<String, VcsError> {
        let object = format!("{commit}:{path}");
        let bytes = self.run(&["show", &object])?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[derive(Debug, PartialEq, Eq)]
struct NameStatusEntry {
    change_type: ChangeType,
    similarity: Option<u8>,
    old_path: Option<String>,
    new_path: Option<String>,
}

/// Parses `git diff --name-status -z` output. Copies count as additions and
/// type changes as modifications.
fn parse_name_status(raw: &str) -> Result<Vec<NameStatusEntry>, VcsError> {
    let mut fields = raw.split('\0').filter(|field| !field.is_empty());
    let mut entries = Vec::new();

    while let Some(status) = fields.next() {
        let mut next_path = || {
            fields
                .next()
                .map(str::to_string)
                .ok_or_else(|| VcsError::Parse(format!("missing path after status '{status}'")))
        };
        let code = status.chars().next().unwrap_or(' ');
        let similarity = status.get(1..).and_then(|score| score.parse::<u8>().ok());

        let entry = match code {
            'A' => NameStatusEntry {
                change_type: ChangeType::Add,
                similarity,
                old_path: None,
                new_path: Some(next_path()?),
            },
            'D' => NameStatusEntry {
                change_type: ChangeType::Delete,
                similarity,
                old_path: Some(next_path()?),
                new_path: None,
            },
            'M' | 'T' => {
                let path = next_path()?;
                NameStatusEntry {
                    change_type: ChangeType::Modify,
                    similarity,
                    old_path: Some(path.clone()),
                    new_path: Some(path),
                }
            }
            'R' => {
                let old_path = next_path()?;
                let new_path = next_path()?;
                NameStatusEntry {
                    change_type: ChangeType::Rename,
                    similarity,
                    old_path: Some(old_path),
                    new_path: Some(new_path),
                }
            }
            'C' => {
                let _source = next_path()?;
                NameStatusEntry {
                    change_type: ChangeType::Add,
                    similarity,
                    old_path: None,
                    new_path: Some(next_path()?),
                }
            }
            _ => return Err(VcsError::Parse(format!("unknown status '{status}'"))),
        };
        entries.push(entry);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_status_output_maps_to_change_types() {
        let raw = "M\0pkg/a.py\0R100\0pkg/old.py\0pkg/new.py\0A\0pkg/b.py\0D\0pkg/c.py\0R087\0x.py\0y.py\0C100\0b.py\0b2.py\0T\0link.py\0";
        let entries = parse_name_status(raw).unwrap();

        assert_eq!(entries.len(), 7);
        assert_eq!(entries[0].change_type, ChangeType::Modify);
        assert_eq!(entries[1].change_type, ChangeType::Rename);
        assert_eq!(entries[1].similarity, Some(100));
        assert_eq!(entries[1].old_path.as_deref(), Some("pkg/old.py"));
        assert_eq!(entries[1].new_path.as_deref(), Some("pkg/new.py"));
        assert_eq!(entries[3].change_type, ChangeType::Delete);
        assert_eq!(entries[3].new_path, None);
        assert_eq!(entries[4].similarity, Some(87));
        assert_eq!(entries[5].change_type, ChangeType::Add);
        assert_eq!(entries[5].new_path.as_deref(), Some("b2.py"));
        assert_eq!(entries[6].change_type, ChangeType::Modify);
    }

    #[test]
    fn truncated_output_is_an_error() {
        assert!(matches!(
            parse_name_status("R100\0only-one.py\0"),
            Err(VcsError::Parse(_))
        ));
    }

    #[test]
    fn change_path_prefers_the_new_path() {
        assert_eq!(ChangeRecord::delete("gone.py").path(), "gone.py");
        assert_eq!(ChangeRecord::rename("a.py", "b.py", None).path(), "b.py");
    }
}
