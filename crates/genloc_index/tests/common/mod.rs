#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use genloc_index::embedding::{Embedder, EmbeddingError};
use genloc_index::tokens::ApproxCounter;
use genloc_index::vcs::{ChangeRecord, VcsError, VersionControl};
use genloc_index::{
    Chunker, EntityParser, IndexStore, IndexSynchronizer, SnapshotStore, SourceLanguage,
    SqliteIndexStore, SyncSettings,
};
use sha2::{Digest, Sha256};

/// Bag-of-words vectors over hashed lowercase tokens.
pub struct WordHashEmbedder;

impl Embedder for WordHashEmbedder {
    fn model_name(&self) -> &str {
        "word-hash"
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; 64];
                for word in text
                    .split(|ch: char| !ch.is_alphanumeric() && ch != '_')
                    .filter(|word| !word.is_empty())
                {
                    let digest = Sha256::digest(word.to_lowercase().as_bytes());
                    vector[digest[0] as usize % 64] += 1.0;
                }
                vector
            })
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub files: BTreeMap<String, String>,
    /// Renames relative to the previous commit, `(old, new)`.
    pub renames: Vec<(String, String)>,
}

/// In-memory history whose checkouts are written to a scratch worktree.
pub struct FakeRepository {
    worktree: PathBuf,
    commits: BTreeMap<String, Commit>,
    pub checkouts: Vec<String>,
}

impl FakeRepository {
    pub fn new(worktree: &Path, commits: BTreeMap<String, Commit>) -> Self {
        Self {
            worktree: worktree.to_path_buf(),
            commits,
            checkouts: Vec::new(),
        }
    }

    fn commit(&self, id: &str) -> Result<&Commit, VcsError> {
        self.commits
            .get(id)
            .ok_or_else(|| VcsError::Git(format!("unknown commit {id}")))
    }
}

impl VersionControl for FakeRepository {
    fn worktree(&self) -> &Path {
        &self.worktree
    }

    fn checkout(&mut self, commit: &str) -> Result<(), VcsError> {
        let files = self.commit(commit)?.files.clone();
        for entry in fs::read_dir(&self.worktree).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                fs::remove_dir_all(path).unwrap();
            } else {
                fs::remove_file(path).unwrap();
            }
        }
        for (path, content) in files {
            let target = self.worktree.join(&path);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(target, content).unwrap();
        }
        self.checkouts.push(commit.to_string());
        Ok(())
    }

    fn diff(&self, from_commit: &str, to_commit: &str) -> Result<Vec<ChangeRecord>, VcsError> {
        let before = &self.commit(from_commit)?.files;
        let after = self.commit(to_commit)?;
        let mut records = Vec::new();
        let mut renamed_old = BTreeSet::new();
        let mut renamed_new = BTreeSet::new();

        for (old, new) in &after.renames {
            let content = &after.files[new];
            let changed = before.get(old) != Some(content);
            records.push(ChangeRecord::rename(
                old,
                new,
                changed.then_some(content.as_str()),
            ));
            renamed_old.insert(old.clone());
            renamed_new.insert(new.clone());
        }

        for (path, content) in before {
            if renamed_old.contains(path) {
                continue;
            }
            match after.files.get(path) {
                None => records.push(ChangeRecord::delete(path)),
                Some(updated) if updated != content => {
                    records.push(ChangeRecord::modify(path, updated))
                }
                Some(_) => {}
            }
        }
        for (path, content) in &after.files {
            if !before.contains_key(path) && !renamed_new.contains(path) {
                records.push(ChangeRecord::add(path, content));
            }
        }
        Ok(records)
    }

    fn show(&self, commit: &str, path: &str) -> Result<String, VcsError> {
        self.commit(commit)?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| VcsError::Git(format!("{path} does not exist at {commit}")))
    }
}

pub fn python_function(name: &str, salt: usize) -> String {
    format!("def {name}(value, other):\n    total = value + other\n    return total * {salt}\n")
}

pub fn synchronizer(
    worktree: &Path,
    output: &Path,
    commits: BTreeMap<String, Commit>,
) -> IndexSynchronizer {
    let embedder = Arc::new(WordHashEmbedder);
    let store = SqliteIndexStore::open_in_memory("python-files", embedder).unwrap();
    let chunker = Chunker::new(Arc::new(ApproxCounter), 300);
    IndexSynchronizer::new(
        SyncSettings::new(SourceLanguage::Python),
        Box::new(store),
        Box::new(FakeRepository::new(worktree, commits)),
        EntityParser::new(SourceLanguage::Python).unwrap(),
        chunker,
        SnapshotStore::new(output),
    )
}

/// `(file, id, document)` for every chunk of every tracked file.
pub fn store_contents(sync: &IndexSynchronizer) -> BTreeSet<(String, String, String)> {
    let mut contents = BTreeSet::new();
    for path in sync.table().paths() {
        for chunk in sync.store().get_file(path).unwrap() {
            contents.insert((chunk.metadata.file, chunk.id, chunk.document));
        }
    }
    assert_eq!(
        contents.len(),
        sync.store().count().unwrap(),
        "store holds chunks for untracked files"
    );
    contents
}
