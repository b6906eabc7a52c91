use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chunk::Chunker;
use crate::fuzzy::basename;
use crate::store::IndexChunk;

/// A function or method: its signature and full source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub signature: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: String,
    pub entities: Vec<Entity>,
}

/// Row of the persisted per-bug snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshotRow {
    pub filepath: String,
    pub filename: String,
    pub methods: Vec<Entity>,
}

/// Per-file entities for the checked-out revision, keyed by repository
/// relative path. Files without entities are never present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityTable {
    files: BTreeMap<String, FileRecord>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileRecord)> {
        self.files.iter().map(|(path, record)| (path.as_str(), record))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Replaces the row for `path`. An empty entity map removes the row
    /// instead. Returns whether the path is tracked afterwards.
    pub fn insert(&mut self, path: &str, entities: IndexMap<String, String>) -> bool {
        if entities.is_empty() {
            self.files.remove(path);
            return false;
        }
        let record = FileRecord {
            filename: basename(path).to_string(),
            entities: entities
                .into_iter()
                .map(|(signature, body)| Entity { signature, body })
                .collect(),
        };
        self.files.insert(path.to_string(), record);
        true
    }

    pub fn remove(&mut self, path: &str) -> Option<FileRecord> {
        self.files.remove(path)
    }

    /// Moves a row to a new key. A missing source key is logged and ignored.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> bool {
        let Some(mut record) = self.files.remove(old_path) else {
            warn!(old_path, new_path, "Rename source is not tracked; skipping");
            return false;
        };
        record.filename = basename(new_path).to_string();
        self.files.insert(new_path.to_string(), record);
        true
    }

    /// Rows sorted by path.
    pub fn snapshot(&self) -> Vec<FileSnapshotRow> {
        self.files
            .iter()
            .map(|(path, record)| FileSnapshotRow {
                filepath: path.clone(),
                filename: record.filename.clone(),
                methods: record.entities.clone(),
            })
            .collect()
    }

    pub fn from_snapshot(rows: Vec<FileSnapshotRow>) -> Self {
        let files = rows
            .into_iter()
            .filter(|row| !row.methods.is_empty())
            .map(|row| {
                (
                    row.filepath,
                    FileRecord {
                        filename: row.filename,
                        entities: row.methods,
                    },
                )
            })
            .collect();
        Self { files }
    }
}

/// Index chunks for one file: entity bodies joined by newlines, split to the
/// chunker's token limit and tagged with the path.
pub fn build_file_chunks(path: &str, record: &FileRecord, chunker: &Chunker) -> Vec<IndexChunk> {
    let text: String = record
        .entities
        .iter()
        .map(|entity| format!("\n{}", entity.body))
        .collect();
    chunker
        .split(text.trim())
        .iter()
        .map(|chunk| IndexChunk::for_file(path, chunk))
        .collect()
}
