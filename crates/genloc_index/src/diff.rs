use tracing::{debug, warn};

use crate::chunk::Chunker;
use crate::entity_table::{build_file_chunks, EntityTable};
use crate::parser::{EntityParser, SourceLanguage};
use crate::scan::is_test_path;
use crate::store::{insert_chunks, IndexChunk, IndexStore, StoreError};
use crate::vcs::{ChangeRecord, ChangeType};

/// Counts of what one commit transition did to the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub renamed: usize,
    pub skipped: usize,
    pub chunks_inserted: usize,
}

fn is_indexed_path(path: Option<&str>, language: SourceLanguage) -> bool {
    path.is_some_and(|path| language.is_source_path(path) && !is_test_path(path))
}

/// Keeps the changes that touch indexed files. A rename that crosses the
/// indexed boundary becomes a delete of the old path or an add of the new one.
pub fn relevant_changes(changes: Vec<ChangeRecord>, language: SourceLanguage) -> Vec<ChangeRecord> {
    changes
        .into_iter()
        .filter_map(|change| {
            let old_indexed = is_indexed_path(change.old_path.as_deref(), language);
            let new_indexed = is_indexed_path(change.new_path.as_deref(), language);
            match change.change_type {
                ChangeType::Delete => old_indexed.then_some(change),
                ChangeType::Add | ChangeType::Modify => new_indexed.then_some(change),
                ChangeType::Rename => match (old_indexed, new_indexed) {
                    (true, true) => Some(change),
                    (true, false) => change.old_path.as_deref().map(ChangeRecord::delete),
                    (false, true) => Some(ChangeRecord {
                        change_type: ChangeType::Add,
                        old_path: None,
                        ..change
                    }),
                    (false, false) => None,
                },
            }
        })
        .collect()
}

/// Applies one commit transition's changes to the entity table and the
/// index store.
pub struct DiffApplicator<'a> {
    table: &'a mut EntityTable,
    store: &'a mut dyn IndexStore,
    parser: &'a mut EntityParser,
    chunker: &'a Chunker,
    batch_size: usize,
}

impl<'a> DiffApplicator<'a> {
    pub fn new(
        table: &'a mut EntityTable,
        store: &'a mut dyn IndexStore,
        parser: &'a mut EntityParser,
        chunker: &'a Chunker,
        batch_size: usize,
    ) -> Self {
        Self {
            table,
            store,
            parser,
            chunker,
            batch_size,
        }
    }

    /// Deletions run first; all new chunks are inserted in one batched pass at
    /// the end.
    pub fn apply(mut self, mut changes: Vec<ChangeRecord>) -> Result<DiffSummary, StoreError> {
        changes.sort_by_key(|change| change.change_type != ChangeType::Delete);

        let mut summary = DiffSummary::default();
        let mut staged: Vec<IndexChunk> = Vec::new();

        for change in changes {
            match change.change_type {
                ChangeType::Delete => {
                    let path = change.path();
                    self.delete(path)?;
                    summary.deleted += 1;
                }
                ChangeType::Add | ChangeType::Modify => {
                    let Some(content) = change.new_content.as_deref() else {
                        warn!(path = change.path(), "Change has no content; skipping");
                        summary.skipped += 1;
                        continue;
                    };
                    let path = change.path();
                    if change.change_type == ChangeType::Add && !self.table.contains(path) {
                        summary.added += 1;
                    } else {
                        summary.modified += 1;
                    }
                    self.delete(path)?;
                    staged.extend(self.parse_and_chunk(path, content));
                }
                ChangeType::Rename => {
                    let (Some(old_path), Some(new_path)) =
                        (change.old_path.as_deref(), change.new_path.as_deref())
                    else {
                        summary.skipped += 1;
                        continue;
                    };
                    summary.renamed += 1;
                    match change.new_content.as_deref() {
                        Some(content) => {
                            self.delete(old_path)?;
                            self.delete(new_path)?;
                            staged.extend(self.parse_and_chunk(new_path, content));
                        }
                        None => staged.extend(self.rename_in_place(old_path, new_path)?),
                    }
                }
            }
        }

        summary.chunks_inserted = insert_chunks(&mut *self.store, staged, self.batch_size)?;
        debug!(?summary, "Applied diff");
        Ok(summary)
    }

    fn delete(&mut self, path: &str) -> Result<(), StoreError> {
        if self.table.remove(path).is_none() {
            debug!(path, "Path was not tracked");
        }
        self.store.delete_file(path)?;
        Ok(())
    }

    fn parse_and_chunk(&mut self, path: &str, content: &str) -> Vec<IndexChunk> {
        let entities = self.parser.extract(content);
        if !self.table.insert(path, entities) {
            return Vec::new();
        }
        self.table
            .get(path)
            .map(|record| build_file_chunks(path, record, self.chunker))
            .unwrap_or_default()
    }

    /// Moves the stored chunks to the new path, rewriting path references in
    /// their text, and renames the table row.
    fn rename_in_place(&mut self, old_path: &str, new_path: &str) -> Result<Vec<IndexChunk>, StoreError> {
        let rewritten: Vec<IndexChunk> = self
            .store
            .get_file(old_path)?
            .into_iter()
            .map(|chunk| IndexChunk::from_document(new_path, chunk.document.replace(old_path, new_path)))
            .collect();

        self.store.delete_file(new_path)?;
        self.store.delete_file(old_path)?;
        self.table.remove(new_path);
        self.table.rename(old_path, new_path);
        Ok(rewritten)
    }
}
