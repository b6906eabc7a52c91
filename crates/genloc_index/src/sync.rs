use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::chunk::Chunker;
use crate::diff::{relevant_changes, DiffApplicator, DiffSummary};
use crate::entity_table::{build_file_chunks, EntityTable};
use crate::parser::{EntityParser, SourceLanguage};
use crate::scan::{scan_source_files, ScanError};
use crate::snapshot::{SnapshotError, SnapshotStore};
use crate::store::{insert_chunks, IndexStore, StoreError, DEFAULT_INSERT_BATCH_SIZE};
use crate::vcs::{ChangeRecord, ChangeType, VcsError, VersionControl};

pub const DEFAULT_RESCAN_RATIO: usize = 2;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Vcs(#[from] VcsError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub language: SourceLanguage,
    /// A diff touching `m` of `n` tracked files triggers a full rescan when
    /// `rescan_ratio * m >= n`.
    pub rescan_ratio: usize,
    pub insert_batch_size: usize,
}

impl SyncSettings {
    pub fn new(language: SourceLanguage) -> Self {
        Self {
            language,
            rescan_ratio: DEFAULT_RESCAN_RATIO,
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    FullRescan,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub mode: SyncMode,
    pub changed_files: usize,
    pub tracked_files: usize,
    pub chunks_inserted: usize,
    pub diff: Option<DiffSummary>,
}

/// Whether a diff of `changed` files against `tracked` files is large
/// enough to rebuild from scratch.
pub fn needs_full_rescan(changed: usize, tracked: usize, ratio: usize) -> bool {
    ratio.saturating_mul(changed) >= tracked
}

/// Keeps one project's entity table and index store in step with a moving
/// commit pointer.
pub struct IndexSynchronizer {
    settings: SyncSettings,
    table: EntityTable,
    store: Box<dyn IndexStore>,
    vcs: Box<dyn VersionControl>,
    parser: EntityParser,
    chunker: Chunker,
    snapshots: SnapshotStore,
}

impl IndexSynchronizer {
    pub fn new(
        settings: SyncSettings,
        store: Box<dyn IndexStore>,
        vcs: Box<dyn VersionControl>,
        parser: EntityParser,
        chunker: Chunker,
        snapshots: SnapshotStore,
    ) -> Self {
        Self {
            settings,
            table: EntityTable::new(),
            store,
            vcs,
            parser,
            chunker,
            snapshots,
        }
    }

    pub fn table(&self) -> &EntityTable {
        &self.table
    }

    pub fn store(&self) -> &dyn IndexStore {
        self.store.as_ref()
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Brings the index to `target_commit` and writes the bug's entity table
    /// snapshot. With no previous commit the tree is rescanned in full.
    pub fn sync(
        &mut self,
        bug_id: &str,
        previous_commit: Option<&str>,
        target_commit: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let outcome = match previous_commit.filter(|commit| !commit.trim().is_empty()) {
            None => self.full_rescan(target_commit, 0)?,
            Some(previous) => {
                let mut changes = relevant_changes(
                    self.vcs.diff(previous, target_commit)?,
                    self.settings.language,
                );
                self.fill_missing_content(&mut changes, target_commit)?;
                let changed = changes.len();
                let tracked = self.table.len();

                if needs_full_rescan(changed, tracked, self.settings.rescan_ratio) {
                    info!(bug_id, changed, tracked, "Diff is large; rescanning");
                    self.full_rescan(target_commit, changed)?
                } else {
                    let summary = DiffApplicator::new(
                        &mut self.table,
                        self.store.as_mut(),
                        &mut self.parser,
                        &self.chunker,
                        self.settings.insert_batch_size,
                    )
                    .apply(changes)?;
                    SyncOutcome {
                        mode: SyncMode::Incremental,
                        changed_files: changed,
                        tracked_files: self.table.len(),
                        chunks_inserted: summary.chunks_inserted,
                        diff: Some(summary),
                    }
                }
            }
        };

        self.snapshots.write_entity_table(bug_id, &self.table)?;
        info!(
            bug_id,
            commit = target_commit,
            mode = ?outcome.mode,
            tracked = outcome.tracked_files,
            chunks = outcome.chunks_inserted,
            "Index synchronized"
        );
        Ok(outcome)
    }

    /// Adds and modifications need the target content. A pure rename into
    /// the indexed tree arrives as an add without it.
    fn fill_missing_content(
        &self,
        changes: &mut [ChangeRecord],
        target_commit: &str,
    ) -> Result<(), SyncError> {
        for change in changes.iter_mut().filter(|change| {
            matches!(change.change_type, ChangeType::Add | ChangeType::Modify)
                && change.new_content.is_none()
        }) {
            debug!(path = change.path(), "Fetching content for change");
            change.new_content = Some(self.vcs.show(target_commit, change.path())?);
        }
        Ok(())
    }

    fn full_rescan(&mut self, target_commit: &str, changed: usize) -> Result<SyncOutcome, SyncError> {
        self.vcs.checkout(target_commit)?;
        let files = scan_source_files(self.vcs.worktree(), self.settings.language)?;

        self.store.reset()?;
        let mut table = EntityTable::new();
        let mut chunks = Vec::new();
        for file in files {
            let entities = self.parser.extract(&file.content);
            if !table.insert(&file.path, entities) {
                continue;
            }
            if let Some(record) = table.get(&file.path) {
                chunks.extend(build_file_chunks(&file.path, record, &self.chunker));
            }
        }

        let chunks_inserted =
            insert_chunks(self.store.as_mut(), chunks, self.settings.insert_batch_size)?;
        self.table = table;

        Ok(SyncOutcome {
            mode: SyncMode::FullRescan,
            changed_files: changed,
            tracked_files: self.table.len(),
            chunks_inserted,
            diff: None,
        })
    }
}
