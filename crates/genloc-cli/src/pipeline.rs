//! Sequential indexing: every bug of a project, oldest first, syncs the
//! index to its commit and retrieves its candidate files.

use std::fs;

use anyhow::{Context, Result};
use genloc_index::environment::collect_model_cache_info;
use genloc_index::{
    create_embedder, token_counter_for, Chunker, EmbeddingBackend, EntityParser, GitRepository,
    IndexSynchronizer, RetrievalRanker, SnapshotStore, SqliteIndexStore, SyncMode, SyncSettings,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::bugs::{load_bugs, BugRecord};
use crate::config::{EmbeddingChoice, IndexConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexingSummary {
    pub indexed: usize,
    pub full_rescans: usize,
    pub incremental: usize,
    pub failed: Vec<String>,
}

pub fn embedding_backend(config: &IndexConfig) -> Result<EmbeddingBackend> {
    let project = &config.project;
    Ok(match &config.embedding {
        EmbeddingChoice::Local { model } => {
            let cache = collect_model_cache_info();
            cache.log();
            EmbeddingBackend::Local {
                model: model.clone(),
                cache_dir: cache.directory,
            }
        }
        EmbeddingChoice::Hosted { model } => EmbeddingBackend::Hosted {
            model: model.clone(),
            base_url: project.api_base.clone(),
            api_key: project
                .api_key
                .clone()
                .context("hosted embeddings need an API key")?,
            retry: project.retry.clone(),
        },
    })
}

/// Runs the whole indexing pass on a blocking thread; embedding, git and
/// SQLite calls all block.
pub async fn run_indexing(config: IndexConfig) -> Result<IndexingSummary> {
    tokio::task::spawn_blocking(move || index_project(&config))
        .await
        .context("indexing task panicked")?
}

fn index_project(config: &IndexConfig) -> Result<IndexingSummary> {
    let project = &config.project;
    let bugs = load_bugs(&project.bugs_path)?;
    info!(project = %project.project, bugs = bugs.len(), "Loaded bug list");

    let backend = embedding_backend(config)?;
    // Loading the local model downloads its tokenizer, which the counter reads.
    let embedder = create_embedder(&backend).context("failed to initialise embedder")?;
    let counter = token_counter_for(&backend).context("failed to load tokenizer")?;

    if let Some(parent) = config.database_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteIndexStore::open(
        &config.database_path,
        project.language.collection_name(),
        embedder,
    )?;
    let repository =
        GitRepository::open(&config.repo)?.with_content_extension(project.language.extension());

    let mut settings = SyncSettings::new(project.language);
    settings.rescan_ratio = config.rescan_ratio;
    settings.insert_batch_size = config.insert_batch_size;

    let mut synchronizer = IndexSynchronizer::new(
        settings,
        Box::new(store),
        Box::new(repository),
        EntityParser::new(project.language)?,
        Chunker::new(counter.clone(), config.entity_chunk_tokens),
        SnapshotStore::for_project(&project.output_dir, &project.project),
    );
    let ranker = RetrievalRanker::new(
        Chunker::new(counter, config.report_segment_tokens),
        config.neighbors,
        config.candidate_limit,
    );

    Ok(index_bugs(&bugs, &mut synchronizer, &ranker))
}

/// Processes bugs in order. A failed bug is logged and skipped, and the next
/// bug starts from a full rescan because the index state is then unknown.
pub fn index_bugs(
    bugs: &[BugRecord],
    synchronizer: &mut IndexSynchronizer,
    ranker: &RetrievalRanker,
) -> IndexingSummary {
    let mut summary = IndexingSummary::default();
    let mut previous_commit: Option<String> = None;

    for bug in bugs {
        let bug_id = bug.bug_id.as_str();
        let outcome = match synchronizer.sync(bug_id, previous_commit.as_deref(), &bug.commit) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(bug_id, commit = %bug.commit, error = %err, "Index sync failed; skipping bug");
                summary.failed.push(bug.bug_id.clone());
                previous_commit = None;
                continue;
            }
        };
        previous_commit = Some(bug.commit.clone());
        match outcome.mode {
            SyncMode::FullRescan => summary.full_rescans += 1,
            SyncMode::Incremental => summary.incremental += 1,
        }

        match ranker.retrieve(synchronizer.store(), synchronizer.snapshots(), bug_id, &bug.report) {
            Ok(candidates) => {
                if candidates.is_empty() {
                    warn!(bug_id, "No candidate files retrieved");
                }
                summary.indexed += 1;
            }
            Err(err) => {
                error!(bug_id, error = %err, "Candidate retrieval failed; skipping bug");
                summary.failed.push(bug.bug_id.clone());
            }
        }
    }

    info!(
        indexed = summary.indexed,
        failed = summary.failed.len(),
        full_rescans = summary.full_rescans,
        incremental = summary.incremental,
        "Indexing finished"
    );
    summary
}
