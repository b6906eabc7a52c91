//! Parallel ranking of already indexed bugs.
//!
//! Each worker reads its bug's snapshot files, runs the refinement loop and
//! appends one line to the project's results file. The results file and the
//! project directory are the only shared state; both sit behind one lock that
//! is never held across a chat request.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use genloc_index::{CandidateList, SnapshotStore, SourceLanguage};
use serde::Serialize;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::agent::{LoopOutcome, LoopSettings, LoopStatus, RankedEntry, RefinementLoop};
use crate::bugs::{load_bugs, BugRecord};
use crate::chat::ChatClient;
use crate::config::RankConfig;
use crate::resolve::resolve_ranked_list;
use crate::tools::ToolBackends;
use crate::transcript::Transcript;

/// One line of `<output>/<project>-ranking.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct RankingRecord {
    pub bug_id: String,
    pub outcome: String,
    pub iterations: usize,
    pub analysis: Option<String>,
    pub ranked_list: Vec<RankedEntry>,
    pub resolved_files: Vec<String>,
    pub fixed_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RankingSummary {
    pub done: usize,
    pub exhausted: usize,
    pub malformed: usize,
    pub failed: usize,
}

impl RankingSummary {
    fn count(&mut self, record: &RankingRecord) {
        match record.outcome.as_str() {
            "done" => self.done += 1,
            "exhausted" => self.exhausted += 1,
            "malformed" => self.malformed += 1,
            _ => self.failed += 1,
        }
    }
}

struct SharedOutput {
    results: File,
    project_dir: PathBuf,
    project_dir_ready: bool,
}

impl SharedOutput {
    async fn ensure_project_dir(&mut self) -> std::io::Result<PathBuf> {
        if !self.project_dir_ready {
            fs::create_dir_all(&self.project_dir).await?;
            self.project_dir_ready = true;
        }
        Ok(self.project_dir.clone())
    }

    async fn append(&mut self, record: &RankingRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.results.write_all(line.as_bytes()).await?;
        self.results.flush().await?;
        Ok(())
    }
}

struct RankingContext {
    refinement: RefinementLoop,
    snapshots: SnapshotStore,
    language: SourceLanguage,
    candidate_limit: usize,
    signature_distance: usize,
    output: Mutex<SharedOutput>,
}

pub async fn run_ranking(config: &RankConfig, client: Arc<dyn ChatClient>) -> Result<RankingSummary> {
    let project = &config.project;
    let bugs = load_bugs(&project.bugs_path)?;

    fs::create_dir_all(&project.output_dir)
        .await
        .with_context(|| format!("failed to create {}", project.output_dir.display()))?;
    let results_path = project.results_path();
    let results = File::create(&results_path)
        .await
        .with_context(|| format!("failed to create {}", results_path.display()))?;

    let context = Arc::new(RankingContext {
        refinement: RefinementLoop::new(
            client,
            LoopSettings {
                model: config.chat_model.clone(),
                language: project.language,
                max_iterations: config.max_iterations,
                ranked_limit: config.ranked_limit,
            },
        ),
        snapshots: SnapshotStore::for_project(&project.output_dir, &project.project),
        language: project.language,
        candidate_limit: config.candidate_limit,
        signature_distance: config.signature_distance,
        output: Mutex::new(SharedOutput {
            results,
            project_dir: project.project_dir(),
            project_dir_ready: false,
        }),
    });

    info!(project = %project.project, bugs = bugs.len(), workers = config.workers, "Ranking bugs");
    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut workers = JoinSet::new();
    for bug in bugs {
        let context = context.clone();
        let semaphore = semaphore.clone();
        workers.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            let record = rank_bug(&context, &bug).await;
            if let Err(err) = context.output.lock().await.append(&record).await {
                error!(bug_id = %bug.bug_id, error = %err, "Failed to write ranking result");
            }
            Some(record)
        });
    }

    let mut summary = RankingSummary::default();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Some(record)) => summary.count(&record),
            Ok(None) => summary.failed += 1,
            Err(err) => {
                error!(error = %err, "Ranking worker panicked");
                summary.failed += 1;
            }
        }
    }

    info!(
        done = summary.done,
        exhausted = summary.exhausted,
        malformed = summary.malformed,
        failed = summary.failed,
        results = %results_path.display(),
        "Ranking finished"
    );
    Ok(summary)
}

async fn rank_bug(context: &RankingContext, bug: &BugRecord) -> RankingRecord {
    match try_rank_bug(context, bug).await {
        Ok((outcome, resolved_files)) => RankingRecord {
            bug_id: bug.bug_id.clone(),
            outcome: outcome.status.as_str().to_string(),
            iterations: outcome.iteration,
            analysis: outcome.analysis,
            ranked_list: outcome.ranked_list,
            resolved_files,
            fixed_files: bug.fixed_files.clone(),
            error: None,
        },
        Err(err) => {
            error!(bug_id = %bug.bug_id, error = %format!("{err:#}"), "Ranking failed; skipping bug");
            RankingRecord {
                bug_id: bug.bug_id.clone(),
                outcome: "failed".to_string(),
                iterations: 0,
                analysis: None,
                ranked_list: Vec::new(),
                resolved_files: Vec::new(),
                fixed_files: bug.fixed_files.clone(),
                error: Some(format!("{err:#}")),
            }
        }
    }
}

async fn try_rank_bug(context: &RankingContext, bug: &BugRecord) -> Result<(LoopOutcome, Vec<String>)> {
    let bug_id = bug.bug_id.as_str();
    let table = context.snapshots.read_entity_table(bug_id)?;
    let candidates = CandidateList::from_search_result(
        &context.snapshots.read_search_result(bug_id)?,
        context.candidate_limit,
    );

    let project_dir = context.output.lock().await.ensure_project_dir().await?;
    let mut transcript = Transcript::open(&project_dir, bug_id).await?;

    let tools = ToolBackends::new(
        table,
        candidates.paths(),
        context.language,
        context.signature_distance,
    );
    let outcome = context
        .refinement
        .run(bug_id, &bug.report, &tools, &mut transcript)
        .await?;

    let resolved = match outcome.status {
        LoopStatus::Done => resolve_ranked_list(&outcome.ranked_list, tools.table(), context.language),
        LoopStatus::Exhausted | LoopStatus::Malformed => Vec::new(),
    };
    Ok((outcome, resolved))
}
