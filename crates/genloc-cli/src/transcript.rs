//! Append-only JSONL record of one bug's refinement conversation.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::chat::Usage;

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("failed to write transcript {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode transcript entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TranscriptEvent {
    IterationStarted {
        iteration: usize,
        tool_choice: String,
    },
    ToolCall {
        iteration: usize,
        call_id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        iteration: usize,
        call_id: String,
        name: String,
        result: Value,
    },
    FinalResponse {
        iteration: usize,
        content: Option<String>,
    },
    Usage {
        iteration: usize,
        usage: Usage,
    },
    Finished {
        status: String,
        iterations: usize,
    },
}

#[derive(Serialize)]
struct Entry<'a> {
    run_id: &'a str,
    bug_id: &'a str,
    timestamp_ms: u64,
    #[serde(flatten)]
    event: &'a TranscriptEvent,
}

pub struct Transcript {
    path: PathBuf,
    bug_id: String,
    run_id: String,
    writer: BufWriter<File>,
}

impl Transcript {
    /// `<project_dir>/bug_<bug_id>_log.jsonl`, opened for appending.
    pub async fn open(project_dir: &Path, bug_id: &str) -> Result<Self, TranscriptError> {
        let path = transcript_path(project_dir, bug_id);
        let io_error = |source| TranscriptError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(project_dir).await.map_err(io_error)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_error)?;
        Ok(Self {
            bug_id: bug_id.to_string(),
            run_id: Uuid::new_v4().to_string(),
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn record(&mut self, event: TranscriptEvent) -> Result<(), TranscriptError> {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        let mut line = serde_json::to_string(&Entry {
            run_id: &self.run_id,
            bug_id: &self.bug_id,
            timestamp_ms,
            event: &event,
        })?;
        line.push('\n');
        let path = &self.path;
        let io_error = |source| TranscriptError::Io {
            path: path.clone(),
            source,
        };
        self.writer.write_all(line.as_bytes()).await.map_err(io_error)?;
        self.writer.flush().await.map_err(io_error)
    }
}

pub fn transcript_path(project_dir: &Path, bug_id: &str) -> PathBuf {
    project_dir.join(format!("bug_{bug_id}_log.jsonl"))
}
