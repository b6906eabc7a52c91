#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use genloc_cli::chat::{ChatClient, ChatError, ChatMessage, ChatRequest, ChatResponse, ToolCall, Usage};
use genloc_index::embedding::{Embedder, EmbeddingError};
use genloc_index::vcs::{ChangeRecord, VcsError, VersionControl};
use genloc_index::EntityTable;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};

/// Chat client answering from a closure of `(iteration, request)`, where the
/// iteration is the number of assistant turns already in the conversation.
pub struct ScriptedClient<F> {
    respond: F,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl<F> ScriptedClient<F>
where
    F: Fn(usize, &ChatRequest) -> ChatResponse + Send + Sync,
{
    pub fn new(respond: F) -> Self {
        Self {
            respond,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl<F> ChatClient for ScriptedClient<F>
where
    F: Fn(usize, &ChatRequest) -> ChatResponse + Send + Sync,
{
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        let iteration = request
            .messages
            .iter()
            .filter(|message| matches!(message, ChatMessage::Assistant { .. }))
            .count();
        self.requests.lock().unwrap().push(request.clone());
        Ok((self.respond)(iteration, request))
    }
}

pub fn tool_response(name: &str, arguments: &str) -> ChatResponse {
    ChatResponse {
        content: None,
        tool_calls: vec![ToolCall::new(&format!("call_{name}"), name, arguments)],
        usage: Some(Usage {
            prompt_tokens: 100,
            completion_tokens: 10,
            total_tokens: 110,
        }),
    }
}

pub fn answer(files: &[&str]) -> ChatResponse {
    let ranked: Vec<serde_json::Value> = files
        .iter()
        .map(|file| serde_json::json!({ "file": file, "justification": format!("{file} handles it") }))
        .collect();
    ChatResponse {
        content: Some(
            serde_json::json!({
                "analysis_of_the_bug_report": "The report describes a failing save.",
                "ranked_list": ranked,
            })
            .to_string(),
        ),
        tool_calls: Vec::new(),
        usage: Some(Usage {
            prompt_tokens: 300,
            completion_tokens: 40,
            total_tokens: 340,
        }),
    }
}

/// The user message of a request: the bug report prompt.
pub fn report_of(request: &ChatRequest) -> &str {
    request
        .messages
        .iter()
        .find_map(|message| match message {
            ChatMessage::User { content } => Some(content.as_str()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Table from `(path, signature, body)` rows.
pub fn entity_table(rows: &[(&str, &str, &str)]) -> EntityTable {
    let mut files: BTreeMap<&str, IndexMap<String, String>> = BTreeMap::new();
    for (path, signature, body) in rows {
        files
            .entry(*path)
            .or_default()
            .insert(signature.to_string(), body.to_string());
    }
    let mut table = EntityTable::new();
    for (path, entities) in files {
        table.insert(path, entities);
    }
    table
}

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

/// Commits as full file maps; diffs report adds, deletes and modifications.
pub struct SnapshotRepository {
    worktree: PathBuf,
    commits: BTreeMap<String, BTreeMap<String, String>>,
}

impl SnapshotRepository {
    pub fn new(worktree: &Path, commits: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        Self {
            worktree: worktree.to_path_buf(),
            commits,
        }
    }

    fn files(&self, commit: &str) -> Result<&BTreeMap<String, String>, VcsError> {
        self.commits
            .get(commit)
            .ok_or_else(|| VcsError::Git(format!("unknown commit {commit}")))
    }
}

impl VersionControl for SnapshotRepository {
    fn worktree(&self) -> &Path {
        &self.worktree
    }

    fn checkout(&mut self, commit: &str) -> Result<(), VcsError> {
        let files = self.files(commit)?.clone();
        if self.worktree.exists() {
            fs::remove_dir_all(&self.worktree).unwrap();
        }
        for (path, content) in files {
            let target = self.worktree.join(path);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(target, content).unwrap();
        }
        Ok(())
    }

    fn diff(&self, from_commit: &str, to_commit: &str) -> Result<Vec<ChangeRecord>, VcsError> {
        let before = self.files(from_commit)?;
        let after = self.files(to_commit)?;
        let mut changes = Vec::new();
        for (path, content) in after {
            match before.get(path) {
                None => changes.push(ChangeRecord::add(path, content)),
                Some(old) if old != content => changes.push(ChangeRecord::modify(path, content)),
                Some(_) => {}
            }
        }
        for path in before.keys().filter(|path| !after.contains_key(*path)) {
            changes.push(ChangeRecord::delete(path));
        }
        Ok(changes)
    }

    fn show(&self, commit: &str, path: &str) -> Result<String, VcsError> {
        self.files(commit)?
            .get(path)
            .cloned()
            .ok_or_else(|| VcsError::Git(format!("{path} does not exist at {commit}")))
    }
}

pub fn python_function(name: &str, body_word: &str) -> String {
    format!("def {name}(value, other):\n    total = value + other\n    return '{body_word}'\n")
}
