use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use genloc_index::embedding::{
    DEFAULT_API_BASE, DEFAULT_HOSTED_MODEL, DEFAULT_LOCAL_MODEL, HOSTED_MODEL_MAX_TOKENS,
    LOCAL_MODEL_MAX_TOKENS,
};
use genloc_index::fuzzy::DEFAULT_SIGNATURE_DISTANCE;
use genloc_index::retrieval::{DEFAULT_CANDIDATE_LIMIT, DEFAULT_NEIGHBORS};
use genloc_index::snapshot::sanitize_project_name;
use genloc_index::store::DEFAULT_INSERT_BATCH_SIZE;
use genloc_index::sync::DEFAULT_RESCAN_RATIO;
use genloc_index::{RetryPolicy, SourceLanguage};
use thiserror::Error;

use crate::chat::DEFAULT_CHAT_MODEL;

pub const DEFAULT_ENTITY_CHUNK_TOKENS: usize = 300;
pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_RANKED_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown log level: {0}")]
    LogLevel(String),
    #[error("unknown embedding backend: {0} (expected `local` or `hosted`)")]
    EmbeddingBackend(String),
    #[error(transparent)]
    Language(#[from] genloc_index::parser::ParseError),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("{0} requires an API key; set OPENAI_API_KEY or GENLOC_API_KEY_FILE")]
    MissingApiKey(&'static str),
    #[error("failed to read API key file {path}: {source}")]
    ApiKeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} must be at least {min}")]
    TooSmall { name: &'static str, min: usize },
    #[error("{name} must be at most {max} for embedding model {model}")]
    TooLarge {
        name: &'static str,
        max: usize,
        model: String,
    },
}

#[derive(Parser, Debug)]
#[command(name = "genloc", author, version, about = "Bug localization over an incrementally synced code index", long_about = None)]
pub struct Args {
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Directory that receives snapshots, transcripts and results.
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sync the index through every bug's commit and retrieve candidate files.
    Index(IndexArgs),
    /// Rank candidate files for bugs that were already indexed.
    Rank(RankArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ProjectArgs {
    #[arg(long)]
    pub project: String,

    /// JSON list of `{bug_id, commit, report, reported_at?, fixed_files?}`.
    #[arg(long, value_name = "PATH")]
    pub bugs: PathBuf,

    /// `python` or `java`.
    #[arg(long)]
    pub language: Option<String>,

    /// Base URL of the OpenAI-compatible API.
    #[arg(long)]
    pub api_base: Option<String>,

    #[arg(long)]
    pub retry_attempts: Option<u32>,

    #[arg(long)]
    pub retry_initial_ms: Option<u64>,

    #[arg(long)]
    pub retry_max_ms: Option<u64>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct IndexArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Git worktree of the project.
    #[arg(long)]
    pub repo: Option<PathBuf>,

    /// `local` or `hosted`.
    #[arg(long)]
    pub embedding: Option<String>,

    #[arg(long)]
    pub embedding_model: Option<String>,

    #[arg(long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    #[arg(long)]
    pub rescan_ratio: Option<usize>,

    #[arg(long)]
    pub chunk_tokens: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub segment_tokens: Option<usize>,

    #[arg(long)]
    pub neighbors: Option<usize>,

    #[arg(long)]
    pub candidate_limit: Option<usize>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RankArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    #[arg(long)]
    pub chat_model: Option<String>,

    #[arg(long)]
    pub max_iterations: Option<usize>,

    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long)]
    pub ranked_limit: Option<usize>,

    /// Largest signature edit distance accepted by method body lookups.
    #[arg(long)]
    pub signature_distance: Option<usize>,

    #[arg(long)]
    pub candidate_limit: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(ConfigError::LogLevel(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmbeddingChoice {
    Local { model: String },
    Hosted { model: String },
}

impl EmbeddingChoice {
    pub fn model(&self) -> &str {
        match self {
            EmbeddingChoice::Local { model } | EmbeddingChoice::Hosted { model } => model,
        }
    }

    /// Token window of the chosen model; chunks and report segments must
    /// fit in it.
    pub fn max_input_tokens(&self) -> usize {
        match self {
            EmbeddingChoice::Local { .. } => LOCAL_MODEL_MAX_TOKENS,
            EmbeddingChoice::Hosted { .. } => HOSTED_MODEL_MAX_TOKENS,
        }
    }
}

/// Settings shared by both subcommands.
#[derive(Clone, Debug)]
pub struct ProjectConfig {
    pub project: String,
    pub bugs_path: PathBuf,
    pub output_dir: PathBuf,
    pub language: SourceLanguage,
    pub api_base: String,
    pub api_key: Option<String>,
    pub retry: RetryPolicy,
}

impl ProjectConfig {
    /// `<output>/<project>` with `/` in the project name replaced.
    pub fn project_dir(&self) -> PathBuf {
        self.output_dir.join(sanitize_project_name(&self.project))
    }

    pub fn results_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}-ranking.jsonl", sanitize_project_name(&self.project)))
    }
}

#[derive(Clone, Debug)]
pub struct IndexConfig {
    pub project: ProjectConfig,
    pub repo: PathBuf,
    pub embedding: EmbeddingChoice,
    pub database_path: PathBuf,
    pub rescan_ratio: usize,
    pub entity_chunk_tokens: usize,
    pub insert_batch_size: usize,
    pub report_segment_tokens: usize,
    pub neighbors: usize,
    pub candidate_limit: usize,
}

#[derive(Clone, Debug)]
pub struct RankConfig {
    pub project: ProjectConfig,
    pub chat_model: String,
    pub max_iterations: usize,
    pub workers: usize,
    pub ranked_limit: usize,
    pub signature_distance: usize,
    pub candidate_limit: usize,
}

#[derive(Clone, Debug)]
pub enum CommandConfig {
    Index(IndexConfig),
    Rank(RankConfig),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: LogLevel,
    pub command: CommandConfig,
}

impl Config {
    /// Resolves every setting as flag, then `GENLOC_*` environment variable,
    /// then default.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        Self::resolve(args, |key| env::var(key).ok())
    }

    pub fn resolve<F>(args: &Args, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = args
            .log_level
            .clone()
            .or_else(|| lookup("GENLOC_LOG_LEVEL"))
            .map(|value| value.parse())
            .transpose()?
            .unwrap_or(LogLevel::Info);

        let output_dir = args
            .output_dir
            .clone()
            .or_else(|| lookup("GENLOC_OUTPUT_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let command = match &args.command {
            Command::Index(index) => {
                CommandConfig::Index(resolve_index(index, output_dir, &lookup)?)
            }
            Command::Rank(rank) => CommandConfig::Rank(resolve_rank(rank, output_dir, &lookup)?),
        };

        Ok(Config { log_level, command })
    }
}

fn resolve_project<F>(args: &ProjectArgs, output_dir: PathBuf, lookup: &F) -> Result<ProjectConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let language = args
        .language
        .clone()
        .or_else(|| lookup("GENLOC_LANGUAGE"))
        .map(|value| value.parse::<SourceLanguage>())
        .transpose()?
        .unwrap_or(SourceLanguage::Python);

    let api_base = args
        .api_base
        .clone()
        .or_else(|| lookup("GENLOC_API_BASE"))
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

    let api_key = match lookup("OPENAI_API_KEY").filter(|key| !key.trim().is_empty()) {
        Some(key) => Some(key.trim().to_string()),
        None => match lookup("GENLOC_API_KEY_FILE") {
            Some(path) => Some(read_key_file(Path::new(&path))?),
            None => None,
        },
    };

    let defaults = RetryPolicy::default();
    let retry = RetryPolicy::new(
        pick(args.retry_attempts, lookup, "GENLOC_RETRY_ATTEMPTS", defaults.max_attempts())?,
        pick(args.retry_initial_ms, lookup, "GENLOC_RETRY_INITIAL_MS", 5_000)?,
        pick(args.retry_max_ms, lookup, "GENLOC_RETRY_MAX_MS", 60_000)?,
        2.0,
    );

    Ok(ProjectConfig {
        project: args.project.clone(),
        bugs_path: args.bugs.clone(),
        output_dir,
        language,
        api_base,
        api_key,
        retry,
    })
}

fn resolve_index<F>(args: &IndexArgs, output_dir: PathBuf, lookup: &F) -> Result<IndexConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let project = resolve_project(&args.project, output_dir, lookup)?;

    let repo = args
        .repo
        .clone()
        .or_else(|| lookup("GENLOC_REPO").map(PathBuf::from))
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let backend = args
        .embedding
        .clone()
        .or_else(|| lookup("GENLOC_EMBEDDING"))
        .unwrap_or_else(|| "local".to_string());
    let model = args
        .embedding_model
        .clone()
        .or_else(|| lookup("GENLOC_EMBEDDING_MODEL"));
    let embedding = match backend.to_ascii_lowercase().as_str() {
        "local" => EmbeddingChoice::Local {
            model: model.unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string()),
        },
        "hosted" | "openai" => {
            if project.api_key.is_none() {
                return Err(ConfigError::MissingApiKey("hosted embeddings"));
            }
            EmbeddingChoice::Hosted {
                model: model.unwrap_or_else(|| DEFAULT_HOSTED_MODEL.to_string()),
            }
        }
        other => return Err(ConfigError::EmbeddingBackend(other.to_string())),
    };

    let database_path = args
        .database
        .clone()
        .or_else(|| lookup("GENLOC_DATABASE").map(PathBuf::from))
        .unwrap_or_else(|| {
            project
                .output_dir
                .join(format!("{}_bug_data", sanitize_project_name(&project.project)))
                .join(".genloc-index.sqlite")
        });

    let rescan_ratio = pick(args.rescan_ratio, lookup, "GENLOC_RESCAN_RATIO", DEFAULT_RESCAN_RATIO)?;
    let max_tokens = embedding.max_input_tokens();
    let entity_chunk_tokens = at_least(
        "chunk_tokens",
        pick(args.chunk_tokens, lookup, "GENLOC_CHUNK_TOKENS", DEFAULT_ENTITY_CHUNK_TOKENS)?,
        1,
    )?;
    let entity_chunk_tokens = at_most("chunk_tokens", entity_chunk_tokens, &embedding)?;
    let insert_batch_size = at_least(
        "batch_size",
        pick(args.batch_size, lookup, "GENLOC_BATCH_SIZE", DEFAULT_INSERT_BATCH_SIZE)?,
        1,
    )?;
    let report_segment_tokens = at_least(
        "segment_tokens",
        pick(args.segment_tokens, lookup, "GENLOC_SEGMENT_TOKENS", max_tokens)?,
        1,
    )?;
    let report_segment_tokens = at_most("segment_tokens", report_segment_tokens, &embedding)?;
    let neighbors = at_least(
        "neighbors",
        pick(args.neighbors, lookup, "GENLOC_NEIGHBORS", DEFAULT_NEIGHBORS)?,
        1,
    )?;
    let candidate_limit = pick(args.candidate_limit, lookup, "GENLOC_CANDIDATE_LIMIT", DEFAULT_CANDIDATE_LIMIT)?;

    Ok(IndexConfig {
        project,
        repo,
        embedding,
        database_path,
        rescan_ratio,
        entity_chunk_tokens,
        insert_batch_size,
        report_segment_tokens,
        neighbors,
        candidate_limit,
    })
}

fn resolve_rank<F>(args: &RankArgs, output_dir: PathBuf, lookup: &F) -> Result<RankConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let project = resolve_project(&args.project, output_dir, lookup)?;
    if project.api_key.is_none() {
        return Err(ConfigError::MissingApiKey("ranking"));
    }

    let chat_model = args
        .chat_model
        .clone()
        .or_else(|| lookup("GENLOC_CHAT_MODEL"))
        .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string());

    // The loop forbids tools at `max_iterations - 2`, which needs two turns.
    let max_iterations = at_least(
        "max_iterations",
        pick(args.max_iterations, lookup, "GENLOC_MAX_ITERATIONS", DEFAULT_MAX_ITERATIONS)?,
        2,
    )?;
    let workers = at_least("workers", pick(args.workers, lookup, "GENLOC_WORKERS", DEFAULT_WORKERS)?, 1)?;
    let ranked_limit = pick(args.ranked_limit, lookup, "GENLOC_RANKED_LIMIT", DEFAULT_RANKED_LIMIT)?;
    let signature_distance = pick(
        args.signature_distance,
        lookup,
        "GENLOC_SIGNATURE_DISTANCE",
        DEFAULT_SIGNATURE_DISTANCE,
    )?;
    let candidate_limit = pick(args.candidate_limit, lookup, "GENLOC_CANDIDATE_LIMIT", DEFAULT_CANDIDATE_LIMIT)?;

    Ok(RankConfig {
        project,
        chat_model,
        max_iterations,
        workers,
        ranked_limit,
        signature_distance,
        candidate_limit,
    })
}

fn pick<T, F>(flag: Option<T>, lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = flag {
        return Ok(value);
    }
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: key,
            value: raw,
        }),
        None => Ok(default),
    }
}

fn at_least(name: &'static str, value: usize, min: usize) -> Result<usize, ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall { name, min });
    }
    Ok(value)
}

fn at_most(name: &'static str, value: usize, embedding: &EmbeddingChoice) -> Result<usize, ConfigError> {
    let max = embedding.max_input_tokens();
    if value > max {
        return Err(ConfigError::TooLarge {
            name,
            max,
            model: embedding.model().to_string(),
        });
    }
    Ok(value)
}

fn read_key_file(path: &Path) -> Result<String, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::ApiKeyFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(raw.trim().to_string())
}
