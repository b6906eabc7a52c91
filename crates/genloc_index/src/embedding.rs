use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use fastembed::{EmbeddingModel, TextEmbedding, TextInitOptions};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::retry::{is_retryable_status, RetryPolicy, Retryable};
use crate::tokens::TokenizerError;

pub const DEFAULT_LOCAL_MODEL: &str = "Xenova/bge-small-en-v1.5";
pub const DEFAULT_HOSTED_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Input window of the BERT-sized models fastembed runs locally.
pub const LOCAL_MODEL_MAX_TOKENS: usize = 512;
/// Input window of the hosted `text-embedding-3-*` models.
pub const HOSTED_MODEL_MAX_TOKENS: usize = 8191;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("failed to initialise embedding model '{model}': {message}")]
    ModelInit { model: String, message: String },
    #[error("embedding generation failed: {0}")]
    Generation(String),
    #[error("embedding request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("embedding service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error("embedding model lock was poisoned")]
    Poisoned,
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::Transport(error) => !error.is_builder() && !error.is_decode(),
            EmbeddingError::Status { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

/// Turns texts into vectors. Implementations must be deterministic and free of
/// side effects visible to the index.
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Embedding backend chosen once at configuration time.
#[derive(Debug, Clone)]
pub enum EmbeddingBackend {
    Local {
        model: String,
        cache_dir: Option<PathBuf>,
    },
    Hosted {
        model: String,
        base_url: String,
        api_key: String,
        retry: RetryPolicy,
    },
}

impl EmbeddingBackend {
    pub fn model_name(&self) -> &str {
        match self {
            EmbeddingBackend::Local { model, .. } | EmbeddingBackend::Hosted { model, .. } => model,
        }
    }

    /// Longest input, in tokens, the model embeds without truncating.
    pub fn max_input_tokens(&self) -> usize {
        match self {
            EmbeddingBackend::Local { .. } => LOCAL_MODEL_MAX_TOKENS,
            EmbeddingBackend::Hosted { .. } => HOSTED_MODEL_MAX_TOKENS,
        }
    }
}

pub fn create_embedder(backend: &EmbeddingBackend) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    match backend {
        EmbeddingBackend::Local { model, cache_dir } => {
            Ok(Arc::new(LocalEmbedder::new(model, cache_dir.clone())?))
        }
        EmbeddingBackend::Hosted {
            model,
            base_url,
            api_key,
            retry,
        } => Ok(Arc::new(HostedEmbedder::new(
            model,
            base_url,
            api_key,
            retry.clone(),
        ))),
    }
}

/// ONNX model executed in-process through fastembed.
pub struct LocalEmbedder {
    model_name: String,
    model: Mutex<TextEmbedding>,
}

impl LocalEmbedder {
    pub fn new(model_name: &str, cache_dir: Option<PathBuf>) -> Result<Self, EmbeddingError> {
        let name = model_name.trim();
        let options = if name.is_empty() || name.eq_ignore_ascii_case(DEFAULT_LOCAL_MODEL) {
            TextInitOptions::default()
        } else {
            let parsed = EmbeddingModel::from_str(name).map_err(|error| EmbeddingError::ModelInit {
                model: name.to_string(),
                message: format!("unknown embedding model: {error}"),
            })?;
            TextInitOptions::new(parsed)
        }
        .with_show_download_progress(false);

        let options = match cache_dir {
            Some(directory) => options.with_cache_dir(directory),
            None => options,
        };

        let model = TextEmbedding::try_new(options).map_err(|error| EmbeddingError::ModelInit {
            model: name.to_string(),
            message: error.to_string(),
        })?;
        info!(model = name, "Loaded local embedding model");

        Ok(Self {
            model_name: if name.is_empty() {
                DEFAULT_LOCAL_MODEL.to_string()
            } else {
                name.to_string()
            },
            model: Mutex::new(model),
        })
    }
}

impl fmt::Debug for LocalEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEmbedder")
            .field("model_name", &self.model_name)
            .finish()
    }
}

impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut model = self.model.lock().map_err(|_| EmbeddingError::Poisoned)?;
        model
            .embed(texts.to_vec(), None)
            .map_err(|error| EmbeddingError::Generation(error.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` endpoint, called from blocking threads.
pub struct HostedEmbedder {
    model_name: String,
    endpoint: String,
    api_key: String,
    retry: RetryPolicy,
    client: OnceCell<reqwest::blocking::Client>,
}

impl HostedEmbedder {
    pub fn new(model_name: &str, base_url: &str, api_key: &str, retry: RetryPolicy) -> Self {
        Self {
            model_name: model_name.to_string(),
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            retry,
            client: OnceCell::new(),
        }
    }

    // The blocking client owns a runtime, so it is built on first use from a
    // blocking thread rather than at construction.
    fn client(&self) -> Result<&reqwest::blocking::Client, EmbeddingError> {
        self.client
            .get_or_try_init(|| reqwest::blocking::Client::builder().build())
            .map_err(EmbeddingError::from)
    }

    fn request_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let response = self
            .client()?
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model_name,
                input: texts,
            })
            .send()?;

        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_embedding_response(&body, texts.len())
    }
}

impl fmt::Debug for HostedEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedEmbedder")
            .field("model_name", &self.model_name)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Embedder for HostedEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = texts.len(), model = %self.model_name, "Requesting hosted embeddings");
        self.retry
            .execute_blocking(|_attempt| self.request_once(texts))
    }
}

fn parse_embedding_response(body: &str, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut parsed: EmbeddingResponse = serde_json::from_str(body)
        .map_err(|error| EmbeddingError::MalformedResponse(error.to_string()))?;
    if parsed.data.len() != expected {
        return Err(EmbeddingError::MalformedResponse(format!(
            "expected {expected} vectors, received {}",
            parsed.data.len()
        )));
    }
    parsed.data.sort_by_key(|datum| datum.index);
    Ok(parsed.data.into_iter().map(|datum| datum.embedding).collect())
}
