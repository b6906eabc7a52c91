use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tiktoken_rs::CoreBPE;
use tokenizers::Tokenizer;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::embedding::EmbeddingBackend;

const APPROX_CHARS_PER_TOKEN: usize = 4;
const FASTEMBED_DEFAULT_CACHE_DIR: &str = ".fastembed_cache";

/// Length function shared by the chunker and the bug-report segmenter. It must
/// agree with the tokenizer of the embedding model in use.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

#[derive(Debug, Error)]
#[error("failed to load tokenizer: {0}")]
pub struct TokenizerError(String);

/// Exact token counts for hosted embedding models (`cl100k_base`).
pub struct Cl100kCounter {
    bpe: CoreBPE,
}

impl Cl100kCounter {
    pub fn new() -> Result<Self, TokenizerError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|error| TokenizerError(error.to_string()))?;
        Ok(Self { bpe })
    }
}

impl fmt::Debug for Cl100kCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cl100kCounter")
    }
}

impl TokenCounter for Cl100kCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

/// Counts with the `tokenizer.json` that ships with a local model.
pub struct ModelTokenCounter {
    tokenizer: Tokenizer,
}

impl ModelTokenCounter {
    pub fn from_file(path: &Path) -> Result<Self, TokenizerError> {
        let mut tokenizer =
            Tokenizer::from_file(path).map_err(|error| TokenizerError(error.to_string()))?;
        // Counts must see the whole text, not the model's truncated window.
        tokenizer
            .with_truncation(None)
            .map_err(|error| TokenizerError(error.to_string()))?;
        tokenizer.with_padding(None);
        Ok(Self { tokenizer })
    }

    /// Looks the model up in a Hugging Face hub cache
    /// (`models--<org>--<name>/snapshots/<rev>/tokenizer.json`).
    pub fn from_model_cache(cache_dir: &Path, model: &str) -> Result<Self, TokenizerError> {
        let path = find_cached_tokenizer(cache_dir, model).ok_or_else(|| {
            TokenizerError(format!(
                "no tokenizer.json for {model} under {}",
                cache_dir.display()
            ))
        })?;
        debug!(path = %path.display(), "Loading model tokenizer");
        Self::from_file(&path)
    }
}

impl fmt::Debug for ModelTokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ModelTokenCounter")
    }
}

impl TokenCounter for ModelTokenCounter {
    fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.len(),
            Err(error) => {
                warn!(%error, "Tokenizer failed; approximating");
                ApproxCounter.count(text)
            }
        }
    }
}

fn find_cached_tokenizer(cache_dir: &Path, model: &str) -> Option<PathBuf> {
    let model_dir = cache_dir.join(format!("models--{}", model.trim().replace('/', "--")));
    WalkDir::new(model_dir)
        .max_depth(3)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name() == "tokenizer.json")
        .map(|entry| entry.into_path())
}

/// Four characters per token, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxCounter;

impl TokenCounter for ApproxCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(APPROX_CHARS_PER_TOKEN)
    }
}

/// Counter matching the tokenizer of the selected embedding backend. Local
/// models are counted with their own tokenizer, so call this after the model
/// has been downloaded; without one the four-characters rule is used.
pub fn token_counter_for(
    backend: &EmbeddingBackend,
) -> Result<Arc<dyn TokenCounter>, TokenizerError> {
    match backend {
        EmbeddingBackend::Hosted { .. } => Ok(Arc::new(Cl100kCounter::new()?)),
        EmbeddingBackend::Local { model, cache_dir } => {
            let cache_dir = cache_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(FASTEMBED_DEFAULT_CACHE_DIR));
            match ModelTokenCounter::from_model_cache(&cache_dir, model) {
                Ok(counter) => Ok(Arc::new(counter)),
                Err(error) => {
                    warn!(%error, "Model tokenizer unavailable; approximating token counts");
                    Ok(Arc::new(ApproxCounter))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_counter_rounds_up() {
        let counter = ApproxCounter;
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("abc"), 1);
        assert_eq!(counter.count("abcd"), 1);
        assert_eq!(counter.count("abcde"), 2);
        assert_eq!(counter.count("ééééé"), 2);
    }

    const WORD_LEVEL_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": {"direction": "Right", "max_length": 2, "strategy": "LongestFirst", "stride": 0},
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": {"[UNK]": 0, "def": 1, "save": 2}, "unk_token": "[UNK]"}
    }"#;

    #[test]
    fn local_backend_counts_with_the_cached_model_tokenizer() {
        let cache = tempfile::tempdir().unwrap();
        let snapshot = cache
            .path()
            .join("models--Xenova--bge-small-en-v1.5/snapshots/0123abcd");
        std::fs::create_dir_all(&snapshot).unwrap();
        std::fs::write(snapshot.join("tokenizer.json"), WORD_LEVEL_TOKENIZER).unwrap();

        let backend = EmbeddingBackend::Local {
            model: "Xenova/bge-small-en-v1.5".into(),
            cache_dir: Some(cache.path().to_path_buf()),
        };
        let counter = token_counter_for(&backend).unwrap();
        // def | save | ( | self | ): with the file's truncation switched off.
        assert_eq!(counter.count("def save(self):"), 5);
    }

    #[test]
    fn local_backend_without_a_tokenizer_approximates() {
        let cache = tempfile::tempdir().unwrap();
        let backend = EmbeddingBackend::Local {
            model: "Xenova/bge-small-en-v1.5".into(),
            cache_dir: Some(cache.path().to_path_buf()),
        };
        let counter = token_counter_for(&backend).unwrap();
        assert_eq!(counter.count("abcdefgh"), 2);
    }
}
