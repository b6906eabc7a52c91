use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use dirs::home_dir;
use serde::Serialize;
use tracing::{info, warn};

const FASTEMBED_CACHE_ENV: &str = "FASTEMBED_CACHE_DIR";
const GENLOC_CACHE_ENV: &str = "GENLOC_MODEL_CACHE_DIR";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Warn,
    Error,
}

/// Where the resolved model cache directory came from.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum ModelCacheSource {
    #[serde(rename = "FASTEMBED_CACHE_DIR")]
    FastembedCacheDir,
    #[serde(rename = "GENLOC_MODEL_CACHE_DIR")]
    GenlocModelCacheDir,
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "tmp")]
    Tmp,
}

impl ModelCacheSource {
    fn as_str(&self) -> &'static str {
        match self {
            ModelCacheSource::FastembedCacheDir => FASTEMBED_CACHE_ENV,
            ModelCacheSource::GenlocModelCacheDir => GENLOC_CACHE_ENV,
            ModelCacheSource::Default => "default",
            ModelCacheSource::Tmp => "tmp",
        }
    }
}

/// Problem found while preparing a candidate cache directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDiagnostic {
    pub level: DiagnosticLevel,
    pub code: String,
    pub message: String,
    pub source: ModelCacheSource,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCacheInfo {
    pub directory: Option<PathBuf>,
    pub source: Option<ModelCacheSource>,
    pub diagnostics: Vec<EnvironmentDiagnostic>,
}

impl ModelCacheInfo {
    /// Emits every diagnostic through `tracing`.
    pub fn log(&self) {
        for diagnostic in &self.diagnostics {
            match diagnostic.level {
                DiagnosticLevel::Warn => warn!(
                    code = %diagnostic.code,
                    path = %diagnostic.path,
                    source = diagnostic.source.as_str(),
                    "{}",
                    diagnostic.message
                ),
                DiagnosticLevel::Error => warn!(
                    code = %diagnostic.code,
                    path = %diagnostic.path,
                    source = diagnostic.source.as_str(),
                    error = diagnostic.error.as_deref().unwrap_or(""),
                    "{}",
                    diagnostic.message
                ),
            }
        }
        match (&self.directory, self.source) {
            (Some(directory), Some(source)) => info!(
                directory = %directory.display(),
                source = source.as_str(),
                "Using embedding model cache directory"
            ),
            _ => warn!("No writable embedding model cache directory; using the fastembed default"),
        }
    }
}

struct DirectoryCandidate {
    path: PathBuf,
    source: ModelCacheSource,
}

/// Resolves a writable directory for downloaded embedding models. Candidates
/// are tried in order: `FASTEMBED_CACHE_DIR`, `GENLOC_MODEL_CACHE_DIR`,
/// `~/.genloc/models`, then a directory under the system temp dir.
pub fn collect_model_cache_info() -> ModelCacheInfo {
    let candidates = candidates_from(
        std::env::var(FASTEMBED_CACHE_ENV).ok(),
        std::env::var(GENLOC_CACHE_ENV).ok(),
        home_dir(),
        std::env::temp_dir(),
    );
    resolve_candidates(candidates)
}

fn candidates_from(
    fastembed_dir: Option<String>,
    genloc_dir: Option<String>,
    home: Option<PathBuf>,
    tmp: PathBuf,
) -> Vec<DirectoryCandidate> {
    let mut candidates = Vec::new();

    if let Some(path) = fastembed_dir.and_then(normalize_non_empty) {
        candidates.push(DirectoryCandidate {
            path: to_absolute_path(&path),
            source: ModelCacheSource::FastembedCacheDir,
        });
    }

    if let Some(path) = genloc_dir.and_then(normalize_non_empty) {
        candidates.push(DirectoryCandidate {
            path: to_absolute_path(&path),
            source: ModelCacheSource::GenlocModelCacheDir,
        });
    }

    if let Some(home) = home {
        candidates.push(DirectoryCandidate {
            path: home.join(".genloc").join("models"),
            source: ModelCacheSource::Default,
        });
    }

    candidates.push(DirectoryCandidate {
        path: tmp.join("genloc").join("models"),
        source: ModelCacheSource::Tmp,
    });

    candidates
}

fn resolve_candidates(candidates: Vec<DirectoryCandidate>) -> ModelCacheInfo {
    let mut diagnostics = Vec::new();
    let mut recorded_failures = HashSet::new();

    for candidate in candidates {
        if prepare_directory(&candidate, &mut diagnostics, &mut recorded_failures) {
            return ModelCacheInfo {
                directory: Some(candidate.path),
                source: Some(candidate.source),
                diagnostics,
            };
        }
    }

    ModelCacheInfo {
        directory: None,
        source: None,
        diagnostics,
    }
}

fn normalize_non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn to_absolute_path(candidate: &str) -> PathBuf {
    let path = PathBuf::from(candidate);
    if path.is_absolute() {
        path
    } else if let Ok(cwd) = std::env::current_dir() {
        cwd.join(path)
    } else {
        path
    }
}

fn prepare_directory(
    candidate: &DirectoryCandidate,
    diagnostics: &mut Vec<EnvironmentDiagnostic>,
    recorded_failures: &mut HashSet<(String, PathBuf)>,
) -> bool {
    if let Ok(metadata) = fs::metadata(&candidate.path) {
        if !metadata.is_dir() {
            record_diagnostic(
                diagnostics,
                recorded_failures,
                candidate,
                "model_cache_not_directory",
                format!(
                    "Model cache path {} exists but is not a directory.",
                    candidate.path.display()
                ),
                None,
            );
            return false;
        }
    }

    if let Err(err) = fs::create_dir_all(&candidate.path) {
        record_diagnostic(
            diagnostics,
            recorded_failures,
            candidate,
            "model_cache_creation_failed",
            format!(
                "Unable to create model cache directory {}.",
                candidate.path.display()
            ),
            Some(&err),
        );
        return false;
    }

    if let Err(err) = check_writable(&candidate.path) {
        record_diagnostic(
            diagnostics,
            recorded_failures,
            candidate,
            "model_cache_unwritable",
            format!(
                "Model cache directory {} is not writable.",
                candidate.path.display()
            ),
            Some(&err),
        );
        return false;
    }

    true
}

fn check_writable(path: &Path) -> Result<(), io::Error> {
    let marker_path = path.join(".genloc-write-test");
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&marker_path)?;
    let _ = fs::remove_file(marker_path);
    Ok(())
}

fn record_diagnostic(
    diagnostics: &mut Vec<EnvironmentDiagnostic>,
    recorded_failures: &mut HashSet<(String, PathBuf)>,
    candidate: &DirectoryCandidate,
    code: &str,
    message: String,
    error: Option<&io::Error>,
) {
    if !recorded_failures.insert((code.to_string(), candidate.path.clone())) {
        return;
    }

    diagnostics.push(EnvironmentDiagnostic {
        level: DiagnosticLevel::Error,
        code: code.to_string(),
        message,
        source: candidate.source,
        path: candidate.path.display().to_string(),
        error: error.map(|err| format!("{err} ({:?})", err.kind())),
    });
}
