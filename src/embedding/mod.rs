//! Semantic text embeddings backed by fastembed ONNX models.
//!
//! The model artifact is downloaded once, cached under the configured
//! directory and verified before use. Loading is single-flight: the first
//! caller performs the load while concurrent callers wait on the same
//! in-flight initialization instead of triggering duplicate downloads.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::domain::matching::MatchError;
use crate::models::config::ModelConfig;

/// Seam between the orchestrator/backfill and the concrete model runtime.
pub trait Embedder: Send + Sync {
    /// Embed one text into a unit-length vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError>;

    /// Embed a batch, preserving input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MatchError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimension(&self) -> usize;

    fn is_loaded(&self) -> bool {
        true
    }

    /// Perform the one-time model load eagerly, honoring cancellation
    /// between retry attempts.
    fn preload(&self, _cancel: &CancellationToken) -> Result<(), MatchError> {
        Ok(())
    }
}

/// Name and dimensionality of the configured model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub dimension: usize,
}

/// Resolve a configured model name to a fastembed model and its fixed
/// output dimensionality.
pub fn resolve_model(name: &str) -> Option<(EmbeddingModel, usize)> {
    match name.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" => Some((EmbeddingModel::AllMiniLML6V2, 384)),
        "multilingual-e5-large" => Some((EmbeddingModel::MultilingualE5Large, 1024)),
        _ => None,
    }
}

/// Owned handle on a lazily loaded embedding model.
///
/// Replaces a process-wide singleton: callers share one engine instance and
/// the mutex both serializes inference (the runtime needs `&mut`) and makes
/// initialization single-flight.
pub struct EmbeddingEngine {
    model: EmbeddingModel,
    info: ModelInfo,
    config: ModelConfig,
    inner: Mutex<Option<TextEmbedding>>,
}

impl EmbeddingEngine {
    pub fn new(config: ModelConfig) -> Result<Self, MatchError> {
        let (model, dimension) = resolve_model(&config.name).ok_or_else(|| {
            MatchError::ModelUnavailable(format!("unknown embedding model: {}", config.name))
        })?;
        Ok(EmbeddingEngine {
            model,
            info: ModelInfo {
                name: config.name.clone(),
                dimension,
            },
            config,
            inner: Mutex::new(None),
        })
    }

    pub fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    /// Load the model with bounded, backoff-governed retries.
    fn load(&self, cancel: Option<&CancellationToken>) -> Result<TextEmbedding, MatchError> {
        let attempts = self.config.download_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(MatchError::ModelUnavailable(
                        "model load cancelled".to_string(),
                    ));
                }
            }
            let options = InitOptions::new(self.model.clone())
                .with_cache_dir(self.config.cache_dir.clone())
                .with_show_download_progress(false);
            match TextEmbedding::try_new(options) {
                Ok(embedder) => {
                    if let Some(expected) = self.config.checksum.as_deref() {
                        verify_cache_checksum(&self.config.cache_dir, expected)?;
                    }
                    return Ok(embedder);
                }
                Err(error) => {
                    last_error = format!("{error:?}");
                    log::warn!(
                        "Failed to load embedding model {} (attempt {attempt}/{attempts}): {last_error}",
                        self.info.name
                    );
                    if attempt < attempts {
                        std::thread::sleep(Duration::from_secs(u64::from(attempt)));
                    }
                }
            }
        }

        Err(MatchError::ModelUnavailable(format!(
            "failed to load model {} after {attempts} attempts: {last_error}",
            self.info.name
        )))
    }

    fn with_model<T>(
        &self,
        cancel: Option<&CancellationToken>,
        f: impl FnOnce(&mut TextEmbedding) -> Result<T, MatchError>,
    ) -> Result<T, MatchError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| MatchError::ModelUnavailable("embedder mutex poisoned".to_string()))?;
        if guard.is_none() {
            *guard = Some(self.load(cancel)?);
            log::info!(
                "Loaded embedding model {} ({} dimensions)",
                self.info.name,
                self.info.dimension
            );
        }
        f(guard.as_mut().expect("model loaded above"))
    }
}

impl Embedder for EmbeddingEngine {
    fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError> {
        let texts = [text.to_string()];
        let embeddings = self.embed_batch(&texts)?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| MatchError::ModelUnavailable("model returned no embedding".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MatchError> {
        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                return Err(MatchError::InvalidInput(format!(
                    "cannot embed empty or whitespace-only text (entry {i})"
                )));
            }
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let raw = self.with_model(None, |embedder| {
            embedder
                .embed(texts.to_vec(), None)
                .map_err(|error| {
                    MatchError::ModelUnavailable(format!("failed to generate embeddings: {error:?}"))
                })
        })?;

        Ok(raw.iter().map(|v| normalize_embedding(v)).collect())
    }

    fn dimension(&self) -> usize {
        self.info.dimension
    }

    fn is_loaded(&self) -> bool {
        self.inner.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn preload(&self, cancel: &CancellationToken) -> Result<(), MatchError> {
        self.with_model(Some(cancel), |_| Ok(()))
    }
}

/// Normalize a vector to unit length.
///
/// Returns the original vector when the norm is zero.
pub fn normalize_embedding(vec: &[f32]) -> Vec<f32> {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        vec.to_vec()
    } else {
        vec.iter().map(|x| x / norm).collect()
    }
}

/// Cosine similarity of two vectors of equal length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Verify that some ONNX artifact in the cache matches the expected sha256.
///
/// The cache layout below the model directory is owned by fastembed, so the
/// check walks the tree rather than assuming a path.
fn verify_cache_checksum(cache_dir: &Path, expected: &str) -> Result<(), MatchError> {
    let mut onnx_files = Vec::new();
    collect_onnx_files(cache_dir, &mut onnx_files)
        .map_err(|e| MatchError::ModelUnavailable(format!("cannot read model cache: {e}")))?;
    if onnx_files.is_empty() {
        return Err(MatchError::ModelUnavailable(
            "no model artifact found in cache for integrity check".to_string(),
        ));
    }

    let expected = expected.to_ascii_lowercase();
    for path in &onnx_files {
        let bytes = std::fs::read(path)
            .map_err(|e| MatchError::ModelUnavailable(format!("cannot read model artifact: {e}")))?;
        let digest = hex::encode(Sha256::digest(&bytes));
        if digest == expected {
            return Ok(());
        }
    }

    Err(MatchError::ModelUnavailable(format!(
        "model artifact checksum mismatch (expected {expected})"
    )))
}

fn collect_onnx_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_onnx_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "onnx") {
            out.push(path);
        }
    }
    Ok(())
}
