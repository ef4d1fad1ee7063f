//! Embedding providers.
//!
//! - `EmbeddingProvider`: the capability the cache consumes
//! - `EmbeddingModel`: local fastembed model, inference on the blocking pool
//! - `ModelLoader`: one-time lazy loading shared by concurrent callers

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fastembed::{InitOptions, TextEmbedding};
use tokio::sync::OnceCell;

use super::Vector;

/// Error type for embedding operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model returned {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Produces fixed-dimension, L2-normalised vectors from text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model name, used for logging and storage identification.
    fn name(&self) -> &str;

    /// Dimensionality of every vector this provider returns.
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vector, EmbeddingError>;
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct EmbeddingModel {
    model: Arc<Mutex<TextEmbedding>>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Create a new embedding model with the given name.
    ///
    /// The model will be downloaded on first use if not cached.
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    /// Blocking; call from a blocking context.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        log::info!("Loading embedding model '{}'", model_name);

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut model)?;

        log::info!(
            "Embedding model '{}' ready ({} dimensions)",
            model_name,
            dimensions
        );

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l6-v2-q" | "allminiml6v2q" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q)
            }
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
                Ok(fastembed::EmbeddingModel::BGESmallENV15Q)
            }
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5 (add -q suffix for quantized MiniLM/bge-small)",
                name
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model.embed(vec!["test"], None).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e))
        })?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vector, EmbeddingError> {
        let model = Arc::clone(&self.model);
        let input = text.to_string();

        tokio::task::spawn_blocking(move || {
            let mut model = model.lock().map_err(|e| {
                EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
            })?;

            let embeddings = model
                .embed(vec![input], None)
                .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
        })
        .await
        .map_err(|e| EmbeddingError::EmbeddingFailed(format!("Embedding task failed: {}", e)))?
    }
}

/// Builds a provider. Runs on the blocking pool.
pub type ProviderFactory =
    dyn Fn() -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> + Send + Sync;

/// Lazily loads the embedding provider exactly once.
///
/// Concurrent callers wait on the same load. A failed load leaves the loader
/// empty, so the next call tries again.
pub struct ModelLoader {
    factory: Arc<ProviderFactory>,
    provider: OnceCell<Arc<dyn EmbeddingProvider>>,
    loading: AtomicBool,
    timeout: Option<Duration>,
}

/// Clears the loading flag when the load settles or its caller goes away.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ModelLoader {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            provider: OnceCell::new(),
            loading: AtomicBool::new(false),
            timeout: None,
        }
    }

    /// Fail a load that takes longer than `timeout`.
    ///
    /// The factory keeps running on the blocking pool; only the wait is cut
    /// short, and the next call starts a fresh load.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Loader for a local fastembed model stored under `base_path/models`.
    pub fn fastembed(model_name: String, base_path: PathBuf, download_timeout: Duration) -> Self {
        Self::new(move || {
            let model = EmbeddingModel::new(&model_name, base_path.clone())?;
            Ok(Arc::new(model) as Arc<dyn EmbeddingProvider>)
        })
        .with_timeout(download_timeout)
    }

    /// Loader wrapping an already constructed provider.
    pub fn ready(provider: Arc<dyn EmbeddingProvider>) -> Self {
        let loader = Self::new({
            let provider = provider.clone();
            move || Ok(provider.clone())
        });
        // a fresh cell cannot already be set
        let _ = loader.provider.set(provider);
        loader
    }

    pub fn is_loaded(&self) -> bool {
        self.provider.initialized()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// The loaded provider, if any, without triggering a load.
    pub fn loaded(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        self.provider.get().cloned()
    }

    /// Get the provider, loading it first if needed.
    pub async fn get(&self) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
        if let Some(provider) = self.provider.get() {
            return Ok(provider.clone());
        }

        self.provider
            .get_or_try_init(|| async {
                self.loading.store(true, Ordering::SeqCst);
                let _loading = LoadingGuard(&self.loading);

                let factory = Arc::clone(&self.factory);
                let load = tokio::task::spawn_blocking(move || (*factory)());

                let joined = match self.timeout {
                    Some(timeout) => tokio::time::timeout(timeout, load).await.map_err(|_| {
                        EmbeddingError::InitFailed(format!(
                            "Model load timed out after {}s",
                            timeout.as_secs()
                        ))
                    }),
                    None => Ok(load.await),
                };

                let result = joined.and_then(|loaded| {
                    loaded
                        .map_err(|e| EmbeddingError::InitFailed(format!("Model loader task failed: {}", e)))
                        .and_then(|provider| provider)
                });

                if let Err(e) = &result {
                    log::error!("Failed to load embedding model: {}", e);
                }
                result
            })
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::StubProvider;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = EmbeddingModel::new("nonexistent-model", temp_dir.path().to_path_buf());
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_model_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = EmbeddingModel::new("all-MiniLM-L6-v2", temp_dir.path().to_path_buf())
            .unwrap();

        assert_eq!(model.name(), "all-MiniLM-L6-v2");
        assert_eq!(model.dimensions(), 384);
    }

    #[tokio::test]
    #[ignore = "requires model download"]
    async fn test_embedding_is_normalized() {
        let temp_dir = tempfile::tempdir().unwrap();
        let loader = ModelLoader::fastembed(
            "all-MiniLM-L6-v2".to_string(),
            temp_dir.path().to_path_buf(),
            Duration::from_secs(300),
        );

        let provider = loader.get().await.unwrap();
        let embedding = provider.embed("Hello, world!").await.unwrap();
        assert_eq!(embedding.len(), 384);

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_loader_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loader = ModelLoader::new({
            let loads = loads.clone();
            move || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(StubProvider::new(4)) as Arc<dyn EmbeddingProvider>)
            }
        });

        assert!(!loader.is_loaded());
        assert!(loader.loaded().is_none());

        let (a, b) = tokio::join!(loader.get(), loader.get());
        assert!(a.is_ok() && b.is_ok());
        loader.get().await.unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(loader.is_loaded());
        assert!(!loader.is_loading());
    }

    #[tokio::test]
    async fn test_loader_retries_after_failure() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let loader = ModelLoader::new({
            let attempts = attempts.clone();
            move || {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(EmbeddingError::InitFailed("model unavailable".to_string()))
                } else {
                    Ok(Arc::new(StubProvider::new(4)) as Arc<dyn EmbeddingProvider>)
                }
            }
        });

        assert!(matches!(loader.get().await, Err(EmbeddingError::InitFailed(_))));
        assert!(!loader.is_loaded());
        assert!(!loader.is_loading());

        assert!(loader.get().await.is_ok());
        assert!(loader.is_loaded());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ready_loader() {
        let loader = ModelLoader::ready(Arc::new(StubProvider::new(8)));
        assert!(loader.is_loaded());
        assert_eq!(loader.get().await.unwrap().dimensions(), 8);
    }

    fn slow_loader(delay: Duration) -> ModelLoader {
        ModelLoader::new(move || {
            std::thread::sleep(delay);
            Ok(Arc::new(StubProvider::new(4)) as Arc<dyn EmbeddingProvider>)
        })
    }

    #[tokio::test]
    async fn test_cancelled_load_clears_loading_flag() {
        let loader = slow_loader(Duration::from_millis(300));

        let cancelled = tokio::time::timeout(Duration::from_millis(20), loader.get()).await;
        assert!(cancelled.is_err());

        assert!(!loader.is_loading());
        assert!(!loader.is_loaded());

        // a later call loads normally
        assert!(loader.get().await.is_ok());
        assert!(!loader.is_loading());
    }

    #[tokio::test]
    async fn test_load_timeout() {
        let loader = slow_loader(Duration::from_millis(300)).with_timeout(Duration::from_millis(20));

        let result = loader.get().await;

        assert!(matches!(result, Err(EmbeddingError::InitFailed(msg)) if msg.contains("timed out")));
        assert!(!loader.is_loaded());
        assert!(!loader.is_loading());
    }
}
