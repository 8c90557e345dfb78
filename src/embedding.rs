//! Embedding providers for the hybrid retrieval path.
//!
//! - `disabled`: no vectors are computed; retrieval is keyword-only.
//! - `openai`: `POST {base}/embeddings` with batching, retry, and backoff.
//! - `ollama`: `POST {url}/api/embed`.
//! - `local`: fastembed, in-process. Model load is expensive, so each
//!   worker owns a [`ModelCache`] that builds the embedder once and reuses
//!   it for every job that worker runs.
//!
//! Retry policy for the HTTP providers: 429 and 5xx are retried with
//! backoff of 1s, 2s, 4s, ... capped at 32s; other 4xx fail immediately.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::EmbeddingConfig;
use crate::error::{KbError, Result};

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query string.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| KbError::upstream("empty embedding response"))
}

/// Build the embedder named by `config.provider`; `None` when disabled.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    if !config.is_enabled() {
        return Ok(None);
    }
    match config.provider.as_str() {
        "openai" => Ok(Some(Arc::new(HttpEmbedder::openai(config)?))),
        "ollama" => Ok(Some(Arc::new(HttpEmbedder::ollama(config)?))),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Some(Arc::new(LocalEmbedder::new(config)?))),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(KbError::validation(
            "local embedding provider requires --features local-embeddings-fastembed",
        )),
        other => Err(KbError::validation(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Worker-owned cache ============

/// Lazily-built embedder shared by every job one worker executes.
///
/// Owned by the worker and handed to job functions by reference; there is
/// no process-global model state.
pub struct ModelCache {
    config: EmbeddingConfig,
    embedder: OnceCell<Option<Arc<dyn Embedder>>>,
}

impl ModelCache {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            config,
            embedder: OnceCell::new(),
        }
    }

    /// Cache pre-seeded with a specific embedder.
    pub fn with_embedder(config: EmbeddingConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            embedder: OnceCell::new_with(Some(Some(embedder))),
        }
    }

    /// Build on first use. Local models load on a blocking thread.
    pub async fn get(&self) -> Result<Option<Arc<dyn Embedder>>> {
        self.embedder
            .get_or_try_init(|| async {
                let config = self.config.clone();
                tokio::task::spawn_blocking(move || create_embedder(&config))
                    .await
                    .map_err(|e| KbError::internal(e.to_string()))?
            })
            .await
            .cloned()
    }
}

// ============ HTTP providers ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpFlavor {
    OpenAi,
    Ollama,
}

pub struct HttpEmbedder {
    flavor: HttpFlavor,
    model: String,
    dims: usize,
    url: String,
    api_key: Option<String>,
    max_retries: u32,
    batch_size: usize,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn openai(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| KbError::validation("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Self::build(HttpFlavor::OpenAi, config, url, Some(api_key))
    }

    pub fn ollama(config: &EmbeddingConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Self::build(HttpFlavor::Ollama, config, url, None)
    }

    fn build(
        flavor: HttpFlavor,
        config: &EmbeddingConfig,
        url: String,
        api_key: Option<String>,
    ) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| KbError::validation("embedding.model is required"))?;
        let dims = config
            .dims
            .ok_or_else(|| KbError::validation("embedding.dims is required"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KbError::internal(e.to_string()))?;
        Ok(Self {
            flavor,
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            batch_size: config.batch_size.max(1),
            client,
        })
    }

    fn endpoint(&self) -> String {
        match self.flavor {
            HttpFlavor::OpenAi => format!("{}/embeddings", self.url),
            HttpFlavor::Ollama => format!("{}/api/embed", self.url),
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_with_retry(
            &self.client,
            &self.endpoint(),
            self.api_key.as_deref(),
            &body,
            self.max_retries,
        )
        .await?;
        match self.flavor {
            HttpFlavor::OpenAi => parse_openai_response(&json),
            HttpFlavor::Ollama => parse_ollama_response(&json),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }
}

/// POST JSON with exponential backoff on 429/5xx and network errors.
pub(crate) async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(key) = bearer {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| KbError::upstream(format!("invalid response from {}: {}", url, e)));
                }
                let body_text = response.text().await.unwrap_or_default();
                let err = KbError::upstream(format!("{} returned {}: {}", url, status, body_text));
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(KbError::upstream(format!("request to {} failed: {}", url, e)));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| KbError::upstream(format!("{} failed after retries", url))))
}

fn parse_vectors(items: &[serde_json::Value]) -> Result<Vec<Vec<f32>>> {
    items
        .iter()
        .map(|item| {
            item.as_array()
                .map(|arr| {
                    arr.iter()
                        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                        .collect::<Vec<f32>>()
                })
                .ok_or_else(|| KbError::upstream("embedding is not an array"))
        })
        .collect()
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| KbError::upstream("invalid OpenAI response: missing data array"))?;
    let embeddings: Vec<serde_json::Value> = data
        .iter()
        .map(|item| item.get("embedding").cloned().unwrap_or_default())
        .collect();
    parse_vectors(&embeddings)
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| KbError::upstream("invalid Ollama response: missing embeddings array"))?;
    parse_vectors(embeddings)
}

// ============ Local provider ============

#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    /// Loads (and on first run downloads) the model. Blocking; called once
    /// per worker through [`ModelCache`].
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (variant, default_dims) = fastembed_model(&model_name)?;
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(variant).with_show_download_progress(false),
        )
        .map_err(|e| KbError::upstream(format!("failed to load local model: {}", e)))?;
        tracing::info!(model = %model_name, "local embedding model loaded");
        Ok(Self {
            model_name,
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size.max(1),
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel as M;
    match name {
        "all-minilm-l6-v2" => Ok((M::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Ok((M::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((M::BGEBaseENV15, 768)),
        "bge-large-en-v1.5" => Ok((M::BGELargeENV15, 1024)),
        "nomic-embed-text-v1.5" => Ok((M::NomicEmbedTextV15, 768)),
        "multilingual-e5-small" => Ok((M::MultilingualE5Small, 384)),
        "multilingual-e5-base" => Ok((M::MultilingualE5Base, 768)),
        other => Err(KbError::validation(format!(
            "unknown local embedding model: '{}'",
            other
        ))),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let batch_size = self.batch_size;
        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| KbError::internal("local embedding model lock poisoned"))?;
            guard
                .embed(texts, Some(batch_size))
                .map_err(|e| KbError::upstream(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| KbError::internal(e.to_string()))?
    }
}

// ============ Vector math ============

/// Cosine similarity in `[-1, 1]`; 0.0 for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_parse_openai_response() {
        let json = serde_json::json!({
            "data": [{"embedding": [0.5, 1.0]}, {"embedding": [0.0, -1.0]}]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![0.5, 1.0], vec![0.0, -1.0]]);
    }

    #[test]
    fn test_parse_ollama_response_missing_field() {
        let json = serde_json::json!({ "model": "x" });
        assert!(matches!(
            parse_ollama_response(&json),
            Err(KbError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_cache_yields_none() {
        let cache = ModelCache::new(EmbeddingConfig::default());
        assert!(cache.get().await.unwrap().is_none());
    }
}
