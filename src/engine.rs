//! Memory engine: the storage port between job functions and a project's
//! persisted index.
//!
//! Job functions only see [`MemoryEngine`] and [`IndexBuilder`]. The shipped
//! implementation, [`LocalMemoryEngine`], keeps every chunk of a project in
//! one JSON artifact (`memory_index.json`) inside the project's storage
//! area. Each indexing job loads the artifact, appends its chunks, and
//! rewrites the whole file atomically.
//!
//! # Retrieval
//!
//! Keyword scores are a TF-IDF sum over the query's terms. When the worker
//! has an embedder, chunks also carry vectors and the final score is
//!
//! ```text
//! hybrid = (1 - alpha) * keyword_norm + alpha * cosine_norm
//! ```
//!
//! with both channels min-max normalized to `[0, 1]` before merging.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::chunk::chunk_text;
use crate::embedding::{cosine_similarity, embed_query, Embedder, ModelCache};
use crate::error::{KbError, Result};
use crate::models::{ProjectConfig, SearchResult};
use crate::storage::{write_atomic, StorageLayout};

const ARTIFACT_VERSION: u32 = 1;

/// Accumulates chunks for one project and persists them in one step.
#[async_trait]
pub trait IndexBuilder: Send {
    /// Chunk `text` and stage the chunks. Returns the number staged.
    async fn add_text(
        &mut self,
        text: &str,
        metadata: Map<String, Value>,
        chunking: ProjectConfig,
    ) -> Result<usize>;

    /// Chunks staged so far by this builder.
    fn staged(&self) -> usize;

    /// Write the artifact. Returns its size in bytes.
    async fn persist(self: Box<Self>) -> Result<u64>;
}

#[async_trait]
pub trait MemoryEngine: Send + Sync {
    async fn builder(&self, project_id: &str) -> Result<Box<dyn IndexBuilder>>;

    /// Top `top_k` passages, best first. Fails with `NotIndexed` when the
    /// project has no artifact.
    async fn search(&self, project_id: &str, query: &str, top_k: usize)
        -> Result<Vec<SearchResult>>;

    /// Drop the project's artifact.
    async fn reset(&self, project_id: &str) -> Result<()>;
}

// ============ Artifact format ============

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredChunk {
    /// SHA-256 of `text`.
    id: String,
    text: String,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Artifact {
    version: u32,
    #[serde(default)]
    embedding_model: Option<String>,
    chunks: Vec<StoredChunk>,
}

impl Default for Artifact {
    fn default() -> Self {
        Self {
            version: ARTIFACT_VERSION,
            embedding_model: None,
            chunks: Vec::new(),
        }
    }
}

async fn load_artifact(storage: &StorageLayout, project_id: &str) -> Result<Option<Artifact>> {
    let path = storage.artifact_path(project_id);
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| KbError::storage(&path, format!("corrupt index artifact: {}", e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(KbError::storage(&path, e)),
    }
}

// ============ Local engine ============

pub struct LocalMemoryEngine {
    storage: StorageLayout,
    models: Arc<ModelCache>,
    hybrid_alpha: f64,
}

impl LocalMemoryEngine {
    pub fn new(storage: StorageLayout, models: Arc<ModelCache>, hybrid_alpha: f64) -> Self {
        Self {
            storage,
            models,
            hybrid_alpha,
        }
    }
}

#[async_trait]
impl MemoryEngine for LocalMemoryEngine {
    async fn builder(&self, project_id: &str) -> Result<Box<dyn IndexBuilder>> {
        let artifact = load_artifact(&self.storage, project_id)
            .await?
            .unwrap_or_default();
        let embedder = self.models.get().await?;
        Ok(Box::new(LocalIndexBuilder {
            storage: self.storage.clone(),
            project_id: project_id.to_string(),
            artifact,
            embedder,
            staged: 0,
        }))
    }

    async fn search(
        &self,
        project_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        let artifact = load_artifact(&self.storage, project_id)
            .await?
            .ok_or_else(|| KbError::NotIndexed(project_id.to_string()))?;

        let query_vec = match self.models.get().await? {
            Some(embedder) if artifact.chunks.iter().any(|c| c.vector.is_some()) => {
                Some(embed_query(embedder.as_ref(), query).await?)
            }
            _ => None,
        };

        Ok(rank_chunks(
            &artifact.chunks,
            query,
            query_vec.as_deref(),
            self.hybrid_alpha,
            top_k,
        ))
    }

    async fn reset(&self, project_id: &str) -> Result<()> {
        self.storage.remove_artifact(project_id)
    }
}

struct LocalIndexBuilder {
    storage: StorageLayout,
    project_id: String,
    artifact: Artifact,
    embedder: Option<Arc<dyn Embedder>>,
    staged: usize,
}

#[async_trait]
impl IndexBuilder for LocalIndexBuilder {
    async fn add_text(
        &mut self,
        text: &str,
        metadata: Map<String, Value>,
        chunking: ProjectConfig,
    ) -> Result<usize> {
        let chunks = chunk_text(text, chunking.chunk_size, chunking.chunk_overlap);
        if chunks.is_empty() {
            return Ok(0);
        }

        let vectors = match &self.embedder {
            Some(embedder) => {
                let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
                let vectors = embedder.embed(&texts).await?;
                if vectors.len() != texts.len() {
                    return Err(KbError::upstream(format!(
                        "embedder returned {} vectors for {} chunks",
                        vectors.len(),
                        texts.len()
                    )));
                }
                if let Some(v) = vectors.iter().find(|v| v.len() != embedder.dims()) {
                    return Err(KbError::upstream(format!(
                        "embedder {} returned a {}-dim vector, expected {}",
                        embedder.model_name(),
                        v.len(),
                        embedder.dims()
                    )));
                }
                self.artifact.embedding_model = Some(embedder.model_name().to_string());
                vectors.into_iter().map(Some).collect()
            }
            None => vec![None; chunks.len()],
        };

        let added = chunks.len();
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            let mut meta = metadata.clone();
            meta.insert("chunk_index".to_string(), Value::from(chunk.index));
            self.artifact.chunks.push(StoredChunk {
                id: chunk.hash,
                text: chunk.text,
                metadata: meta,
                vector,
            });
        }
        self.staged += added;
        Ok(added)
    }

    fn staged(&self) -> usize {
        self.staged
    }

    async fn persist(self: Box<Self>) -> Result<u64> {
        let path = self.storage.artifact_path(&self.project_id);
        let bytes = serde_json::to_vec(&self.artifact)?;
        let size = bytes.len() as u64;
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| KbError::internal(e.to_string()))??;
        Ok(size)
    }
}

// ============ Scoring ============

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// TF-IDF keyword score per chunk index; chunks with no term hits are absent.
fn keyword_scores(chunks: &[StoredChunk], query: &str) -> Vec<(usize, f64)> {
    let terms: HashSet<String> = tokenize(query).into_iter().collect();
    if terms.is_empty() {
        return Vec::new();
    }

    let tokenized: Vec<Vec<String>> = chunks.iter().map(|c| tokenize(&c.text)).collect();
    let n = chunks.len() as f64;

    let mut df: HashMap<&str, usize> = HashMap::new();
    for tokens in &tokenized {
        let unique: HashSet<&str> = tokens.iter().map(|t| t.as_str()).collect();
        for term in &terms {
            if unique.contains(term.as_str()) {
                *df.entry(term.as_str()).or_default() += 1;
            }
        }
    }

    tokenized
        .iter()
        .enumerate()
        .filter_map(|(i, tokens)| {
            let len = tokens.len().max(1) as f64;
            let score: f64 = terms
                .iter()
                .filter_map(|term| {
                    let tf = tokens.iter().filter(|t| *t == term).count();
                    if tf == 0 {
                        return None;
                    }
                    let idf = (1.0 + n / *df.get(term.as_str())? as f64).ln();
                    Some(tf as f64 / len.sqrt() * idf)
                })
                .sum();
            (score > 0.0).then_some((i, score))
        })
        .collect()
}

/// Min-max normalize to `[0, 1]`. A single candidate or a flat distribution
/// normalizes to 1.0.
pub fn normalize_scores(scores: &[(usize, f64)]) -> HashMap<usize, f64> {
    if scores.is_empty() {
        return HashMap::new();
    }

    let s_min = scores.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let s_max = scores
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    scores
        .iter()
        .map(|(i, s)| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            };
            (*i, norm)
        })
        .collect()
}

fn rank_chunks(
    chunks: &[StoredChunk],
    query: &str,
    query_vec: Option<&[f32]>,
    alpha: f64,
    top_k: usize,
) -> Vec<SearchResult> {
    let keyword = normalize_scores(&keyword_scores(chunks, query));

    let vector = match query_vec {
        Some(q) => {
            let sims: Vec<(usize, f64)> = chunks
                .iter()
                .enumerate()
                .filter_map(|(i, c)| {
                    c.vector
                        .as_deref()
                        .filter(|v| v.len() == q.len())
                        .map(|v| (i, cosine_similarity(q, v) as f64))
                })
                .collect();
            normalize_scores(&sims)
        }
        None => HashMap::new(),
    };

    let effective_alpha = if vector.is_empty() { 0.0 } else { alpha };

    let candidates: HashSet<usize> = keyword.keys().chain(vector.keys()).copied().collect();
    let mut scored: Vec<(usize, f64)> = candidates
        .into_iter()
        .map(|i| {
            let k = keyword.get(&i).copied().unwrap_or(0.0);
            let v = vector.get(&i).copied().unwrap_or(0.0);
            (i, (1.0 - effective_alpha) * k + effective_alpha * v)
        })
        .collect();

    // Ties keep insertion order so older chunks rank first
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    scored.truncate(top_k);

    scored
        .into_iter()
        .map(|(i, score)| SearchResult {
            text: chunks[i].text.clone(),
            score,
            metadata: chunks[i].metadata.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use tempfile::TempDir;

    fn stored(text: &str, vector: Option<Vec<f32>>) -> StoredChunk {
        StoredChunk {
            id: String::new(),
            text: text.to_string(),
            metadata: Map::new(),
            vector,
        }
    }

    fn engine(tmp: &TempDir) -> LocalMemoryEngine {
        let storage = StorageLayout::new(tmp.path());
        storage.create_area("p1").unwrap();
        LocalMemoryEngine::new(
            storage,
            Arc::new(ModelCache::new(EmbeddingConfig::default())),
            0.6,
        )
    }

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("cat") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    #[test]
    fn test_normalize_range() {
        let norm = normalize_scores(&[(0, 1.0), (1, 3.0), (2, 5.0)]);
        assert_eq!(norm[&0], 0.0);
        assert_eq!(norm[&1], 0.5);
        assert_eq!(norm[&2], 1.0);
    }

    #[test]
    fn test_normalize_flat_and_empty() {
        assert!(normalize_scores(&[]).is_empty());
        let norm = normalize_scores(&[(0, 2.0), (1, 2.0)]);
        assert_eq!(norm[&0], 1.0);
        assert_eq!(norm[&1], 1.0);
    }

    #[test]
    fn test_keyword_ranking() {
        let chunks = vec![
            stored("the weather is mild", None),
            stored("rust borrow checker rules", None),
            stored("the borrow checker enforces rust ownership in rust code", None),
        ];
        let results = rank_chunks(&chunks, "rust ownership", None, 0.6, 5);
        assert_eq!(results.len(), 2);
        assert!(results[0].text.contains("ownership"));
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[test]
    fn test_top_k_truncates() {
        let chunks: Vec<StoredChunk> = (0..10)
            .map(|i| stored(&format!("alpha number {}", i), None))
            .collect();
        assert_eq!(rank_chunks(&chunks, "alpha", None, 0.6, 3).len(), 3);
    }

    #[test]
    fn test_alpha_one_follows_vectors() {
        let chunks = vec![
            stored("dog dog dog", Some(vec![0.0, 1.0])),
            stored("dog and a cat", Some(vec![1.0, 0.0])),
        ];
        let results = rank_chunks(&chunks, "dog", Some(&[1.0, 0.0]), 1.0, 2);
        assert_eq!(results[0].text, "dog and a cat");
    }

    #[tokio::test]
    async fn test_build_persist_search() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);

        let mut builder = engine.builder("p1").await.unwrap();
        let mut meta = Map::new();
        meta.insert("source".into(), Value::from("notes.txt"));
        let added = builder
            .add_text(
                "Paris is the capital of France.",
                meta,
                ProjectConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(builder.staged(), 1);
        let size = builder.persist().await.unwrap();
        assert_eq!(size, engine.storage.artifact_size("p1"));

        // A second job appends to the same artifact
        let mut builder = engine.builder("p1").await.unwrap();
        builder
            .add_text("Berlin is in Germany.", Map::new(), ProjectConfig::default())
            .await
            .unwrap();
        builder.persist().await.unwrap();

        let results = engine.search("p1", "capital of France", 5).await.unwrap();
        assert_eq!(results[0].text, "Paris is the capital of France.");
        assert_eq!(results[0].metadata["source"], "notes.txt");
        assert_eq!(results[0].metadata["chunk_index"], 0);

        let results = engine.search("p1", "Germany", 5).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_search_without_artifact_is_not_indexed() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let err = engine.search("p1", "anything", 3).await.unwrap_err();
        assert!(matches!(err, KbError::NotIndexed(_)));
    }

    #[tokio::test]
    async fn test_reset_removes_artifact() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let mut builder = engine.builder("p1").await.unwrap();
        builder
            .add_text("some text", Map::new(), ProjectConfig::default())
            .await
            .unwrap();
        builder.persist().await.unwrap();
        engine.reset("p1").await.unwrap();
        assert_eq!(engine.storage.artifact_size("p1"), 0);
    }

    #[tokio::test]
    async fn test_vectors_stored_when_embedder_present() {
        let tmp = TempDir::new().unwrap();
        let storage = StorageLayout::new(tmp.path());
        storage.create_area("p1").unwrap();
        let cache = ModelCache::with_embedder(EmbeddingConfig::default(), Arc::new(AxisEmbedder));
        let engine = LocalMemoryEngine::new(storage, Arc::new(cache), 1.0);

        let mut builder = engine.builder("p1").await.unwrap();
        builder
            .add_text("a cat sat", Map::new(), ProjectConfig::default())
            .await
            .unwrap();
        builder
            .add_text("a dog ran", Map::new(), ProjectConfig::default())
            .await
            .unwrap();
        builder.persist().await.unwrap();

        // Pure vector ranking: "cat" embeds onto the same axis as the first chunk
        let results = engine.search("p1", "cat", 2).await.unwrap();
        assert_eq!(results[0].text, "a cat sat");
    }

    struct MisconfiguredEmbedder;

    #[async_trait]
    impl Embedder for MisconfiguredEmbedder {
        fn model_name(&self) -> &str {
            "misconfigured"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_upstream_error() {
        let tmp = TempDir::new().unwrap();
        let storage = StorageLayout::new(tmp.path());
        storage.create_area("p1").unwrap();
        let cache = ModelCache::with_embedder(
            EmbeddingConfig::default(),
            Arc::new(MisconfiguredEmbedder),
        );
        let engine = LocalMemoryEngine::new(storage, Arc::new(cache), 0.6);

        let mut builder = engine.builder("p1").await.unwrap();
        let err = builder
            .add_text("a cat sat", Map::new(), ProjectConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "upstream_error");
        assert_eq!(builder.staged(), 0);
    }
}
