//! TOML configuration.
//!
//! A single file configures the API process and the worker processes; both
//! must point at the same `[db].path` and `[storage].data_dir` so they share
//! the registry, the job queue, and the per-project storage areas.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::QueueClass;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root of all project storage areas (`<data_dir>/projects/<id>/`).
    pub data_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Per-class execution timeouts.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_chat_timeout")]
    pub chat_timeout_secs: u64,
    #[serde(default = "default_indexing_timeout")]
    pub indexing_timeout_secs: u64,
    #[serde(default = "default_default_timeout")]
    pub default_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            chat_timeout_secs: default_chat_timeout(),
            indexing_timeout_secs: default_indexing_timeout(),
            default_timeout_secs: default_default_timeout(),
        }
    }
}

fn default_chat_timeout() -> u64 {
    300
}
fn default_indexing_timeout() -> u64 {
    3600
}
fn default_default_timeout() -> u64 {
    600
}

impl QueueConfig {
    pub fn timeout_for(&self, class: QueueClass) -> Duration {
        let secs = match class {
            QueueClass::Chat => self.chat_timeout_secs,
            QueueClass::Indexing => self.indexing_timeout_secs,
            QueueClass::Default => self.default_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Queues this worker services. Dispatch order is always chat, indexing,
    /// default regardless of the order listed here.
    #[serde(default = "default_worker_queues")]
    pub queues: Vec<QueueClass>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            queues: default_worker_queues(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_worker_queues() -> Vec<QueueClass> {
    QueueClass::ALL.to_vec()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Extension allow-list for folder and upload indexing (lowercase, with dot).
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_allowed_extensions() -> Vec<String> {
    vec![".txt".to_string(), ".md".to_string(), ".pdf".to_string()]
}
fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

impl IndexingConfig {
    /// Returns true if `ext` (with or without a leading dot) is allowed.
    pub fn is_allowed(&self, ext: &str) -> bool {
        let normalized = normalize_extension(ext);
        self.allowed_extensions
            .iter()
            .any(|a| normalize_extension(a) == normalized)
    }
}

/// Lowercase an extension and make sure it carries a leading dot.
pub fn normalize_extension(ext: &str) -> String {
    let lower = ext.trim().to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{}", lower)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_search_top_k")]
    pub default_search_top_k: usize,
    #[serde(default = "default_max_search_top_k")]
    pub max_search_top_k: usize,
    #[serde(default = "default_chat_top_k")]
    pub default_chat_top_k: usize,
    #[serde(default = "default_max_chat_top_k")]
    pub max_chat_top_k: usize,
    /// Characters kept in each chat source preview.
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            default_search_top_k: default_search_top_k(),
            max_search_top_k: default_max_search_top_k(),
            default_chat_top_k: default_chat_top_k(),
            max_chat_top_k: default_max_chat_top_k(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_search_top_k() -> usize {
    5
}
fn default_max_search_top_k() -> usize {
    50
}
fn default_chat_top_k() -> usize {
    3
}
fn default_max_chat_top_k() -> usize {
    20
}
fn default_preview_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Language backend selection and defaults. Chat requests may override the
/// backend, model, and sampling parameters through `model_params`.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_backend")]
    pub backend: String,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,
    #[serde(default = "default_openai_url")]
    pub openai_url: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    /// Name of the environment variable holding the OpenAI API key.
    #[serde(default = "default_openai_key_env")]
    pub openai_api_key_env: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: default_llm_backend(),
            ollama_url: default_ollama_url(),
            ollama_model: default_ollama_model(),
            openai_url: default_openai_url(),
            openai_model: default_openai_model(),
            openai_api_key_env: default_openai_key_env(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_llm_backend() -> String {
    "ollama".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "qwen2.5:14b".to_string()
}
fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_openai_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_llm_timeout() -> u64 {
    300
}
fn default_llm_retries() -> u32 {
    2
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Standalone worker processes expose their own scrape endpoint here.
    #[serde(default)]
    pub worker_bind: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            worker_bind: None,
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

impl Config {
    pub fn projects_dir(&self) -> PathBuf {
        self.storage.data_dir.join("projects")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    for (name, secs) in [
        ("queue.chat_timeout_secs", config.queue.chat_timeout_secs),
        ("queue.indexing_timeout_secs", config.queue.indexing_timeout_secs),
        ("queue.default_timeout_secs", config.queue.default_timeout_secs),
    ] {
        if secs == 0 {
            bail!("{} must be > 0", name);
        }
    }

    if config.worker.concurrency == 0 {
        bail!("worker.concurrency must be >= 1");
    }
    if config.worker.queues.is_empty() {
        bail!("worker.queues must name at least one queue");
    }

    if config.indexing.allowed_extensions.is_empty() {
        bail!("indexing.allowed_extensions must not be empty");
    }

    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.max_search_top_k == 0 || config.retrieval.max_chat_top_k == 0 {
        bail!("retrieval top_k limits must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.llm.backend.as_str() {
        "ollama" | "openai" => {}
        other => bail!(
            "Unknown llm backend: '{}'. Must be ollama or openai.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"
[db]
path = "/tmp/kbhub.sqlite"

[storage]
data_dir = "/tmp/kbhub"

[server]
bind = "127.0.0.1:8503"
"#
    }

    #[test]
    fn test_defaults_applied() {
        let cfg: Config = toml::from_str(minimal()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.queue.chat_timeout_secs, 300);
        assert_eq!(cfg.queue.indexing_timeout_secs, 3600);
        assert_eq!(cfg.queue.default_timeout_secs, 600);
        assert_eq!(cfg.worker.queues, QueueClass::ALL.to_vec());
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.llm.backend, "ollama");
    }

    #[test]
    fn test_timeout_for_class() {
        let cfg: Config = toml::from_str(minimal()).unwrap();
        assert_eq!(
            cfg.queue.timeout_for(QueueClass::Chat),
            Duration::from_secs(300)
        );
        assert_eq!(
            cfg.queue.timeout_for(QueueClass::Indexing),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_extension_allow_list() {
        let cfg = IndexingConfig::default();
        assert!(cfg.is_allowed(".txt"));
        assert!(cfg.is_allowed("PDF"));
        assert!(!cfg.is_allowed(".docx"));
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let raw = format!("{}\n[llm]\nbackend = \"gemini\"\n", minimal());
        let cfg: Config = toml::from_str(&raw).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_rejects_openai_embeddings_without_dims() {
        let raw = format!(
            "{}\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
            minimal()
        );
        let cfg: Config = toml::from_str(&raw).unwrap();
        let err = validate(&cfg).unwrap_err().to_string();
        assert!(err.contains("embedding.dims"));
    }
}
