//! Core data models: projects, jobs, queue classes, job payloads, and the
//! normalized search result shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{KbError, Result};

pub const MIN_CHUNK_SIZE: usize = 128;
pub const MAX_CHUNK_SIZE: usize = 4096;
pub const MAX_CHUNK_OVERLAP: usize = 512;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;

// ============ Projects ============

/// Per-project chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    64
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<()> {
        validate_chunking(Some(self.chunk_size), Some(self.chunk_overlap))
    }
}

/// Bounds check for chunking parameters; `None` means "not overridden".
pub fn validate_chunking(chunk_size: Option<usize>, chunk_overlap: Option<usize>) -> Result<()> {
    if let Some(size) = chunk_size {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size) {
            return Err(KbError::validation(format!(
                "chunk_size must be in [{}, {}], got {}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, size
            )));
        }
    }
    if let Some(overlap) = chunk_overlap {
        if overlap > MAX_CHUNK_OVERLAP {
            return Err(KbError::validation(format!(
                "chunk_overlap must be in [0, {}], got {}",
                MAX_CHUNK_OVERLAP, overlap
            )));
        }
    }
    Ok(())
}

/// A named, isolated knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub config: ProjectConfig,
    /// Registry bookkeeping: the sum of chunk counts reported by every
    /// successful indexing job since creation or the last reset. Not a
    /// recount of the persisted artifact.
    pub total_chunks: u64,
    /// Size in bytes of the persisted index artifact.
    pub storage_size: u64,
    pub files_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: Option<ProjectConfig>,
}

impl ProjectCreate {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_description(self.description.as_deref())?;
        if let Some(cfg) = &self.config {
            cfg.validate()?;
        }
        Ok(())
    }
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub config: Option<ProjectConfig>,
}

impl ProjectUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        validate_description(self.description.as_deref())?;
        if let Some(cfg) = &self.config {
            cfg.validate()?;
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let len = name.trim().chars().count();
    if len == 0 {
        return Err(KbError::validation("name must not be empty"));
    }
    if len > MAX_NAME_LEN {
        return Err(KbError::validation(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn validate_description(description: Option<&str>) -> Result<()> {
    if let Some(d) = description {
        if d.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(KbError::validation(format!(
                "description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStats {
    pub id: String,
    pub name: String,
    pub total_chunks: u64,
    pub storage_size: u64,
    pub files_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl From<&Project> for ProjectStats {
    fn from(p: &Project) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            total_chunks: p.total_chunks,
            storage_size: p.storage_size,
            files_count: p.files_count,
            last_updated: p.updated_at,
        }
    }
}

// ============ Queue classes & job status ============

/// Named queue. Lower [`priority`](QueueClass::priority) is dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Chat,
    Indexing,
    Default,
}

impl QueueClass {
    /// All classes in dispatch order.
    pub const ALL: [QueueClass; 3] = [QueueClass::Chat, QueueClass::Indexing, QueueClass::Default];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Chat => "chat",
            QueueClass::Indexing => "indexing",
            QueueClass::Default => "default",
        }
    }

    pub fn priority(&self) -> i64 {
        match self {
            QueueClass::Chat => 0,
            QueueClass::Indexing => 1,
            QueueClass::Default => 2,
        }
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueClass {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chat" => Ok(QueueClass::Chat),
            "indexing" => Ok(QueueClass::Indexing),
            "default" => Ok(QueueClass::Default),
            other => Err(KbError::validation(format!(
                "unknown queue '{}': expected chat, indexing, or default",
                other
            ))),
        }
    }
}

/// Forward-only job lifecycle: `queued → started → finished | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// Position in the lifecycle; terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Started => 1,
            JobStatus::Finished | JobStatus::Failed => 2,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "started" => Ok(JobStatus::Started),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            other => Err(KbError::validation(format!(
                "unknown job status '{}': expected queued, started, finished, or failed",
                other
            ))),
        }
    }
}

// ============ Job payloads ============

/// Optional per-request overrides for the language backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// `"ollama"` or `"openai"`; defaults to `[llm].backend`.
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Operation-specific job arguments, stored as tagged JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    IndexText {
        text: String,
        #[serde(default)]
        metadata: serde_json::Map<String, Value>,
    },
    /// Index a file already copied into the project's `files/` directory.
    IndexFile { path: PathBuf, filename: String },
    IndexFolder {
        folder_path: PathBuf,
        recursive: bool,
        file_extensions: Vec<String>,
        #[serde(default)]
        chunk_size: Option<usize>,
        #[serde(default)]
        chunk_overlap: Option<usize>,
    },
    Search {
        query: String,
        top_k: usize,
    },
    Chat {
        query: String,
        top_k: usize,
        #[serde(default)]
        model_params: ModelParams,
    },
    Reset,
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::IndexText { .. } => "index_text",
            JobPayload::IndexFile { .. } => "index_file",
            JobPayload::IndexFolder { .. } => "index_folder",
            JobPayload::Search { .. } => "search",
            JobPayload::Chat { .. } => "chat",
            JobPayload::Reset => "reset",
        }
    }

    /// Retrieval and chat share the user-facing queue; indexing is long
    /// running; maintenance goes to the default queue.
    pub fn queue_class(&self) -> QueueClass {
        match self {
            JobPayload::Search { .. } | JobPayload::Chat { .. } => QueueClass::Chat,
            JobPayload::IndexText { .. }
            | JobPayload::IndexFile { .. }
            | JobPayload::IndexFolder { .. } => QueueClass::Indexing,
            JobPayload::Reset => QueueClass::Default,
        }
    }
}

/// Error captured into a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

impl From<&KbError> for JobError {
    fn from(err: &KbError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub queue: QueueClass,
    pub project_id: String,
    pub kind: String,
    pub status: JobStatus,
    pub payload: JobPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

// ============ Search ============

/// A ranked passage returned by the memory engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub text: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

// ============ Timestamps ============

/// Milliseconds since the Unix epoch; the storage format for every timestamp
/// in the registry and the queue.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// ============ Request bodies ============

#[derive(Debug, Clone, Deserialize)]
pub struct IndexTextRequest {
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexFolderRequest {
    pub folder_path: PathBuf,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default)]
    pub file_extensions: Option<Vec<String>>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub chunk_overlap: Option<usize>,
}

fn default_recursive() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub model_params: ModelParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_bounds() {
        assert!(ProjectConfig::default().validate().is_ok());
        assert!(validate_chunking(Some(127), None).is_err());
        assert!(validate_chunking(Some(4096), Some(512)).is_ok());
        assert!(validate_chunking(Some(4097), None).is_err());
        assert!(validate_chunking(None, Some(513)).is_err());
    }

    #[test]
    fn test_overlap_may_exceed_chunk_size() {
        // Only the independent bounds apply; the chunker always advances
        let cfg = ProjectConfig {
            chunk_size: 128,
            chunk_overlap: 200,
        };
        assert!(cfg.validate().is_ok());
        assert!(validate_chunking(Some(128), Some(512)).is_ok());
    }

    #[test]
    fn test_create_validation() {
        let ok = ProjectCreate {
            name: "docs".into(),
            description: None,
            tags: vec![],
            config: None,
        };
        assert!(ok.validate().is_ok());

        let empty = ProjectCreate {
            name: "   ".into(),
            ..ok.clone()
        };
        assert!(matches!(empty.validate(), Err(KbError::Validation(_))));

        let long = ProjectCreate {
            name: "x".repeat(101),
            ..ok
        };
        assert!(long.validate().is_err());
    }

    #[test]
    fn test_status_rank_is_forward_only() {
        assert!(JobStatus::Queued.rank() < JobStatus::Started.rank());
        assert!(JobStatus::Started.rank() < JobStatus::Finished.rank());
        assert_eq!(JobStatus::Finished.rank(), JobStatus::Failed.rank());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Started.is_terminal());
    }

    #[test]
    fn test_payload_routing() {
        let search = JobPayload::Search {
            query: "q".into(),
            top_k: 1,
        };
        assert_eq!(search.queue_class(), QueueClass::Chat);
        assert_eq!(JobPayload::Reset.queue_class(), QueueClass::Default);
        let text = JobPayload::IndexText {
            text: "t".into(),
            metadata: Default::default(),
        };
        assert_eq!(text.queue_class(), QueueClass::Indexing);
        assert_eq!(text.kind(), "index_text");
    }

    #[test]
    fn test_payload_tagged_json() {
        let payload = JobPayload::Chat {
            query: "what".into(),
            top_k: 3,
            model_params: ModelParams::default(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "chat");
        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_queue_class_parse() {
        assert_eq!("chat".parse::<QueueClass>().unwrap(), QueueClass::Chat);
        assert!("urgent".parse::<QueueClass>().is_err());
        assert!(QueueClass::Chat.priority() < QueueClass::Indexing.priority());
        assert!(QueueClass::Indexing.priority() < QueueClass::Default.priority());
    }
}
