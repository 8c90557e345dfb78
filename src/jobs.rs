//! Job domain functions and submission-time validation.
//!
//! Each domain function takes the worker's [`JobContext`], reads the project
//! from the registry, does its work against the memory engine, writes the
//! new stats back, and returns a JSON result that the worker stores on the
//! job.
//!
//! `total_chunks` is bookkeeping: the value read at job start plus the
//! chunk count this job reported. Two indexing jobs on the same project
//! running at once can lose one update; see DESIGN.md.
//!
//! The `prepare_*` functions run in the API process before enqueue, so a
//! request that can never succeed is rejected with 400 instead of becoming a
//! failed job.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use walkdir::WalkDir;

use crate::config::{normalize_extension, IndexingConfig, RetrievalConfig};
use crate::engine::MemoryEngine;
use crate::error::{KbError, Result};
use crate::extract::{extension_of, extract_file};
use crate::llm::{build_prompt, preview, LlmRouter};
use crate::metrics;
use crate::models::{
    validate_chunking, ChatRequest, IndexFolderRequest, IndexTextRequest, Job, JobPayload,
    ModelParams, ProjectConfig, SearchRequest,
};
use crate::registry::{ProjectRegistry, StatsUpdate};

/// Everything a job function needs. One per worker.
#[derive(Clone)]
pub struct JobContext {
    pub registry: ProjectRegistry,
    pub engine: Arc<dyn MemoryEngine>,
    pub llm: LlmRouter,
    pub indexing: IndexingConfig,
    pub retrieval: RetrievalConfig,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Dispatch a claimed job to its domain function and record metrics.
pub async fn run_job(ctx: &JobContext, job: &Job) -> Result<Value> {
    let start = Instant::now();
    let project_id = job.project_id.as_str();

    let outcome = match &job.payload {
        JobPayload::IndexText { text, metadata } => {
            index_text(ctx, project_id, text, metadata.clone()).await
        }
        JobPayload::IndexFile { path, filename } => {
            index_file(ctx, project_id, path, filename).await
        }
        JobPayload::IndexFolder {
            folder_path,
            recursive,
            file_extensions,
            chunk_size,
            chunk_overlap,
        } => {
            index_folder(
                ctx,
                project_id,
                folder_path,
                *recursive,
                file_extensions,
                *chunk_size,
                *chunk_overlap,
            )
            .await
        }
        JobPayload::Search { query, top_k } => search(ctx, project_id, query, *top_k).await,
        JobPayload::Chat {
            query,
            top_k,
            model_params,
        } => chat(ctx, project_id, query, *top_k, model_params).await,
        JobPayload::Reset => reset(ctx, project_id).await,
    };

    let elapsed = start.elapsed();
    match &outcome {
        Ok(_) => metrics::record_operation(project_id, &job.kind, "success", elapsed),
        Err(e) => {
            metrics::record_operation(project_id, &job.kind, "error", elapsed);
            metrics::record_error(&job.kind, e.kind());
        }
    }
    outcome
}

// ============ Indexing ============

pub async fn index_text(
    ctx: &JobContext,
    project_id: &str,
    text: &str,
    metadata: Map<String, Value>,
) -> Result<Value> {
    let start = Instant::now();
    let project = ctx.registry.get(project_id).await?;

    let mut builder = ctx.engine.builder(project_id).await?;
    let added = builder.add_text(text, metadata, project.config).await? as u64;
    let size = builder.persist().await?;

    let updated = ctx
        .registry
        .update_stats(
            project_id,
            StatsUpdate {
                total_chunks: project.total_chunks + added,
                storage_size: size,
                files_count: project.files_count,
            },
        )
        .await?;
    metrics::record_indexed_chunks(project_id, added);

    Ok(json!({
        "success": true,
        "project_id": project_id,
        "chunks_added": added,
        "total_chunks": updated.total_chunks,
        "storage_size": updated.storage_size,
        "duration_seconds": round2(start.elapsed().as_secs_f64()),
    }))
}

/// Index one uploaded file already copied into the project's `files/`.
pub async fn index_file(
    ctx: &JobContext,
    project_id: &str,
    path: &Path,
    filename: &str,
) -> Result<Value> {
    let start = Instant::now();
    let project = ctx.registry.get(project_id).await?;

    let text = extract_file(path)
        .await
        .map_err(|e| KbError::UnsupportedFormat(format!("{}: {}", filename, e)))?;

    let mut metadata = Map::new();
    metadata.insert("source".to_string(), Value::from(filename));

    let mut builder = ctx.engine.builder(project_id).await?;
    let added = builder.add_text(&text, metadata, project.config).await? as u64;
    let size = builder.persist().await?;

    let updated = ctx
        .registry
        .update_stats(
            project_id,
            StatsUpdate {
                total_chunks: project.total_chunks + added,
                storage_size: size,
                files_count: project.files_count + 1,
            },
        )
        .await?;
    metrics::record_indexed_chunks(project_id, added);

    Ok(json!({
        "success": true,
        "project_id": project_id,
        "filename": filename,
        "chunks_added": added,
        "total_chunks": updated.total_chunks,
        "storage_size": updated.storage_size,
        "duration_seconds": round2(start.elapsed().as_secs_f64()),
    }))
}

fn extension_globs(extensions: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for ext in extensions {
        let glob = GlobBuilder::new(&format!("*{}", normalize_extension(ext)))
            .case_insensitive(true)
            .literal_separator(true)
            .build()
            .map_err(|e| KbError::validation(format!("bad extension '{}': {}", ext, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| KbError::validation(e.to_string()))
}

#[allow(clippy::too_many_arguments)]
pub async fn index_folder(
    ctx: &JobContext,
    project_id: &str,
    folder: &Path,
    recursive: bool,
    extensions: &[String],
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
) -> Result<Value> {
    let start = Instant::now();
    let project = ctx.registry.get(project_id).await?;

    if !folder.is_dir() {
        return Err(KbError::validation(format!(
            "folder not found: {}",
            folder.display()
        )));
    }

    let chunking = ProjectConfig {
        chunk_size: chunk_size.unwrap_or(project.config.chunk_size),
        chunk_overlap: chunk_overlap.unwrap_or(project.config.chunk_overlap),
    };
    chunking.validate()?;

    let globs = extension_globs(extensions)?;
    let mut walker = WalkDir::new(folder).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut skipped: Vec<Value> = Vec::new();
    let mut builder = ctx.engine.builder(project_id).await?;
    let mut files_indexed: u64 = 0;

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                tracing::warn!(project_id, path = %path, error = %e, "skipping unreadable entry");
                skipped.push(json!({ "path": path, "reason": e.to_string() }));
                continue;
            }
        };
        if !entry.file_type().is_file() || !globs.is_match(entry.file_name()) {
            continue;
        }

        let path = entry.path();
        let rel = path.strip_prefix(folder).unwrap_or(path).display().to_string();
        match extract_file(path).await {
            Ok(text) => {
                let mut metadata = Map::new();
                metadata.insert("source".to_string(), Value::from(rel));
                builder.add_text(&text, metadata, chunking).await?;
                files_indexed += 1;
            }
            Err(e) => {
                tracing::warn!(project_id, path = %rel, error = %e, "skipping file");
                skipped.push(json!({ "path": rel, "reason": e.to_string() }));
            }
        }
    }

    if files_indexed == 0 {
        return Ok(json!({
            "success": true,
            "project_id": project_id,
            "message": "No files found",
            "files_indexed": 0,
            "files_skipped": skipped,
            "chunks_added": 0,
            "total_chunks": project.total_chunks,
            "duration_seconds": round2(start.elapsed().as_secs_f64()),
        }));
    }

    let added = builder.staged() as u64;
    let size = builder.persist().await?;
    let updated = ctx
        .registry
        .update_stats(
            project_id,
            StatsUpdate {
                total_chunks: project.total_chunks + added,
                storage_size: size,
                files_count: project.files_count + files_indexed,
            },
        )
        .await?;
    metrics::record_indexed_chunks(project_id, added);

    Ok(json!({
        "success": true,
        "project_id": project_id,
        "files_indexed": files_indexed,
        "files_skipped": skipped,
        "chunks_added": added,
        "total_chunks": updated.total_chunks,
        "storage_size": updated.storage_size,
        "duration_seconds": round2(start.elapsed().as_secs_f64()),
    }))
}

// ============ Retrieval ============

pub async fn search(ctx: &JobContext, project_id: &str, query: &str, top_k: usize) -> Result<Value> {
    let start = Instant::now();
    let project = ctx.registry.get(project_id).await?;
    if project.total_chunks == 0 {
        return Err(KbError::NotIndexed(project_id.to_string()));
    }

    let results = ctx.engine.search(project_id, query, top_k).await?;

    Ok(json!({
        "project_id": project_id,
        "query": query,
        "total_results": results.len(),
        "results": results,
        "duration_seconds": round2(start.elapsed().as_secs_f64()),
    }))
}

pub async fn chat(
    ctx: &JobContext,
    project_id: &str,
    query: &str,
    top_k: usize,
    params: &ModelParams,
) -> Result<Value> {
    let start = Instant::now();
    let project = ctx.registry.get(project_id).await?;
    if project.total_chunks == 0 {
        return Err(KbError::NotIndexed(project_id.to_string()));
    }

    let backend = ctx.llm.backend_for(params)?;
    let passages = ctx.engine.search(project_id, query, top_k).await?;
    let prompt = build_prompt(&passages, query);

    let answer = backend.generate(&prompt).await?;
    if answer.trim().is_empty() {
        return Err(KbError::upstream(format!(
            "empty answer from {} backend",
            backend.name()
        )));
    }

    metrics::record_chat_context(passages.len());
    let sources: Vec<Value> = passages
        .iter()
        .map(|p| {
            json!({
                "text": preview(&p.text, ctx.retrieval.preview_chars),
                "score": p.score,
            })
        })
        .collect();

    Ok(json!({
        "project_id": project_id,
        "query": query,
        "answer": answer,
        "context_chunks": passages.len(),
        "sources": sources,
        "backend": backend.name(),
        "model": backend.model(),
        "duration_seconds": round2(start.elapsed().as_secs_f64()),
    }))
}

// ============ Maintenance ============

/// Drop the index artifact and zero the stats. Uploaded files stay.
pub async fn reset(ctx: &JobContext, project_id: &str) -> Result<Value> {
    ctx.registry.get(project_id).await?;
    ctx.engine.reset(project_id).await?;
    ctx.registry
        .update_stats(project_id, StatsUpdate::default())
        .await?;
    Ok(json!({
        "success": true,
        "project_id": project_id,
        "message": "Project index reset",
    }))
}

// ============ Submission ============

pub fn prepare_index_text(req: IndexTextRequest) -> Result<JobPayload> {
    if req.text.trim().is_empty() {
        return Err(KbError::validation("text must not be empty"));
    }
    Ok(JobPayload::IndexText {
        text: req.text,
        metadata: req.metadata,
    })
}

pub fn prepare_index_folder(
    req: IndexFolderRequest,
    indexing: &IndexingConfig,
) -> Result<JobPayload> {
    if !req.folder_path.is_dir() {
        return Err(KbError::validation(format!(
            "folder not found: {}",
            req.folder_path.display()
        )));
    }

    let extensions: Vec<String> = req
        .file_extensions
        .unwrap_or_else(|| indexing.allowed_extensions.clone())
        .iter()
        .map(|e| normalize_extension(e))
        .collect();
    if extensions.is_empty() {
        return Err(KbError::validation("file_extensions must not be empty"));
    }
    if let Some(bad) = extensions.iter().find(|e| !indexing.is_allowed(e)) {
        return Err(KbError::UnsupportedFormat(format!(
            "extension '{}' is not in the allow-list",
            bad
        )));
    }

    validate_chunking(req.chunk_size, req.chunk_overlap)?;

    Ok(JobPayload::IndexFolder {
        folder_path: req.folder_path,
        recursive: req.recursive,
        file_extensions: extensions,
        chunk_size: req.chunk_size,
        chunk_overlap: req.chunk_overlap,
    })
}

/// Check an upload's extension and size before it is stored.
pub fn check_upload(filename: &str, size: usize, indexing: &IndexingConfig) -> Result<()> {
    let ext = extension_of(Path::new(filename))
        .ok_or_else(|| KbError::UnsupportedFormat(format!("{} has no extension", filename)))?;
    if !indexing.is_allowed(&ext) {
        return Err(KbError::UnsupportedFormat(format!(
            "extension '{}' is not in the allow-list",
            ext
        )));
    }
    if size == 0 {
        return Err(KbError::validation("uploaded file is empty"));
    }
    if size > indexing.max_upload_bytes {
        return Err(KbError::validation(format!(
            "uploaded file exceeds {} bytes",
            indexing.max_upload_bytes
        )));
    }
    Ok(())
}

fn resolve_top_k(requested: Option<usize>, default: usize, max: usize) -> Result<usize> {
    match requested {
        None => Ok(default),
        Some(k) if (1..=max).contains(&k) => Ok(k),
        Some(k) => Err(KbError::validation(format!(
            "top_k must be in [1, {}], got {}",
            max, k
        ))),
    }
}

pub fn prepare_search(req: SearchRequest, retrieval: &RetrievalConfig) -> Result<JobPayload> {
    if req.query.trim().is_empty() {
        return Err(KbError::validation("query must not be empty"));
    }
    let top_k = resolve_top_k(
        req.top_k,
        retrieval.default_search_top_k,
        retrieval.max_search_top_k,
    )?;
    Ok(JobPayload::Search {
        query: req.query,
        top_k,
    })
}

pub fn prepare_chat(
    req: ChatRequest,
    retrieval: &RetrievalConfig,
    llm: &LlmRouter,
) -> Result<JobPayload> {
    if req.query.trim().is_empty() {
        return Err(KbError::validation("query must not be empty"));
    }
    let top_k = resolve_top_k(
        req.top_k,
        retrieval.default_chat_top_k,
        retrieval.max_chat_top_k,
    )?;
    llm.validate(&req.model_params)?;
    Ok(JobPayload::Chat {
        query: req.query,
        top_k,
        model_params: req.model_params,
    })
}
