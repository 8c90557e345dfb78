//! # kbhub
//!
//! Multi-project knowledge-base orchestration.
//!
//! kbhub hosts many isolated knowledge-base projects behind one HTTP API.
//! Each project owns a storage area with its uploaded files and a searchable
//! memory artifact. Expensive work (indexing, search, chat, reset) runs
//! asynchronously: the API enqueues a job in a durable, prioritized queue
//! and worker processes execute it against the project's memory engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  enqueue  ┌──────────────┐  claim  ┌──────────┐
//! │ HTTP API │──────────▶│  Job queue   │◀────────│ Workers  │
//! │  (axum)  │           │ chat>idx>def │         │  (pool)  │
//! └────┬─────┘           └──────┬───────┘         └────┬─────┘
//!      │                        │ SQLite (WAL)         │
//!      ▼                        ▼                      ▼
//! ┌──────────┐           ┌──────────────┐        ┌──────────┐
//! │ Registry │──────────▶│  projects/   │◀───────│  Engine  │
//! │          │           │  <id>/...    │        │ + LLM    │
//! └──────────┘           └──────────────┘        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbhub init                              # create database and data dir
//! kbhub serve --workers 2                 # API with embedded workers
//! kbhub worker --queues chat              # extra chat-only worker
//! kbhub projects create docs
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error kinds shared by jobs and the API |
//! | [`models`] | Projects, jobs, payloads, request types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`registry`] | Project registry |
//! | [`storage`] | Per-project storage layout |
//! | [`chunk`] | Text chunking |
//! | [`extract`] | Text extraction from `.txt`, `.md`, `.pdf` |
//! | [`embedding`] | Embedding providers and the per-worker model cache |
//! | [`engine`] | Memory engine: build, search, reset |
//! | [`llm`] | Language backends and prompt assembly |
//! | [`queue`] | Durable prioritized job queue |
//! | [`jobs`] | Job execution and submission checks |
//! | [`worker`] | Worker loop and pool |
//! | [`metrics`] | Prometheus instrumentation |
//! | [`server`] | HTTP API gateway |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod llm;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod registry;
pub mod server;
pub mod storage;
pub mod worker;
