//! # kbhub CLI
//!
//! The `kbhub` binary runs the API gateway and worker processes and offers
//! a few administrative commands against the shared database.
//!
//! ## Usage
//!
//! ```bash
//! kbhub --config ./config/kbhub.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbhub init` | Create the database, schema, and data directory |
//! | `kbhub serve` | Start the HTTP API (optionally with embedded workers) |
//! | `kbhub worker` | Start a standalone worker pool |
//! | `kbhub projects list\|create\|delete` | Manage projects |
//! | `kbhub jobs list\|get` | Inspect the job queue |
//!
//! ## Examples
//!
//! ```bash
//! kbhub init
//! kbhub serve --workers 2
//! kbhub worker --concurrency 4 --queues indexing,default
//! kbhub projects create handbook --description "Ops handbook"
//! kbhub jobs list --status failed
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio::sync::watch;

use kbhub::config::{self, Config};
use kbhub::llm::LlmRouter;
use kbhub::models::{JobStatus, ProjectConfig, ProjectCreate, QueueClass};
use kbhub::queue::JobQueue;
use kbhub::registry::ProjectRegistry;
use kbhub::server::{self, ServerOptions};
use kbhub::storage::StorageLayout;
use kbhub::{db, metrics, migrate, worker};

/// kbhub: multi-project knowledge bases with background indexing and chat.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kbhub.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kbhub",
    about = "Multi-project knowledge-base orchestration: registry, job queue, workers, HTTP API",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbhub.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and data directory.
    ///
    /// Idempotent; running it again leaves existing data untouched.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve {
        /// Workers to run inside the API process. 0 leaves all jobs to
        /// standalone `kbhub worker` processes.
        #[arg(long, default_value_t = 0)]
        workers: usize,
    },

    /// Start a standalone worker pool.
    Worker {
        /// Number of concurrent workers. Defaults to `[worker].concurrency`.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Comma-separated queues to service. Defaults to `[worker].queues`.
        #[arg(long, value_delimiter = ',')]
        queues: Option<Vec<QueueClass>>,
    },

    /// Manage projects.
    Projects {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Inspect jobs.
    Jobs {
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// List all projects.
    List,
    /// Create a project and its storage area.
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Comma-separated tags.
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_overlap: Option<usize>,
    },
    /// Delete a project and its storage area.
    Delete { id: String },
}

#[derive(Subcommand)]
enum JobAction {
    /// List recent jobs, newest first.
    List {
        /// Filter by status: queued, started, finished, failed.
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one job as JSON.
    Get { id: String },
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => "kbhub=info,tower_http=info",
        1 => "kbhub=debug,tower_http=debug",
        _ => "kbhub=trace,tower_http=trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            let projects_dir = cfg.projects_dir();
            std::fs::create_dir_all(&projects_dir)
                .with_context(|| format!("Failed to create {}", projects_dir.display()))?;
            println!("Database initialized successfully.");
        }
        Commands::Serve { workers } => {
            server::run_server(
                &cfg,
                ServerOptions {
                    workers,
                    llm: None,
                },
            )
            .await?;
        }
        Commands::Worker {
            concurrency,
            queues,
        } => {
            let concurrency = concurrency.unwrap_or(cfg.worker.concurrency);
            let queues = queues.unwrap_or_else(|| cfg.worker.queues.clone());
            run_workers(&cfg, concurrency, &queues).await?;
        }
        Commands::Projects { action } => run_projects(&cfg, action).await?,
        Commands::Jobs { action } => run_jobs(&cfg, action).await?,
    }

    Ok(())
}

async fn run_workers(cfg: &Config, concurrency: usize, queues: &[QueueClass]) -> anyhow::Result<()> {
    if concurrency == 0 {
        anyhow::bail!("--concurrency must be >= 1");
    }
    if queues.is_empty() {
        anyhow::bail!("--queues must name at least one queue");
    }

    let pool = db::connect(cfg).await?;
    migrate::migrate(&pool).await?;

    if cfg.metrics.enabled {
        if let Some(bind) = &cfg.metrics.worker_bind {
            let addr = bind
                .parse()
                .with_context(|| format!("invalid metrics.worker_bind: {}", bind))?;
            metrics::install_with_listener(addr)?;
        }
    }

    let queue = JobQueue::new(pool.clone());
    let llm = LlmRouter::from_config(cfg.llm.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = worker::spawn_pool(cfg, pool.clone(), queue, llm, concurrency, queues, shutdown_rx);

    let names: Vec<&str> = queues.iter().map(|q| q.as_str()).collect();
    tracing::info!(concurrency, queues = %names.join(","), "workers started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, waiting for running jobs");
    let _ = shutdown_tx.send(true);
    for h in handles {
        let _ = h.await;
    }
    pool.close().await;
    Ok(())
}

async fn open_registry(cfg: &Config) -> anyhow::Result<ProjectRegistry> {
    let pool = db::connect(cfg).await?;
    migrate::migrate(&pool).await?;
    Ok(ProjectRegistry::new(pool, StorageLayout::from_config(cfg)))
}

async fn run_projects(cfg: &Config, action: ProjectAction) -> anyhow::Result<()> {
    let registry = open_registry(cfg).await?;

    match action {
        ProjectAction::List => {
            let projects = registry.list().await?;
            if projects.is_empty() {
                println!("No projects.");
            }
            for p in projects {
                println!(
                    "{}  {:<24} chunks={:<8} files={:<5} bytes={}",
                    p.id, p.name, p.total_chunks, p.files_count, p.storage_size
                );
            }
        }
        ProjectAction::Create {
            name,
            description,
            tags,
            chunk_size,
            chunk_overlap,
        } => {
            let config = if chunk_size.is_some() || chunk_overlap.is_some() {
                let defaults = ProjectConfig::default();
                Some(ProjectConfig {
                    chunk_size: chunk_size.unwrap_or(defaults.chunk_size),
                    chunk_overlap: chunk_overlap.unwrap_or(defaults.chunk_overlap),
                })
            } else {
                None
            };
            let project = registry
                .create(ProjectCreate {
                    name,
                    description,
                    tags,
                    config,
                })
                .await?;
            println!("Created project {} ({})", project.id, project.name);
        }
        ProjectAction::Delete { id } => {
            if registry.delete(&id).await? {
                println!("Deleted project {}", id);
            } else {
                anyhow::bail!("project not found: {}", id);
            }
        }
    }
    Ok(())
}

async fn run_jobs(cfg: &Config, action: JobAction) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::migrate(&pool).await?;
    let queue = JobQueue::new(pool);

    match action {
        JobAction::List { status, limit } => {
            let jobs = queue.list(status, limit).await?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for j in jobs {
                println!(
                    "{}  {:<8} {:<12} {:<9} project={}  created={}",
                    j.id,
                    j.queue.as_str(),
                    j.kind,
                    j.status.as_str(),
                    j.project_id,
                    j.created_at.to_rfc3339()
                );
            }
        }
        JobAction::Get { id } => {
            let job = queue.status(&id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
    }
    Ok(())
}
