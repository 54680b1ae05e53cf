//! # Semandex CLI (`sdx`)
//!
//! The `sdx` binary drives the Semandex indexing pipeline and retrieval
//! services from the command line.
//!
//! ## Usage
//!
//! ```bash
//! sdx --config ./sdx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sdx init` | Create the SQLite database and run schema migrations |
//! | `sdx index` | Run the ingestion pipeline over the content root |
//! | `sdx stop` | Cooperatively stop an active pipeline run |
//! | `sdx status` | Show pipeline state and index statistics |
//! | `sdx search "<query>"` | Semantic search over indexed chunks |
//! | `sdx similar <content-id>` | Find content similar to one document |
//! | `sdx stats` | Print index statistics |
//! | `sdx serve` | Start the JSON HTTP server |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use semandex::config;
use semandex::content::{FsContentSource, RunScope};
use semandex::db;
use semandex::embedding::create_provider;
use semandex::index::SqliteVectorIndex;
use semandex::migrate;
use semandex::models::SearchFilters;
use semandex::pipeline::{self, Orchestrator, PipelineState, StartOptions};
use semandex::retrieval::RetrievalService;
use semandex::server;
use semandex::state::StateStore;
use semandex::stats;

/// Semandex CLI — a local-first semantic indexing and retrieval engine.
#[derive(Parser)]
#[command(
    name = "sdx",
    about = "Semandex — a local-first semantic indexing and retrieval engine",
    version,
    long_about = "Semandex ingests text content through a phase-ordered, resumable pipeline \
    (chunking, embedding, vector indexing) and serves semantic search via a CLI and JSON HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./sdx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Run the ingestion pipeline.
    ///
    /// Builds documents from the content root, chunks and embeds them,
    /// and finalizes the vector index. Interrupted runs resume where
    /// they left off; unchanged content is skipped.
    Index {
        /// Reprocess items even when their content is unchanged.
        #[arg(long)]
        force: bool,

        /// Restrict the run to one content type (e.g. `markdown`).
        #[arg(long = "type")]
        content_type: Option<String>,

        /// Restrict the run to a single content id.
        #[arg(long)]
        id: Option<String>,
    },

    /// Stop an active pipeline run.
    ///
    /// Cancels all queued batches; the batch currently executing
    /// finishes its unit of work. Completed work is kept.
    Stop,

    /// Show pipeline state and index statistics.
    Status,

    /// Semantic search over indexed chunks.
    Search {
        /// The search query text.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        top_k: Option<usize>,

        /// Filter results to one content type (e.g. `markdown`).
        #[arg(long = "type")]
        content_type: Option<String>,

        /// Only return documents updated on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Print the full response as JSON instead of formatted text.
        #[arg(long)]
        json: bool,
    },

    /// Find content similar to one indexed document.
    Similar {
        /// Content id of the source document.
        content_id: String,

        /// Maximum number of results to return.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Print index statistics.
    Stats,

    /// Start the JSON HTTP server.
    ///
    /// Binds to the address configured in `[server].bind` and serves
    /// search, similarity, status, and pipeline control endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index {
            force,
            content_type,
            id,
        } => {
            run_index(&cfg, force, content_type, id).await?;
        }
        Commands::Stop => {
            let pool = db::connect(&cfg).await?;
            if pipeline::stop_run(&pool).await? {
                println!("Pipeline stopped. Completed work is kept.");
            } else {
                println!("No active pipeline run.");
            }
        }
        Commands::Status => {
            run_status(&cfg).await?;
        }
        Commands::Search {
            query,
            top_k,
            content_type,
            since,
            json,
        } => {
            run_search(&cfg, &query, top_k, content_type, since, json).await?;
        }
        Commands::Similar { content_id, top_k } => {
            run_similar(&cfg, &content_id, top_k).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_index(
    cfg: &config::Config,
    force: bool,
    content_type: Option<String>,
    id: Option<String>,
) -> anyhow::Result<()> {
    if content_type.is_some() && id.is_some() {
        anyhow::bail!("--type and --id are mutually exclusive");
    }
    let scope = match (content_type, id) {
        (Some(content_type), None) => RunScope::ContentType { content_type },
        (None, Some(content_id)) => RunScope::Item { content_id },
        _ => RunScope::All,
    };

    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;

    let source = Arc::new(FsContentSource::new(&cfg.content)?);
    let provider = create_provider(&cfg.embedding)?;
    let index = Arc::new(SqliteVectorIndex::new(
        pool.clone(),
        cfg.retrieval.scan_limit,
    ));
    let orchestrator = Orchestrator::new(
        pool.clone(),
        source,
        provider,
        index,
        cfg.chunking.clone(),
        cfg.pipeline.clone(),
    );

    let started = orchestrator
        .start(StartOptions { scope, force })
        .await
        .context("failed to start pipeline run")?;
    println!(
        "Pipeline run {} started ({} items).",
        started.run_id, started.overall.total
    );

    orchestrator.run_worker_until_idle().await?;

    match orchestrator.status().await? {
        Some(state) => print_pipeline_state(&state),
        None => println!("Pipeline state unavailable."),
    }
    Ok(())
}

async fn run_status(cfg: &config::Config) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let store = StateStore::new(pool.clone());
    match store.get::<PipelineState>(pipeline::STATE_KEY).await? {
        Some(versioned) => print_pipeline_state(&versioned.value),
        None => println!("Pipeline: never run."),
    }
    println!();

    let index_stats = stats::gather_stats(&pool).await?;
    println!("Documents: {}", index_stats.documents);
    for entry in &index_stats.by_status {
        println!("  {:<10} {}", entry.status, entry.count);
    }
    println!("Chunks:    {}", index_stats.chunks);
    println!(
        "Embedded:  {} / {} ({}%)",
        index_stats.vectors, index_stats.chunks, index_stats.embedded_pct
    );
    Ok(())
}

fn print_pipeline_state(state: &PipelineState) {
    println!(
        "Pipeline: {:?} (run {})",
        state.status, state.run_id
    );
    println!(
        "  Phase:    {} ({}/{} done, {} failed, {} skipped)",
        state.current_phase.as_str(),
        state.phase.completed,
        state.phase.total,
        state.phase.failed,
        state.phase.skipped
    );
    println!(
        "  Overall:  {:.0}% ({} completed, {} failed, {} skipped)",
        state.overall.percentage(),
        state.overall.completed,
        state.overall.failed,
        state.overall.skipped
    );
    if let Some(ref err) = state.last_error {
        println!("  Last error: {}", err);
    }
}

async fn run_search(
    cfg: &config::Config,
    query: &str,
    top_k: Option<usize>,
    content_type: Option<String>,
    since: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let filters = SearchFilters {
        content_type,
        date_after: since.map(|s| parse_date(&s)).transpose()?,
        ..Default::default()
    };

    let service = retrieval_service(cfg).await?;
    let response = service.search(query, top_k, &filters).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if response.results.is_empty() {
        println!("No results.");
    }
    for (rank, item) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.4}] {} #{}",
            rank + 1,
            item.score,
            item.content_id,
            item.anchor
        );
        if !item.heading_path.is_empty() {
            println!("   {}", item.heading_path.join(" > "));
        }
        println!("   {}", snippet(&item.text, 200));
    }
    println!(
        "\n{} results, {} candidates scanned, {} ms",
        response.results.len(),
        response.total_scanned,
        response.query_time_ms
    );
    Ok(())
}

async fn run_similar(
    cfg: &config::Config,
    content_id: &str,
    top_k: Option<usize>,
) -> anyhow::Result<()> {
    let service = retrieval_service(cfg).await?;
    let Some(response) = service
        .find_similar(content_id, top_k, &SearchFilters::default())
        .await?
    else {
        anyhow::bail!("no indexed vectors for content id: {}", content_id);
    };

    for (rank, item) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.4}] {} — {}",
            rank + 1,
            item.score,
            item.content_id,
            item.title.as_deref().unwrap_or("(untitled)")
        );
    }
    Ok(())
}

async fn retrieval_service(cfg: &config::Config) -> anyhow::Result<RetrievalService> {
    let pool = db::connect(cfg).await?;
    let provider = create_provider(&cfg.embedding)?;
    let index = Arc::new(SqliteVectorIndex::new(
        pool.clone(),
        cfg.retrieval.scan_limit,
    ));
    Ok(RetrievalService::new(
        pool,
        provider,
        index,
        cfg.retrieval.clone(),
    ))
}

/// Parse a YYYY-MM-DD date into a Unix timestamp at midnight UTC.
fn parse_date(s: &str) -> anyhow::Result<i64> {
    let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .context("invalid time of day")?;
    Ok(midnight.and_utc().timestamp())
}

/// First `max` characters of a chunk, flattened to one line.
fn snippet(text: &str, max: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max) {
        Some((pos, _)) => format!("{}…", &flat[..pos]),
        None => flat,
    }
}
