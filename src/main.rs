//! # Quarry CLI (`qry`)
//!
//! The `qry` binary is the primary interface for Quarry. It provides
//! commands for indexing a workspace, re-indexing single files,
//! semantic search, supervised-service control, and corpus statistics.
//!
//! ## Usage
//!
//! ```bash
//! qry --config ./quarry.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qry index` | Select, embed, and store chunks for the whole workspace |
//! | `qry reindex <file>` | Re-index a single file (the editor-save path) |
//! | `qry search "<query>"` | Ranked semantic search over the corpus |
//! | `qry service start` | Run the inference service in the foreground |
//! | `qry service status` | Probe the service recorded by a previous start |
//! | `qry service stop` | Terminate a service left running by `start` |
//! | `qry stats` | Corpus statistics |
//!
//! ## Examples
//!
//! ```bash
//! # Full re-index, skipping generated code
//! qry index --exclude "**/gen/**,**/*.min.js"
//!
//! # Search only the src tree
//! qry search "retry with backoff" --include "src/**"
//!
//! # Rank on the service instead of locally
//! qry search "retry with backoff" --remote
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use quarry::config::{load_config, Config};
use quarry::embed::{self, EmbeddingBackend, HttpEmbedClient, ServiceBackend};
use quarry::indexer::{IndexSummary, Indexer};
use quarry::progress::ProgressMode;
use quarry::search::{search_corpus, SearchOptions};
use quarry::service::{self, ServiceSupervisor};
use quarry::stats::print_stats;
use quarry::store::CorpusStore;

/// Quarry — a local-first semantic code search engine.
///
/// All commands accept a `--config` flag pointing to a TOML
/// configuration file; a missing file falls back to built-in defaults.
#[derive(Parser)]
#[command(
    name = "qry",
    about = "Quarry — a local-first semantic code search engine",
    version,
    long_about = "Quarry indexes a source tree into fingerprinted chunks, embeds them through a \
    supervised local inference service, and answers natural-language queries by cosine \
    similarity with relevance windowing and dedup."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./quarry.toml")]
    config: PathBuf,

    /// Progress output: auto, off, human, or json.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Index the whole workspace.
    ///
    /// Selects chunks for every matching file, embeds anything not
    /// covered by the fingerprint cache, and replaces the corpus
    /// snapshot. Safe to re-run: unchanged code is never re-embedded.
    Index {
        /// Comma-separated glob patterns to exclude from this run.
        #[arg(long)]
        exclude: Option<String>,

        /// Discard the existing snapshot and regenerate every embedding.
        #[arg(long)]
        full: bool,
    },

    /// Re-index a single file.
    ///
    /// The path the host editor calls on save. A newer save of the same
    /// file supersedes an in-flight one at merge time.
    Reindex {
        /// File to re-index (workspace-relative or absolute).
        file: PathBuf,
    },

    /// Search indexed chunks.
    Search {
        /// The natural-language query.
        query: String,

        /// Comma-separated glob patterns a file must match.
        #[arg(long)]
        include: Option<String>,

        /// Comma-separated glob patterns that exclude a file.
        #[arg(long)]
        exclude: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum cosine similarity.
        #[arg(long)]
        threshold: Option<f32>,

        /// Rank on the inference service (`POST /search`) instead of
        /// locally.
        #[arg(long)]
        remote: bool,
    },

    /// Control the supervised inference service.
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },

    /// Show corpus statistics.
    Stats,
}

#[derive(Subcommand)]
enum ServiceAction {
    /// Start the service and keep it running until Ctrl-C.
    Start,
    /// Terminate a service started by a previous invocation.
    Stop,
    /// Report whether a previously started service answers its health
    /// check.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        Config::default()
    };

    let progress = match cli.progress.as_str() {
        "off" => ProgressMode::Off,
        "human" => ProgressMode::Human,
        "json" => ProgressMode::Json,
        _ => ProgressMode::default_for_tty(),
    };

    match cli.command {
        Commands::Index { exclude, full } => run_index(config, exclude, full, progress).await,
        Commands::Reindex { file } => run_reindex(config, file).await,
        Commands::Search {
            query,
            include,
            exclude,
            limit,
            threshold,
            remote,
        } => run_search(config, query, include, exclude, limit, threshold, remote).await,
        Commands::Service { action } => run_service(config, action).await,
        Commands::Stats => {
            let store = CorpusStore::load(&config.store.path);
            print_stats(&config, &store);
            Ok(())
        }
    }
}

/// Backend selection: reuse a service recorded by `qry service start`
/// when it still answers its health check, otherwise supervise a fresh
/// process for the duration of this invocation.
async fn select_backend(
    config: &Config,
) -> (Arc<dyn EmbeddingBackend>, Option<Arc<ServiceSupervisor>>) {
    if let Some(url) = running_service_url(config).await {
        let client: Arc<dyn EmbeddingBackend> =
            Arc::new(HttpEmbedClient::new(url, config.embedding.timeout_secs));
        return (client, None);
    }

    let supervisor = Arc::new(ServiceSupervisor::new(config.service.clone()));
    let backend: Arc<dyn EmbeddingBackend> = Arc::new(ServiceBackend::new(
        Arc::clone(&supervisor),
        config.embedding.timeout_secs,
    ));
    (backend, Some(supervisor))
}

async fn running_service_url(config: &Config) -> Option<String> {
    let handle = service::read_handle(&config.service.state_dir)?;
    let url = format!("http://127.0.0.1:{}", handle.port);
    let healthy = reqwest::Client::new()
        .get(format!("{}/healthz", url))
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false);
    healthy.then_some(url)
}

async fn run_index(
    config: Config,
    exclude: Option<String>,
    full: bool,
    progress: ProgressMode,
) -> Result<()> {
    let store = if full {
        Arc::new(CorpusStore::new())
    } else {
        Arc::new(CorpusStore::load(&config.store.path))
    };

    let (backend, supervisor) = select_backend(&config).await;
    let mut indexer = Indexer::new(config, Arc::clone(&store), backend)?;
    if let Some(supervisor) = &supervisor {
        indexer = indexer.with_supervisor(Arc::clone(supervisor));
    }

    let reporter = progress.reporter();
    let result = indexer.index_workspace(exclude.as_deref(), reporter.as_ref()).await;

    // The service was spawned for this run; take it down either way.
    if let Some(supervisor) = supervisor {
        supervisor.stop().await;
    }

    print_summary("index", &result?);
    Ok(())
}

async fn run_reindex(config: Config, file: PathBuf) -> Result<()> {
    let store = Arc::new(CorpusStore::load(&config.store.path));
    let root = config.indexing.root.clone();
    let path = if file.is_absolute() {
        file
    } else {
        root.join(file)
    };

    let (backend, supervisor) = select_backend(&config).await;
    let mut indexer = Indexer::new(config, store, backend)?;
    if let Some(supervisor) = &supervisor {
        indexer = indexer.with_supervisor(Arc::clone(supervisor));
    }

    let result = indexer.reindex_file(&path).await;

    if let Some(supervisor) = supervisor {
        supervisor.stop().await;
    }

    print_summary("reindex", &result?);
    Ok(())
}

async fn run_search(
    config: Config,
    query: String,
    include: Option<String>,
    exclude: Option<String>,
    limit: Option<usize>,
    threshold: Option<f32>,
    remote: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let mut options = SearchOptions::from_config(&config.search);
    options.include_pattern = include;
    options.exclude_pattern = exclude;
    if let Some(limit) = limit {
        options.max_results = limit;
    }
    if let Some(threshold) = threshold {
        options.similarity_threshold = threshold;
    }

    let results = if remote {
        let (_, supervisor) = select_backend(&config).await;
        let url = match &supervisor {
            Some(supervisor) => {
                let state = supervisor.start().await?;
                state
                    .base_url()
                    .ok_or_else(|| anyhow::anyhow!("service ready without a bound port"))?
            }
            None => running_service_url(&config)
                .await
                .ok_or_else(|| anyhow::anyhow!("no running service"))?,
        };

        let client = HttpEmbedClient::new(url, config.embedding.timeout_secs);
        let results = client
            .search_remote(
                &query,
                options.max_results,
                options.similarity_threshold,
                options.include_pattern.as_deref(),
                options.exclude_pattern.as_deref(),
            )
            .await;

        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
        results?
    } else {
        let store = CorpusStore::load(&config.store.path);
        let (backend, supervisor) = select_backend(&config).await;
        let query_vec = embed::embed_query(backend, &query).await;

        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }

        search_corpus(&query_vec?, &store.snapshot_chunks(), &options)
    };

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}:{}-{} {}",
            i + 1,
            result.score,
            result.file_path,
            result.line_start,
            result.line_end,
            result.name,
        );
        println!(
            "    excerpt: \"{}\"",
            result.snippet.replace('\n', " ").trim()
        );
        println!();
    }

    Ok(())
}

async fn run_service(config: Config, action: ServiceAction) -> Result<()> {
    match action {
        ServiceAction::Start => {
            let supervisor = ServiceSupervisor::new(config.service.clone());
            let state = supervisor.start().await?;
            println!("service {}", state.status);
            if let Some(port) = state.port {
                println!("  port: {}", port);
            }
            if let Some(pid) = state.pid {
                println!("  pid: {}", pid);
            }
            if state.degraded {
                println!("  degraded: health check never passed");
            }
            println!("  press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            supervisor.stop().await;
            println!("service stopped");
        }
        ServiceAction::Stop => match service::stop_external(&config.service.state_dir).await {
            Some(handle) => println!("service stopped (pid {})", handle.pid),
            None => println!("service not running"),
        },
        ServiceAction::Status => match running_service_url(&config).await {
            Some(url) => println!("service ready at {}", url),
            None => println!("service not running"),
        },
    }
    Ok(())
}

fn print_summary(operation: &str, summary: &IndexSummary) {
    println!("{}", operation);
    println!("  files scanned: {}", summary.files_scanned);
    println!("  files indexed: {}", summary.files_indexed);
    println!("  files failed: {}", summary.files_failed);
    println!("  chunks selected: {}", summary.chunks_selected);
    println!("  cache hits: {}", summary.cache_hits);
    println!("  duplicate reuse: {}", summary.dedup_hits);
    println!("  embedded: {}", summary.chunks_embedded);
    println!("ok");
}
