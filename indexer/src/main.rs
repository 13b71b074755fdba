use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use search_core::analytics::ClientMeta;
use search_core::catalog::MemoryCatalog;
use search_core::config::SearchConfig;
use search_core::planner::{QueryPlanner, SearchRequest};
use search_core::snapshot::load_snapshot;
use search_core::sync::SyncEngine;
use search_core::{Index, IndexStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "catalog-indexer")]
#[command(about = "Build and maintain the catalog search index offline", long_about = None)]
struct Cli {
    /// TOML config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the index from a catalog snapshot (file or directory)
    Build {
        #[arg(long)]
        catalog: PathBuf,
        /// Index directory; overrides the config value
        #[arg(long)]
        index: Option<PathBuf>,
    },
    /// Merge segments and compact storage
    Optimize {
        #[arg(long)]
        index: Option<PathBuf>,
    },
    /// Print index statistics as JSON
    Stats {
        #[arg(long)]
        index: Option<PathBuf>,
    },
    /// Run one product search against a built index
    Query {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        index: Option<PathBuf>,
        #[arg(long)]
        q: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => SearchConfig::load(path)?,
        None => SearchConfig::default(),
    };

    match cli.command {
        Commands::Build { catalog, index } => {
            override_path(&mut config, index);
            build(config, catalog).await
        }
        Commands::Optimize { index } => {
            override_path(&mut config, index);
            let store = open_index(&config)?;
            let started = Instant::now();
            store.optimize()?;
            info!(elapsed_ms = started.elapsed().as_millis() as u64, "index optimized");
            Ok(())
        }
        Commands::Stats { index } => {
            override_path(&mut config, index);
            let store = open_index(&config)?;
            println!("{}", serde_json::to_string_pretty(&store.stats()?)?);
            Ok(())
        }
        Commands::Query { catalog, index, q, limit } => {
            override_path(&mut config, index);
            query(config, catalog, q, limit).await
        }
    }
}

fn override_path(config: &mut SearchConfig, index: Option<PathBuf>) {
    if let Some(path) = index {
        config.index.path = path;
    }
}

fn open_index(config: &SearchConfig) -> Result<IndexStore> {
    IndexStore::open(&config.index, config.ranking.clone(), config.highlight.clone())
        .with_context(|| format!("open index at {}", config.index.path.display()))
}

async fn build(config: SearchConfig, catalog: PathBuf) -> Result<()> {
    let started = Instant::now();
    let snapshot = load_snapshot(&catalog).context("load catalog snapshot")?;
    let catalog = Arc::new(MemoryCatalog::from_snapshot(snapshot));
    let index = Arc::new(open_index(&config)?);
    let engine = SyncEngine::new(index.clone(), catalog, config.sync.clone());

    let report = engine.rebuild_from_catalog().await?;
    index.optimize()?;
    let stats = index.stats()?;
    let finished = OffsetDateTime::now_utc().format(&Rfc3339)?;
    info!(
        scanned = report.scanned,
        indexed = report.indexed,
        segments = stats.segments,
        size_bytes = stats.size_bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        finished = %finished,
        "index built at {}",
        config.index.path.display()
    );
    Ok(())
}

async fn query(config: SearchConfig, catalog: PathBuf, q: String, limit: usize) -> Result<()> {
    let catalog = Arc::new(MemoryCatalog::from_snapshot(load_snapshot(&catalog)?));
    let index = Arc::new(open_index(&config)?);
    let planner = QueryPlanner::new(index, catalog, None, config);
    let request = SearchRequest { q: Some(q), limit: Some(limit), ..Default::default() };
    let response = planner.search_products(request, ClientMeta::default()).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
