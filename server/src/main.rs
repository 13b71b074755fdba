use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use search_core::catalog::MemoryCatalog;
use search_core::config::SearchConfig;
use search_core::snapshot::load_snapshot;
use search_server::{bootstrap, build_app, spawn_retention_task};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
struct Args {
    /// TOML config file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// Catalog snapshot (.json, .jsonl or a directory of them)
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SearchConfig::load(path)?,
        None => SearchConfig::default(),
    };
    let catalog = match &args.catalog {
        Some(path) => MemoryCatalog::from_snapshot(load_snapshot(path).context("load catalog snapshot")?),
        None => MemoryCatalog::new(),
    };
    tracing::info!(products = catalog.product_count(), "catalog loaded");
    let admin_token = std::env::var("ADMIN_TOKEN").ok();

    let state = bootstrap(config, catalog, admin_token).await?;
    if let Some(analytics) = state.analytics.clone() {
        spawn_retention_task(analytics, Duration::from_secs(3600));
    }
    let app: Router = build_app(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
