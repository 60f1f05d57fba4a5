//! `ltm-server`: serves the long-term memory store over HTTP.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use ltm_core::{clock::SystemClock, store::GraphStore};
use ltm_engine::{KnowledgeStore, MemoryStore};
use ltm_server::{Backend, ServerConfig};
use ltm_store_sqlite::SqliteStore;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

#[derive(Parser)]
#[command(author, version, about = "Bitemporal long-term memory server")]
struct Cli {
  /// Path to the config file.
  #[arg(short, long, default_value = "ltm.toml")]
  config: PathBuf,

  /// Override the configured port.
  #[arg(short, long)]
  port: Option<u16>,

  /// Keep everything in memory, ignoring the configured store.
  #[arg(long)]
  memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let mut cfg = ServerConfig::load(&cli.config)
    .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
  if let Some(port) = cli.port {
    cfg.server.port = port;
  }
  if cli.memory {
    cfg.store.backend = Backend::Memory;
  }

  match cfg.store.backend {
    Backend::Sqlite => {
      let path = cfg.store.expanded_path();
      if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
          .with_context(|| format!("failed to create {}", parent.display()))?;
      }
      let store = SqliteStore::open_with_timeout(&path, cfg.store.timeout())
        .await
        .with_context(|| format!("failed to open store at {}", path.display()))?;
      tracing::info!(path = %path.display(), "using sqlite store");
      serve(store, cfg).await
    }
    Backend::Memory => {
      tracing::warn!("using in-memory store; nothing will be persisted");
      serve(MemoryStore::new(), cfg).await
    }
  }
}

async fn serve<S>(store: S, cfg: ServerConfig) -> Result<()>
where
  S: GraphStore + 'static,
{
  let engine = KnowledgeStore::open(store, Arc::new(SystemClock), cfg.engine.clone())
    .await
    .context("failed to open knowledge store")?;
  let app = ltm_server::app(Arc::new(engine));

  let addr = cfg.address();
  let listener = tokio::net::TcpListener::bind(&addr)
    .await
    .with_context(|| format!("failed to bind {addr}"))?;

  tracing::info!("ltm-server listening on {addr}");
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown())
    .await
    .context("server error")?;

  tracing::info!("ltm-server stopped");
  Ok(())
}

async fn shutdown() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!("failed to listen for shutdown signal: {e}");
  }
}
