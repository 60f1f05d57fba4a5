//! Configuration and application assembly for the `ltm-server` binary.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use axum::Router;
use ltm_core::store::GraphStore;
use ltm_engine::{EngineConfig, KnowledgeStore};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime configuration, read from `ltm.toml` and `LTM__*` environment
/// variables (e.g. `LTM__SERVER__PORT=9000`). Every field has a default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub server: HttpConfig,
  pub store:  StoreConfig,
  pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub host: String,
  pub port: u16,
}

impl Default for HttpConfig {
  fn default() -> Self { Self { host: "127.0.0.1".to_string(), port: 8080 } }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
  #[default]
  Sqlite,
  Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub backend:    Backend,
  /// SQLite database file; a leading `~/` is expanded.
  pub path:       PathBuf,
  /// Upper bound on one storage call before it fails as unavailable.
  pub timeout_ms: u64,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      backend:    Backend::Sqlite,
      path:       PathBuf::from("ltm.db"),
      timeout_ms: 5_000,
    }
  }
}

impl StoreConfig {
  pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }

  pub fn expanded_path(&self) -> PathBuf { expand_tilde(&self.path) }
}

impl ServerConfig {
  /// Layer the optional TOML file at `path` under the environment.
  pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
    config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("LTM")
          .separator("__")
          .try_parsing(true),
      )
      .build()?
      .try_deserialize()
  }

  pub fn address(&self) -> String { format!("{}:{}", self.server.host, self.server.port) }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

// ─── Application ──────────────────────────────────────────────────────────────

/// The full HTTP application: the API under `/ltm`, with request tracing.
pub fn app<S>(engine: Arc<KnowledgeStore<S>>) -> Router
where
  S: GraphStore + 'static,
{
  Router::new()
    .nest("/ltm", ltm_api::api_router(engine))
    .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
  use std::io::Write as _;

  use axum::{
    body::Body,
    http::{Request, StatusCode},
  };
  use ltm_core::clock::SystemClock;
  use ltm_engine::MemoryStore;
  use tower::ServiceExt as _;

  use super::*;

  #[test]
  fn defaults_apply_without_a_file() {
    let cfg = ServerConfig::load(Path::new("/nonexistent/ltm.toml")).unwrap();
    assert_eq!(cfg.store.backend, Backend::Sqlite);
    assert_eq!(cfg.store.timeout(), Duration::from_secs(5));
    assert_eq!(cfg.engine, EngineConfig::default());
  }

  #[test]
  fn file_sections_override_defaults() {
    let dir = std::env::temp_dir().join(format!("ltm-server-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("ltm.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
      file,
      "[server]\nport = 9090\n\n[store]\nbackend = \"memory\"\ntimeout_ms = 250\n\n[engine]\nrange_index = false\ncache_threshold = 2\nindex_capacity = 64"
    )
    .unwrap();

    let cfg = ServerConfig::load(&path).unwrap();
    assert_eq!(cfg.address(), "127.0.0.1:9090");
    assert_eq!(cfg.store.backend, Backend::Memory);
    assert_eq!(cfg.store.timeout(), Duration::from_millis(250));
    assert!(!cfg.engine.range_index);
    assert_eq!(cfg.engine.cache_threshold, 2);
    assert_eq!(cfg.engine.index_capacity, 64);
    assert_eq!(cfg.engine.max_write_retries, 3);
    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn tilde_expands_to_home() {
    let store = StoreConfig { path: PathBuf::from("~/data/ltm.db"), ..StoreConfig::default() };
    if let Ok(home) = std::env::var("HOME") {
      assert_eq!(store.expanded_path(), PathBuf::from(home).join("data/ltm.db"));
    }
  }

  #[tokio::test]
  async fn api_is_mounted_under_ltm() {
    let engine = KnowledgeStore::open(MemoryStore::new(), Arc::new(SystemClock), EngineConfig::default())
      .await
      .unwrap();
    let app = app(Arc::new(engine));

    let req = Request::builder()
      .uri("/ltm/retrieve?query=key:nobody")
      .body(Body::empty())
      .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let req = Request::builder().uri("/retrieve").body(Body::empty()).unwrap();
    assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::NOT_FOUND);
  }
}
