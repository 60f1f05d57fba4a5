//! Handlers for identities, edges and events.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/entities` | Body: [`NewEntityBody`]; returns 201 + entity |
//! | `GET`  | `/entities/{id}` | Single entity |
//! | `POST` | `/edges` | Body: [`EdgeRecord`]; returns 201 + `{edge, receipt}` |
//! | `POST` | `/events` | Body: [`EventRecord`]; returns 201 + `{event, receipt}` |

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, State, rejection::JsonRejection},
  http::StatusCode,
  response::IntoResponse,
};
use ltm_core::{
  entity::{Entity, NewEntity},
  store::GraphStore,
};
use ltm_engine::{EdgeRecord, EventRecord, KnowledgeStore};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewEntityKind {
  #[default]
  Node,
  Event,
}

#[derive(Debug, Deserialize)]
pub struct NewEntityBody {
  #[serde(default)]
  pub kind:  NewEntityKind,
  pub label: String,
  pub key:   Option<String>,
}

impl From<NewEntityBody> for NewEntity {
  fn from(b: NewEntityBody) -> Self {
    let mut entity = match b.kind {
      NewEntityKind::Node => NewEntity::node(b.label),
      NewEntityKind::Event => NewEntity::event(b.label),
    };
    entity.key = b.key;
    entity
  }
}

/// `POST /entities`
pub async fn create<S>(
  State(engine): State<Arc<KnowledgeStore<S>>>,
  body: std::result::Result<Json<NewEntityBody>, JsonRejection>,
) -> Result<impl IntoResponse>
where
  S: GraphStore + 'static,
{
  let Json(body) = body?;
  let entity = engine.create_entity(body.into()).await?;
  Ok((StatusCode::CREATED, Json(entity)))
}

/// `GET /entities/{id}`
pub async fn get_one<S>(
  State(engine): State<Arc<KnowledgeStore<S>>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Entity>>
where
  S: GraphStore + 'static,
{
  Ok(Json(engine.entity(id).await?))
}

/// `POST /edges`
pub async fn create_edge<S>(
  State(engine): State<Arc<KnowledgeStore<S>>>,
  body: std::result::Result<Json<EdgeRecord>, JsonRejection>,
) -> Result<impl IntoResponse>
where
  S: GraphStore + 'static,
{
  let Json(body) = body?;
  let (edge, receipt) = engine.create_edge(body).await?;
  Ok((StatusCode::CREATED, Json(json!({ "edge": edge, "receipt": receipt }))))
}

/// `POST /events`
pub async fn record_event<S>(
  State(engine): State<Arc<KnowledgeStore<S>>>,
  body: std::result::Result<Json<EventRecord>, JsonRejection>,
) -> Result<impl IntoResponse>
where
  S: GraphStore + 'static,
{
  let Json(body) = body?;
  let (event, receipt) = engine.record_event(body).await?;
  Ok((StatusCode::CREATED, Json(json!({ "event": event, "receipt": receipt }))))
}
