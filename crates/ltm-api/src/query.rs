//! Handlers for reading.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/retrieve` | `?query=<pattern>` plus optional `valid_at`, `transaction_at`, `valid_from`, `valid_to` |
//! | `GET`  | `/history/{id}` | Every version of every property, superseded ones included |
//! | `GET`  | `/spatial` | `?min_x&min_y&max_x&max_y` plus optional `valid_at`, `transaction_at` |
//!
//! Timestamps are RFC 3339 or bare `YYYY-MM-DD` dates.

use std::{str::FromStr, sync::Arc};

use axum::{
  Json,
  extract::{Path, Query, State, rejection::QueryRejection},
};
use ltm_core::{
  query::{Pattern, QueryOutcome, TemporalSelector},
  store::GraphStore,
  time::parse_optional,
  value::BoundingBox,
};
use ltm_engine::{EntityHistory, KnowledgeStore};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Deserialize)]
pub struct RetrieveParams {
  pub query:          String,
  pub valid_at:       Option<String>,
  pub transaction_at: Option<String>,
  pub valid_from:     Option<String>,
  pub valid_to:       Option<String>,
}

/// `GET /retrieve`
pub async fn retrieve<S>(
  State(engine): State<Arc<KnowledgeStore<S>>>,
  params: std::result::Result<Query<RetrieveParams>, QueryRejection>,
) -> Result<Json<QueryOutcome>>
where
  S: GraphStore + 'static,
{
  let Query(params) = params?;
  let pattern = Pattern::from_str(&params.query)?;
  let selector = TemporalSelector::from_params(
    parse_optional(params.valid_at.as_deref())?,
    parse_optional(params.transaction_at.as_deref())?,
    parse_optional(params.valid_from.as_deref())?,
    parse_optional(params.valid_to.as_deref())?,
  )?;
  Ok(Json(engine.retrieve(&pattern, selector).await?))
}

/// `GET /history/{id}`
pub async fn history<S>(
  State(engine): State<Arc<KnowledgeStore<S>>>,
  Path(id): Path<Uuid>,
) -> Result<Json<EntityHistory>>
where
  S: GraphStore + 'static,
{
  Ok(Json(engine.history(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SpatialParams {
  pub min_x:          f64,
  pub min_y:          f64,
  pub max_x:          f64,
  pub max_y:          f64,
  pub valid_at:       Option<String>,
  pub transaction_at: Option<String>,
}

/// `GET /spatial`
pub async fn spatial<S>(
  State(engine): State<Arc<KnowledgeStore<S>>>,
  params: std::result::Result<Query<SpatialParams>, QueryRejection>,
) -> Result<Json<QueryOutcome>>
where
  S: GraphStore + 'static,
{
  let Query(params) = params?;
  let selector = TemporalSelector::from_params(
    parse_optional(params.valid_at.as_deref())?,
    parse_optional(params.transaction_at.as_deref())?,
    None,
    None,
  )?;
  let bbox = BoundingBox {
    min_x: params.min_x,
    min_y: params.min_y,
    max_x: params.max_x,
    max_y: params.max_y,
  };
  Ok(Json(engine.spatial(bbox, selector).await?))
}
