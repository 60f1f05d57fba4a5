//! Handlers for writing facts.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `POST`   | `/ingest` | Body: [`IngestBody`]; returns 202 + receipt |
//! | `DELETE` | `/entity/{id}` | Logical delete; returns the closing transaction |

use std::{collections::BTreeMap, sync::Arc};

use axum::{
  Json,
  extract::{Path, State, rejection::JsonRejection},
  http::StatusCode,
  response::IntoResponse,
};
use chrono::{DateTime, Utc};
use ltm_core::{
  store::GraphStore,
  time::lenient,
  value::{Geometry, Value},
  version::{Provenance, TxId},
};
use ltm_engine::{FactRecord, KnowledgeStore, SubjectRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, Result};

// ─── Ingest ──────────────────────────────────────────────────────────────────

/// JSON body accepted by `POST /ingest`. Exactly one of `subject_key` and
/// `subject_id` must be given; `source_id` and `confidence` are required.
#[derive(Debug, Deserialize)]
pub struct IngestBody {
  pub subject_key:     Option<String>,
  pub subject_id:      Option<Uuid>,
  /// Label for a subject first seen through this fact.
  pub subject_label:   Option<String>,
  pub property:        String,
  pub value:           Value,
  #[serde(deserialize_with = "lenient::timestamp")]
  pub valid_from:      DateTime<Utc>,
  #[serde(default, deserialize_with = "lenient::optional")]
  pub valid_to:        Option<DateTime<Utc>>,
  pub source_id:       String,
  /// Within `0.0..=1.0`.
  pub confidence:      f32,
  #[serde(default)]
  pub metadata:        BTreeMap<String, serde_json::Value>,
  pub spatial:         Option<Geometry>,
  #[serde(default)]
  pub correction:      bool,
  pub idempotency_key: Option<String>,
}

impl TryFrom<IngestBody> for FactRecord {
  type Error = ApiError;

  fn try_from(b: IngestBody) -> Result<Self> {
    let subject = match (b.subject_key, b.subject_id) {
      (Some(key), None) => SubjectRef::Key(key),
      (None, Some(id)) => SubjectRef::Id(id),
      _ => {
        return Err(ApiError::BadRequest(
          "exactly one of subject_key and subject_id is required".into(),
        ));
      }
    };
    let provenance = Provenance {
      source_id:  Some(b.source_id),
      confidence: b.confidence,
      metadata:   b.metadata,
    };
    provenance.validate()?;
    Ok(FactRecord {
      subject,
      subject_label: b.subject_label,
      property: b.property,
      value: b.value,
      valid_from: b.valid_from,
      valid_to: b.valid_to,
      provenance,
      spatial: b.spatial,
      correction: b.correction,
      idempotency_key: b.idempotency_key,
    })
  }
}

/// `POST /ingest`: 202 + [`TxReceipt`](ltm_core::store::TxReceipt).
pub async fn ingest<S>(
  State(engine): State<Arc<KnowledgeStore<S>>>,
  body: std::result::Result<Json<IngestBody>, JsonRejection>,
) -> Result<impl IntoResponse>
where
  S: GraphStore + 'static,
{
  let Json(body) = body?;
  let receipt = engine.ingest(FactRecord::try_from(body)?).await?;
  Ok((StatusCode::ACCEPTED, Json(receipt)))
}

// ─── Delete ──────────────────────────────────────────────────────────────────

/// `tx_id` and `tx_timestamp` are null when nothing was left to close and
/// no transaction was recorded.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
  pub tx_id:        Option<TxId>,
  pub tx_timestamp: Option<DateTime<Utc>>,
  /// Versions closed by the delete, incident edges included.
  pub closed:       usize,
}

/// `DELETE /entity/{id}`
pub async fn delete_entity<S>(
  State(engine): State<Arc<KnowledgeStore<S>>>,
  Path(id): Path<Uuid>,
) -> Result<Json<DeleteResponse>>
where
  S: GraphStore + 'static,
{
  let receipt = engine.logical_delete(id).await?;
  Ok(Json(DeleteResponse {
    tx_id:        receipt.as_ref().map(|r| r.tx_id),
    tx_timestamp: receipt.as_ref().map(|r| r.tx_timestamp),
    closed:       receipt.map_or(0, |r| r.closed),
  }))
}
