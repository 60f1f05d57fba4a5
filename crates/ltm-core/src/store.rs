//! The `GraphStore` trait and the write batch it commits.
//!
//! The trait is implemented by storage backends (`ltm-store-sqlite`, and the
//! in-process store in `ltm-engine`). It is deliberately dumb: backends hold
//! identities, append records and closures, and enforce compare-and-append
//! on per-property heads. Versioning rules live in
//! [`crate::history::PropertyHistory`]; indexing and caching live in the
//! engine.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
  entity::{Entity, NewEntity, PropertyKey},
  history::{AppendPlan, PropertyHistory},
  version::{TxId, TxStamp},
};

// ─── Write batch ─────────────────────────────────────────────────────────────

/// What a successful write reports back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
  pub tx_id:        TxId,
  pub tx_timestamp: DateTime<Utc>,
  pub entity_id:    Uuid,
  /// Versions asserted by this transaction (remainders excluded).
  pub version_ids:  Vec<Uuid>,
  /// Number of closures written.
  #[serde(default)]
  pub closed:       usize,
  /// `true` when an idempotency key matched an earlier write and nothing
  /// new was recorded.
  #[serde(default)]
  pub deduplicated: bool,
}

/// A caller-supplied deduplication key bound to the write it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
  pub key:         String,
  /// SHA-256 over the canonical JSON of the original payload.
  pub fingerprint: String,
  pub receipt:     TxReceipt,
}

/// Everything one transaction appends. Backends apply it all or nothing.
#[derive(Debug, Clone)]
pub struct WriteBatch {
  pub stamp:       TxStamp,
  pub plans:       Vec<AppendPlan>,
  pub idempotency: Option<IdempotencyEntry>,
}

/// Hex SHA-256 of a payload's canonical JSON form.
pub fn payload_fingerprint<T: Serialize>(payload: &T) -> crate::Result<String> {
  let canonical = serde_json::to_vec(&serde_json::to_value(payload)?)?;
  Ok(hex::encode(Sha256::digest(&canonical)))
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a bitemporal graph storage backend.
///
/// Nothing is ever updated or deleted. [`GraphStore::commit`] must apply a
/// batch atomically, and must refuse it with
/// [`crate::Error::StaleHead`] if any plan's `expected_head` no longer
/// matches the property's latest transaction.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes (e.g. tokio with `axum`).
pub trait GraphStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static + Into<crate::Error>;

  // ── Identities ────────────────────────────────────────────────────────

  /// Allocate a new identity. Fails with [`crate::Error::DuplicateKey`] if
  /// the stable key is already bound.
  fn create_entity(
    &self,
    input: NewEntity,
  ) -> impl Future<Output = Result<Entity, Self::Error>> + Send + '_;

  fn get_entity(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Entity>, Self::Error>> + Send + '_;

  /// Exact-match resolution of a stable key.
  fn find_by_key(
    &self,
    key: String,
  ) -> impl Future<Output = Result<Option<Entity>, Self::Error>> + Send + '_;

  /// All identities, optionally restricted to one label.
  fn list_entities(
    &self,
    label: Option<String>,
  ) -> impl Future<Output = Result<Vec<Entity>, Self::Error>> + Send + '_;

  /// Edges whose source or target is `entity_id`.
  fn incident_edges(
    &self,
    entity_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Entity>, Self::Error>> + Send + '_;

  // ── Versions ──────────────────────────────────────────────────────────

  /// Names of every property with at least one recorded version.
  fn property_names(
    &self,
    entity_id: Uuid,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + '_;

  /// Everything recorded for one property, including superseded records.
  fn load_history(
    &self,
    key: PropertyKey,
  ) -> impl Future<Output = Result<PropertyHistory, Self::Error>> + Send + '_;

  /// Append a batch atomically after checking every plan's head.
  fn commit(
    &self,
    batch: WriteBatch,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// The latest transaction ever committed; seeds the transaction clock.
  fn latest_stamp(
    &self,
  ) -> impl Future<Output = Result<Option<TxStamp>, Self::Error>> + Send + '_;

  fn find_idempotency(
    &self,
    key: String,
  ) -> impl Future<Output = Result<Option<IdempotencyEntry>, Self::Error>> + Send + '_;
}
