//! Error types for `ltm-core`.
//!
//! This is the shared taxonomy: storage backends convert their own errors
//! into it, and the API layer maps it onto HTTP status codes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{time::ValidInterval, value::Value, version::TxId};

/// One existing version that an attempted append collided with.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictingVersion {
  pub version_id: Uuid,
  /// Effective valid-time interval at the latest transaction.
  pub interval:   ValidInterval,
  pub tx_id:      TxId,
  pub value:      Value,
}

/// Payload of [`Error::Conflict`]; actionable enough for an upstream
/// corrector to resubmit with an explicit override.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictDetail {
  pub entity_id: Uuid,
  pub property:  String,
  pub attempted: ValidInterval,
  pub existing:  Vec<ConflictingVersion>,
}

impl std::fmt::Display for ConflictDetail {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{}.{} interval {} overlaps",
      self.entity_id, self.property, self.attempted
    )?;
    for (i, v) in self.existing.iter().enumerate() {
      let sep = if i == 0 { " " } else { ", " };
      write!(f, "{sep}{} (version {}, tx {})", v.interval, v.version_id, v.tx_id)?;
    }
    Ok(())
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("conflict: {0}")]
  Conflict(Box<ConflictDetail>),

  #[error("entity not found: {0}")]
  EntityNotFound(Uuid),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("invalid interval: valid_from {from} is not before valid_to {to}")]
  InvalidInterval {
    from: DateTime<Utc>,
    to:   DateTime<Utc>,
  },

  #[error(
    "transaction time {attempted} precedes latest recorded transaction \
     {latest} for {entity_id}.{property}"
  )]
  NonMonotonicTransaction {
    entity_id: Uuid,
    property:  String,
    latest:    DateTime<Utc>,
    attempted: DateTime<Utc>,
  },

  /// The compare-and-append check failed: another writer moved the head of
  /// this property between planning and commit.
  #[error("stale head for {entity_id}.{property}: expected {expected:?}, found {found:?}")]
  StaleHead {
    entity_id: Uuid,
    property:  String,
    expected:  Option<TxId>,
    found:     Option<TxId>,
  },

  #[error("stable key {0:?} is already bound to another entity")]
  DuplicateKey(String),

  #[error("idempotency key {0:?} was already used with a different payload")]
  IdempotencyMismatch(String),

  #[error("idempotency key {0:?} was claimed by a concurrent write")]
  IdempotencyKeyTaken(String),

  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub fn bad_request(msg: impl Into<String>) -> Self {
    Self::BadRequest(msg.into())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
