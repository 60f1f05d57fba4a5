//! Property version records, the atomic unit of the model.
//!
//! A record is immutable once written. A "change" appends a new record and,
//! where needed, a [`Closure`] against an older one; closures are themselves
//! append-only and carry their own transaction stamp, so the state of any
//! record can be recomputed as of any transaction time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result, time::ValidInterval, value::Value};

// ─── Transaction time ────────────────────────────────────────────────────────

/// Monotonic, unique transaction identifier.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TxId(pub u64);

impl std::fmt::Display for TxId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "tx-{}", self.0)
  }
}

/// A system-assigned point in transaction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxStamp {
  pub tx_id:        TxId,
  pub tx_timestamp: DateTime<Utc>,
}

// ─── Provenance ──────────────────────────────────────────────────────────────

/// Caller-supplied provenance for a write. Missing fields take their
/// defaults (no source, full confidence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Provenance {
  pub source_id:  Option<String>,
  pub confidence: f32,
  pub metadata:   BTreeMap<String, serde_json::Value>,
}

impl Default for Provenance {
  fn default() -> Self {
    Self { source_id: None, confidence: 1.0, metadata: BTreeMap::new() }
  }
}

impl Provenance {
  pub fn from_source(source_id: impl Into<String>, confidence: f32) -> Self {
    Self {
      source_id: Some(source_id.into()),
      confidence,
      metadata: BTreeMap::new(),
    }
  }

  pub fn validate(&self) -> Result<()> {
    if !(0.0..=1.0).contains(&self.confidence) {
      return Err(Error::bad_request(format!(
        "confidence must be within [0, 1], got {}",
        self.confidence
      )));
    }
    Ok(())
  }
}

/// The transaction block embedded in every version record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
  pub tx_id:        TxId,
  /// When the system recorded this version.
  pub tx_timestamp: DateTime<Utc>,
  pub source_id:    Option<String>,
  pub confidence:   f32,
  #[serde(default)]
  pub metadata:     BTreeMap<String, serde_json::Value>,
}

impl Transaction {
  pub fn new(stamp: TxStamp, provenance: Provenance) -> Self {
    Self {
      tx_id:        stamp.tx_id,
      tx_timestamp: stamp.tx_timestamp,
      source_id:    provenance.source_id,
      confidence:   provenance.confidence,
      metadata:     provenance.metadata,
    }
  }

  pub fn stamp(&self) -> TxStamp {
    TxStamp { tx_id: self.tx_id, tx_timestamp: self.tx_timestamp }
  }
}

// ─── Version record ──────────────────────────────────────────────────────────

/// One immutable version of one property of one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
  pub version_id:   Uuid,
  pub entity_id:    Uuid,
  pub property:     String,
  pub value:        Value,
  /// The interval as asserted; later closures may shorten it, never this
  /// field.
  #[serde(flatten)]
  pub interval:     ValidInterval,
  pub transaction:  Transaction,
  /// Set on remainder records re-appended when a correction only partly
  /// covers an older version.
  pub derived_from: Option<Uuid>,
}

// ─── Closures ────────────────────────────────────────────────────────────────

/// What a closure does to the version it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClosureKind {
  /// A later open-ended successor ends this version's validity.
  Truncated { valid_to: DateTime<Utc> },
  /// A correction withdraws this version entirely.
  Replaced,
  /// A logical delete ends this version's validity.
  Deleted { valid_to: DateTime<Utc> },
}

/// An append-only lifecycle entry against one version record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
  pub closure_id:   Uuid,
  pub version_id:   Uuid,
  #[serde(flatten)]
  pub kind:         ClosureKind,
  /// The version whose arrival caused this closure, if any.
  pub caused_by:    Option<Uuid>,
  pub tx_id:        TxId,
  pub tx_timestamp: DateTime<Utc>,
}

impl Closure {
  pub fn new(
    version_id: Uuid,
    kind: ClosureKind,
    caused_by: Option<Uuid>,
    stamp: TxStamp,
  ) -> Self {
    Self {
      closure_id: Uuid::new_v4(),
      version_id,
      kind,
      caused_by,
      tx_id: stamp.tx_id,
      tx_timestamp: stamp.tx_timestamp,
    }
  }

  pub fn stamp(&self) -> TxStamp {
    TxStamp { tx_id: self.tx_id, tx_timestamp: self.tx_timestamp }
  }
}

// ─── Resolved state ──────────────────────────────────────────────────────────

/// The lifecycle state of a version as of some transaction time, computed
/// from the closures visible at that time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VersionState {
  Open,
  Closed {
    valid_to: DateTime<Utc>,
    by:       Option<Uuid>,
    at:       DateTime<Utc>,
  },
  Superseded {
    by: Option<Uuid>,
    at: DateTime<Utc>,
  },
  LogicallyDeleted {
    valid_to: DateTime<Utc>,
    at:       DateTime<Utc>,
  },
}

impl VersionState {
  pub fn is_superseded(&self) -> bool { matches!(self, Self::Superseded { .. }) }
}

/// A version bundled with its state and effective interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedVersion {
  #[serde(flatten)]
  pub record:    VersionRecord,
  pub state:     VersionState,
  /// `None` when nothing of the interval remains in force.
  pub effective: Option<ValidInterval>,
}

impl ResolvedVersion {
  /// Whether this version participates in snapshot and range resolution.
  pub fn is_visible(&self) -> bool { self.effective.is_some() }
}
