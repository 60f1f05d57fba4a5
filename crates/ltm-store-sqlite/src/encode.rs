//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 strings with a fixed microsecond width
//! and a `Z` suffix, so lexical order in SQL matches chronological order.
//! Values and metadata are stored as compact JSON. UUIDs are stored as
//! hyphenated lowercase strings.

use chrono::{DateTime, SecondsFormat, Utc};
use ltm_core::{
  entity::{Entity, EntityKind},
  time::ValidInterval,
  value::Value,
  version::{Closure, ClosureKind, Transaction, TxId, VersionRecord},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── TxId ─────────────────────────────────────────────────────────────────────

pub fn encode_tx(id: TxId) -> i64 { id.0 as i64 }

pub fn decode_tx(n: i64) -> Result<TxId> {
  u64::try_from(n)
    .map(TxId)
    .map_err(|_| Error::Corrupt(format!("negative tx_id {n}")))
}

// ─── EntityKind ───────────────────────────────────────────────────────────────

pub fn encode_kind(k: EntityKind) -> &'static str {
  match k {
    EntityKind::Node => "node",
    EntityKind::Event => "event",
    EntityKind::Edge { .. } => "edge",
  }
}

// ─── ClosureKind ──────────────────────────────────────────────────────────────

/// `(kind, valid_to)` columns for a closure.
pub fn encode_closure_kind(k: ClosureKind) -> (&'static str, Option<String>) {
  match k {
    ClosureKind::Truncated { valid_to } => ("truncated", Some(encode_dt(valid_to))),
    ClosureKind::Replaced => ("replaced", None),
    ClosureKind::Deleted { valid_to } => ("deleted", Some(encode_dt(valid_to))),
  }
}

pub fn decode_closure_kind(kind: &str, valid_to: Option<&str>) -> Result<ClosureKind> {
  let bound = || {
    valid_to
      .ok_or_else(|| Error::Corrupt(format!("{kind} closure without valid_to")))
      .and_then(decode_dt)
  };
  match kind {
    "truncated" => Ok(ClosureKind::Truncated { valid_to: bound()? }),
    "replaced" => Ok(ClosureKind::Replaced),
    "deleted" => Ok(ClosureKind::Deleted { valid_to: bound()? }),
    other => Err(Error::Corrupt(format!("unknown closure kind: {other:?}"))),
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────

pub const ENTITY_COLUMNS: &str =
  "entity_id, kind, label, stable_key, edge_source, edge_target, created_at";

/// Raw strings read directly from an `entities` row.
pub struct RawEntity {
  pub entity_id:   String,
  pub kind:        String,
  pub label:       String,
  pub stable_key:  Option<String>,
  pub edge_source: Option<String>,
  pub edge_target: Option<String>,
  pub created_at:  String,
}

impl RawEntity {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      entity_id:   row.get(0)?,
      kind:        row.get(1)?,
      label:       row.get(2)?,
      stable_key:  row.get(3)?,
      edge_source: row.get(4)?,
      edge_target: row.get(5)?,
      created_at:  row.get(6)?,
    })
  }

  pub fn into_entity(self) -> Result<Entity> {
    let kind = match (self.kind.as_str(), self.edge_source, self.edge_target) {
      ("node", ..) => EntityKind::Node,
      ("event", ..) => EntityKind::Event,
      ("edge", Some(source), Some(target)) => EntityKind::Edge {
        source: decode_uuid(&source)?,
        target: decode_uuid(&target)?,
      },
      (other, ..) => {
        return Err(Error::Corrupt(format!("bad entity kind {other:?} for {}", self.entity_id)));
      }
    };
    Ok(Entity {
      entity_id: decode_uuid(&self.entity_id)?,
      kind,
      label: self.label,
      key: self.stable_key,
      created_at: decode_dt(&self.created_at)?,
    })
  }
}

pub const VERSION_COLUMNS: &str = "version_id, entity_id, property, value_json, valid_from, \
   valid_to, tx_id, tx_timestamp, source_id, confidence, metadata, derived_from";

/// Raw values read directly from a `versions` row.
pub struct RawVersion {
  pub version_id:   String,
  pub entity_id:    String,
  pub property:     String,
  pub value_json:   String,
  pub valid_from:   String,
  pub valid_to:     Option<String>,
  pub tx_id:        i64,
  pub tx_timestamp: String,
  pub source_id:    Option<String>,
  pub confidence:   f64,
  pub metadata:     String,
  pub derived_from: Option<String>,
}

impl RawVersion {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      version_id:   row.get(0)?,
      entity_id:    row.get(1)?,
      property:     row.get(2)?,
      value_json:   row.get(3)?,
      valid_from:   row.get(4)?,
      valid_to:     row.get(5)?,
      tx_id:        row.get(6)?,
      tx_timestamp: row.get(7)?,
      source_id:    row.get(8)?,
      confidence:   row.get(9)?,
      metadata:     row.get(10)?,
      derived_from: row.get(11)?,
    })
  }

  pub fn into_record(self) -> Result<VersionRecord> {
    let value: Value = serde_json::from_str(&self.value_json)?;
    let interval = ValidInterval {
      valid_from: decode_dt(&self.valid_from)?,
      valid_to:   self.valid_to.as_deref().map(decode_dt).transpose()?,
    };
    Ok(VersionRecord {
      version_id: decode_uuid(&self.version_id)?,
      entity_id: decode_uuid(&self.entity_id)?,
      property: self.property,
      value,
      interval,
      transaction: Transaction {
        tx_id:        decode_tx(self.tx_id)?,
        tx_timestamp: decode_dt(&self.tx_timestamp)?,
        source_id:    self.source_id,
        confidence:   self.confidence as f32,
        metadata:     serde_json::from_str(&self.metadata)?,
      },
      derived_from: self.derived_from.as_deref().map(decode_uuid).transpose()?,
    })
  }
}

/// Raw values read directly from a `closures` row.
pub struct RawClosure {
  pub closure_id:   String,
  pub version_id:   String,
  pub kind:         String,
  pub valid_to:     Option<String>,
  pub caused_by:    Option<String>,
  pub tx_id:        i64,
  pub tx_timestamp: String,
}

impl RawClosure {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      closure_id:   row.get(0)?,
      version_id:   row.get(1)?,
      kind:         row.get(2)?,
      valid_to:     row.get(3)?,
      caused_by:    row.get(4)?,
      tx_id:        row.get(5)?,
      tx_timestamp: row.get(6)?,
    })
  }

  pub fn into_closure(self) -> Result<Closure> {
    Ok(Closure {
      closure_id:   decode_uuid(&self.closure_id)?,
      version_id:   decode_uuid(&self.version_id)?,
      kind:         decode_closure_kind(&self.kind, self.valid_to.as_deref())?,
      caused_by:    self.caused_by.as_deref().map(decode_uuid).transpose()?,
      tx_id:        decode_tx(self.tx_id)?,
      tx_timestamp: decode_dt(&self.tx_timestamp)?,
    })
  }
}
