//! [`SqliteStore`], the SQLite implementation of [`GraphStore`].

use std::{
  path::Path,
  time::{Duration, Instant},
};

use chrono::Utc;
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use ltm_core::{
  entity::{Entity, EntityKind, NewEntity, PropertyKey},
  history::PropertyHistory,
  store::{GraphStore, IdempotencyEntry, TxReceipt, WriteBatch},
  version::TxStamp,
};

use crate::{
  Error, Result,
  encode::{
    ENTITY_COLUMNS, RawClosure, RawEntity, RawVersion, VERSION_COLUMNS, decode_dt,
    decode_tx, encode_closure_kind, encode_dt, encode_kind, encode_tx, encode_uuid,
  },
  schema::SCHEMA,
};

/// Default bound on a single database call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Virtual machine steps between deadline checks on a running statement.
const PROGRESS_STEPS: i32 = 1_000;

/// Largest busy wait SQLite accepts.
const MAX_BUSY_WAIT: Duration = Duration::from_millis(i32::MAX as u64);

// ─── Store ───────────────────────────────────────────────────────────────────

/// A knowledge store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn:    tokio_rusqlite::Connection,
  timeout: Duration,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::open_with_timeout(path, DEFAULT_TIMEOUT).await
  }

  pub async fn open_with_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn, timeout };
    store.init_schema().await?;
    Ok(store)
  }

  /// The same store with a different bound on each call.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn, timeout: DEFAULT_TIMEOUT };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await
  }

  /// Run `f` on the database thread within the configured timeout.
  ///
  /// The deadline is enforced on the database thread: a call still queued
  /// when it passes never starts, and one still running is interrupted and
  /// rolled back. The outcome is always awaited, so `Ok` means the work
  /// happened and [`Error::Timeout`] means it did not.
  pub(crate) async fn call<F, R>(&self, f: F) -> Result<R>
  where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R, tokio_rusqlite::Error>
      + Send
      + 'static,
    R: Send + 'static,
  {
    let timeout = self.timeout;
    let deadline = Instant::now().checked_add(timeout);

    let outcome = self
      .conn
      .call(move |conn| {
        let Some(deadline) = deadline else {
          return f(conn).map(Some);
        };
        let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
        else {
          return Ok(None);
        };

        conn.busy_timeout(remaining.min(MAX_BUSY_WAIT))?;
        conn.progress_handler(PROGRESS_STEPS, Some(move || Instant::now() >= deadline));
        let result = f(conn);
        conn.progress_handler(PROGRESS_STEPS, None::<fn() -> bool>);
        if !conn.is_autocommit() {
          conn.execute_batch("ROLLBACK")?;
        }

        match result {
          Ok(value) => Ok(Some(value)),
          Err(tokio_rusqlite::Error::Rusqlite(e))
            if e.sqlite_error_code() == Some(rusqlite::ErrorCode::OperationInterrupted) =>
          {
            Ok(None)
          }
          Err(e) => Err(e),
        }
      })
      .await?;

    outcome.ok_or_else(|| {
      tracing::warn!(?timeout, "sqlite call ran past its deadline");
      Error::Timeout(timeout)
    })
  }

  async fn query_entities(
    &self,
    condition: &'static str,
    params: Vec<String>,
  ) -> Result<Vec<Entity>> {
    let raws: Vec<RawEntity> = self
      .call(move |conn| {
        let sql = format!(
          "SELECT {ENTITY_COLUMNS} FROM entities {condition} ORDER BY created_at, entity_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params.iter()), RawEntity::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawEntity::into_entity).collect()
  }

  async fn query_entity(&self, condition: &'static str, param: String) -> Result<Option<Entity>> {
    Ok(self.query_entities(condition, vec![param]).await?.into_iter().next())
  }
}

// ─── Commit ──────────────────────────────────────────────────────────────────

/// Column values for one version row, encoded ahead of the database call.
struct VersionRow {
  version_id:   String,
  entity_id:    String,
  property:     String,
  value_json:   String,
  valid_from:   String,
  valid_to:     Option<String>,
  tx_id:        i64,
  tx_timestamp: String,
  source_id:    Option<String>,
  confidence:   f64,
  metadata:     String,
  derived_from: Option<String>,
}

struct ClosureRow {
  closure_id:   String,
  version_id:   String,
  kind:         &'static str,
  valid_to:     Option<String>,
  caused_by:    Option<String>,
  tx_id:        i64,
  tx_timestamp: String,
}

struct HeadCheck {
  entity_id: String,
  property:  String,
  expected:  Option<i64>,
  /// Whether the plan writes anything and so moves the head.
  advances:  bool,
}

enum CommitOutcome {
  Committed,
  Stale { index: usize, found: Option<i64> },
  KeyTaken,
}

// ─── GraphStore impl ─────────────────────────────────────────────────────────

impl GraphStore for SqliteStore {
  type Error = Error;

  // ── Identities ────────────────────────────────────────────────────────────

  async fn create_entity(&self, input: NewEntity) -> Result<Entity> {
    let entity = Entity {
      entity_id:  Uuid::new_v4(),
      kind:       input.kind,
      label:      input.label,
      key:        input.key,
      created_at: Utc::now(),
    };

    let (source, target) = match entity.kind {
      EntityKind::Edge { source, target } => (Some(encode_uuid(source)), Some(encode_uuid(target))),
      _ => (None, None),
    };
    let id_str    = encode_uuid(entity.entity_id);
    let kind_str  = encode_kind(entity.kind);
    let label     = entity.label.clone();
    let key       = entity.key.clone();
    let at_str    = encode_dt(entity.created_at);

    // The lookup and the insert share one call, so no other call can bind
    // the key in between.
    let inserted = self
      .call(move |conn| {
        if let Some(k) = &key {
          let taken = conn
            .query_row(
              "SELECT 1 FROM entities WHERE stable_key = ?1",
              rusqlite::params![k],
              |_| Ok(()),
            )
            .optional()?
            .is_some();
          if taken {
            return Ok(false);
          }
        }
        conn.execute(
          "INSERT INTO entities (
             entity_id, kind, label, stable_key, edge_source, edge_target, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![id_str, kind_str, label, key, source, target, at_str],
        )?;
        Ok(true)
      })
      .await?;

    if !inserted {
      let key = entity.key.unwrap_or_default();
      return Err(ltm_core::Error::DuplicateKey(key).into());
    }
    Ok(entity)
  }

  async fn get_entity(&self, id: Uuid) -> Result<Option<Entity>> {
    self.query_entity("WHERE entity_id = ?1", encode_uuid(id)).await
  }

  async fn find_by_key(&self, key: String) -> Result<Option<Entity>> {
    self.query_entity("WHERE stable_key = ?1", key).await
  }

  async fn list_entities(&self, label: Option<String>) -> Result<Vec<Entity>> {
    match label {
      Some(label) => self.query_entities("WHERE label = ?1", vec![label]).await,
      None => self.query_entities("", Vec::new()).await,
    }
  }

  async fn incident_edges(&self, entity_id: Uuid) -> Result<Vec<Entity>> {
    self
      .query_entities(
        "WHERE kind = 'edge' AND (edge_source = ?1 OR edge_target = ?1)",
        vec![encode_uuid(entity_id)],
      )
      .await
  }

  // ── Versions ──────────────────────────────────────────────────────────────

  async fn property_names(&self, entity_id: Uuid) -> Result<Vec<String>> {
    let id_str = encode_uuid(entity_id);
    self
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT DISTINCT property FROM versions WHERE entity_id = ?1 ORDER BY property",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await
  }

  async fn load_history(&self, key: PropertyKey) -> Result<PropertyHistory> {
    let id_str   = encode_uuid(key.entity_id);
    let property = key.property.clone();

    let (raw_versions, raw_closures): (Vec<RawVersion>, Vec<RawClosure>) = self
      .call(move |conn| {
        let sql = format!(
          "SELECT {VERSION_COLUMNS} FROM versions WHERE entity_id = ?1 AND property = ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let versions = stmt
          .query_map(rusqlite::params![id_str, property], RawVersion::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
          "SELECT c.closure_id, c.version_id, c.kind, c.valid_to, c.caused_by,
                  c.tx_id, c.tx_timestamp
           FROM closures c
           JOIN versions v ON v.version_id = c.version_id
           WHERE v.entity_id = ?1 AND v.property = ?2",
        )?;
        let closures = stmt
          .query_map(rusqlite::params![id_str, property], RawClosure::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((versions, closures))
      })
      .await?;

    let versions = raw_versions
      .into_iter()
      .map(RawVersion::into_record)
      .collect::<Result<Vec<_>>>()?;
    let closures = raw_closures
      .into_iter()
      .map(RawClosure::into_closure)
      .collect::<Result<Vec<_>>>()?;

    Ok(PropertyHistory::new(key, versions, closures))
  }

  async fn commit(&self, batch: WriteBatch) -> Result<()> {
    let tx_timestamp = encode_dt(batch.stamp.tx_timestamp);
    let tx_id        = encode_tx(batch.stamp.tx_id);

    let mut heads    = Vec::with_capacity(batch.plans.len());
    let mut versions = Vec::new();
    let mut closures = Vec::new();
    for plan in &batch.plans {
      heads.push(HeadCheck {
        entity_id: encode_uuid(plan.key.entity_id),
        property:  plan.key.property.clone(),
        expected:  plan.expected_head.map(encode_tx),
        advances:  !plan.is_empty(),
      });
      for r in &plan.records {
        versions.push(VersionRow {
          version_id:   encode_uuid(r.version_id),
          entity_id:    encode_uuid(r.entity_id),
          property:     r.property.clone(),
          value_json:   serde_json::to_string(&r.value)?,
          valid_from:   encode_dt(r.interval.valid_from),
          valid_to:     r.interval.valid_to.map(encode_dt),
          tx_id:        encode_tx(r.transaction.tx_id),
          tx_timestamp: encode_dt(r.transaction.tx_timestamp),
          source_id:    r.transaction.source_id.clone(),
          confidence:   f64::from(r.transaction.confidence),
          metadata:     serde_json::to_string(&r.transaction.metadata)?,
          derived_from: r.derived_from.map(encode_uuid),
        });
      }
      for c in &plan.closures {
        let (kind, valid_to) = encode_closure_kind(c.kind);
        closures.push(ClosureRow {
          closure_id: encode_uuid(c.closure_id),
          version_id: encode_uuid(c.version_id),
          kind,
          valid_to,
          caused_by: c.caused_by.map(encode_uuid),
          tx_id: encode_tx(c.tx_id),
          tx_timestamp: encode_dt(c.tx_timestamp),
        });
      }
    }

    let idempotency = batch
      .idempotency
      .as_ref()
      .map(|e| Ok::<_, Error>((e.key.clone(), e.fingerprint.clone(), serde_json::to_string(&e.receipt)?)))
      .transpose()?;
    let idem_key = idempotency.as_ref().map(|(k, ..)| k.clone());

    let outcome = self
      .call(move |conn| {
        let tx = conn.transaction()?;

        for (index, head) in heads.iter().enumerate() {
          let found: Option<i64> = tx
            .query_row(
              "SELECT tx_id FROM heads WHERE entity_id = ?1 AND property = ?2",
              rusqlite::params![head.entity_id, head.property],
              |row| row.get(0),
            )
            .optional()?;
          if found != head.expected {
            return Ok(CommitOutcome::Stale { index, found });
          }
        }

        if let Some((key, fingerprint, receipt)) = &idempotency {
          let taken = tx
            .query_row(
              "SELECT 1 FROM idempotency WHERE idem_key = ?1",
              rusqlite::params![key],
              |_| Ok(()),
            )
            .optional()?
            .is_some();
          if taken {
            return Ok(CommitOutcome::KeyTaken);
          }
          tx.execute(
            "INSERT INTO idempotency (idem_key, fingerprint, receipt_json) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, fingerprint, receipt],
          )?;
        }

        for v in &versions {
          tx.execute(
            "INSERT INTO versions (
               version_id, entity_id, property, value_json, valid_from, valid_to,
               tx_id, tx_timestamp, source_id, confidence, metadata, derived_from
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
              v.version_id,
              v.entity_id,
              v.property,
              v.value_json,
              v.valid_from,
              v.valid_to,
              v.tx_id,
              v.tx_timestamp,
              v.source_id,
              v.confidence,
              v.metadata,
              v.derived_from,
            ],
          )?;
        }

        for c in &closures {
          tx.execute(
            "INSERT INTO closures (
               closure_id, version_id, kind, valid_to, caused_by, tx_id, tx_timestamp
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
              c.closure_id,
              c.version_id,
              c.kind,
              c.valid_to,
              c.caused_by,
              c.tx_id,
              c.tx_timestamp,
            ],
          )?;
        }

        for head in heads.iter().filter(|h| h.advances) {
          tx.execute(
            "INSERT INTO heads (entity_id, property, tx_id, tx_timestamp)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (entity_id, property)
             DO UPDATE SET tx_id = excluded.tx_id, tx_timestamp = excluded.tx_timestamp",
            rusqlite::params![head.entity_id, head.property, tx_id, tx_timestamp],
          )?;
        }

        tx.commit()?;
        Ok(CommitOutcome::Committed)
      })
      .await?;

    match outcome {
      CommitOutcome::Committed => Ok(()),
      CommitOutcome::Stale { index, found } => {
        let plan = &batch.plans[index];
        tracing::debug!(key = %plan.key, "commit refused: head moved");
        Err(
          ltm_core::Error::StaleHead {
            entity_id: plan.key.entity_id,
            property:  plan.key.property.clone(),
            expected:  plan.expected_head,
            found:     found.map(decode_tx).transpose()?,
          }
          .into(),
        )
      }
      CommitOutcome::KeyTaken => {
        Err(ltm_core::Error::IdempotencyKeyTaken(idem_key.unwrap_or_default()).into())
      }
    }
  }

  async fn latest_stamp(&self) -> Result<Option<TxStamp>> {
    let raw: Option<(i64, String)> = self
      .call(|conn| {
        Ok(
          conn
            .query_row(
              "SELECT tx_id, tx_timestamp FROM heads ORDER BY tx_id DESC LIMIT 1",
              [],
              |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?,
        )
      })
      .await?;

    raw
      .map(|(id, at)| {
        Ok::<_, Error>(TxStamp { tx_id: decode_tx(id)?, tx_timestamp: decode_dt(&at)? })
      })
      .transpose()
  }

  async fn find_idempotency(&self, key: String) -> Result<Option<IdempotencyEntry>> {
    let lookup = key.clone();
    let raw: Option<(String, String)> = self
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT fingerprint, receipt_json FROM idempotency WHERE idem_key = ?1",
              rusqlite::params![lookup],
              |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?,
        )
      })
      .await?;

    raw
      .map(|(fingerprint, receipt_json)| {
        let receipt: TxReceipt = serde_json::from_str(&receipt_json)?;
        Ok::<_, Error>(IdempotencyEntry { key: key.clone(), fingerprint, receipt })
      })
      .transpose()
  }
}
