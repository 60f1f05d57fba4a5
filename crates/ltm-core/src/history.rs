//! Per-property version lists and the versioning rules applied to them.
//!
//! [`PropertyHistory`] is a read-only view over everything ever recorded for
//! one `(identity, property)` pair. Writers never mutate it. They ask it for
//! an [`AppendPlan`] (the records and closures a new assertion implies) and
//! hand that plan to the storage backend, which appends it atomically after
//! a compare-and-append check on [`AppendPlan::expected_head`].

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  Error, Result,
  entity::PropertyKey,
  error::{ConflictDetail, ConflictingVersion},
  time::ValidInterval,
  value::Value,
  version::{
    Closure, ClosureKind, ResolvedVersion, Transaction, TxId, TxStamp,
    VersionRecord, VersionState,
  },
};

// ─── Write inputs and plans ──────────────────────────────────────────────────

/// How an append treats existing versions it overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppendMode {
  /// Only an open-ended version that started earlier may be superseded;
  /// any other overlap is a conflict.
  #[default]
  Assert,
  /// Replace every overlapping version, re-appending uncovered remainders.
  Correct,
}

/// A version about to be appended, before transaction time is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionDraft {
  pub key:      PropertyKey,
  pub value:    Value,
  pub interval: ValidInterval,
  pub mode:     AppendMode,
}

/// The rows one append writes for a single property.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendPlan {
  pub key:           PropertyKey,
  /// Head transaction the plan was computed against; the backend rejects
  /// the plan if the head has moved.
  pub expected_head: Option<TxId>,
  /// Id of the asserted version, `None` for delete-only plans.
  pub version_id:    Option<Uuid>,
  pub records:       Vec<VersionRecord>,
  pub closures:      Vec<Closure>,
}

impl AppendPlan {
  pub fn is_empty(&self) -> bool { self.records.is_empty() && self.closures.is_empty() }

  /// The same rows under transaction `stamp`. Plans are built against a
  /// provisional stamp and restamped once they are known to be valid.
  pub fn restamped(mut self, stamp: TxStamp) -> Self {
    for record in &mut self.records {
      record.transaction.tx_id = stamp.tx_id;
      record.transaction.tx_timestamp = stamp.tx_timestamp;
    }
    for closure in &mut self.closures {
      closure.tx_id = stamp.tx_id;
      closure.tx_timestamp = stamp.tx_timestamp;
    }
    self
  }
}

// ─── History ─────────────────────────────────────────────────────────────────

/// Everything recorded for one property: immutable records ordered by
/// `valid_from`, and the closure log ordered by transaction.
#[derive(Debug, Clone)]
pub struct PropertyHistory {
  key:        PropertyKey,
  versions:   Vec<VersionRecord>,
  closures:   Vec<Closure>,
  by_version: HashMap<Uuid, Vec<usize>>,
}

impl PropertyHistory {
  pub fn new(
    key: PropertyKey,
    mut versions: Vec<VersionRecord>,
    mut closures: Vec<Closure>,
  ) -> Self {
    versions.sort_by(|a, b| {
      a.interval
        .valid_from
        .cmp(&b.interval.valid_from)
        .then(a.transaction.stamp().cmp(&b.transaction.stamp()))
    });
    closures.sort_by_key(Closure::stamp);

    let mut by_version: HashMap<Uuid, Vec<usize>> = HashMap::new();
    for (i, c) in closures.iter().enumerate() {
      by_version.entry(c.version_id).or_default().push(i);
    }

    Self { key, versions, closures, by_version }
  }

  pub fn empty(key: PropertyKey) -> Self { Self::new(key, Vec::new(), Vec::new()) }

  pub fn key(&self) -> &PropertyKey { &self.key }

  /// Records ordered by `valid_from`, including superseded ones.
  pub fn versions(&self) -> &[VersionRecord] { &self.versions }

  pub fn closures(&self) -> &[Closure] { &self.closures }

  /// A restartable, finite pass over the records in `valid_from` order.
  pub fn iter(&self) -> std::slice::Iter<'_, VersionRecord> { self.versions.iter() }

  pub fn is_empty(&self) -> bool { self.versions.is_empty() }

  /// The latest transaction that touched this property.
  pub fn head(&self) -> Option<TxStamp> {
    let last_version = self.versions.iter().map(|v| v.transaction.stamp()).max();
    let last_closure = self.closures.last().map(Closure::stamp);
    last_version.max(last_closure)
  }

  /// A new history with `records` and `closures` appended. Rows belonging
  /// to other properties are ignored.
  pub fn extended(&self, records: &[VersionRecord], closures: &[Closure]) -> Self {
    let mut versions = self.versions.clone();
    versions.extend(
      records
        .iter()
        .filter(|r| r.entity_id == self.key.entity_id && r.property == self.key.property)
        .cloned(),
    );
    let owned: HashSet<Uuid> = versions.iter().map(|v| v.version_id).collect();
    let mut all_closures = self.closures.clone();
    all_closures.extend(
      closures
        .iter()
        .filter(|c| owned.contains(&c.version_id))
        .cloned(),
    );
    Self::new(self.key.clone(), versions, all_closures)
  }

  // ── Resolution ─────────────────────────────────────────────────────────

  /// The state of `record` considering only closures recorded at or before
  /// `as_of` (all closures when `None`).
  pub fn state_of(
    &self,
    record: &VersionRecord,
    as_of: Option<DateTime<Utc>>,
  ) -> VersionState {
    let mut state = VersionState::Open;
    let Some(indices) = self.by_version.get(&record.version_id) else {
      return state;
    };

    for closure in indices.iter().map(|&i| &self.closures[i]) {
      if as_of.is_some_and(|s| closure.tx_timestamp > s) {
        break;
      }
      state = match (closure.kind, state) {
        (ClosureKind::Replaced, _) => {
          return VersionState::Superseded {
            by: closure.caused_by,
            at: closure.tx_timestamp,
          };
        }
        (ClosureKind::Truncated { valid_to }, VersionState::Open) => VersionState::Closed {
          valid_to,
          by: closure.caused_by,
          at: closure.tx_timestamp,
        },
        (ClosureKind::Truncated { valid_to }, VersionState::Closed { valid_to: prev, by, at }) => {
          VersionState::Closed { valid_to: prev.min(valid_to), by, at }
        }
        (ClosureKind::Truncated { valid_to }, VersionState::LogicallyDeleted { valid_to: prev, at }) => {
          VersionState::LogicallyDeleted { valid_to: prev.min(valid_to), at }
        }
        (ClosureKind::Deleted { valid_to }, VersionState::Closed { valid_to: prev, .. })
        | (ClosureKind::Deleted { valid_to }, VersionState::LogicallyDeleted { valid_to: prev, .. }) => {
          VersionState::LogicallyDeleted {
            valid_to: prev.min(valid_to),
            at:       closure.tx_timestamp,
          }
        }
        (ClosureKind::Deleted { valid_to }, _) => VersionState::LogicallyDeleted {
          valid_to,
          at: closure.tx_timestamp,
        },
        (_, superseded @ VersionState::Superseded { .. }) => superseded,
      };
    }
    state
  }

  pub fn resolve(
    &self,
    record: &VersionRecord,
    as_of: Option<DateTime<Utc>>,
  ) -> ResolvedVersion {
    let state = self.state_of(record, as_of);
    let effective = match state {
      VersionState::Open => Some(record.interval),
      VersionState::Closed { valid_to, .. }
      | VersionState::LogicallyDeleted { valid_to, .. } => record.interval.truncated(valid_to),
      VersionState::Superseded { .. } => None,
    };
    ResolvedVersion { record: record.clone(), state, effective }
  }

  /// Every record known at transaction time `as_of` (all when `None`), with
  /// its state as of that time.
  pub fn resolve_all(&self, as_of: Option<DateTime<Utc>>) -> Vec<ResolvedVersion> {
    self
      .versions
      .iter()
      .filter(|v| as_of.is_none_or(|s| v.transaction.tx_timestamp <= s))
      .map(|v| self.resolve(v, as_of))
      .collect()
  }

  /// The non-superseded versions at `as_of`; their effective intervals
  /// partition valid time without overlap.
  pub fn visible(&self, as_of: Option<DateTime<Utc>>) -> Vec<ResolvedVersion> {
    self
      .resolve_all(as_of)
      .into_iter()
      .filter(ResolvedVersion::is_visible)
      .collect()
  }

  // ── Planning ───────────────────────────────────────────────────────────

  /// Fail unless `stamp` is at or after the latest transaction recorded
  /// here.
  pub fn ensure_after_head(&self, stamp: TxStamp) -> Result<()> {
    if let Some(head) = self.head()
      && stamp.tx_timestamp < head.tx_timestamp
    {
      return Err(Error::NonMonotonicTransaction {
        entity_id: self.key.entity_id,
        property:  self.key.property.clone(),
        latest:    head.tx_timestamp,
        attempted: stamp.tx_timestamp,
      });
    }
    Ok(())
  }

  /// Work out what appending `draft` under `transaction` writes, or why it
  /// cannot be appended.
  pub fn plan_append(
    &self,
    draft: VersionDraft,
    transaction: Transaction,
  ) -> Result<AppendPlan> {
    let stamp = transaction.stamp();
    self.ensure_after_head(stamp)?;

    let new_id = Uuid::new_v4();
    let attempted = draft.interval;
    let overlapping: Vec<ResolvedVersion> = self
      .visible(None)
      .into_iter()
      .filter(|rv| rv.effective.is_some_and(|eff| eff.overlaps(&attempted)))
      .collect();

    let mut records = Vec::new();
    let mut closures = Vec::new();

    match draft.mode {
      AppendMode::Assert => {
        let mut conflicts = Vec::new();
        for rv in overlapping {
          let Some(eff) = rv.effective else { continue };
          if eff.is_open() && eff.valid_from < attempted.valid_from {
            closures.push(Closure::new(
              rv.record.version_id,
              ClosureKind::Truncated { valid_to: attempted.valid_from },
              Some(new_id),
              stamp,
            ));
          } else {
            conflicts.push(ConflictingVersion {
              version_id: rv.record.version_id,
              interval:   eff,
              tx_id:      rv.record.transaction.tx_id,
              value:      rv.record.value,
            });
          }
        }
        if !conflicts.is_empty() {
          return Err(Error::Conflict(Box::new(ConflictDetail {
            entity_id: self.key.entity_id,
            property:  self.key.property.clone(),
            attempted,
            existing:  conflicts,
          })));
        }
      }
      AppendMode::Correct => {
        for rv in overlapping {
          let Some(eff) = rv.effective else { continue };
          closures.push(Closure::new(
            rv.record.version_id,
            ClosureKind::Replaced,
            Some(new_id),
            stamp,
          ));

          let mut remainders = Vec::new();
          if eff.valid_from < attempted.valid_from {
            remainders.push(ValidInterval {
              valid_from: eff.valid_from,
              valid_to:   Some(attempted.valid_from),
            });
          }
          if let Some(end) = attempted.valid_to
            && eff.extends_past(end)
          {
            remainders.push(ValidInterval { valid_from: end, valid_to: eff.valid_to });
          }
          for interval in remainders {
            records.push(VersionRecord {
              version_id: Uuid::new_v4(),
              entity_id: self.key.entity_id,
              property: self.key.property.clone(),
              value: rv.record.value.clone(),
              interval,
              transaction: Transaction {
                tx_id:        stamp.tx_id,
                tx_timestamp: stamp.tx_timestamp,
                source_id:    rv.record.transaction.source_id.clone(),
                confidence:   rv.record.transaction.confidence,
                metadata:     rv.record.transaction.metadata.clone(),
              },
              derived_from: Some(rv.record.version_id),
            });
          }
        }
      }
    }

    records.push(VersionRecord {
      version_id: new_id,
      entity_id: draft.key.entity_id,
      property: draft.key.property,
      value: draft.value,
      interval: attempted,
      transaction,
      derived_from: None,
    });

    Ok(AppendPlan {
      key: self.key.clone(),
      expected_head: self.head().map(|h| h.tx_id),
      version_id: Some(new_id),
      records,
      closures,
    })
  }

  /// Close every version still in force at or after `valid_to`.
  pub fn plan_delete(&self, valid_to: DateTime<Utc>, stamp: TxStamp) -> Result<AppendPlan> {
    self.ensure_after_head(stamp)?;

    let closures = self
      .visible(None)
      .into_iter()
      .filter(|rv| rv.effective.is_some_and(|eff| eff.extends_past(valid_to)))
      .map(|rv| {
        Closure::new(
          rv.record.version_id,
          ClosureKind::Deleted { valid_to },
          None,
          stamp,
        )
      })
      .collect();

    Ok(AppendPlan {
      key: self.key.clone(),
      expected_head: self.head().map(|h| h.tx_id),
      version_id: None,
      records: Vec::new(),
      closures,
    })
  }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
