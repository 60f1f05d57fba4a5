//! Range and transaction-time indexes over property histories.
//!
//! Every property the engine has touched gets a [`PropertyIndex`]: an
//! immutable bundle of the property's [`PropertyHistory`], the versions
//! visible at its head transaction with an [`IntervalIndex`] over their
//! effective intervals, and a [`TxIndex`] over transaction times. Writers
//! build a fresh bundle per commit and publish it to the [`IndexRegistry`];
//! readers clone an `Arc` and never block on a writer.
//!
//! Reads at the latest transaction go through the interval index. Audit
//! reads at an earlier transaction go through the transaction-time index,
//! which narrows the history to what was recorded by then before closures
//! are applied.

use std::{
  num::NonZeroUsize,
  sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use lru::LruCache;
use ltm_core::{
  entity::PropertyKey,
  history::PropertyHistory,
  time::ValidInterval,
  version::{ResolvedVersion, TxStamp, VersionRecord},
};

/// An interval end; `None` is "open", which sorts after every timestamp.
type End = Option<DateTime<Utc>>;

fn later(a: End, b: End) -> End {
  match (a, b) {
    (None, _) | (_, None) => None,
    (Some(a), Some(b)) => Some(a.max(b)),
  }
}

fn ends_after(end: End, t: DateTime<Utc>) -> bool { end.is_none_or(|e| e > t) }

// ─── Interval index ──────────────────────────────────────────────────────────

/// Positions matched by one interval lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hits {
  pub positions: Vec<usize>,
  /// Entries inspected to find them.
  pub examined:  usize,
}

/// Stabbing and overlap lookups over intervals sorted by start.
///
/// `reach[i]` is the latest end among entries `0..=i`. A backwards scan from
/// the last entry that starts early enough stops as soon as `reach` drops
/// to or below the instant asked about. Over disjoint intervals that is one
/// entry past the matches.
#[derive(Debug, Clone, Default)]
pub struct IntervalIndex {
  starts: Vec<DateTime<Utc>>,
  ends:   Vec<End>,
  reach:  Vec<End>,
}

impl IntervalIndex {
  /// Build over intervals ordered by `valid_from`; `None` if they are not.
  pub fn build(intervals: &[ValidInterval]) -> Option<Self> {
    if intervals.windows(2).any(|w| w[0].valid_from > w[1].valid_from) {
      return None;
    }

    let starts = intervals.iter().map(|i| i.valid_from).collect();
    let ends: Vec<End> = intervals.iter().map(|i| i.valid_to).collect();
    let mut reach = Vec::with_capacity(ends.len());
    let mut acc: Option<End> = None;
    for &end in &ends {
      let next = match acc {
        None => end,
        Some(prev) => later(prev, end),
      };
      reach.push(next);
      acc = Some(next);
    }

    Some(Self { starts, ends, reach })
  }

  pub fn len(&self) -> usize { self.starts.len() }

  pub fn is_empty(&self) -> bool { self.starts.is_empty() }

  /// Positions whose interval ends after `floor`, among the first `upto`.
  fn scan_back(&self, upto: usize, floor: DateTime<Utc>) -> Hits {
    let mut hits = Hits::default();
    for i in (0..upto).rev() {
      if !ends_after(self.reach[i], floor) {
        break;
      }
      hits.examined += 1;
      if ends_after(self.ends[i], floor) {
        hits.positions.push(i);
      }
    }
    hits.positions.reverse();
    hits
  }

  /// Positions of intervals containing `t`.
  pub fn stab(&self, t: DateTime<Utc>) -> Hits {
    let upto = self.starts.partition_point(|&s| s <= t);
    self.scan_back(upto, t)
  }

  /// Positions of intervals sharing at least one instant with `range`.
  pub fn overlapping(&self, range: &ValidInterval) -> Hits {
    let upto = match range.valid_to {
      Some(to) => self.starts.partition_point(|&s| s < to),
      None => self.starts.len(),
    };
    self.scan_back(upto, range.valid_from)
  }
}

// ─── Transaction-time index ──────────────────────────────────────────────────

/// Record positions ordered by transaction time.
#[derive(Debug, Clone, Default)]
pub struct TxIndex {
  order: Vec<(DateTime<Utc>, usize)>,
}

impl TxIndex {
  pub fn build(records: &[VersionRecord]) -> Self {
    let mut order: Vec<_> = records
      .iter()
      .enumerate()
      .map(|(i, r)| (r.transaction.tx_timestamp, i))
      .collect();
    order.sort();
    Self { order }
  }

  /// Positions of records written at or before `as_of`, in transaction
  /// order.
  pub fn known_at(&self, as_of: DateTime<Utc>) -> impl Iterator<Item = usize> + '_ {
    let n = self.order.partition_point(|&(t, _)| t <= as_of);
    self.order[..n].iter().map(|&(_, i)| i)
  }

  /// The versions of `history` visible as of transaction time `as_of`,
  /// with the closures recorded by then applied, ordered by effective
  /// `valid_from`.
  pub fn visible_at(&self, history: &PropertyHistory, as_of: DateTime<Utc>) -> Vec<ResolvedVersion> {
    let versions = history.versions();
    let mut visible: Vec<ResolvedVersion> = self
      .known_at(as_of)
      .map(|i| history.resolve(&versions[i], Some(as_of)))
      .filter(ResolvedVersion::is_visible)
      .collect();
    visible.sort_by_key(|rv| (rv.effective.map(|e| e.valid_from), rv.record.transaction.stamp()));
    visible
  }
}

// ─── Property index ──────────────────────────────────────────────────────────

/// Versions matched by one lookup, before any tie-breaking.
#[derive(Debug, Clone, Default)]
pub struct Lookup {
  pub versions: Vec<ResolvedVersion>,
  /// The interval index was unavailable and the whole history was scanned.
  pub scanned:  bool,
  /// Versions inspected to answer the lookup.
  pub examined: usize,
}

/// An immutable, indexed view of one property's history.
#[derive(Debug)]
pub struct PropertyIndex {
  history:   Arc<PropertyHistory>,
  /// Versions visible at the head, ordered by effective `valid_from`.
  current:   Vec<ResolvedVersion>,
  intervals: Option<IntervalIndex>,
  by_tx:     TxIndex,
}

impl PropertyIndex {
  pub fn build(history: Arc<PropertyHistory>, range_index: bool) -> Self {
    let mut current = history.visible(None);
    current.sort_by_key(|rv| (rv.effective.map(|e| e.valid_from), rv.record.transaction.stamp()));

    let intervals = if range_index {
      let effective: Vec<ValidInterval> = current.iter().filter_map(|rv| rv.effective).collect();
      let built = IntervalIndex::build(&effective);
      if built.is_none() {
        tracing::warn!(key = %history.key(), "interval index build failed, falling back to scans");
      }
      built
    } else {
      None
    };
    let by_tx = TxIndex::build(history.versions());
    Self { history, current, intervals, by_tx }
  }

  pub fn key(&self) -> &PropertyKey { self.history.key() }

  pub fn history(&self) -> &Arc<PropertyHistory> { &self.history }

  pub fn head(&self) -> Option<TxStamp> { self.history.head() }

  /// Versions visible at the head, ordered by effective `valid_from`.
  pub fn current(&self) -> &[ResolvedVersion] { &self.current }

  pub fn is_degraded(&self) -> bool { self.intervals.is_none() }

  /// The transaction time of an audit read: `as_of` when it falls before
  /// the head, `None` when the read sees the head state.
  fn before_head(&self, as_of: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    let head = self.head()?;
    as_of.filter(|&t| t < head.tx_timestamp)
  }

  fn lookup(
    &self,
    as_of: Option<DateTime<Utc>>,
    search: impl FnOnce(&IntervalIndex) -> Hits,
    keep: impl Fn(&ValidInterval) -> bool,
  ) -> Lookup {
    let matching = |rv: &ResolvedVersion| rv.effective.as_ref().is_some_and(&keep);

    let Some(index) = &self.intervals else {
      let all = self.history.resolve_all(as_of);
      let examined = all.len();
      return Lookup {
        versions: all.into_iter().filter(matching).collect(),
        scanned: true,
        examined,
      };
    };

    match self.before_head(as_of) {
      None => {
        let hits = search(index);
        Lookup {
          versions: hits.positions.iter().map(|&i| self.current[i].clone()).collect(),
          scanned:  false,
          examined: hits.examined,
        }
      }
      Some(as_of) => {
        let visible = self.by_tx.visible_at(&self.history, as_of);
        let examined = visible.len();
        Lookup {
          versions: visible.into_iter().filter(matching).collect(),
          scanned: false,
          examined,
        }
      }
    }
  }

  /// Versions in force at valid time `t`, as known at `as_of`.
  pub fn at(&self, t: DateTime<Utc>, as_of: Option<DateTime<Utc>>) -> Lookup {
    self.lookup(as_of, |ix| ix.stab(t), |eff| eff.contains(t))
  }

  /// Versions whose effective interval meets `range`, as known at `as_of`.
  pub fn overlapping(&self, range: &ValidInterval, as_of: Option<DateTime<Utc>>) -> Lookup {
    self.lookup(as_of, |ix| ix.overlapping(range), |eff| eff.overlaps(range))
  }
}

// ─── Registry ────────────────────────────────────────────────────────────────

struct Slots {
  indexes: LruCache<PropertyKey, Arc<PropertyIndex>>,
  /// Bumped on every publish.
  epoch:   u64,
}

/// The engine's live indexes, one per recently used property key. Keys
/// beyond the capacity are dropped least recently used first and reloaded
/// from the store on their next use.
pub struct IndexRegistry {
  slots: Mutex<Slots>,
}

impl IndexRegistry {
  pub fn new(capacity: usize) -> Self {
    let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
    Self { slots: Mutex::new(Slots { indexes: LruCache::new(capacity), epoch: 0 }) }
  }

  fn slots(&self) -> std::sync::MutexGuard<'_, Slots> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn get(&self, key: &PropertyKey) -> Option<Arc<PropertyIndex>> {
    self.slots().indexes.get(key).cloned()
  }

  /// Take before loading a history from the store; pass to
  /// [`IndexRegistry::adopt`] afterwards.
  pub fn epoch(&self) -> u64 { self.slots().epoch }

  /// Install the index of a freshly committed history, unless a newer one
  /// (by head transaction) is already there, and return whichever is now
  /// current.
  pub fn publish(&self, index: Arc<PropertyIndex>) -> Arc<PropertyIndex> {
    let mut slots = self.slots();
    slots.epoch += 1;
    Self::put(&mut slots, index)
  }

  /// Install an index loaded from the store while `epoch` was current. If
  /// anything was published since, the load may predate that commit, so it
  /// answers this one read and is not kept.
  pub fn adopt(&self, index: Arc<PropertyIndex>, epoch: u64) -> Arc<PropertyIndex> {
    let mut slots = self.slots();
    if slots.epoch != epoch {
      return match slots.indexes.peek(index.key()) {
        Some(existing) if existing.head() > index.head() => existing.clone(),
        _ => index,
      };
    }
    Self::put(&mut slots, index)
  }

  fn put(slots: &mut Slots, index: Arc<PropertyIndex>) -> Arc<PropertyIndex> {
    if let Some(existing) = slots.indexes.get(index.key())
      && existing.head() > index.head()
    {
      return existing.clone();
    }
    slots.indexes.put(index.key().clone(), index.clone());
    index
  }

  /// Forget `key`; its next use reloads from the store.
  pub fn evict(&self, key: &PropertyKey) { self.slots().indexes.pop(key); }

  pub fn len(&self) -> usize { self.slots().indexes.len() }

  pub fn is_empty(&self) -> bool { self.slots().indexes.is_empty() }
}

impl std::fmt::Debug for IndexRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let slots = self.slots();
    f.debug_struct("IndexRegistry")
      .field("len", &slots.indexes.len())
      .field("cap", &slots.indexes.cap())
      .field("epoch", &slots.epoch)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use chrono::Duration;
  use ltm_core::{
    history::{AppendMode, VersionDraft},
    time::parse_timestamp,
    value::Value,
    version::{Closure, ClosureKind, Provenance, Transaction, TxId},
  };
  use uuid::Uuid;

  use super::*;

  fn day(s: &str) -> DateTime<Utc> { parse_timestamp(s).unwrap() }

  fn stamp(n: u64) -> TxStamp {
    TxStamp { tx_id: TxId(n), tx_timestamp: day("2024-01-01") + Duration::seconds(n as i64) }
  }

  fn key() -> PropertyKey { PropertyKey::new(Uuid::nil(), "price") }

  fn history(spans: &[(f64, &str, Option<&str>)]) -> Arc<PropertyHistory> {
    let mut h = PropertyHistory::empty(key());
    for (n, (value, from, to)) in spans.iter().enumerate() {
      let draft = VersionDraft {
        key:      h.key().clone(),
        value:    Value::number(*value),
        interval: ValidInterval::new(day(from), to.map(day)).unwrap(),
        mode:     AppendMode::Assert,
      };
      let plan = h
        .plan_append(draft, Transaction::new(stamp(n as u64 + 1), Provenance::default()))
        .unwrap();
      h = h.extended(&plan.records, &plan.closures);
    }
    Arc::new(h)
  }

  fn scenario() -> Arc<PropertyHistory> {
    history(&[
      (100.0, "2022-01-01", Some("2022-12-31")),
      (120.0, "2023-01-01", Some("2023-03-31")),
      (150.0, "2023-04-01", None),
    ])
  }

  /// `n` open-ended versions, each truncated by its successor: version `i`
  /// starts on day `i` and is written in transaction `i + 1`.
  fn open_chain(n: usize) -> Arc<PropertyHistory> {
    let start = day("2000-01-01");
    let mut records: Vec<VersionRecord> = Vec::with_capacity(n);
    let mut closures = Vec::with_capacity(n);
    for i in 0..n {
      let record = VersionRecord {
        version_id:   Uuid::new_v4(),
        entity_id:    Uuid::nil(),
        property:     "price".into(),
        value:        Value::number(i as f64),
        interval:     ValidInterval::open(start + Duration::days(i as i64)),
        transaction:  Transaction::new(stamp(i as u64 + 1), Provenance::default()),
        derived_from: None,
      };
      if let Some(prev) = records.last() {
        closures.push(Closure::new(
          prev.version_id,
          ClosureKind::Truncated { valid_to: record.interval.valid_from },
          Some(record.version_id),
          stamp(i as u64 + 1),
        ));
      }
      records.push(record);
    }
    Arc::new(PropertyHistory::new(key(), records, closures))
  }

  fn values(lookup: &Lookup) -> Vec<Value> {
    lookup.versions.iter().map(|rv| rv.record.value.clone()).collect()
  }

  fn intervals(h: &PropertyHistory) -> Vec<ValidInterval> {
    h.versions().iter().map(|v| v.interval).collect()
  }

  #[test]
  fn stab_finds_only_covering_intervals() {
    let h = scenario();
    let ix = IntervalIndex::build(&intervals(&h)).unwrap();
    assert_eq!(ix.stab(day("2023-03-30")).positions, vec![1]);
    assert_eq!(ix.stab(day("2030-01-01")).positions, vec![2]);
    assert!(ix.stab(day("2021-01-01")).positions.is_empty());
    assert!(ix.stab(day("2022-12-31")).positions.is_empty());
  }

  #[test]
  fn long_early_interval_is_not_skipped() {
    let spans = vec![
      ValidInterval::new(day("2000-01-01"), Some(day("2030-01-01"))).unwrap(),
      ValidInterval::new(day("2005-01-01"), Some(day("2005-02-01"))).unwrap(),
    ];
    let ix = IntervalIndex::build(&spans).unwrap();
    assert_eq!(ix.stab(day("2020-01-01")).positions, vec![0]);
    assert_eq!(ix.stab(day("2005-01-15")).positions, vec![0, 1]);
    assert_eq!(ix.len(), 2);
  }

  #[test]
  fn unsorted_intervals_fail_to_index() {
    let mut spans = intervals(&scenario());
    spans.reverse();
    assert!(IntervalIndex::build(&spans).is_none());
  }

  #[test]
  fn point_lookups_stay_bounded_on_a_long_open_chain() {
    let ix = PropertyIndex::build(open_chain(1000), true);
    assert_eq!(ix.current().len(), 1000);

    let latest = ix.at(day("2000-01-01") + Duration::days(5000), None);
    assert_eq!(values(&latest), vec![Value::number(999.0)]);
    assert!(latest.examined <= 2, "examined {}", latest.examined);

    let middle = ix.at(day("2000-01-01") + Duration::days(500) + Duration::hours(12), None);
    assert_eq!(values(&middle), vec![Value::number(500.0)]);
    assert!(middle.examined <= 2, "examined {}", middle.examined);

    let week = ValidInterval::new(
      day("2000-01-01") + Duration::days(100),
      Some(day("2000-01-01") + Duration::days(107)),
    )
    .unwrap();
    let range = ix.overlapping(&week, None);
    assert_eq!(range.versions.len(), 7);
    assert!(range.examined <= 8, "examined {}", range.examined);
  }

  #[test]
  fn audit_reads_use_transaction_order() {
    let ix = PropertyIndex::build(open_chain(50), true);

    // As of transaction 10 only versions 0..=9 exist and 9 is still open.
    let as_of = Some(stamp(10).tx_timestamp);
    let far = ix.at(day("2000-01-01") + Duration::days(40), as_of);
    assert_eq!(values(&far), vec![Value::number(9.0)]);
    assert!(!far.scanned);
    assert_eq!(far.examined, 10);

    // The same instant at the head belongs to version 40.
    let now = ix.at(day("2000-01-01") + Duration::days(40), None);
    assert_eq!(values(&now), vec![Value::number(40.0)]);
  }

  #[test]
  fn range_lookup_matches_scenario() {
    let ix = PropertyIndex::build(scenario(), true);
    let range = ValidInterval::new(day("2022-06-01"), Some(day("2023-02-01"))).unwrap();
    let hit = ix.overlapping(&range, None);
    assert!(!hit.scanned);
    assert_eq!(values(&hit), vec![Value::number(100.0), Value::number(120.0)]);
  }

  #[test]
  fn point_lookup_respects_transaction_time() {
    let ix = PropertyIndex::build(scenario(), true);
    assert_eq!(values(&ix.at(day("2023-05-01"), None)), vec![Value::number(150.0)]);
    // Before the third transaction, nothing covered May 2023.
    assert!(ix.at(day("2023-05-01"), Some(stamp(2).tx_timestamp)).versions.is_empty());
    // At or after the head the interval index answers.
    let later = ix.at(day("2023-05-01"), Some(stamp(7).tx_timestamp));
    assert_eq!(values(&later), vec![Value::number(150.0)]);
  }

  #[test]
  fn scans_when_index_is_disabled() {
    let ix = PropertyIndex::build(scenario(), false);
    assert!(ix.is_degraded());
    let hit = ix.at(day("2023-03-30"), None);
    assert!(hit.scanned);
    assert_eq!(values(&hit), vec![Value::number(120.0)]);

    let audit = ix.at(day("2023-05-01"), Some(stamp(2).tx_timestamp));
    assert!(audit.scanned);
    assert!(audit.versions.is_empty());
  }

  #[test]
  fn newer_head_wins_on_publish() {
    let registry = IndexRegistry::new(8);
    let old = Arc::new(PropertyIndex::build(history(&[(1.0, "2020-01-01", None)]), true));
    let new = Arc::new(PropertyIndex::build(scenario(), true));

    registry.publish(new.clone());
    let current = registry.publish(old);
    assert!(Arc::ptr_eq(&current, &new));
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn loads_racing_a_publish_are_not_kept() {
    let registry = IndexRegistry::new(8);
    let loaded = Arc::new(PropertyIndex::build(history(&[(1.0, "2020-01-01", None)]), true));

    let epoch = registry.epoch();
    let elsewhere = PropertyKey::new(Uuid::new_v4(), "volume");
    registry.publish(Arc::new(PropertyIndex::build(Arc::new(PropertyHistory::empty(elsewhere)), true)));

    let served = registry.adopt(loaded.clone(), epoch);
    assert!(Arc::ptr_eq(&served, &loaded));
    assert!(registry.get(loaded.key()).is_none());

    registry.adopt(loaded.clone(), registry.epoch());
    assert!(registry.get(loaded.key()).is_some());
  }

  #[test]
  fn registry_is_bounded() {
    let registry = IndexRegistry::new(2);
    for n in 0..5 {
      let key = PropertyKey::new(Uuid::new_v4(), format!("p{n}"));
      registry.publish(Arc::new(PropertyIndex::build(Arc::new(PropertyHistory::empty(key)), true)));
    }
    assert_eq!(registry.len(), 2);
  }
}
