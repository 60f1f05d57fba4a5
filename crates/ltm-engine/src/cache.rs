//! Snapshot cache for hot properties.
//!
//! Once a property has been read at a point in valid time often enough, its
//! latest-transaction view is materialised into a step map
//! (`valid_from → version`) and later point reads become one binary search.
//! Each map remembers the head transaction it was built from and is only
//! served while that is still the property's head. Read counters are kept
//! for a bounded set of recently read keys.

use std::{
  num::NonZeroUsize,
  sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use lru::LruCache;
use ltm_core::{
  entity::PropertyKey,
  version::{ResolvedVersion, TxStamp},
};

use crate::index::PropertyIndex;

/// A materialised `{timestamp → value}` map for one property.
#[derive(Debug)]
pub struct StepMap {
  head:  Option<TxStamp>,
  /// Visible versions ordered by effective `valid_from`; non-overlapping.
  steps: Vec<ResolvedVersion>,
}

impl StepMap {
  /// Materialise the latest view of `index`. `None` if visible versions
  /// overlap, in which case reads must go through the tie-break path.
  pub fn build(index: &PropertyIndex) -> Option<Self> {
    let steps = index.current().to_vec();

    let disjoint = steps.windows(2).all(|w| match (w[0].effective, w[1].effective) {
      (Some(a), Some(b)) => !a.overlaps(&b),
      _ => false,
    });
    disjoint.then(|| Self { head: index.head(), steps })
  }

  pub fn at(&self, t: DateTime<Utc>) -> Option<&ResolvedVersion> {
    let n = self
      .steps
      .partition_point(|rv| rv.effective.is_some_and(|e| e.valid_from <= t));
    let candidate = self.steps[..n].last()?;
    candidate.effective.is_some_and(|e| e.contains(t)).then_some(candidate)
  }

  pub fn len(&self) -> usize { self.steps.len() }

  pub fn is_empty(&self) -> bool { self.steps.is_empty() }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached {
  /// Served from a current step map; the value may legitimately be absent.
  Hit(Option<ResolvedVersion>),
  /// Not cached (yet); resolve through the index.
  Miss,
}

pub struct SnapshotCache {
  threshold: u32,
  reads:     Mutex<LruCache<PropertyKey, u32>>,
  maps:      Option<Mutex<LruCache<PropertyKey, Arc<StepMap>>>>,
}

impl SnapshotCache {
  /// Read counters tracked per materialised map slot.
  const READS_PER_SLOT: usize = 4;

  pub fn new(threshold: u32, capacity: usize) -> Self {
    let tracked = NonZeroUsize::new(capacity.saturating_mul(Self::READS_PER_SLOT))
      .unwrap_or(NonZeroUsize::MIN);
    Self {
      threshold,
      reads: Mutex::new(LruCache::new(tracked)),
      maps: NonZeroUsize::new(capacity).map(|c| Mutex::new(LruCache::new(c))),
    }
  }

  /// Answer a latest-transaction point read at `t`, materialising the
  /// property's step map once it has been read `threshold` times.
  pub fn lookup(&self, index: &PropertyIndex, t: DateTime<Utc>) -> Cached {
    let Some(maps) = &self.maps else {
      return Cached::Miss;
    };
    let key = index.key();

    let cached = maps.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned();
    if let Some(map) = cached
      && map.head == index.head()
    {
      return Cached::Hit(map.at(t).cloned());
    }

    let reads = {
      let mut reads = self.reads.lock().unwrap_or_else(PoisonError::into_inner);
      let count = reads.get_or_insert_mut(key.clone(), || 0);
      *count = count.saturating_add(1);
      *count
    };
    if reads < self.threshold {
      return Cached::Miss;
    }

    let Some(map) = StepMap::build(index) else {
      return Cached::Miss;
    };
    tracing::debug!(%key, steps = map.len(), "materialised snapshot map");
    let map = Arc::new(map);
    let hit = map.at(t).cloned();
    maps.lock().unwrap_or_else(PoisonError::into_inner).put(key.clone(), map);
    Cached::Hit(hit)
  }

  /// Drop the step map for `key`. The read count is kept, so the next read
  /// rebuilds it.
  pub fn invalidate(&self, key: &PropertyKey) {
    if let Some(maps) = &self.maps {
      maps.lock().unwrap_or_else(PoisonError::into_inner).pop(key);
    }
  }

  /// Keys with a live read counter.
  pub fn tracked(&self) -> usize { self.reads.lock().unwrap_or_else(PoisonError::into_inner).len() }

  pub fn is_cached(&self, key: &PropertyKey) -> bool {
    self
      .maps
      .as_ref()
      .is_some_and(|m| m.lock().unwrap_or_else(PoisonError::into_inner).contains(key))
  }
}

impl std::fmt::Debug for SnapshotCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SnapshotCache")
      .field("threshold", &self.threshold)
      .field("tracked", &self.tracked())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use chrono::Duration;
  use ltm_core::{
    history::{AppendMode, PropertyHistory, VersionDraft},
    time::{ValidInterval, parse_timestamp},
    value::Value,
    version::{Provenance, Transaction, TxId},
  };
  use uuid::Uuid;

  use super::*;

  fn day(s: &str) -> DateTime<Utc> { parse_timestamp(s).unwrap() }

  fn append(h: &PropertyHistory, value: f64, from: &str, to: Option<&str>, n: u64) -> PropertyHistory {
    let draft = VersionDraft {
      key:      h.key().clone(),
      value:    Value::number(value),
      interval: ValidInterval::new(day(from), to.map(day)).unwrap(),
      mode:     AppendMode::Assert,
    };
    let stamp = TxStamp { tx_id: TxId(n), tx_timestamp: day("2024-01-01") + Duration::seconds(n as i64) };
    let plan = h.plan_append(draft, Transaction::new(stamp, Provenance::default())).unwrap();
    h.extended(&plan.records, &plan.closures)
  }

  fn index(h: PropertyHistory) -> PropertyIndex { PropertyIndex::build(Arc::new(h), true) }

  fn prices() -> PropertyHistory {
    let h = PropertyHistory::empty(PropertyKey::new(Uuid::nil(), "price"));
    let h = append(&h, 100.0, "2022-01-01", Some("2022-12-31"), 1);
    let h = append(&h, 120.0, "2023-01-01", Some("2023-03-31"), 2);
    append(&h, 150.0, "2023-04-01", None, 3)
  }

  fn value(p: Cached) -> Option<Value> {
    match p {
      Cached::Hit(rv) => rv.map(|rv| rv.record.value),
      Cached::Miss => panic!("expected a cache hit"),
    }
  }

  #[test]
  fn materialises_after_threshold() {
    let cache = SnapshotCache::new(3, 16);
    let ix = index(prices());

    assert_eq!(cache.lookup(&ix, day("2023-02-01")), Cached::Miss);
    assert_eq!(cache.lookup(&ix, day("2023-02-01")), Cached::Miss);
    assert_eq!(value(cache.lookup(&ix, day("2023-02-01"))), Some(Value::number(120.0)));
    assert!(cache.is_cached(ix.key()));

    assert_eq!(value(cache.lookup(&ix, day("2023-05-01"))), Some(Value::number(150.0)));
    assert_eq!(value(cache.lookup(&ix, day("2022-12-31"))), None);
    assert_eq!(value(cache.lookup(&ix, day("2000-01-01"))), None);
  }

  #[test]
  fn stale_map_is_not_served() {
    let cache = SnapshotCache::new(1, 16);
    let h = prices();
    let before = index(h.clone());
    assert_eq!(value(cache.lookup(&before, day("2024-02-01"))), Some(Value::number(150.0)));

    // A newer head is never answered from the older map.
    let after = index(append(&h, 175.0, "2024-01-01", None, 4));
    assert_eq!(value(cache.lookup(&after, day("2024-02-01"))), Some(Value::number(175.0)));
  }

  #[test]
  fn invalidation_forces_rebuild() {
    let cache = SnapshotCache::new(1, 16);
    let ix = index(prices());
    cache.lookup(&ix, day("2023-02-01"));
    cache.invalidate(ix.key());
    assert!(!cache.is_cached(ix.key()));
    assert!(matches!(cache.lookup(&ix, day("2023-02-01")), Cached::Hit(Some(_))));
  }

  #[test]
  fn read_counters_are_bounded() {
    let cache = SnapshotCache::new(100, 2);
    for n in 0..50 {
      let h = PropertyHistory::empty(PropertyKey::new(Uuid::new_v4(), format!("p{n}")));
      let h = append(&h, 1.0, "2020-01-01", None, 1);
      assert_eq!(cache.lookup(&index(h), day("2021-01-01")), Cached::Miss);
    }
    assert_eq!(cache.tracked(), 2 * SnapshotCache::READS_PER_SLOT);
  }

  #[test]
  fn zero_capacity_disables_cache() {
    let cache = SnapshotCache::new(0, 0);
    let ix = index(prices());
    assert_eq!(cache.lookup(&ix, day("2023-02-01")), Cached::Miss);
  }
}
