//! Per-property write serialisation.

use std::sync::Arc;

use dashmap::DashMap;
use ltm_core::entity::PropertyKey;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per `(identity, property)` key.
///
/// Writers to the same key queue behind each other; writers to different
/// keys never contend. Multi-key writers take their locks in key order so
/// two of them cannot deadlock. A key's entry lives only while someone
/// holds or waits for its lock.
#[derive(Debug, Default)]
pub struct KeyLocks {
  locks: DashMap<PropertyKey, Arc<Mutex<()>>>,
}

/// A held key lock. Dropping it releases the lock and forgets the key if
/// nobody else is queued on it.
#[derive(Debug)]
pub struct KeyGuard<'a> {
  locks: &'a DashMap<PropertyKey, Arc<Mutex<()>>>,
  key:   PropertyKey,
  guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
  fn drop(&mut self) {
    drop(self.guard.take());
    // Waiters hold a clone of the Arc, so a count of one is the map's own.
    self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
  }
}

impl KeyLocks {
  pub fn new() -> Self { Self::default() }

  /// Lock every key in `keys`; the locks are held until the guards drop.
  pub async fn lock_all(&self, keys: &[PropertyKey]) -> Vec<KeyGuard<'_>> {
    let mut sorted = keys.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut guards = Vec::with_capacity(sorted.len());
    for key in sorted {
      // Clone the Arc out so no map shard is held across the await.
      let lock = self.locks.entry(key.clone()).or_default().clone();
      let guard = lock.lock_owned().await;
      guards.push(KeyGuard { locks: &self.locks, key, guard: Some(guard) });
    }
    guards
  }

  /// Keys currently held or waited on.
  pub fn len(&self) -> usize { self.locks.len() }

  pub fn is_empty(&self) -> bool { self.locks.is_empty() }
}
