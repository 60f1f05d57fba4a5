//! [`MemoryStore`], an in-process [`GraphStore`] backend.
//!
//! Used for tests and for running the server without a database file. It
//! enforces the same contract as the SQLite backend: unique stable keys,
//! compare-and-append on per-property heads, and all-or-nothing batches.

use std::{
  collections::HashMap,
  sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicBool, Ordering},
  },
};

use chrono::Utc;
use ltm_core::{
  Error, Result,
  entity::{Entity, EntityKind, NewEntity, PropertyKey},
  history::PropertyHistory,
  store::{GraphStore, IdempotencyEntry, WriteBatch},
  version::{Closure, TxStamp, VersionRecord},
};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
  entities:    HashMap<Uuid, Entity>,
  /// Creation order, for stable listings.
  order:       Vec<Uuid>,
  keys:        HashMap<String, Uuid>,
  versions:    HashMap<PropertyKey, Vec<VersionRecord>>,
  closures:    HashMap<PropertyKey, Vec<Closure>>,
  heads:       HashMap<PropertyKey, TxStamp>,
  idempotency: HashMap<String, IdempotencyEntry>,
  latest:      Option<TxStamp>,
}

/// Cloning shares the underlying data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  inner:       Arc<RwLock<Inner>>,
  unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }

  /// Simulate an outage: while unavailable every call fails with
  /// [`Error::StorageUnavailable`].
  pub fn set_available(&self, available: bool) {
    self.unavailable.store(!available, Ordering::SeqCst);
  }

  fn check(&self) -> Result<()> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(Error::StorageUnavailable("memory store is offline".into()));
    }
    Ok(())
  }

  fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> Result<T> {
    self.check()?;
    Ok(f(&self.inner.read().unwrap_or_else(PoisonError::into_inner)))
  }

  fn write<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
    self.check()?;
    f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
  }
}

impl GraphStore for MemoryStore {
  type Error = Error;

  async fn create_entity(&self, input: NewEntity) -> Result<Entity> {
    self.write(|inner| {
      if let Some(key) = &input.key
        && inner.keys.contains_key(key)
      {
        return Err(Error::DuplicateKey(key.clone()));
      }
      if let EntityKind::Edge { source, target } = input.kind {
        for end in [source, target] {
          if !inner.entities.contains_key(&end) {
            return Err(Error::EntityNotFound(end));
          }
        }
      }

      let entity = Entity {
        entity_id:  Uuid::new_v4(),
        kind:       input.kind,
        label:      input.label,
        key:        input.key,
        created_at: Utc::now(),
      };
      if let Some(key) = &entity.key {
        inner.keys.insert(key.clone(), entity.entity_id);
      }
      inner.order.push(entity.entity_id);
      inner.entities.insert(entity.entity_id, entity.clone());
      Ok(entity)
    })
  }

  async fn get_entity(&self, id: Uuid) -> Result<Option<Entity>> {
    self.read(|inner| inner.entities.get(&id).cloned())
  }

  async fn find_by_key(&self, key: String) -> Result<Option<Entity>> {
    self.read(|inner| {
      inner
        .keys
        .get(&key)
        .and_then(|id| inner.entities.get(id))
        .cloned()
    })
  }

  async fn list_entities(&self, label: Option<String>) -> Result<Vec<Entity>> {
    self.read(|inner| {
      inner
        .order
        .iter()
        .filter_map(|id| inner.entities.get(id))
        .filter(|e| label.as_ref().is_none_or(|l| &e.label == l))
        .cloned()
        .collect()
    })
  }

  async fn incident_edges(&self, entity_id: Uuid) -> Result<Vec<Entity>> {
    self.read(|inner| {
      inner
        .order
        .iter()
        .filter_map(|id| inner.entities.get(id))
        .filter(|e| {
          matches!(e.kind, EntityKind::Edge { source, target }
            if source == entity_id || target == entity_id)
        })
        .cloned()
        .collect()
    })
  }

  async fn property_names(&self, entity_id: Uuid) -> Result<Vec<String>> {
    self.read(|inner| {
      let mut names: Vec<String> = inner
        .versions
        .keys()
        .filter(|k| k.entity_id == entity_id)
        .map(|k| k.property.clone())
        .collect();
      names.sort();
      names
    })
  }

  async fn load_history(&self, key: PropertyKey) -> Result<PropertyHistory> {
    self.read(|inner| {
      let versions = inner.versions.get(&key).cloned().unwrap_or_default();
      let closures = inner.closures.get(&key).cloned().unwrap_or_default();
      PropertyHistory::new(key, versions, closures)
    })
  }

  async fn commit(&self, batch: WriteBatch) -> Result<()> {
    self.write(|inner| {
      for plan in &batch.plans {
        let found = inner.heads.get(&plan.key).map(|h| h.tx_id);
        if found != plan.expected_head {
          return Err(Error::StaleHead {
            entity_id: plan.key.entity_id,
            property:  plan.key.property.clone(),
            expected:  plan.expected_head,
            found,
          });
        }
        if !inner.entities.contains_key(&plan.key.entity_id) {
          return Err(Error::EntityNotFound(plan.key.entity_id));
        }
      }
      if let Some(entry) = &batch.idempotency
        && inner.idempotency.contains_key(&entry.key)
      {
        return Err(Error::IdempotencyKeyTaken(entry.key.clone()));
      }

      // Every check passed; nothing below can fail.
      for plan in batch.plans {
        if plan.is_empty() {
          continue;
        }
        inner.heads.insert(plan.key.clone(), batch.stamp);
        inner.versions.entry(plan.key.clone()).or_default().extend(plan.records);
        inner.closures.entry(plan.key).or_default().extend(plan.closures);
      }
      if let Some(entry) = batch.idempotency {
        inner.idempotency.insert(entry.key.clone(), entry);
      }
      inner.latest = inner.latest.max(Some(batch.stamp));
      Ok(())
    })
  }

  async fn latest_stamp(&self) -> Result<Option<TxStamp>> {
    self.read(|inner| inner.latest)
  }

  async fn find_idempotency(&self, key: String) -> Result<Option<IdempotencyEntry>> {
    self.read(|inner| inner.idempotency.get(&key).cloned())
  }
}
