//! The bitemporal knowledge store engine.
//!
//! [`KnowledgeStore`] sits between callers and a [`GraphStore`] backend. It
//! turns facts into version plans, serialises writers per property key,
//! commits with compare-and-append on property heads (re-planning when it
//! loses a race), and answers temporal queries from its in-memory indexes.

pub mod cache;
pub mod config;
pub mod index;
pub mod locks;
pub mod memory;
pub mod spatial;

mod ingest;
mod query;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ltm_core::{
  Error, Result,
  clock::{Clock, TxSequencer},
  entity::{Entity, LOCATION_PROPERTY, PropertyKey},
  history::{AppendMode, AppendPlan, PropertyHistory, VersionDraft},
  store::{GraphStore, IdempotencyEntry, TxReceipt, WriteBatch},
  time::ValidInterval,
  value::Value,
  version::{Provenance, Transaction},
};
use uuid::Uuid;

pub use config::EngineConfig;
pub use ingest::{EdgeRecord, EventRecord, FactRecord, Participant, SubjectRef};
pub use memory::MemoryStore;
pub use query::{EntityHistory, PropertyVersions};

use crate::{cache::SnapshotCache, index::{IndexRegistry, PropertyIndex}, locks::KeyLocks, spatial::GridIndex};

/// One property change inside a transaction.
#[derive(Debug, Clone)]
pub(crate) struct Write {
  key: PropertyKey,
  op:  WriteOp,
}

#[derive(Debug, Clone)]
enum WriteOp {
  Append {
    value:      Value,
    interval:   ValidInterval,
    mode:       AppendMode,
    provenance: Provenance,
  },
  Close { valid_to: DateTime<Utc> },
}

impl Write {
  pub(crate) fn append(
    key: PropertyKey,
    value: Value,
    interval: ValidInterval,
    mode: AppendMode,
    provenance: Provenance,
  ) -> Self {
    Self { key, op: WriteOp::Append { value, interval, mode, provenance } }
  }

  pub(crate) fn close(key: PropertyKey, valid_to: DateTime<Utc>) -> Self {
    Self { key, op: WriteOp::Close { valid_to } }
  }
}

pub struct KnowledgeStore<S> {
  store:     S,
  sequencer: Arc<TxSequencer>,
  config:    EngineConfig,
  indexes:   IndexRegistry,
  cache:     SnapshotCache,
  spatial:   GridIndex,
  locks:     KeyLocks,
}

impl<S: GraphStore> KnowledgeStore<S> {
  /// Open the engine over `store`, seeding the transaction clock from the
  /// latest transaction the backend has recorded.
  pub async fn open(store: S, clock: Arc<dyn Clock>, config: EngineConfig) -> Result<Self> {
    let last = store.latest_stamp().await.map_err(Into::into)?;
    let sequencer = Arc::new(TxSequencer::new(clock, last));
    Self::with_sequencer(store, sequencer, config).await
  }

  /// Open the engine with an existing sequencer, shared with other writers
  /// of the same backend.
  pub async fn with_sequencer(
    store: S,
    sequencer: Arc<TxSequencer>,
    config: EngineConfig,
  ) -> Result<Self> {
    let engine = Self {
      cache: SnapshotCache::new(config.cache_threshold, config.cache_capacity),
      spatial: GridIndex::new(config.spatial_cell_size),
      indexes: IndexRegistry::new(config.index_capacity),
      locks: KeyLocks::new(),
      store,
      sequencer,
      config,
    };
    engine.warm_spatial().await?;
    Ok(engine)
  }

  pub fn store(&self) -> &S { &self.store }

  pub fn config(&self) -> &EngineConfig { &self.config }

  pub fn sequencer(&self) -> &Arc<TxSequencer> { &self.sequencer }

  /// Wall-clock "now" as the engine sees it.
  pub fn now(&self) -> DateTime<Utc> { self.sequencer.now() }

  /// Fetch an identity or fail with [`Error::EntityNotFound`].
  pub async fn entity(&self, entity_id: Uuid) -> Result<Entity> {
    self
      .store
      .get_entity(entity_id)
      .await
      .map_err(Into::into)?
      .ok_or(Error::EntityNotFound(entity_id))
  }

  /// Load every recorded location into the spatial grid. The histories are
  /// not kept; their indexes are built on first use like any other.
  async fn warm_spatial(&self) -> Result<()> {
    let entities = self.store.list_entities(None).await.map_err(Into::into)?;
    for entity in entities {
      let names = self.store.property_names(entity.entity_id).await.map_err(Into::into)?;
      if names.iter().any(|n| n == LOCATION_PROPERTY) {
        let key = PropertyKey::new(entity.entity_id, LOCATION_PROPERTY);
        let history = self.store.load_history(key).await.map_err(Into::into)?;
        self.spatial.insert_all(history.versions());
      }
    }
    tracing::debug!(locations = self.spatial.len(), "spatial index warmed");
    Ok(())
  }

  /// The current index for `key`, loading the history on first use.
  pub(crate) async fn index_for(&self, key: &PropertyKey) -> Result<Arc<PropertyIndex>> {
    if let Some(index) = self.indexes.get(key) {
      return Ok(index);
    }
    let epoch = self.indexes.epoch();
    let history = self.store.load_history(key.clone()).await.map_err(Into::into)?;
    Ok(self.indexes.adopt(self.build_index(history), epoch))
  }

  fn build_index(&self, history: PropertyHistory) -> Arc<PropertyIndex> {
    if history.key().property == LOCATION_PROPERTY {
      self.spatial.insert_all(history.versions());
    }
    Arc::new(PropertyIndex::build(Arc::new(history), self.config.range_index))
  }

  /// Forget what is held in memory for `keys` so the next use reloads
  /// them from the store.
  fn forget(&self, keys: &[PropertyKey]) {
    for key in keys {
      self.indexes.evict(key);
      self.cache.invalidate(key);
    }
  }

  /// Plan and commit `writes` as one transaction on behalf of `entity_id`.
  ///
  /// The keys stay locked for the whole attempt loop. Plans are built
  /// against a provisional stamp and only take a transaction id once all of
  /// them succeed, so a rejected write consumes nothing. A commit refused
  /// with [`Error::StaleHead`] means another process moved a head; the plans
  /// are rebuilt from freshly loaded histories, up to `max_write_retries`
  /// times. When the backend cannot say whether a commit landed, the keys'
  /// in-memory state is dropped and reloaded on next use.
  pub(crate) async fn commit_writes(
    &self,
    entity_id: Uuid,
    writes: Vec<Write>,
    idempotency: Option<(String, String)>,
  ) -> Result<TxReceipt> {
    let keys: Vec<PropertyKey> = writes.iter().map(|w| w.key.clone()).collect();
    let mut distinct = keys.clone();
    distinct.sort();
    distinct.dedup();
    if distinct.len() != keys.len() {
      return Err(Error::bad_request("a transaction may write each property only once"));
    }
    let _guards = self.locks.lock_all(&keys).await;

    let mut attempt = 0;
    loop {
      let mut histories = Vec::with_capacity(writes.len());
      for write in &writes {
        let history = if attempt == 0 {
          self.index_for(&write.key).await?.history().clone()
        } else {
          Arc::new(self.store.load_history(write.key.clone()).await.map_err(Into::into)?)
        };
        histories.push(history);
      }

      let provisional = self.sequencer.peek();
      let plans = writes
        .iter()
        .zip(&histories)
        .map(|(write, history)| match &write.op {
          WriteOp::Append { value, interval, mode, provenance } => history.plan_append(
            VersionDraft {
              key:      write.key.clone(),
              value:    value.clone(),
              interval: *interval,
              mode:     *mode,
            },
            Transaction::new(provisional, provenance.clone()),
          ),
          WriteOp::Close { valid_to } => history.plan_delete(*valid_to, provisional),
        })
        .collect::<Result<Vec<_>>>()?;

      // `next` never precedes `peek`, so the head checks made while planning
      // still hold for the real stamp.
      let stamp = self.sequencer.next();
      let plans: Vec<AppendPlan> = plans.into_iter().map(|plan| plan.restamped(stamp)).collect();

      let receipt = TxReceipt {
        tx_id: stamp.tx_id,
        tx_timestamp: stamp.tx_timestamp,
        entity_id,
        version_ids: plans.iter().filter_map(|p| p.version_id).collect(),
        closed: plans.iter().map(|p| p.closures.len()).sum(),
        deduplicated: false,
      };
      let updated: Vec<PropertyHistory> = histories
        .iter()
        .zip(&plans)
        .map(|(history, plan)| history.extended(&plan.records, &plan.closures))
        .collect();
      let batch = WriteBatch {
        stamp,
        plans,
        idempotency: idempotency.clone().map(|(key, fingerprint)| IdempotencyEntry {
          key,
          fingerprint,
          receipt: receipt.clone(),
        }),
      };

      match self.store.commit(batch).await.map_err(Into::into) {
        Ok(()) => {
          for history in updated {
            let key = history.key().clone();
            self.indexes.publish(self.build_index(history));
            self.cache.invalidate(&key);
          }
          tracing::debug!(
            tx = %stamp.tx_id,
            entity = %entity_id,
            versions = receipt.version_ids.len(),
            closed = receipt.closed,
            "committed"
          );
          return Ok(receipt);
        }
        Err(Error::StaleHead { entity_id, property, .. })
          if attempt < self.config.max_write_retries =>
        {
          attempt += 1;
          tracing::debug!(%entity_id, %property, attempt, "head moved, re-planning");
        }
        Err(e @ Error::StorageUnavailable(_)) => {
          tracing::warn!(tx = %stamp.tx_id, entity = %entity_id, "commit outcome unknown, dropping cached state");
          self.forget(&keys);
          return Err(e);
        }
        Err(e) => return Err(e),
      }
    }
  }
}

impl<S> std::fmt::Debug for KnowledgeStore<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("KnowledgeStore")
      .field("config", &self.config)
      .field("indexes", &self.indexes.len())
      .field("cache", &self.cache)
      .finish()
  }
}
