//! Write operations: fact ingestion, raw version appends, edges, events and
//! logical deletion.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use ltm_core::{
  Error, Result,
  entity::{EXISTS_PROPERTY, Entity, EntityKind, LOCATION_PROPERTY, NewEntity, PropertyKey},
  history::{AppendMode, PropertyHistory},
  store::{GraphStore, TxReceipt, payload_fingerprint},
  time::{ValidInterval, lenient},
  value::{Geometry, Value},
  version::Provenance,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{KnowledgeStore, Write};

/// Label given to identities created implicitly by [`KnowledgeStore::ingest`].
const DEFAULT_LABEL: &str = "entity";

// ─── Inputs ──────────────────────────────────────────────────────────────────

/// How a fact names its subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectRef {
  /// Exact-match stable key; an identity is created on first sight.
  Key(String),
  /// An identity that must already exist.
  Id(Uuid),
}

/// A structured fact from an upstream producer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactRecord {
  pub subject:         SubjectRef,
  /// Label for a subject created from its key.
  pub subject_label:   Option<String>,
  pub property:        String,
  pub value:           Value,
  pub valid_from:      DateTime<Utc>,
  pub valid_to:        Option<DateTime<Utc>>,
  pub provenance:      Provenance,
  /// Also record this geometry as the subject's `location` over the same
  /// interval.
  pub spatial:         Option<Geometry>,
  /// Replace overlapping versions instead of failing with a conflict.
  pub correction:      bool,
  #[serde(skip)]
  pub idempotency_key: Option<String>,
}

impl FactRecord {
  pub fn new(
    subject: SubjectRef,
    property: impl Into<String>,
    value: Value,
    valid_from: DateTime<Utc>,
  ) -> Self {
    Self {
      subject,
      subject_label: None,
      property: property.into(),
      value,
      valid_from,
      valid_to: None,
      provenance: Provenance::default(),
      spatial: None,
      correction: false,
      idempotency_key: None,
    }
  }

  pub fn until(mut self, valid_to: DateTime<Utc>) -> Self {
    self.valid_to = Some(valid_to);
    self
  }

  pub fn with_provenance(mut self, provenance: Provenance) -> Self {
    self.provenance = provenance;
    self
  }

  pub fn with_spatial(mut self, geometry: Geometry) -> Self {
    self.spatial = Some(geometry);
    self
  }

  pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
    self.idempotency_key = Some(key.into());
    self
  }

  pub fn correcting(mut self) -> Self {
    self.correction = true;
    self
  }

  fn interval(&self) -> Result<ValidInterval> { ValidInterval::new(self.valid_from, self.valid_to) }

  fn mode(&self) -> AppendMode {
    if self.correction { AppendMode::Correct } else { AppendMode::Assert }
  }

  fn validate(&self) -> Result<()> {
    check_property_name(&self.property)?;
    self.provenance.validate()?;
    self.interval()?;
    if let SubjectRef::Key(key) = &self.subject
      && key.trim().is_empty()
    {
      return Err(Error::bad_request("subject_key must not be empty"));
    }
    check_value(&self.property, &self.value)?;
    if let Some(geometry) = &self.spatial {
      if self.property == LOCATION_PROPERTY {
        return Err(Error::bad_request(
          "spatial cannot be combined with a location fact",
        ));
      }
      check_geometry(geometry)?;
    }
    Ok(())
  }
}

/// A directed relationship to record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
  pub label:      String,
  pub source:     Uuid,
  pub target:     Uuid,
  #[serde(deserialize_with = "lenient::timestamp")]
  pub valid_from: DateTime<Utc>,
  #[serde(default, deserialize_with = "lenient::optional")]
  pub valid_to:   Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub provenance: Provenance,
}

/// One participant of an event, linked by an edge labelled `role`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
  pub role:      String,
  pub entity_id: Uuid,
}

/// A reified occurrence with its participants and own properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
  pub label:        String,
  #[serde(default)]
  pub key:          Option<String>,
  #[serde(default)]
  pub participants: Vec<Participant>,
  #[serde(deserialize_with = "lenient::timestamp")]
  pub valid_from:   DateTime<Utc>,
  #[serde(default, deserialize_with = "lenient::optional")]
  pub valid_to:     Option<DateTime<Utc>>,
  #[serde(default)]
  pub properties:   BTreeMap<String, Value>,
  #[serde(flatten)]
  pub provenance:   Provenance,
}

fn check_property_name(name: &str) -> Result<()> {
  if name.trim().is_empty() {
    return Err(Error::bad_request("property name must not be empty"));
  }
  Ok(())
}

fn check_label(label: &str) -> Result<()> {
  if label.trim().is_empty() {
    return Err(Error::bad_request("label must not be empty"));
  }
  Ok(())
}

fn check_geometry(geometry: &Geometry) -> Result<()> {
  match geometry.bounding_box() {
    Some(b) if b.is_well_formed() => Ok(()),
    _ => Err(Error::bad_request("geometry has no well-formed bounding box")),
  }
}

/// Reserved properties carry a fixed value type.
fn check_value(property: &str, value: &Value) -> Result<()> {
  match property {
    EXISTS_PROPERTY if value.as_bool().is_none() => {
      Err(Error::bad_request("exists must be a boolean"))
    }
    LOCATION_PROPERTY => match value.as_geometry() {
      Some(geometry) => check_geometry(geometry),
      None => Err(Error::bad_request("location must be a geometry")),
    },
    _ => Ok(()),
  }
}

// ─── Operations ──────────────────────────────────────────────────────────────

impl<S: GraphStore> KnowledgeStore<S> {
  /// Record a fact, resolving or creating its subject first.
  ///
  /// With an idempotency key, a replay of the same payload returns the
  /// original receipt marked `deduplicated`; a different payload under the
  /// same key is refused.
  pub async fn ingest(&self, fact: FactRecord) -> Result<TxReceipt> {
    fact.validate()?;

    let idempotency = match &fact.idempotency_key {
      Some(key) => {
        let fingerprint = payload_fingerprint(&fact)?;
        if let Some(receipt) = self.replay(key, &fingerprint).await? {
          tracing::debug!(key = %key, tx = %receipt.tx_id, "idempotent replay");
          return Ok(receipt);
        }
        Some((key.clone(), fingerprint))
      }
      None => None,
    };

    let subject = self.resolve_subject(&fact).await?;
    let interval = fact.interval()?;
    let mut writes = vec![Write::append(
      PropertyKey::new(subject.entity_id, fact.property.as_str()),
      fact.value.clone(),
      interval,
      fact.mode(),
      fact.provenance.clone(),
    )];
    if let Some(geometry) = &fact.spatial {
      writes.push(Write::append(
        PropertyKey::new(subject.entity_id, LOCATION_PROPERTY),
        Value::Geometry(geometry.clone()),
        interval,
        fact.mode(),
        fact.provenance.clone(),
      ));
    }

    match self.commit_writes(subject.entity_id, writes, idempotency.clone()).await {
      // Lost the key to a concurrent writer; answer as its replay would.
      Err(Error::IdempotencyKeyTaken(key)) => {
        let fingerprint = idempotency.map(|(_, f)| f).unwrap_or_default();
        self
          .replay(&key, &fingerprint)
          .await?
          .ok_or(Error::IdempotencyKeyTaken(key))
      }
      other => other,
    }
  }

  async fn replay(&self, key: &str, fingerprint: &str) -> Result<Option<TxReceipt>> {
    match self.store.find_idempotency(key.to_owned()).await.map_err(Into::into)? {
      None => Ok(None),
      Some(entry) if entry.fingerprint == fingerprint => {
        Ok(Some(TxReceipt { deduplicated: true, ..entry.receipt }))
      }
      Some(_) => Err(Error::IdempotencyMismatch(key.to_owned())),
    }
  }

  /// Exact-match entity resolution on the stable key.
  async fn resolve_subject(&self, fact: &FactRecord) -> Result<Entity> {
    let key = match &fact.subject {
      SubjectRef::Id(id) => return self.entity(*id).await,
      SubjectRef::Key(key) => key,
    };
    if let Some(entity) = self.store.find_by_key(key.clone()).await.map_err(Into::into)? {
      return Ok(entity);
    }

    let label = fact.subject_label.as_deref().unwrap_or(DEFAULT_LABEL);
    match self
      .store
      .create_entity(NewEntity::node(label).with_key(key.as_str()))
      .await
      .map_err(Into::into)
    {
      Ok(entity) => {
        tracing::debug!(key = %key, id = %entity.entity_id, "created identity");
        Ok(entity)
      }
      // Created concurrently by another ingest.
      Err(Error::DuplicateKey(_)) => self
        .store
        .find_by_key(key.clone())
        .await
        .map_err(Into::into)?
        .ok_or_else(|| Error::DuplicateKey(key.clone())),
      Err(e) => Err(e),
    }
  }

  /// Append one version to `key` under a fresh transaction.
  pub async fn append_version(
    &self,
    key: PropertyKey,
    value: Value,
    interval: ValidInterval,
    provenance: Provenance,
    mode: AppendMode,
  ) -> Result<TxReceipt> {
    check_property_name(&key.property)?;
    check_value(&key.property, &value)?;
    provenance.validate()?;
    let entity_id = self.entity(key.entity_id).await?.entity_id;
    self
      .commit_writes(entity_id, vec![Write::append(key, value, interval, mode, provenance)], None)
      .await
  }

  /// Allocate a node or event identity. Edges go through
  /// [`KnowledgeStore::create_edge`].
  pub async fn create_entity(&self, input: NewEntity) -> Result<Entity> {
    if matches!(input.kind, EntityKind::Edge { .. }) {
      return Err(Error::bad_request("edges are created with their endpoints and interval"));
    }
    check_label(&input.label)?;
    if input.key.as_deref().is_some_and(|k| k.trim().is_empty()) {
      return Err(Error::bad_request("key must not be empty"));
    }
    self.store.create_entity(input).await.map_err(Into::into)
  }

  /// Create an edge and assert its existence over the given interval.
  pub async fn create_edge(&self, edge: EdgeRecord) -> Result<(Entity, TxReceipt)> {
    check_label(&edge.label)?;
    edge.provenance.validate()?;
    let interval = ValidInterval::new(edge.valid_from, edge.valid_to)?;
    self.entity(edge.source).await?;
    self.entity(edge.target).await?;

    let entity = self
      .store
      .create_entity(NewEntity::edge(edge.label, edge.source, edge.target))
      .await
      .map_err(Into::into)?;
    let exists = Write::append(
      PropertyKey::new(entity.entity_id, EXISTS_PROPERTY),
      Value::boolean(true),
      interval,
      AppendMode::Assert,
      edge.provenance,
    );
    let receipt = self.commit_writes(entity.entity_id, vec![exists], None).await?;
    Ok((entity, receipt))
  }

  /// Create an event node, link it to its participants and record its
  /// properties, all under one transaction.
  pub async fn record_event(&self, event: EventRecord) -> Result<(Entity, TxReceipt)> {
    check_label(&event.label)?;
    event.provenance.validate()?;
    let interval = ValidInterval::new(event.valid_from, event.valid_to)?;
    for participant in &event.participants {
      check_label(&participant.role)?;
      self.entity(participant.entity_id).await?;
    }
    for (name, value) in &event.properties {
      check_property_name(name)?;
      check_value(name, value)?;
    }

    let mut node = NewEntity::event(event.label);
    node.key = event.key;
    let entity = self.create_entity(node).await?;

    let mut writes: Vec<Write> = event
      .properties
      .into_iter()
      .map(|(name, value)| {
        Write::append(
          PropertyKey::new(entity.entity_id, name),
          value,
          interval,
          AppendMode::Assert,
          event.provenance.clone(),
        )
      })
      .collect();
    for participant in event.participants {
      let edge = self
        .store
        .create_entity(NewEntity::edge(participant.role, entity.entity_id, participant.entity_id))
        .await
        .map_err(Into::into)?;
      writes.push(Write::append(
        PropertyKey::new(edge.entity_id, EXISTS_PROPERTY),
        Value::boolean(true),
        interval,
        AppendMode::Assert,
        event.provenance.clone(),
      ));
    }

    let receipt = self.commit_writes(entity.entity_id, writes, None).await?;
    Ok((entity, receipt))
  }

  /// Close every open property of `entity_id` at the current wall-clock
  /// time. Edges incident on a node close with it. `None` when nothing was
  /// still in force, in which case no transaction is recorded.
  pub async fn logical_delete(&self, entity_id: Uuid) -> Result<Option<TxReceipt>> {
    let entity = self.entity(entity_id).await?;
    let valid_to = self.now();

    let mut keys: Vec<PropertyKey> = self
      .store
      .property_names(entity_id)
      .await
      .map_err(Into::into)?
      .into_iter()
      .map(|name| PropertyKey::new(entity_id, name))
      .collect();
    if !entity.is_edge() {
      for edge in self.store.incident_edges(entity_id).await.map_err(Into::into)? {
        keys.push(PropertyKey::new(edge.entity_id, EXISTS_PROPERTY));
      }
    }
    keys.sort();
    keys.dedup();

    let mut writes = Vec::with_capacity(keys.len());
    for key in keys {
      let index = self.index_for(&key).await?;
      let open = index
        .current()
        .iter()
        .any(|rv| rv.effective.is_some_and(|eff| eff.extends_past(valid_to)));
      if open {
        writes.push(Write::close(key, valid_to));
      }
    }
    if writes.is_empty() {
      tracing::debug!(%entity_id, "nothing in force, delete is a no-op");
      return Ok(None);
    }

    let receipt = self.commit_writes(entity_id, writes, None).await?;
    tracing::info!(%entity_id, tx = %receipt.tx_id, closed = receipt.closed, "logically deleted");
    Ok(Some(receipt))
  }

  /// The full version history of one property, ordered by `valid_from`.
  pub async fn property_history(&self, key: &PropertyKey) -> Result<Arc<PropertyHistory>> {
    self.entity(key.entity_id).await?;
    Ok(self.index_for(key).await?.history().clone())
  }
}
