//! Read operations: pattern retrieval, entity history and spatial search.
//!
//! Every identity on a matched path is resolved against the same
//! `(valid_at, transaction_at)` cut, so a traversal sees one consistent
//! slice of the bitemporal plane.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use ltm_core::{
  Error, Result,
  entity::{EXISTS_PROPERTY, Entity, LOCATION_PROPERTY, PropertyKey},
  query::{
    Anchor, Diagnostic, DiagnosticKind, Pattern, QueryOutcome, RetrievedValue, TemporalSelector,
  },
  store::GraphStore,
  time::ValidInterval,
  value::{BoundingBox, Geometry},
  version::{Closure, ResolvedVersion},
};
use serde::Serialize;
use uuid::Uuid;

use crate::{KnowledgeStore, cache::Cached};

/// A selector with "now" pinned.
#[derive(Debug, Clone, Copy)]
enum Slice {
  At {
    valid_at: DateTime<Utc>,
    as_of:    Option<DateTime<Utc>>,
  },
  Over { range: ValidInterval },
}

/// Every version of every property of one identity.
#[derive(Debug, Clone, Serialize)]
pub struct EntityHistory {
  pub entity:     Entity,
  pub properties: Vec<PropertyVersions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertyVersions {
  pub property: String,
  /// Ordered by `valid_from`, superseded versions included.
  pub versions: Vec<ResolvedVersion>,
  pub closures: Vec<Closure>,
}

impl<S: GraphStore> KnowledgeStore<S> {
  fn slice(&self, selector: TemporalSelector) -> Slice {
    match selector {
      TemporalSelector::Current => Slice::At { valid_at: self.now(), as_of: None },
      TemporalSelector::Snapshot { valid_at } => Slice::At { valid_at, as_of: None },
      TemporalSelector::Audit { valid_at, transaction_at } => {
        Slice::At { valid_at, as_of: Some(transaction_at) }
      }
      TemporalSelector::Range { range } => Slice::Over { range },
    }
  }

  /// Match `pattern` and resolve the selected properties of the identities
  /// it reaches. An anchor that names nothing yields an empty result.
  pub async fn retrieve(
    &self,
    pattern: &Pattern,
    selector: TemporalSelector,
  ) -> Result<QueryOutcome> {
    let slice = self.slice(selector);
    let mut outcome = QueryOutcome::default();

    let mut frontier: Vec<(Uuid, Vec<Uuid>)> = self
      .anchor(&pattern.anchor)
      .await?
      .into_iter()
      .map(|e| (e.entity_id, Vec::new()))
      .collect();

    for hop in &pattern.hops {
      let mut next = Vec::new();
      let mut seen = HashSet::new();
      for (from, path) in &frontier {
        for edge in self.store.incident_edges(*from).await.map_err(Into::into)? {
          if edge.label != hop.label {
            continue;
          }
          let Some(to) = edge.step_from(*from, hop.direction) else {
            continue;
          };
          if seen.contains(&to) || !self.edge_exists(&edge, slice, &mut outcome.diagnostics).await? {
            continue;
          }
          seen.insert(to);
          let mut path = path.clone();
          path.push(edge.entity_id);
          next.push((to, path));
        }
      }
      frontier = next;
    }

    for (entity_id, path) in frontier {
      let properties = match &pattern.property {
        Some(property) => vec![property.clone()],
        None => self.store.property_names(entity_id).await.map_err(Into::into)?,
      };
      for property in properties {
        let key = PropertyKey::new(entity_id, property);
        for rv in self.resolve(&key, slice, &mut outcome.diagnostics).await? {
          if let Some(value) = retrieved(rv, &path) {
            outcome.results.push(value);
          }
        }
      }
    }
    Ok(outcome)
  }

  async fn anchor(&self, anchor: &Anchor) -> Result<Vec<Entity>> {
    let found = match anchor {
      Anchor::Id(id) => self.store.get_entity(*id).await.map_err(Into::into)?.into_iter().collect(),
      Anchor::Key(key) => {
        self.store.find_by_key(key.clone()).await.map_err(Into::into)?.into_iter().collect()
      }
      Anchor::Label(label) => {
        self.store.list_entities(Some(label.clone())).await.map_err(Into::into)?
      }
    };
    Ok(found)
  }

  async fn edge_exists(
    &self,
    edge: &Entity,
    slice: Slice,
    diagnostics: &mut Vec<Diagnostic>,
  ) -> Result<bool> {
    let key = PropertyKey::new(edge.entity_id, EXISTS_PROPERTY);
    let versions = self.resolve(&key, slice, diagnostics).await?;
    Ok(versions.iter().any(|rv| rv.record.value.as_bool() == Some(true)))
  }

  /// Resolve one property under `slice`. Point reads return at most one
  /// version; when several match, the latest transaction wins and the tie
  /// is reported.
  async fn resolve(
    &self,
    key: &PropertyKey,
    slice: Slice,
    diagnostics: &mut Vec<Diagnostic>,
  ) -> Result<Vec<ResolvedVersion>> {
    let index = self.index_for(key).await?;
    let lookup = match slice {
      Slice::At { valid_at, as_of: None } => match self.cache.lookup(&index, valid_at) {
        Cached::Hit(hit) => return Ok(hit.into_iter().collect()),
        Cached::Miss => index.at(valid_at, None),
      },
      Slice::At { valid_at, as_of } => index.at(valid_at, as_of),
      Slice::Over { range } => index.overlapping(&range, None),
    };

    if lookup.scanned {
      tracing::warn!(%key, "range index unavailable, scanned full history");
      diagnostics.push(Diagnostic {
        kind:       DiagnosticKind::IndexUnavailable,
        key:        key.clone(),
        candidates: Vec::new(),
        chosen:     None,
      });
    }

    let mut versions = lookup.versions;
    if matches!(slice, Slice::At { .. }) && versions.len() > 1 {
      let candidates: Vec<Uuid> = versions.iter().map(|rv| rv.record.version_id).collect();
      versions.sort_by_key(|rv| rv.record.transaction.stamp());
      let chosen = versions.split_off(versions.len() - 1);
      let chosen_id = chosen.first().map(|rv| rv.record.version_id);
      tracing::warn!(%key, candidates = candidates.len(), "ambiguous snapshot, chose latest transaction");
      diagnostics.push(Diagnostic {
        kind: DiagnosticKind::AmbiguousSnapshot,
        key: key.clone(),
        candidates,
        chosen: chosen_id,
      });
      return Ok(chosen);
    }
    Ok(versions)
  }

  /// Every recorded version and closure of every property of `entity_id`.
  pub async fn history(&self, entity_id: Uuid) -> Result<EntityHistory> {
    let entity = self.entity(entity_id).await?;
    let mut properties = Vec::new();
    for property in self.store.property_names(entity_id).await.map_err(Into::into)? {
      let index = self.index_for(&PropertyKey::new(entity_id, property.as_str())).await?;
      let history = index.history();
      properties.push(PropertyVersions {
        property,
        versions: history.resolve_all(None),
        closures: history.closures().to_vec(),
      });
    }
    Ok(EntityHistory { entity, properties })
  }

  /// `location` versions whose bounding box meets `bbox` under `selector`.
  pub async fn spatial(
    &self,
    bbox: BoundingBox,
    selector: TemporalSelector,
  ) -> Result<QueryOutcome> {
    if !bbox.is_well_formed() {
      return Err(Error::bad_request("bounding box must have min <= max on both axes"));
    }
    let slice = self.slice(selector);
    let mut outcome = QueryOutcome::default();

    for entity_id in self.spatial.entities_within(&bbox) {
      let key = PropertyKey::new(entity_id, LOCATION_PROPERTY);
      for rv in self.resolve(&key, slice, &mut outcome.diagnostics).await? {
        let inside = rv
          .record
          .value
          .as_geometry()
          .and_then(Geometry::bounding_box)
          .is_some_and(|b| b.intersects(&bbox));
        if inside && let Some(value) = retrieved(rv, &[]) {
          outcome.results.push(value);
        }
      }
    }
    outcome
      .results
      .sort_by(|a, b| (a.entity_id, a.valid.valid_from).cmp(&(b.entity_id, b.valid.valid_from)));
    Ok(outcome)
  }
}

fn retrieved(rv: ResolvedVersion, path: &[Uuid]) -> Option<RetrievedValue> {
  let valid = rv.effective?;
  Some(RetrievedValue {
    entity_id: rv.record.entity_id,
    property: rv.record.property,
    version_id: rv.record.version_id,
    value: rv.record.value,
    valid,
    state: rv.state,
    transaction: rv.record.transaction,
    path: path.to_vec(),
  })
}
