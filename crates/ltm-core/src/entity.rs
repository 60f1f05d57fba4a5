//! Identity nodes, relationships and events.
//!
//! Identities are thin, permanent envelopes: an id, a kind and a label. All
//! time-varying information lives in property version lists, including an
//! edge's own existence. Identities are never physically deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Property holding an edge's versioned existence (`Boolean`).
pub const EXISTS_PROPERTY: &str = "exists";

/// Property holding an entity's versioned geometry.
pub const LOCATION_PROPERTY: &str = "location";

/// What an identity represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKind {
  /// A persisting real-world entity (company, person, stock).
  Node,
  /// A reified occurrence linked to its participants by edges.
  Event,
  /// A directed relationship between two identities.
  Edge { source: Uuid, target: Uuid },
}

/// Which way to follow an edge during traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  Outgoing,
  Incoming,
}

/// An identity node, event node, or relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
  pub entity_id:  Uuid,
  #[serde(flatten)]
  pub kind:       EntityKind,
  /// Entity category, e.g. `company`, or the relation name for edges.
  pub label:      String,
  /// Stable external key used for exact-match entity resolution.
  pub key:        Option<String>,
  pub created_at: DateTime<Utc>,
}

impl Entity {
  pub fn is_edge(&self) -> bool { matches!(self.kind, EntityKind::Edge { .. }) }

  /// Where walking this edge from `from` in `direction` leads, if the edge
  /// can be walked that way at all.
  pub fn step_from(&self, from: Uuid, direction: Direction) -> Option<Uuid> {
    match (self.kind, direction) {
      (EntityKind::Edge { source, target }, Direction::Outgoing) if source == from => Some(target),
      (EntityKind::Edge { source, target }, Direction::Incoming) if target == from => Some(source),
      _ => None,
    }
  }
}

/// Input to [`crate::store::GraphStore::create_entity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntity {
  pub kind:  EntityKind,
  pub label: String,
  pub key:   Option<String>,
}

impl NewEntity {
  pub fn node(label: impl Into<String>) -> Self {
    Self { kind: EntityKind::Node, label: label.into(), key: None }
  }

  pub fn event(label: impl Into<String>) -> Self {
    Self { kind: EntityKind::Event, label: label.into(), key: None }
  }

  pub fn edge(label: impl Into<String>, source: Uuid, target: Uuid) -> Self {
    Self {
      kind:  EntityKind::Edge { source, target },
      label: label.into(),
      key:   None,
    }
  }

  pub fn with_key(mut self, key: impl Into<String>) -> Self {
    self.key = Some(key.into());
    self
  }
}

/// The `(identity, property name)` pair that owns one version list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyKey {
  pub entity_id: Uuid,
  pub property:  String,
}

impl PropertyKey {
  pub fn new(entity_id: Uuid, property: impl Into<String>) -> Self {
    Self { entity_id, property: property.into() }
  }
}

impl std::fmt::Display for PropertyKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}.{}", self.entity_id, self.property)
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::*;

  #[test]
  fn edges_walk_only_from_their_own_ends() {
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let edge = Entity {
      entity_id:  Uuid::new_v4(),
      kind:       EntityKind::Edge { source: a, target: b },
      label:      "employs".into(),
      key:        None,
      created_at: Utc::now(),
    };
    assert_eq!(edge.step_from(a, Direction::Outgoing), Some(b));
    assert_eq!(edge.step_from(b, Direction::Incoming), Some(a));
    assert_eq!(edge.step_from(b, Direction::Outgoing), None);
    assert_eq!(edge.step_from(c, Direction::Incoming), None);
  }

  #[test]
  fn entity_kind_flattens_into_the_envelope() {
    let json = serde_json::to_value(Entity {
      entity_id:  Uuid::nil(),
      kind:       EntityKind::Node,
      label:      "company".into(),
      key:        Some("AAPL".into()),
      created_at: Utc::now(),
    })
    .unwrap();
    assert_eq!(json["kind"], "node");
    assert_eq!(json["key"], "AAPL");
  }
}
