//! Property values: a closed tagged union.
//!
//! Every consumer (versioning, query engine, spatial index) matches on the
//! three top-level cases exhaustively; there is no open dynamic type.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Scalars ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
  Text(String),
  Integer(i64),
  Number(f64),
  Boolean(bool),
  Timestamp(DateTime<Utc>),
  /// A reference to another identity node by id.
  Entity(Uuid),
}

// ─── Geometry ────────────────────────────────────────────────────────────────

/// An axis-aligned bounding box. Used both as a geometry and as the key of
/// the spatial index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub min_x: f64,
  pub min_y: f64,
  pub max_x: f64,
  pub max_y: f64,
}

impl BoundingBox {
  pub fn intersects(&self, other: &BoundingBox) -> bool {
    self.min_x <= other.max_x
      && other.min_x <= self.max_x
      && self.min_y <= other.max_y
      && other.min_y <= self.max_y
  }

  pub fn is_well_formed(&self) -> bool {
    [self.min_x, self.min_y, self.max_x, self.max_y]
      .iter()
      .all(|c| c.is_finite())
      && self.min_x <= self.max_x
      && self.min_y <= self.max_y
  }
}

/// A location value: a point or a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Geometry {
  Point { x: f64, y: f64 },
  Rect(BoundingBox),
  /// A closed ring of `[x, y]` vertices.
  Polygon { ring: Vec<[f64; 2]> },
}

impl Geometry {
  /// Smallest box enclosing the geometry; `None` for an empty polygon.
  pub fn bounding_box(&self) -> Option<BoundingBox> {
    match self {
      Self::Point { x, y } => Some(BoundingBox {
        min_x: *x,
        min_y: *y,
        max_x: *x,
        max_y: *y,
      }),
      Self::Rect(b) => Some(*b),
      Self::Polygon { ring } => {
        let (first, rest) = ring.split_first()?;
        let init = BoundingBox {
          min_x: first[0],
          min_y: first[1],
          max_x: first[0],
          max_y: first[1],
        };
        Some(rest.iter().fold(init, |b, [x, y]| BoundingBox {
          min_x: b.min_x.min(*x),
          min_y: b.min_y.min(*y),
          max_x: b.max_x.max(*x),
          max_y: b.max_y.max(*y),
        }))
      }
    }
  }
}

// ─── Value ───────────────────────────────────────────────────────────────────

/// The value carried by one property version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Value {
  Scalar(Scalar),
  /// A structured object; nested values follow the same closed union.
  Record(BTreeMap<String, Value>),
  Geometry(Geometry),
}

impl Value {
  pub fn text(s: impl Into<String>) -> Self { Self::Scalar(Scalar::Text(s.into())) }

  pub fn number(n: f64) -> Self { Self::Scalar(Scalar::Number(n)) }

  pub fn boolean(b: bool) -> Self { Self::Scalar(Scalar::Boolean(b)) }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Self::Scalar(Scalar::Boolean(b)) => Some(*b),
      _ => None,
    }
  }

  pub fn as_geometry(&self) -> Option<&Geometry> {
    match self {
      Self::Geometry(g) => Some(g),
      _ => None,
    }
  }
}

impl From<f64> for Value {
  fn from(n: f64) -> Self { Self::number(n) }
}

impl From<i64> for Value {
  fn from(n: i64) -> Self { Self::Scalar(Scalar::Integer(n)) }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self { Self::boolean(b) }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self { Self::text(s) }
}

impl From<Geometry> for Value {
  fn from(g: Geometry) -> Self { Self::Geometry(g) }
}
