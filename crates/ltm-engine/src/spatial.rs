//! Uniform-grid spatial index over `location` versions.
//!
//! The grid holds the bounding box of every location version ever recorded,
//! superseded ones included; it only narrows candidates. Temporal filtering
//! happens afterwards, through the property indexes.

use std::{
  collections::{HashMap, HashSet},
  sync::{PoisonError, RwLock},
};

use ltm_core::{value::BoundingBox, version::VersionRecord};
use uuid::Uuid;

/// Boxes spanning more cells than this go to a side list scanned on every
/// query instead of being smeared across the grid.
const MAX_CELLS_PER_ENTRY: i64 = 4096;

type Cell = (i64, i64);

#[derive(Debug, Default)]
struct Grid {
  cells:    HashMap<Cell, Vec<Uuid>>,
  oversize: Vec<Uuid>,
  /// version id → (owning entity, bounding box)
  entries:  HashMap<Uuid, (Uuid, BoundingBox)>,
}

#[derive(Debug)]
pub struct GridIndex {
  cell_size: f64,
  grid:      RwLock<Grid>,
}

impl GridIndex {
  /// A grid with square cells of side `cell_size` (`1.0` if not positive).
  pub fn new(cell_size: f64) -> Self {
    let cell_size = if cell_size.is_finite() && cell_size > 0.0 { cell_size } else { 1.0 };
    Self { cell_size, grid: RwLock::new(Grid::default()) }
  }

  fn cell_range(&self, b: &BoundingBox) -> (Cell, Cell) {
    let c = |v: f64| (v / self.cell_size).floor() as i64;
    ((c(b.min_x), c(b.min_y)), (c(b.max_x), c(b.max_y)))
  }

  fn span(((x0, y0), (x1, y1)): (Cell, Cell)) -> i64 {
    let w = x1.saturating_sub(x0).saturating_add(1);
    let h = y1.saturating_sub(y0).saturating_add(1);
    w.saturating_mul(h)
  }

  /// Index the geometry of every record that has one. Records already
  /// indexed are skipped.
  pub fn insert_all<'a>(&self, records: impl IntoIterator<Item = &'a VersionRecord>) {
    let mut grid = self.grid.write().unwrap_or_else(PoisonError::into_inner);
    for record in records {
      if grid.entries.contains_key(&record.version_id) {
        continue;
      }
      let Some(bbox) = record.value.as_geometry().and_then(|g| g.bounding_box()) else {
        continue;
      };
      if !bbox.is_well_formed() {
        continue;
      }

      grid.entries.insert(record.version_id, (record.entity_id, bbox));
      let range = self.cell_range(&bbox);
      if Self::span(range) > MAX_CELLS_PER_ENTRY {
        grid.oversize.push(record.version_id);
        continue;
      }
      let ((x0, y0), (x1, y1)) = range;
      for x in x0..=x1 {
        for y in y0..=y1 {
          grid.cells.entry((x, y)).or_default().push(record.version_id);
        }
      }
    }
  }

  /// Entities with at least one indexed version whose box meets `query`.
  pub fn entities_within(&self, query: &BoundingBox) -> Vec<Uuid> {
    let grid = self.grid.read().unwrap_or_else(PoisonError::into_inner);
    let range = self.cell_range(query);
    let ((x0, y0), (x1, y1)) = range;

    let mut seen = HashSet::new();
    let mut consider = |version_id: &Uuid, out: &mut Vec<Uuid>| {
      if let Some((entity_id, bbox)) = grid.entries.get(version_id)
        && bbox.intersects(query)
        && seen.insert(*entity_id)
      {
        out.push(*entity_id);
      }
    };

    let mut out = Vec::new();
    if Self::span(range) > grid.cells.len() as i64 {
      // Fewer occupied cells than cells in the query box.
      for ids in grid.cells.values() {
        ids.iter().for_each(|id| consider(id, &mut out));
      }
    } else {
      for x in x0..=x1 {
        for y in y0..=y1 {
          if let Some(ids) = grid.cells.get(&(x, y)) {
            ids.iter().for_each(|id| consider(id, &mut out));
          }
        }
      }
    }
    grid.oversize.iter().for_each(|id| consider(id, &mut out));
    out
  }

  pub fn len(&self) -> usize {
    self.grid.read().unwrap_or_else(PoisonError::into_inner).entries.len()
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use ltm_core::{
    time::ValidInterval,
    value::{Geometry, Value},
    version::{Provenance, Transaction, TxId, TxStamp},
  };

  use super::*;

  fn record(entity_id: Uuid, geometry: Geometry) -> VersionRecord {
    let stamp = TxStamp { tx_id: TxId(1), tx_timestamp: Utc::now() };
    VersionRecord {
      version_id:   Uuid::new_v4(),
      entity_id,
      property:     "location".into(),
      value:        Value::Geometry(geometry),
      interval:     ValidInterval::open(Utc::now()),
      transaction:  Transaction::new(stamp, Provenance::default()),
      derived_from: None,
    }
  }

  fn bbox(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> BoundingBox {
    BoundingBox { min_x, min_y, max_x, max_y }
  }

  #[test]
  fn finds_points_inside_the_query_box() {
    let grid = GridIndex::new(10.0);
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    grid.insert_all(&[
      record(a, Geometry::Point { x: 5.0, y: 5.0 }),
      record(b, Geometry::Point { x: 55.0, y: -15.0 }),
    ]);

    assert_eq!(grid.entities_within(&bbox(0.0, 0.0, 10.0, 10.0)), vec![a]);
    let mut both = grid.entities_within(&bbox(-100.0, -100.0, 100.0, 100.0));
    both.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(both, expected);
    assert!(grid.entities_within(&bbox(20.0, 20.0, 30.0, 30.0)).is_empty());
  }

  #[test]
  fn regions_spanning_cells_are_found_once() {
    let grid = GridIndex::new(1.0);
    let e = Uuid::new_v4();
    let r = record(e, Geometry::Rect(bbox(0.5, 0.5, 3.5, 3.5)));
    grid.insert_all([&r, &r]);
    assert_eq!(grid.len(), 1);
    assert_eq!(grid.entities_within(&bbox(3.0, 0.0, 4.0, 1.0)), vec![e]);
  }

  #[test]
  fn huge_regions_go_to_the_side_list() {
    let grid = GridIndex::new(0.001);
    let e = Uuid::new_v4();
    grid.insert_all(&[record(e, Geometry::Rect(bbox(-180.0, -90.0, 180.0, 90.0)))]);
    assert_eq!(grid.entities_within(&bbox(10.0, 10.0, 10.0, 10.0)), vec![e]);
  }

  #[test]
  fn non_geometry_values_are_ignored() {
    let grid = GridIndex::new(1.0);
    let mut r = record(Uuid::new_v4(), Geometry::Point { x: 0.0, y: 0.0 });
    r.value = Value::number(3.0);
    grid.insert_all(&[r]);
    assert!(grid.is_empty());
  }
}
