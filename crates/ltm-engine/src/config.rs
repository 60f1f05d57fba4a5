//! Engine tuning knobs. Every field has a default, so an empty `[engine]`
//! section (or none at all) is valid configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Point lookups on one property before its snapshot map is materialised.
  pub cache_threshold:   u32,
  /// Maximum number of materialised snapshot maps; `0` disables the cache.
  pub cache_capacity:    usize,
  /// Maximum number of property indexes kept in memory; the least recently
  /// used are dropped and reloaded from the store on demand.
  pub index_capacity:    usize,
  /// How many times a write is re-planned after losing a compare-and-append
  /// race before giving up with `StaleHead`.
  pub max_write_retries: u32,
  /// Edge length of one spatial grid cell, in coordinate units.
  pub spatial_cell_size: f64,
  /// Build interval indexes over version histories. When off, every lookup
  /// scans the full history and reports `IndexUnavailable`.
  pub range_index:       bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      cache_threshold:   8,
      cache_capacity:    1024,
      index_capacity:    10_000,
      max_write_retries: 3,
      spatial_cell_size: 1.0,
      range_index:       true,
    }
  }
}
