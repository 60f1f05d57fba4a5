//! Valid-time intervals and timestamp parsing.
//!
//! Intervals are half-open: `[valid_from, valid_to)`. A `valid_to` of `None`
//! is the "open" sentinel meaning "still valid".

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A half-open valid-time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidInterval {
  pub valid_from: DateTime<Utc>,
  pub valid_to:   Option<DateTime<Utc>>,
}

impl ValidInterval {
  /// Build an interval, rejecting empty or inverted ones.
  pub fn new(
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
  ) -> Result<Self> {
    if let Some(to) = valid_to
      && to <= valid_from
    {
      return Err(Error::InvalidInterval { from: valid_from, to });
    }
    Ok(Self { valid_from, valid_to })
  }

  /// An interval that is still valid: `[valid_from, open)`.
  pub fn open(valid_from: DateTime<Utc>) -> Self {
    Self { valid_from, valid_to: None }
  }

  pub fn is_open(&self) -> bool { self.valid_to.is_none() }

  /// `valid_from <= t < valid_to`.
  pub fn contains(&self, t: DateTime<Utc>) -> bool {
    self.valid_from <= t && self.valid_to.is_none_or(|to| t < to)
  }

  /// Whether two half-open intervals share at least one instant.
  pub fn overlaps(&self, other: &ValidInterval) -> bool {
    let self_starts_first = other.valid_to.is_none_or(|to| self.valid_from < to);
    let other_starts_first = self.valid_to.is_none_or(|to| other.valid_from < to);
    self_starts_first && other_starts_first
  }

  /// Shorten this interval so it ends no later than `to`. Returns `None` when
  /// nothing of the interval survives.
  pub fn truncated(&self, to: DateTime<Utc>) -> Option<ValidInterval> {
    if to <= self.valid_from {
      return None;
    }
    let end = match self.valid_to {
      Some(existing) if existing <= to => existing,
      _ => to,
    };
    Some(ValidInterval { valid_from: self.valid_from, valid_to: Some(end) })
  }

  /// Whether any part of the interval lies at or after `t`.
  pub fn extends_past(&self, t: DateTime<Utc>) -> bool {
    self.valid_to.is_none_or(|to| to > t)
  }
}

impl std::fmt::Display for ValidInterval {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.valid_to {
      Some(to) => write!(f, "[{}, {})", self.valid_from.to_rfc3339(), to.to_rfc3339()),
      None => write!(f, "[{}, open)", self.valid_from.to_rfc3339()),
    }
  }
}

/// Parse an RFC 3339 timestamp or a bare ISO 8601 date (midnight UTC).
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  let s = s.trim();
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Ok(dt.with_timezone(&Utc));
  }
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|naive| naive.and_utc())
    .ok_or_else(|| Error::bad_request(format!("malformed timestamp: {s:?}")))
}

/// Parse an optional timestamp parameter; empty strings count as absent.
pub fn parse_optional(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
  match s {
    Some(s) if !s.trim().is_empty() => parse_timestamp(s).map(Some),
    _ => Ok(None),
  }
}

/// `deserialize_with` helpers that accept the same formats as
/// [`parse_timestamp`].
pub mod lenient {
  use chrono::{DateTime, Utc};
  use serde::{Deserialize, Deserializer, de::Error as _};

  pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let s = String::deserialize(d)?;
    super::parse_timestamp(&s).map_err(D::Error::custom)
  }

  pub fn optional<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let s = Option::<String>::deserialize(d)?;
    super::parse_optional(s.as_deref()).map_err(D::Error::custom)
  }
}
