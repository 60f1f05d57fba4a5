//! Query shapes: temporal selectors, graph patterns and result items.
//!
//! The query engine itself lives in `ltm-engine`; these types are shared
//! with the API layer.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  entity::{Direction, PropertyKey},
  time::ValidInterval,
  value::Value,
  version::{Transaction, VersionState},
};

// ─── Temporal selector ───────────────────────────────────────────────────────

/// Which slice of the bitemporal plane a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum TemporalSelector {
  /// `valid_at = now`, latest transaction.
  Current,
  /// One point in valid time, latest transaction.
  Snapshot { valid_at: DateTime<Utc> },
  /// What was believed at `transaction_at` about the world at `valid_at`.
  Audit {
    valid_at:       DateTime<Utc>,
    transaction_at: DateTime<Utc>,
  },
  /// Every version whose interval intersects the range, latest transaction.
  Range { range: ValidInterval },
}

impl TemporalSelector {
  /// Build a selector from the optional retrieve parameters, rejecting
  /// combinations that have no meaning.
  pub fn from_params(
    valid_at: Option<DateTime<Utc>>,
    transaction_at: Option<DateTime<Utc>>,
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
  ) -> Result<Self> {
    let ranged = valid_from.is_some() || valid_to.is_some();
    match (valid_at, transaction_at) {
      (None, Some(_)) => Err(Error::bad_request("transaction_at requires valid_at")),
      (Some(_), _) if ranged => Err(Error::bad_request(
        "valid_at cannot be combined with valid_from/valid_to",
      )),
      (Some(valid_at), Some(transaction_at)) => Ok(Self::Audit { valid_at, transaction_at }),
      (Some(valid_at), None) => Ok(Self::Snapshot { valid_at }),
      (None, None) => match (valid_from, valid_to) {
        (None, None) => Ok(Self::Current),
        (None, Some(_)) => Err(Error::bad_request("valid_to requires valid_from")),
        (Some(from), to) => Ok(Self::Range { range: ValidInterval::new(from, to)? }),
      },
    }
  }

  /// The transaction-time cut this selector reads at; `None` is "latest".
  pub fn transaction_at(&self) -> Option<DateTime<Utc>> {
    match self {
      Self::Audit { transaction_at, .. } => Some(*transaction_at),
      _ => None,
    }
  }
}

// ─── Graph pattern ───────────────────────────────────────────────────────────

/// Where a pattern starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum Anchor {
  Id(Uuid),
  Key(String),
  Label(String),
}

/// One edge traversal step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
  pub direction: Direction,
  pub label:     String,
}

/// `START ( '->' LABEL | '<-' LABEL )* ( '.' PROPERTY )?`
///
/// ```text
/// key:AAPL.price
/// key:"Apple Inc."->employs.name
/// label:company
/// id:6f1c…<-located_in.location
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
  pub anchor:   Anchor,
  pub hops:     Vec<Hop>,
  /// `None` selects every property of the final identities.
  pub property: Option<String>,
}

impl Pattern {
  pub fn entity(entity_id: Uuid, property: Option<&str>) -> Self {
    Self {
      anchor:   Anchor::Id(entity_id),
      hops:     Vec::new(),
      property: property.map(str::to_owned),
    }
  }
}

/// Split off a bare name, stopping at `.`, `->` or `<-`.
fn take_name(s: &str) -> (&str, &str) {
  let bytes = s.as_bytes();
  let mut i = 0;
  while i < bytes.len() {
    match bytes[i] {
      b'.' => break,
      b'-' if bytes.get(i + 1) == Some(&b'>') => break,
      b'<' if bytes.get(i + 1) == Some(&b'-') => break,
      _ => i += 1,
    }
  }
  (s[..i].trim(), &s[i..])
}

fn non_empty<'a>(name: &'a str, what: &str) -> Result<&'a str> {
  if name.is_empty() {
    Err(Error::bad_request(format!("pattern: empty {what}")))
  } else {
    Ok(name)
  }
}

impl FromStr for Pattern {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let s = s.trim();
    let (anchor, mut rest) = if let Some(rest) = s.strip_prefix("id:") {
      let (raw, rest) = take_name(rest);
      let id = Uuid::parse_str(raw)
        .map_err(|e| Error::bad_request(format!("pattern: bad entity id {raw:?}: {e}")))?;
      (Anchor::Id(id), rest)
    } else if let Some(rest) = s.strip_prefix("key:") {
      if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted
          .find('"')
          .ok_or_else(|| Error::bad_request("pattern: unterminated quoted key"))?;
        (Anchor::Key(non_empty(&quoted[..end], "key")?.to_owned()), &quoted[end + 1..])
      } else {
        let (key, rest) = take_name(rest);
        (Anchor::Key(non_empty(key, "key")?.to_owned()), rest)
      }
    } else if let Some(rest) = s.strip_prefix("label:") {
      let (label, rest) = take_name(rest);
      (Anchor::Label(non_empty(label, "label")?.to_owned()), rest)
    } else {
      return Err(Error::bad_request(
        "pattern must start with id:, key: or label:",
      ));
    };

    let mut hops = Vec::new();
    let mut property = None;
    loop {
      rest = rest.trim_start();
      if rest.is_empty() {
        break;
      }
      if let Some(after) = rest.strip_prefix("->").or_else(|| rest.strip_prefix("<-")) {
        let direction = if rest.starts_with("->") {
          Direction::Outgoing
        } else {
          Direction::Incoming
        };
        let (label, tail) = take_name(after);
        hops.push(Hop { direction, label: non_empty(label, "edge label")?.to_owned() });
        rest = tail;
      } else if let Some(after) = rest.strip_prefix('.') {
        let (name, tail) = take_name(after);
        if !tail.trim().is_empty() {
          return Err(Error::bad_request("pattern: property must come last"));
        }
        property = Some(non_empty(name, "property")?.to_owned());
        break;
      } else {
        return Err(Error::bad_request(format!("pattern: unexpected {rest:?}")));
      }
    }

    Ok(Self { anchor, hops, property })
  }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// One resolved property value with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedValue {
  pub entity_id:   Uuid,
  pub property:    String,
  pub version_id:  Uuid,
  pub value:       Value,
  /// Effective valid-time interval at the selected transaction time.
  pub valid:       ValidInterval,
  pub state:       VersionState,
  pub transaction: Transaction,
  /// Edges walked from the anchor to reach this identity.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub path:        Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
  /// Several versions matched one snapshot point; the latest transaction
  /// was chosen.
  AmbiguousSnapshot,
  /// A range index was missing and the history was scanned in full.
  IndexUnavailable,
}

/// A non-fatal condition noticed while answering a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
  pub kind:       DiagnosticKind,
  pub key:        PropertyKey,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub candidates: Vec<Uuid>,
  pub chosen:     Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
  pub results:     Vec<RetrievedValue>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub diagnostics: Vec<Diagnostic>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::time::parse_timestamp;

  fn ts(s: &str) -> DateTime<Utc> { parse_timestamp(s).unwrap() }

  #[test]
  fn selector_defaults_to_current_state() {
    assert_eq!(
      TemporalSelector::from_params(None, None, None, None).unwrap(),
      TemporalSelector::Current
    );
  }

  #[test]
  fn transaction_at_alone_is_rejected() {
    let err = TemporalSelector::from_params(None, Some(ts("2024-01-01")), None, None).unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));
  }

  #[test]
  fn selector_shapes() {
    let t = ts("2023-02-01");
    let s = ts("2024-01-01");
    assert_eq!(
      TemporalSelector::from_params(Some(t), Some(s), None, None).unwrap(),
      TemporalSelector::Audit { valid_at: t, transaction_at: s }
    );
    assert!(matches!(
      TemporalSelector::from_params(None, None, Some(t), None).unwrap(),
      TemporalSelector::Range { range } if range.is_open()
    ));
    assert!(TemporalSelector::from_params(Some(t), None, Some(t), None).is_err());
    assert!(matches!(
      TemporalSelector::from_params(None, None, Some(s), Some(t)).unwrap_err(),
      Error::InvalidInterval { .. }
    ));
  }

  #[test]
  fn parses_simple_property_pattern() {
    let p: Pattern = "key:AAPL.price".parse().unwrap();
    assert_eq!(p.anchor, Anchor::Key("AAPL".into()));
    assert!(p.hops.is_empty());
    assert_eq!(p.property.as_deref(), Some("price"));
  }

  #[test]
  fn parses_traversals_and_quoted_keys() {
    let p: Pattern = r#"key:"Apple Inc." -> employs <- mentors.full-name"#.parse().unwrap();
    assert_eq!(p.anchor, Anchor::Key("Apple Inc.".into()));
    assert_eq!(
      p.hops,
      vec![
        Hop { direction: Direction::Outgoing, label: "employs".into() },
        Hop { direction: Direction::Incoming, label: "mentors".into() },
      ]
    );
    assert_eq!(p.property.as_deref(), Some("full-name"));
  }

  #[test]
  fn parses_id_and_label_anchors() {
    let id = Uuid::new_v4();
    let p: Pattern = format!("id:{id}").parse().unwrap();
    assert_eq!(p.anchor, Anchor::Id(id));
    assert_eq!(p.property, None);

    let p: Pattern = "label:company".parse().unwrap();
    assert_eq!(p.anchor, Anchor::Label("company".into()));
  }

  #[test]
  fn rejects_malformed_patterns() {
    for bad in ["AAPL.price", "key:", "key:a.", "key:a.b.c", "key:a->", "id:nope", "key:\"open"] {
      assert!(bad.parse::<Pattern>().is_err(), "{bad} should not parse");
    }
  }
}
