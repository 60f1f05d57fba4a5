//! Integration tests for `SqliteStore` against an in-memory database.

use chrono::{DateTime, Duration, Utc};
use ltm_core::{
  entity::{Entity, NewEntity, PropertyKey},
  history::{AppendMode, AppendPlan, PropertyHistory, VersionDraft},
  store::{GraphStore, IdempotencyEntry, TxReceipt, WriteBatch},
  time::{ValidInterval, parse_timestamp},
  value::Value,
  version::{Provenance, Transaction, TxId, TxStamp, VersionState},
};
use uuid::Uuid;

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn day(s: &str) -> DateTime<Utc> { parse_timestamp(s).unwrap() }

fn stamp(n: u64) -> TxStamp {
  TxStamp {
    tx_id:        TxId(n),
    tx_timestamp: day("2024-01-01") + Duration::seconds(n as i64),
  }
}

fn plan(
  history: &PropertyHistory,
  value: f64,
  from: &str,
  to: Option<&str>,
  n: u64,
) -> AppendPlan {
  let draft = VersionDraft {
    key:      history.key().clone(),
    value:    Value::number(value),
    interval: ValidInterval::new(day(from), to.map(day)).unwrap(),
    mode:     AppendMode::Assert,
  };
  history
    .plan_append(draft, Transaction::new(stamp(n), Provenance::from_source("feed", 0.9)))
    .unwrap()
}

async fn commit_one(s: &SqliteStore, plan: AppendPlan, n: u64) {
  s.commit(WriteBatch { stamp: stamp(n), plans: vec![plan], idempotency: None })
    .await
    .unwrap();
}

// ─── Entities ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_get_entity() {
  let s = store().await;

  let apple = s.create_entity(NewEntity::node("company").with_key("AAPL")).await.unwrap();
  let fetched = s.get_entity(apple.entity_id).await.unwrap().unwrap();
  assert_eq!(fetched, Entity { created_at: fetched.created_at, ..apple.clone() });

  let by_key = s.find_by_key("AAPL".into()).await.unwrap().unwrap();
  assert_eq!(by_key.entity_id, apple.entity_id);
  assert!(s.find_by_key("MSFT".into()).await.unwrap().is_none());
  assert!(s.get_entity(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_stable_key_is_rejected() {
  let s = store().await;
  s.create_entity(NewEntity::node("company").with_key("AAPL")).await.unwrap();

  let err = s
    .create_entity(NewEntity::node("company").with_key("AAPL"))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Core(ltm_core::Error::DuplicateKey(ref k)) if k == "AAPL"));
}

#[tokio::test]
async fn list_entities_by_label_and_incident_edges() {
  let s = store().await;
  let apple = s.create_entity(NewEntity::node("company")).await.unwrap();
  let tim = s.create_entity(NewEntity::node("person")).await.unwrap();
  let other = s.create_entity(NewEntity::node("person")).await.unwrap();
  let edge = s
    .create_entity(NewEntity::edge("employs", apple.entity_id, tim.entity_id))
    .await
    .unwrap();

  assert_eq!(s.list_entities(None).await.unwrap().len(), 4);
  assert_eq!(s.list_entities(Some("person".into())).await.unwrap().len(), 2);

  for id in [apple.entity_id, tim.entity_id] {
    let edges = s.incident_edges(id).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0], Entity { created_at: edges[0].created_at, ..edge.clone() });
  }
  assert!(s.incident_edges(other.entity_id).await.unwrap().is_empty());
}

// ─── Versions ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn commit_and_load_history_preserves_closures() {
  let s = store().await;
  let stock = s.create_entity(NewEntity::node("stock")).await.unwrap();
  let key = PropertyKey::new(stock.entity_id, "price");

  let h = PropertyHistory::empty(key.clone());
  commit_one(&s, plan(&h, 150.0, "2023-04-01", None, 1), 1).await;

  let h = s.load_history(key.clone()).await.unwrap();
  assert_eq!(h.versions().len(), 1);
  assert_eq!(h.head(), Some(stamp(1)));

  commit_one(&s, plan(&h, 175.0, "2024-01-01", None, 2), 2).await;

  let h = s.load_history(key).await.unwrap();
  assert_eq!(h.versions().len(), 2);
  assert_eq!(h.closures().len(), 1);
  assert_eq!(h.head(), Some(stamp(2)));

  let old = &h.versions()[0];
  assert_eq!(old.value, Value::number(150.0));
  assert_eq!(old.transaction.source_id.as_deref(), Some("feed"));
  assert!((old.transaction.confidence - 0.9).abs() < 1e-6);
  assert!(matches!(
    h.resolve(old, None).state,
    VersionState::Closed { valid_to, .. } if valid_to == day("2024-01-01")
  ));
  assert_eq!(h.resolve(old, Some(stamp(1).tx_timestamp)).state, VersionState::Open);
}

#[tokio::test]
async fn stale_plan_is_refused() {
  let s = store().await;
  let stock = s.create_entity(NewEntity::node("stock")).await.unwrap();
  let key = PropertyKey::new(stock.entity_id, "price");

  let h = PropertyHistory::empty(key.clone());
  let first = plan(&h, 100.0, "2022-01-01", Some("2022-12-31"), 1);
  let racing = plan(&h, 120.0, "2023-01-01", None, 2);
  commit_one(&s, first, 1).await;

  let err = s
    .commit(WriteBatch { stamp: stamp(2), plans: vec![racing], idempotency: None })
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Core(ltm_core::Error::StaleHead { expected: None, found: Some(TxId(1)), .. })
  ));

  // Nothing from the refused batch was written.
  assert_eq!(s.load_history(key).await.unwrap().versions().len(), 1);
}

#[tokio::test]
async fn property_names_and_latest_stamp() {
  let s = store().await;
  assert_eq!(s.latest_stamp().await.unwrap(), None);

  let stock = s.create_entity(NewEntity::node("stock")).await.unwrap();
  for (n, property) in [(1, "price"), (2, "volume")] {
    let h = PropertyHistory::empty(PropertyKey::new(stock.entity_id, property));
    commit_one(&s, plan(&h, 1.0, "2023-01-01", None, n), n).await;
  }

  assert_eq!(s.property_names(stock.entity_id).await.unwrap(), vec!["price", "volume"]);
  assert_eq!(s.latest_stamp().await.unwrap(), Some(stamp(2)));
}

// ─── Idempotency ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn idempotency_key_is_recorded_once() {
  let s = store().await;
  let stock = s.create_entity(NewEntity::node("stock")).await.unwrap();
  let h = PropertyHistory::empty(PropertyKey::new(stock.entity_id, "price"));
  let p = plan(&h, 100.0, "2023-01-01", None, 1);

  let entry = IdempotencyEntry {
    key:         "req-1".into(),
    fingerprint: "abc".into(),
    receipt:     TxReceipt {
      tx_id:        TxId(1),
      tx_timestamp: stamp(1).tx_timestamp,
      entity_id:    stock.entity_id,
      version_ids:  p.version_id.into_iter().collect(),
      closed:       0,
      deduplicated: false,
    },
  };
  s.commit(WriteBatch { stamp: stamp(1), plans: vec![p], idempotency: Some(entry.clone()) })
    .await
    .unwrap();

  assert_eq!(s.find_idempotency("req-1".into()).await.unwrap(), Some(entry.clone()));
  assert_eq!(s.find_idempotency("req-2".into()).await.unwrap(), None);

  let err = s
    .commit(WriteBatch { stamp: stamp(2), plans: Vec::new(), idempotency: Some(entry) })
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Core(ltm_core::Error::IdempotencyKeyTaken(_))));
}

#[tokio::test]
async fn store_survives_reopen() {
  let path = std::env::temp_dir().join(format!("ltm-{}.db", Uuid::new_v4()));
  let id = {
    let s = SqliteStore::open(&path).await.unwrap();
    let e = s.create_entity(NewEntity::node("company").with_key("AAPL")).await.unwrap();
    let h = PropertyHistory::empty(PropertyKey::new(e.entity_id, "name"));
    let p = h
      .plan_append(
        VersionDraft {
          key:      h.key().clone(),
          value:    Value::text("Apple Inc."),
          interval: ValidInterval::open(day("1977-01-03")),
          mode:     AppendMode::Assert,
        },
        Transaction::new(stamp(1), Provenance::default()),
      )
      .unwrap();
    commit_one(&s, p, 1).await;
    e.entity_id
  };

  let s = SqliteStore::open(&path).await.unwrap();
  assert_eq!(s.find_by_key("AAPL".into()).await.unwrap().map(|e| e.entity_id), Some(id));
  let h = s.load_history(PropertyKey::new(id, "name")).await.unwrap();
  assert_eq!(h.versions()[0].value, Value::text("Apple Inc."));
  assert_eq!(s.latest_stamp().await.unwrap(), Some(stamp(1)));

  let _ = std::fs::remove_file(&path);
}

// ─── Deadlines ───────────────────────────────────────────────────────────────

/// Counts forever; only an interrupt ends it.
const RUNAWAY: &str = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT count(*) FROM n";

fn runaway(conn: &mut rusqlite::Connection) -> Result<i64, tokio_rusqlite::Error> {
  Ok(conn.query_row(RUNAWAY, [], |row| row.get(0))?)
}

#[tokio::test]
async fn runaway_statement_is_interrupted() {
  let s = store().await;
  let bounded = s.clone().with_timeout(std::time::Duration::from_millis(100));

  let err = bounded.call(runaway).await.unwrap_err();
  assert!(matches!(err, Error::Timeout(_)));
  assert!(matches!(ltm_core::Error::from(err), ltm_core::Error::StorageUnavailable(_)));

  // The connection is free again and outside any transaction.
  assert!(s.list_entities(None).await.unwrap().is_empty());
  assert!(s.call(|conn| Ok(conn.is_autocommit())).await.unwrap());
}

#[tokio::test]
async fn expired_commit_writes_nothing() {
  let s = store().await;
  let stock = s.create_entity(NewEntity::node("stock")).await.unwrap();
  let key = PropertyKey::new(stock.entity_id, "price");
  let h = PropertyHistory::empty(key.clone());

  let expired = s.clone().with_timeout(std::time::Duration::ZERO);
  let err = expired
    .commit(WriteBatch { stamp: stamp(1), plans: vec![plan(&h, 1.0, "2023-01-01", None, 1)], idempotency: None })
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Timeout(_)));

  assert!(s.load_history(key).await.unwrap().is_empty());
  assert_eq!(s.latest_stamp().await.unwrap(), None);
}

#[tokio::test]
async fn commit_queued_past_its_deadline_never_lands() {
  let s = store().await;
  let stock = s.create_entity(NewEntity::node("stock")).await.unwrap();
  let key = PropertyKey::new(stock.entity_id, "price");
  let h = PropertyHistory::empty(key.clone());

  // Occupy the database thread well past the commit's own deadline.
  let hog = {
    let slow = s.clone().with_timeout(std::time::Duration::from_millis(300));
    tokio::spawn(async move { slow.call(runaway).await })
  };
  tokio::time::sleep(std::time::Duration::from_millis(20)).await;

  let quick = s.clone().with_timeout(std::time::Duration::from_millis(50));
  let result = quick
    .commit(WriteBatch { stamp: stamp(1), plans: vec![plan(&h, 1.0, "2023-01-01", None, 1)], idempotency: None })
    .await;
  assert!(matches!(hog.await.unwrap(), Err(Error::Timeout(_))));

  // What the caller was told is what the database holds.
  let landed = !s.load_history(key).await.unwrap().is_empty();
  assert_eq!(landed, result.is_ok());
  assert!(matches!(result, Err(Error::Timeout(_))));
}
