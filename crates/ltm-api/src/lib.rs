//! JSON REST API for the bitemporal knowledge store.
//!
//! Exposes an axum [`Router`] backed by a [`KnowledgeStore`] over any
//! [`GraphStore`] backend. Auth, TLS, and transport concerns are the
//! caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/ltm", ltm_api::api_router(engine.clone()))
//! ```

pub mod entities;
pub mod error;
pub mod facts;
pub mod query;

use std::sync::Arc;

use axum::{
  Router,
  routing::{delete, get, post},
};
use ltm_core::store::GraphStore;
use ltm_engine::KnowledgeStore;

pub use error::ApiError;

/// Build a fully-materialised API router for `engine`.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S>(engine: Arc<KnowledgeStore<S>>) -> Router<()>
where
  S: GraphStore + 'static,
{
  Router::new()
    // Writes
    .route("/ingest", post(facts::ingest::<S>))
    .route("/entity/{id}", delete(facts::delete_entity::<S>))
    // Reads
    .route("/retrieve", get(query::retrieve::<S>))
    .route("/history/{id}", get(query::history::<S>))
    .route("/spatial", get(query::spatial::<S>))
    // Identities
    .route("/entities", post(entities::create::<S>))
    .route("/entities/{id}", get(entities::get_one::<S>))
    .route("/edges", post(entities::create_edge::<S>))
    .route("/events", post(entities::record_event::<S>))
    .with_state(engine)
}

#[cfg(test)]
mod tests {
  use axum::{
    body::Body,
    http::{Request, StatusCode},
  };
  use chrono::{DateTime, Utc};
  use ltm_core::{clock::ManualClock, time::parse_timestamp};
  use ltm_engine::{EngineConfig, MemoryStore};
  use serde_json::{Value as Json, json};
  use tower::ServiceExt as _;

  use super::*;

  fn day(s: &str) -> DateTime<Utc> { parse_timestamp(s).unwrap() }

  async fn engine() -> Arc<KnowledgeStore<MemoryStore>> {
    let clock = Arc::new(ManualClock::new(day("2024-06-01")));
    Arc::new(
      KnowledgeStore::open(MemoryStore::new(), clock, EngineConfig::default())
        .await
        .unwrap(),
    )
  }

  async fn send(
    engine: &Arc<KnowledgeStore<MemoryStore>>,
    method: &str,
    uri: &str,
    body: Option<Json>,
  ) -> (StatusCode, Json) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
      Some(body) => builder
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap(),
      None => builder.body(Body::empty()).unwrap(),
    };
    let app = Router::new().nest("/ltm", api_router(engine.clone()));
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() { Json::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, json)
  }

  fn number(n: f64) -> Json { json!({ "type": "scalar", "data": { "kind": "number", "value": n } }) }

  fn price(value: f64, from: &str, to: Option<&str>) -> Json {
    json!({
      "subject_key": "AAPL",
      "property": "price",
      "value": number(value),
      "valid_from": from,
      "valid_to": to,
      "source_id": "feed",
      "confidence": 0.9,
    })
  }

  async fn ingest_prices(engine: &Arc<KnowledgeStore<MemoryStore>>) {
    for body in [
      price(100.0, "2022-01-01", Some("2022-12-31")),
      price(120.0, "2023-01-01", Some("2023-03-31")),
      price(150.0, "2023-04-01", None),
    ] {
      let (status, _) = send(engine, "POST", "/ltm/ingest", Some(body)).await;
      assert_eq!(status, StatusCode::ACCEPTED);
    }
  }

  fn values(body: &Json) -> Vec<Json> {
    body["results"]
      .as_array()
      .unwrap()
      .iter()
      .map(|r| r["value"].clone())
      .collect()
  }

  #[tokio::test]
  async fn ingest_returns_receipt() {
    let engine = engine().await;
    let (status, body) = send(&engine, "POST", "/ltm/ingest", Some(price(100.0, "2022-01-01", None))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["tx_id"], 1);
    assert_eq!(body["deduplicated"], false);
    assert_eq!(body["version_ids"].as_array().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn snapshot_and_range_retrieval() {
    let engine = engine().await;
    ingest_prices(&engine).await;

    let (status, body) =
      send(&engine, "GET", "/ltm/retrieve?query=key:AAPL.price&valid_at=2023-03-30", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(values(&body), vec![number(120.0)]);
    assert_eq!(body["results"][0]["transaction"]["source_id"], "feed");

    let (_, body) = send(
      &engine,
      "GET",
      "/ltm/retrieve?query=key:AAPL.price&valid_from=2022-06-01&valid_to=2023-02-01",
      None,
    )
    .await;
    assert_eq!(values(&body), vec![number(100.0), number(120.0)]);

    let (_, body) = send(&engine, "GET", "/ltm/retrieve?query=key:AAPL.price", None).await;
    assert_eq!(values(&body), vec![number(150.0)]);
  }

  #[tokio::test]
  async fn conflict_carries_the_existing_interval() {
    let engine = engine().await;
    ingest_prices(&engine).await;

    let (status, body) =
      send(&engine, "POST", "/ltm/ingest", Some(price(200.0, "2023-02-01", Some("2023-02-15")))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let existing = &body["conflict"]["existing"][0];
    assert_eq!(existing["value"], number(120.0));
    assert!(existing["interval"]["valid_from"].as_str().unwrap().starts_with("2023-01-01"));
  }

  #[tokio::test]
  async fn malformed_requests_are_bad_requests() {
    let engine = engine().await;
    for uri in [
      "/ltm/retrieve?query=key:AAPL.price&transaction_at=2023-01-01",
      "/ltm/retrieve?query=key:AAPL.price&valid_at=last-march",
      "/ltm/retrieve?query=AAPL.price",
      "/ltm/retrieve",
      "/ltm/spatial?min_x=1&min_y=1&max_x=0&max_y=0",
    ] {
      let (status, body) = send(&engine, "GET", uri, None).await;
      assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
      assert!(body["error"].is_string());
    }

    let (status, _) =
      send(&engine, "POST", "/ltm/ingest", Some(price(1.0, "2023-04-01", Some("2023-01-01")))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut no_subject = price(1.0, "2023-04-01", None);
    no_subject.as_object_mut().unwrap().remove("subject_key");
    let (status, _) = send(&engine, "POST", "/ltm/ingest", Some(no_subject)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&engine, "POST", "/ltm/ingest", Some(json!({ "property": 3 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn provenance_fields_are_required() {
    let engine = engine().await;
    for field in ["source_id", "confidence"] {
      let mut body = price(1.0, "2023-04-01", None);
      body.as_object_mut().unwrap().remove(field);
      let (status, body) = send(&engine, "POST", "/ltm/ingest", Some(body)).await;
      assert_eq!(status, StatusCode::BAD_REQUEST, "without {field}");
      assert!(body["error"].as_str().unwrap().contains(field), "{body}");
    }

    let mut sure = price(1.0, "2023-04-01", None);
    sure["confidence"] = json!(1.5);
    let (status, _) = send(&engine, "POST", "/ltm/ingest", Some(sure)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing was written by the rejected requests.
    let (_, found) = send(&engine, "GET", "/ltm/retrieve?query=key:AAPL.price", None).await;
    assert!(values(&found).is_empty());
  }

  #[tokio::test]
  async fn idempotent_replay_and_mismatch() {
    let engine = engine().await;
    let mut body = price(150.0, "2023-04-01", None);
    body["idempotency_key"] = json!("msg-1");

    let (_, first) = send(&engine, "POST", "/ltm/ingest", Some(body.clone())).await;
    let (status, second) = send(&engine, "POST", "/ltm/ingest", Some(body.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["deduplicated"], true);
    assert_eq!(first["tx_id"], second["tx_id"]);

    body["value"] = number(151.0);
    let (status, _) = send(&engine, "POST", "/ltm/ingest", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
  }

  #[tokio::test]
  async fn delete_then_history() {
    let engine = engine().await;
    ingest_prices(&engine).await;
    let (_, found) = send(&engine, "GET", "/ltm/retrieve?query=key:AAPL.price", None).await;
    let id = found["results"][0]["entity_id"].as_str().unwrap().to_owned();

    let (status, body) = send(&engine, "DELETE", &format!("/ltm/entity/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["closed"], 1);
    assert_eq!(body["tx_id"], 4);

    let (status, again) = send(&engine, "DELETE", &format!("/ltm/entity/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["closed"], 0);
    assert!(again["tx_id"].is_null());

    let (_, current) = send(&engine, "GET", "/ltm/retrieve?query=key:AAPL.price", None).await;
    assert!(values(&current).is_empty());

    let (status, history) = send(&engine, "GET", &format!("/ltm/history/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["entity"]["key"], "AAPL");
    assert_eq!(history["properties"][0]["versions"].as_array().unwrap().len(), 3);
  }

  #[tokio::test]
  async fn unknown_entities_are_not_found() {
    let engine = engine().await;
    let id = uuid::Uuid::new_v4();
    for (method, uri) in [
      ("GET", format!("/ltm/history/{id}")),
      ("GET", format!("/ltm/entities/{id}")),
      ("DELETE", format!("/ltm/entity/{id}")),
    ] {
      let (status, _) = send(&engine, method, &uri, None).await;
      assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
    }
  }

  #[tokio::test]
  async fn entities_edges_and_traversal() {
    let engine = engine().await;
    let (status, acme) = send(
      &engine,
      "POST",
      "/ltm/entities",
      Some(json!({ "label": "company", "key": "acme" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(acme["kind"], "node");
    let (_, alice) = send(
      &engine,
      "POST",
      "/ltm/entities",
      Some(json!({ "label": "person", "key": "alice" })),
    )
    .await;

    let name = json!({
      "subject_key": "alice",
      "property": "name",
      "value": { "type": "scalar", "data": { "kind": "text", "value": "Alice" } },
      "valid_from": "2020-01-01",
      "source_id": "hr",
      "confidence": 1.0,
    });
    send(&engine, "POST", "/ltm/ingest", Some(name)).await;

    let (status, created) = send(
      &engine,
      "POST",
      "/ltm/edges",
      Some(json!({
        "label": "employs",
        "source": acme["entity_id"],
        "target": alice["entity_id"],
        "valid_from": "2021-01-01",
      })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["edge"]["kind"], "edge");

    let (_, now) = send(&engine, "GET", "/ltm/retrieve?query=key:acme-%3Eemploys.name", None).await;
    assert_eq!(values(&now).len(), 1);
    let (_, before) = send(
      &engine,
      "GET",
      "/ltm/retrieve?query=key:acme-%3Eemploys.name&valid_at=2020-06-01",
      None,
    )
    .await;
    assert!(values(&before).is_empty());

    let (status, _) = send(
      &engine,
      "POST",
      "/ltm/entities",
      Some(json!({ "label": "company", "key": "acme" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
  }

  #[tokio::test]
  async fn events_and_spatial() {
    let engine = engine().await;
    let hq = json!({
      "subject_key": "acme",
      "property": "name",
      "value": { "type": "scalar", "data": { "kind": "text", "value": "Acme" } },
      "valid_from": "2020-01-01",
      "source_id": "registry",
      "confidence": 1.0,
      "spatial": { "shape": "point", "x": 5.0, "y": 5.0 },
    });
    let (_, receipt) = send(&engine, "POST", "/ltm/ingest", Some(hq)).await;

    let (status, body) = send(
      &engine,
      "POST",
      "/ltm/events",
      Some(json!({
        "label": "earnings_call",
        "participants": [{ "role": "host", "entity_id": receipt["entity_id"] }],
        "valid_from": "2024-02-01",
        "valid_to": "2024-02-02",
        "source_id": "calendar",
      })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["event"]["kind"], "event");
    assert_eq!(body["receipt"]["version_ids"].as_array().unwrap().len(), 1);

    let (status, found) =
      send(&engine, "GET", "/ltm/spatial?min_x=0&min_y=0&max_x=10&max_y=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["results"][0]["property"], "location");
    let (_, empty) = send(
      &engine,
      "GET",
      "/ltm/spatial?min_x=0&min_y=0&max_x=10&max_y=10&valid_at=2019-01-01",
      None,
    )
    .await;
    assert!(empty["results"].as_array().unwrap().is_empty());
  }

  #[tokio::test]
  async fn outage_is_service_unavailable() {
    let engine = engine().await;
    engine.store().set_available(false);
    let (status, body) =
      send(&engine, "POST", "/ltm/ingest", Some(price(1.0, "2023-01-01", None))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("unavailable"));
  }
}
