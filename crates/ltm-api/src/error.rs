//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  extract::rejection::{JsonRejection, QueryRejection},
  http::StatusCode,
  response::{IntoResponse, Response},
};
use ltm_core::Error;
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("bad request: {0}")]
  BadRequest(String),

  #[error(transparent)]
  Engine(#[from] Error),
}

impl From<JsonRejection> for ApiError {
  fn from(rejection: JsonRejection) -> Self { Self::BadRequest(rejection.body_text()) }
}

impl From<QueryRejection> for ApiError {
  fn from(rejection: QueryRejection) -> Self { Self::BadRequest(rejection.body_text()) }
}

fn status_of(e: &Error) -> StatusCode {
  match e {
    Error::BadRequest(_) | Error::InvalidInterval { .. } => StatusCode::BAD_REQUEST,
    Error::EntityNotFound(_) => StatusCode::NOT_FOUND,
    Error::Conflict(_)
    | Error::DuplicateKey(_)
    | Error::IdempotencyMismatch(_)
    | Error::IdempotencyKeyTaken(_) => StatusCode::CONFLICT,
    // A write that kept losing its compare-and-append race.
    Error::StorageUnavailable(_) | Error::StaleHead { .. } => StatusCode::SERVICE_UNAVAILABLE,
    Error::NonMonotonicTransaction { .. } | Error::Serialization(_) => {
      StatusCode::INTERNAL_SERVER_ERROR
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let message = self.to_string();
    match self {
      ApiError::BadRequest(_) => {
        (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
      }
      ApiError::Engine(Error::Conflict(detail)) => (
        StatusCode::CONFLICT,
        Json(json!({ "error": message, "conflict": detail })),
      )
        .into_response(),
      ApiError::Engine(e) => {
        let status = status_of(&e);
        if status.is_server_error() {
          tracing::warn!(error = %e, %status, "request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
      }
    }
  }
}

pub type Result<T, E = ApiError> = std::result::Result<T, E>;
