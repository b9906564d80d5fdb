//! API error types mapped to HTTP status codes.
//!
//! Routing outcomes are conveyed via redirect statuses: 301 for the data
//! plane (`add`/`search`), 308 for the control plane (`acquire`), both with
//! a `Location` header pointing at the responsible node. The permanent
//! codes are deliberate: clients that downgrade 302 to GET would corrupt
//! the replayed POST body.

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Application-level error type that implements `IntoResponse`.
///
/// Variants map to HTTP statuses:
/// - `BadRequest` → 400
/// - `MovedPermanently` → 301 (with `Location` header)
/// - `PermanentRedirect` → 308 (with `Location` header)
/// - `Internal` → 500
#[derive(Debug)]
pub enum ApiError {
    /// Invalid request parameters (400). No side effects occurred.
    BadRequest(String),
    /// Data-plane redirect to the owning node (301 with `Location`).
    MovedPermanently(String),
    /// Control-plane redirect to the leader (308 with `Location`).
    PermanentRedirect(String),
    /// Unexpected server error (500).
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::MovedPermanently(location) => {
                redirect_response(StatusCode::MOVED_PERMANENTLY, &location)
            }
            ApiError::PermanentRedirect(location) => {
                redirect_response(StatusCode::PERMANENT_REDIRECT, &location)
            }
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, axum::Json(json!({ "error": msg }))).into_response()
            }
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "error": msg })),
            )
                .into_response(),
        }
    }
}

/// JSON extractor whose rejection is a plain 400.
///
/// Axum's stock `Json` answers deserialization failures with 422; the wire
/// protocol treats every parse failure as a 400.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

fn redirect_response(status: StatusCode, location: &str) -> Response {
    match axum::http::HeaderValue::from_str(location) {
        Ok(val) => {
            let mut resp =
                (status, axum::Json(json!({ "redirect": location }))).into_response();
            resp.headers_mut().insert(axum::http::header::LOCATION, val);
            resp
        }
        Err(_) => {
            let body = axum::Json(json!({ "error": "Invalid redirect location" }));
            (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
        }
    }
}
