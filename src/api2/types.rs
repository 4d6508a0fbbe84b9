//! Shared JSON response shapes for the HTTP surface.
//!
//! Just the error body shape and a couple of small helpers every handler in
//! this module needs.

use hyper::{Body, Response, StatusCode};

use crate::backup::PrecacheError;

/// `{status, reason, description}`, served for every 4xx/5xx response.
#[derive(Debug, serde::Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub reason: String,
    pub description: String,
}

pub fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    let body = serde_json::to_vec(&value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Projects a `PrecacheError` onto its HTTP status and a JSON error body.
pub fn error_response(err: &PrecacheError) -> Response<Body> {
    let status = err.http_status();
    let body = ErrorBody {
        status: status.as_u16(),
        reason: err.reason().to_string(),
        description: err.to_string(),
    };
    json_response(status, serde_json::to_value(&body).unwrap_or_default())
}

pub fn plain_error(status: StatusCode, reason: &str, description: &str) -> Response<Body> {
    let body = ErrorBody {
        status: status.as_u16(),
        reason: reason.to_string(),
        description: description.to_string(),
    };
    json_response(status, serde_json::to_value(&body).unwrap_or_default())
}
