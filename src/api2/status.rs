//! `GET|HEAD /status`: a JSON snapshot of `PrecacheManager::status()`.

use hyper::{Body, Method, Request, Response, StatusCode};

use crate::backup::PrecacheManager;
use crate::tools::time::epoch_to_rfc3339_utc;

use super::types::{error_response, json_response, plain_error};

pub async fn handle(req: Request<Body>, manager: &PrecacheManager) -> Response<Body> {
    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return plain_error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "only GET/HEAD are supported here");
    }

    let status = match manager.status() {
        Ok(status) => status,
        Err(err) => return error_response(&crate::backup::PrecacheError::Internal(err)),
    };

    let started_at = epoch_to_rfc3339_utc(status.start_time).unwrap_or_default();

    let value = serde_json::json!({
        "commitment_bytes": status.commitment_bytes,
        "fetch": {
            "rate_mean": status.fetch_rate_mean,
            "rate_stderr": status.fetch_rate_stderr,
            "active": status.active_fetches,
        },
        "checksum": {
            "rate_mean": status.checksum_rate_mean,
            "rate_stderr": status.checksum_rate_stderr,
            "active": status.active_checksums,
        },
        "total_requests": status.total_requests,
        "start_time": started_at,
    });

    let mut response = json_response(StatusCode::OK, value);
    if *req.method() == Method::HEAD {
        *response.body_mut() = Body::empty();
    }
    response
}
