//! `GET|HEAD /manifest`: a JSON snapshot of every tracked entity.

use hyper::{Body, Method, Request, Response, StatusCode};

use crate::backup::{PrecacheError, PrecacheManager};

use super::types::{error_response, json_response, plain_error};

pub async fn handle(req: Request<Body>, manager: &PrecacheManager) -> Response<Body> {
    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return plain_error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "only GET/HEAD are supported here");
    }

    let entries = match manager.manifest() {
        Ok(entries) => entries,
        Err(err) => return error_response(&PrecacheError::Internal(err)),
    };

    let value: Vec<serde_json::Value> = entries
        .into_iter()
        .map(|e| {
            serde_json::json!({
                "path": e.path,
                "availability": {
                    "data": e.data.as_str(),
                    "metadata": e.metadata.as_str(),
                    "checksums": e.checksums.as_str(),
                },
                "last_accessed": e.last_accessed,
                "contention": e.contention,
            })
        })
        .collect();

    let mut response = json_response(StatusCode::OK, serde_json::Value::Array(value));
    if *req.method() == Method::HEAD {
        *response.body_mut() = Body::empty();
    }
    response
}
