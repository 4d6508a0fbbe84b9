//! `GET|HEAD /config`: a JSON echo of the active configuration.

use hyper::{Body, Method, Request, Response, StatusCode};

use crate::config::Config;

use super::types::{json_response, plain_error};

pub async fn handle(req: Request<Body>, config: &Config) -> Response<Body> {
    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return plain_error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "only GET/HEAD are supported here");
    }

    let mut response = json_response(StatusCode::OK, config.to_json());
    if *req.method() == Method::HEAD {
        *response.body_mut() = Body::empty();
    }
    response
}
