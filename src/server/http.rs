//! Binds the configured address and serves the HTTP surface with `hyper`,
//! using the standard `hyper::Server` + `make_service_fn`/`service_fn` shape
//! for a single shared service object behind an `Arc`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use log::info;

use crate::api2;
use crate::auth::AuthChain;
use crate::backup::PrecacheManager;
use crate::config::Config;

use crate::api2::types::plain_error;

pub struct Daemon {
    manager: PrecacheManager,
    auth: AuthChain,
    config: Config,
}

impl Daemon {
    pub fn new(manager: PrecacheManager, auth: AuthChain, config: Config) -> Self {
        Daemon { manager, auth, config }
    }

    pub async fn run(self) -> Result<(), Error> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.listen)
            .parse()
            .with_context(|| "invalid httpd.bind_address/listen")?;

        let daemon = Arc::new(self);

        let make_svc = make_service_fn(move |_conn| {
            let daemon = daemon.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let daemon = daemon.clone();
                    async move { Ok::<_, Infallible>(dispatch(daemon, req).await) }
                }))
            }
        });

        info!("irobotd listening on {}", addr);
        hyper::Server::bind(&addr).serve(make_svc).await.map_err(Error::from)
    }
}

/// Convenience wrapper used by `bin/irobotd.rs`.
pub async fn run(manager: PrecacheManager, auth: AuthChain, config: Config) -> Result<(), Error> {
    Daemon::new(manager, auth, config).run().await
}

const SIMPLE_ENDPOINTS: &[&str] = &["/status", "/config", "/manifest"];

async fn dispatch(daemon: Arc<Daemon>, req: Request<Body>) -> Response<Body> {
    let authorization = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    // The precache core never inspects credentials itself; the HTTP layer
    // just runs the configured chain before admitting a request.
    if daemon.auth.authenticate(authorization).is_err() {
        return plain_error(StatusCode::UNAUTHORIZED, "Unauthorized", "no configured authentication handler accepted this request");
    }

    let path = req.uri().path().to_string();

    if SIMPLE_ENDPOINTS.contains(&path.as_str()) && *req.method() == Method::OPTIONS {
        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(hyper::header::ALLOW, "GET, HEAD, OPTIONS")
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty()));
    }

    match path.as_str() {
        "/status" => api2::status::handle(req, &daemon.manager).await,
        "/config" => api2::config_endpoint::handle(req, &daemon.config).await,
        "/manifest" => api2::manifest::handle(req, &daemon.manager).await,
        _ => {
            let timeout = Duration::from_secs(daemon.config.httpd_timeout_secs);
            api2::data_object::handle(req, &daemon.manager, timeout).await
        }
    }
}
