//! The upstream gateway: the precache's sole external collaborator.
//!
//! Grounded on the general async-trait-over-external-service pattern;
//! `async-trait` itself is grounded on its presence across most of the other
//! example repos' `Cargo.toml`s. The semaphore-bounded wrapper acquires a
//! permit before each upstream connection and releases it on completion or
//! cancellation.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;

use super::worker_pool::CancelToken;

/// One attribute-value-unit triple attached to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avu {
    pub attribute: String,
    pub value: String,
    pub units: Option<String>,
}

/// Metadata returned by `fetch_metadata`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamMetadata {
    pub size: u64,
    pub checksum: String,
    pub created_ts: i64,
    pub modified_ts: i64,
    pub avus: Vec<Avu>,
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream path not found")]
    NotFound,
    #[error("upstream denied access")]
    Forbidden,
    #[error("transient upstream error: {0}")]
    TransientError(String),
}

/// The external collaborator the Precache Manager calls during admission
/// and data fetch. A concrete implementation speaks whatever protocol the
/// real object store uses; tests use `FakeUpstream` below.
#[async_trait]
pub trait UpstreamGateway: Send + Sync {
    async fn fetch_metadata(&self, path: &str) -> Result<UpstreamMetadata, UpstreamError>;

    /// Streams the object's bytes to `dst`, calling `on_bytes(n)` after each
    /// chunk is written (used by the rate tracker) and checking
    /// `cancel.is_cancelled()` at each chunk boundary.
    async fn fetch_data(
        &self,
        path: &str,
        dst: &Path,
        cancel: CancelToken,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<(), UpstreamError>;
}

/// Wraps any `UpstreamGateway`, bounding concurrent upstream connections by
/// a semaphore sized to `max_connections`; a permit is acquired inside the
/// gateway and released on job completion or cancellation.
pub struct BoundedUpstreamGateway<G> {
    inner: G,
    permits: Arc<Semaphore>,
}

impl<G: UpstreamGateway> BoundedUpstreamGateway<G> {
    pub fn new(inner: G, max_connections: usize) -> Self {
        BoundedUpstreamGateway {
            inner,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }
}

#[async_trait]
impl<G: UpstreamGateway> UpstreamGateway for BoundedUpstreamGateway<G> {
    async fn fetch_metadata(&self, path: &str) -> Result<UpstreamMetadata, UpstreamError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| UpstreamError::TransientError("gateway shut down".into()))?;
        self.inner.fetch_metadata(path).await
    }

    async fn fetch_data(
        &self,
        path: &str,
        dst: &Path,
        cancel: CancelToken,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<(), UpstreamError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| UpstreamError::TransientError("gateway shut down".into()))?;
        self.inner.fetch_data(path, dst, cancel, on_bytes).await
    }
}

/// A plain HTTP upstream: `GET {base_url}/{path}` for data, `HEAD` for
/// metadata, reading `Content-Length`/`ETag` off the response. A minimal
/// `hyper::Client`-based implementation, without TLS/proxy plumbing, just
/// enough to make the daemon runnable end to end.
pub struct HttpUpstreamGateway {
    client: hyper::Client<hyper::client::HttpConnector>,
    base_url: String,
}

impl HttpUpstreamGateway {
    pub fn new(base_url: String) -> Self {
        HttpUpstreamGateway { client: hyper::Client::new(), base_url }
    }

    fn uri_for(&self, path: &str) -> Result<hyper::Uri, UpstreamError> {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
            .parse()
            .map_err(|err| UpstreamError::TransientError(format!("invalid upstream uri: {}", err)))
    }
}

#[async_trait]
impl UpstreamGateway for HttpUpstreamGateway {
    async fn fetch_metadata(&self, path: &str) -> Result<UpstreamMetadata, UpstreamError> {
        let uri = self.uri_for(path)?;
        let request = hyper::Request::builder()
            .method(hyper::Method::HEAD)
            .uri(uri)
            .body(hyper::Body::empty())
            .map_err(|err| UpstreamError::TransientError(err.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| UpstreamError::TransientError(err.to_string()))?;

        match response.status() {
            hyper::StatusCode::OK => {}
            hyper::StatusCode::NOT_FOUND => return Err(UpstreamError::NotFound),
            hyper::StatusCode::FORBIDDEN => return Err(UpstreamError::Forbidden),
            other => return Err(UpstreamError::TransientError(format!("upstream returned {}", other))),
        }

        let headers = response.headers();
        let size = headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let checksum = headers
            .get(hyper::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_default();
        let now = crate::tools::time::epoch_now();

        Ok(UpstreamMetadata { size, checksum, created_ts: now, modified_ts: now, avus: Vec::new() })
    }

    async fn fetch_data(
        &self,
        path: &str,
        dst: &Path,
        cancel: CancelToken,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<(), UpstreamError> {
        use hyper::body::HttpBody;
        use tokio::io::AsyncWriteExt;

        let uri = self.uri_for(path)?;
        let mut response = self
            .client
            .get(uri)
            .await
            .map_err(|err| UpstreamError::TransientError(err.to_string()))?;

        match response.status() {
            hyper::StatusCode::OK => {}
            hyper::StatusCode::NOT_FOUND => return Err(UpstreamError::NotFound),
            hyper::StatusCode::FORBIDDEN => return Err(UpstreamError::Forbidden),
            other => return Err(UpstreamError::TransientError(format!("upstream returned {}", other))),
        }

        let mut file = tokio::fs::File::create(dst)
            .await
            .map_err(|err| UpstreamError::TransientError(err.to_string()))?;

        while let Some(chunk) = response.body_mut().data().await {
            if cancel.is_cancelled() {
                return Err(UpstreamError::TransientError("cancelled".into()));
            }
            let chunk = chunk.map_err(|err| UpstreamError::TransientError(err.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|err| UpstreamError::TransientError(err.to_string()))?;
            on_bytes(chunk.len() as u64);
        }
        file.flush().await.map_err(|err| UpstreamError::TransientError(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    //! In-process fake upstream for scenario-level tests: holds objects in
    //! memory instead of speaking to a real network upstream.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    pub struct FakeObject {
        pub bytes: Vec<u8>,
        pub checksum: String,
        pub created_ts: i64,
        pub modified_ts: i64,
    }

    pub struct FakeUpstream {
        objects: Mutex<HashMap<String, FakeObject>>,
        pub fetch_data_calls: AtomicUsize,
    }

    impl FakeUpstream {
        pub fn new() -> Self {
            FakeUpstream {
                objects: Mutex::new(HashMap::new()),
                fetch_data_calls: AtomicUsize::new(0),
            }
        }

        pub fn insert(&self, path: &str, object: FakeObject) {
            self.objects.lock().unwrap().insert(path.to_string(), object);
        }
    }

    impl Default for FakeUpstream {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl UpstreamGateway for FakeUpstream {
        async fn fetch_metadata(&self, path: &str) -> Result<UpstreamMetadata, UpstreamError> {
            let objects = self.objects.lock().unwrap();
            let object = objects.get(path).ok_or(UpstreamError::NotFound)?;
            Ok(UpstreamMetadata {
                size: object.bytes.len() as u64,
                checksum: object.checksum.clone(),
                created_ts: object.created_ts,
                modified_ts: object.modified_ts,
                avus: Vec::new(),
            })
        }

        async fn fetch_data(
            &self,
            path: &str,
            dst: &Path,
            cancel: CancelToken,
            on_bytes: &(dyn Fn(u64) + Send + Sync),
        ) -> Result<(), UpstreamError> {
            self.fetch_data_calls.fetch_add(1, Ordering::SeqCst);
            let bytes = {
                let objects = self.objects.lock().unwrap();
                objects
                    .get(path)
                    .ok_or(UpstreamError::NotFound)?
                    .bytes
                    .clone()
            };

            let mut file = tokio::fs::File::create(dst)
                .await
                .map_err(|err| UpstreamError::TransientError(err.to_string()))?;

            for chunk in bytes.chunks(64 * 1024) {
                if cancel.is_cancelled() {
                    return Err(UpstreamError::TransientError("cancelled".into()));
                }
                file.write_all(chunk)
                    .await
                    .map_err(|err| UpstreamError::TransientError(err.to_string()))?;
                on_bytes(chunk.len() as u64);
            }
            file.flush().await.map_err(|err| UpstreamError::TransientError(err.to_string()))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn fetch_metadata_reports_not_found_for_unknown_path() {
        let upstream = FakeUpstream::new();
        let err = upstream.fetch_metadata("/no/such/object").await.unwrap_err();
        assert!(matches!(err, UpstreamError::NotFound));
    }

    #[tokio::test]
    async fn fetch_data_writes_bytes_and_reports_progress() {
        let upstream = FakeUpstream::new();
        upstream.insert(
            "/seq/alpha",
            FakeObject {
                bytes: vec![7u8; 200_000],
                checksum: "deadbeef".into(),
                created_ts: 0,
                modified_ts: 0,
            },
        );

        let dir = std::env::temp_dir().join(format!(
            "irobot-fake-upstream-test-{}",
            crate::tools::fs::random_entity_dirname()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let dst = dir.join("data");

        let total = AtomicUsize::new(0);
        upstream
            .fetch_data("/seq/alpha", &dst, CancelToken::new(), &|n| {
                total.fetch_add(n as usize, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(total.load(Ordering::SeqCst), 200_000);
        assert_eq!(std::fs::metadata(&dst).unwrap().len(), 200_000);
        assert_eq!(upstream.fetch_data_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bounded_gateway_enforces_max_connections() {
        let gateway = BoundedUpstreamGateway::new(FakeUpstream::new(), 1);
        // A single permit should still allow sequential calls to complete.
        let err = gateway.fetch_metadata("/missing").await.unwrap_err();
        assert!(matches!(err, UpstreamError::NotFound));
    }
}
