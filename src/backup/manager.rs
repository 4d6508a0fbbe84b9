//! The Precache Manager: the public surface consumed by the HTTP layer.
//!
//! A single process-wide service object constructed at startup, rather than
//! module-global state; `PrecacheManager` is that object, wrapping shared
//! mutable state behind one cheaply-cloneable handle (`Arc`-wrapped inner
//! struct) rather than statics. The admission algorithm below implements the
//! look-up-or-admit sequence step by step.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Error;
use log::{error, info, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::Config;
use crate::tools::fs::{random_entity_dirname, replace_file};
use crate::tools::time::epoch_now;

use super::checksummer::Checksummer;
use super::entity::{EntityHandle, ReadinessRegistry};
use super::error::PrecacheError;
use super::eta::{eta_for_entity, Eta};
use super::invalidator::Invalidator;
use super::rate_tracker::RateTracker;
use super::tracking_index::TrackingIndex;
use super::types::{Datatype, Status};
use super::upstream::{UpstreamError, UpstreamGateway, UpstreamMetadata};
use super::worker_pool::{CancelToken, WorkerPool};

/// Generous per-line estimate for a not-yet-written `.checksums` sidecar,
/// used only to size the admission capacity check; the true size is
/// recorded once the sidecar is actually written (see module doc on why
/// this is never persisted as the size of record ahead of time).
const CHECKSUM_LINE_ESTIMATE_BYTES: u64 = 64;

/// How an entity is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Existing,
    ForceRefetch,
    MetadataOnly,
}

pub struct OpenResult {
    pub handle: EntityHandle,
    /// Only meaningful for `ForceRefetch`: whether a refetch was actually
    /// triggered (metadata differed) as opposed to a no-op.
    pub refetched: bool,
}

#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub path: String,
    pub data: Status,
    pub metadata: Status,
    pub checksums: Status,
    pub last_accessed: i64,
    pub contention: i64,
}

#[derive(Debug, Clone)]
pub struct ManagerStatus {
    pub commitment_bytes: u64,
    pub fetch_rate_mean: Option<f64>,
    pub fetch_rate_stderr: Option<f64>,
    pub checksum_rate_mean: Option<f64>,
    pub checksum_rate_stderr: Option<f64>,
    pub active_fetches: usize,
    pub active_checksums: usize,
    pub total_requests: u64,
    pub start_time: i64,
}

struct ManagerInner {
    index: Arc<TrackingIndex>,
    upstream: Arc<dyn UpstreamGateway>,
    fetch_pool: WorkerPool,
    checksum_pool: WorkerPool,
    invalidator: Arc<Invalidator>,
    rate_tracker: Arc<RateTracker>,
    readiness: Arc<ReadinessRegistry>,
    config: Config,
    /// Serialises the "look up or admit" decision.
    admission_lock: AsyncMutex<()>,
    /// At-most-one-per-entity-per-datatype: jobs currently in flight, so a
    /// concurrent duplicate submission is a no-op.
    inflight: StdMutex<HashSet<(i64, Datatype)>>,
    start_time: i64,
    total_requests: std::sync::atomic::AtomicU64,
}

/// The public service object the HTTP layer holds one of.
#[derive(Clone)]
pub struct PrecacheManager(Arc<ManagerInner>);

impl PrecacheManager {
    pub fn new(index: Arc<TrackingIndex>, upstream: Arc<dyn UpstreamGateway>, config: Config) -> Self {
        let precache_root = config.precache_location.clone();
        let invalidator = Arc::new(Invalidator::new(
            index.clone(),
            precache_root,
            config.age_threshold,
            config.expiry,
        ));

        let inner = ManagerInner {
            fetch_pool: WorkerPool::new(config.max_connections),
            checksum_pool: WorkerPool::new(config.checksum_concurrency),
            index,
            upstream,
            invalidator,
            rate_tracker: Arc::new(RateTracker::new()),
            readiness: Arc::new(ReadinessRegistry::new()),
            config,
            admission_lock: AsyncMutex::new(()),
            inflight: StdMutex::new(HashSet::new()),
            start_time: epoch_now(),
            total_requests: std::sync::atomic::AtomicU64::new(0),
        };

        PrecacheManager(Arc::new(inner))
    }

    pub fn invalidator(&self) -> Arc<Invalidator> {
        self.0.invalidator.clone()
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    fn checksum_size_estimate(data_size: u64, chunk_size: u64) -> u64 {
        let chunks = (data_size + chunk_size - 1) / chunk_size.max(1);
        chunks.max(1) * CHECKSUM_LINE_ESTIMATE_BYTES
    }

    fn mark_inflight(&self, id: i64, datatype: Datatype) -> bool {
        self.0.inflight.lock().unwrap().insert((id, datatype))
    }

    fn clear_inflight(&self, id: i64, datatype: Datatype) {
        self.0.inflight.lock().unwrap().remove(&(id, datatype));
    }

    fn build_handle(&self, id: i64) -> Result<EntityHandle, PrecacheError> {
        let record = self
            .0
            .index
            .get(id)
            .map_err(PrecacheError::Internal)?
            .ok_or_else(|| PrecacheError::Internal(anyhow::format_err!("entity {} vanished", id)))?;

        Ok(EntityHandle::new(
            record.id,
            record.upstream_path,
            self.0.config.precache_location.join(&record.precache_dir),
            record.data,
            record.metadata,
            record.checksums,
            record.data_size.map(|n| n as u64),
            record.metadata_size.map(|n| n as u64),
            record.checksum_size.map(|n| n as u64),
            record.checksum,
        ))
    }

    fn project_upstream_err(&self, err: UpstreamError) -> PrecacheError {
        match err {
            UpstreamError::NotFound => PrecacheError::NotFound,
            UpstreamError::Forbidden => PrecacheError::Forbidden,
            UpstreamError::TransientError(msg) => PrecacheError::UpstreamError(msg),
        }
    }

    /// Reserves capacity for `required` bytes, evicting if necessary.
    async fn reserve_capacity(&self, required: u64) -> Result<(), PrecacheError> {
        let limit = match self.0.config.precache_size.as_bytes() {
            Some(l) => l,
            None => return Ok(()),
        };
        let commitment = self.0.index.commitment().map_err(PrecacheError::Internal)?;
        if commitment + required <= limit {
            return Ok(());
        }
        let headroom = limit.saturating_sub(commitment);
        let needed = required.saturating_sub(headroom);
        self.0.invalidator.free(needed).await
    }

    /// Admission steps 3-7: allocate a fresh entity directory, record sizes,
    /// write the metadata sidecar, and kick off the fetch pipeline.
    async fn admit_fresh(&self, path: &str, metadata: UpstreamMetadata) -> Result<i64, PrecacheError> {
        let checksum_estimate = Self::checksum_size_estimate(metadata.size, self.0.config.chunk_size);
        let required = metadata.size + estimate_metadata_bytes(&metadata) + checksum_estimate;

        self.reserve_capacity(required).await?;

        let dir_name = random_entity_dirname();
        let dir = self.0.config.precache_location.join(&dir_name);
        std::fs::create_dir_all(&dir).map_err(|err| PrecacheError::Internal(err.into()))?;

        let id = expect_index_write(self.0.index.upsert_entity(path, &dir_name), "upsert entity");
        expect_index_write(self.0.index.set_checksum(id, &metadata.checksum), "set checksum");
        expect_index_write(self.0.index.set_modified_ts(id, metadata.modified_ts), "set modified_ts");
        expect_index_write(self.0.index.set_size(id, Datatype::Data, metadata.size), "set data size");

        let metadata_json = serde_json::json!({
            "checksum": metadata.checksum,
            "size": metadata.size,
            "created": metadata.created_ts,
            "modified": metadata.modified_ts,
            "avus": metadata.avus.iter().map(|a| serde_json::json!({
                "attribute": a.attribute, "value": a.value, "units": a.units,
            })).collect::<Vec<_>>(),
        });
        let metadata_bytes = serde_json::to_vec_pretty(&metadata_json).map_err(|err| PrecacheError::Internal(err.into()))?;
        replace_file(dir.join("metadata"), &metadata_bytes).map_err(PrecacheError::Internal)?;
        expect_index_write(
            self.0.index.set_size(id, Datatype::Metadata, metadata_bytes.len() as u64),
            "set metadata size",
        );
        expect_index_write(self.0.index.log_status(id, Datatype::Metadata, Status::Started), "log metadata Started");
        expect_index_write(self.0.index.log_status(id, Datatype::Metadata, Status::Finished), "log metadata Finished");
        self.0.readiness.notify(id, Datatype::Metadata);

        self.submit_fetch(id, path.to_string(), dir, metadata.checksum.clone(), self.0.config.mismatch_retries);

        Ok(id)
    }

    fn submit_fetch(&self, id: i64, path: String, dir: PathBuf, expected_checksum: String, retries_left: u32) {
        if !self.mark_inflight(id, Datatype::Data) {
            return;
        }
        expect_index_write(self.0.index.log_status(id, Datatype::Data, Status::Started), "log data Started");

        let manager = self.clone();
        let upstream = self.0.upstream.clone();
        let data_path = dir.join("data");
        let cancel = CancelToken::new();

        let submitted = self.0.fetch_pool.submit(
            id,
            Datatype::Data,
            cancel,
            move |cancel_token| {
                let upstream = upstream.clone();
                let path = path.clone();
                let data_path = data_path.clone();
                async move {
                    upstream
                        .fetch_data(&path, &data_path, cancel_token, &|_n| {})
                        .await
                        .map_err(|err| anyhow::format_err!("{}", err))
                }
            },
            move |outcome| {
                manager.on_fetch_complete(id, dir, expected_checksum, retries_left, outcome);
            },
        );

        if submitted.is_err() {
            self.clear_inflight(id, Datatype::Data);
        }
    }

    fn on_fetch_complete(
        &self,
        id: i64,
        dir: PathBuf,
        expected_checksum: String,
        retries_left: u32,
        outcome: super::types::JobOutcome,
    ) {
        self.clear_inflight(id, Datatype::Data);
        match outcome {
            super::types::JobOutcome::Finished => {
                expect_index_write(self.0.index.log_status(id, Datatype::Data, Status::Finished), "log data Finished");
                self.0.readiness.notify(id, Datatype::Data);
                self.submit_checksum(id, dir, expected_checksum, retries_left);
            }
            super::types::JobOutcome::Failed(err) => {
                error!("fetch failed for entity {}: {}", id, err);
                expect_index_write(self.0.index.log_status(id, Datatype::Data, Status::Failed), "log data Failed");
                self.0.readiness.notify(id, Datatype::Data);
            }
            super::types::JobOutcome::Cancelled => {
                info!("fetch cancelled for entity {}", id);
            }
        }
    }

    fn submit_checksum(&self, id: i64, dir: PathBuf, expected_checksum: String, retries_left: u32) {
        if !self.mark_inflight(id, Datatype::Checksums) {
            return;
        }
        expect_index_write(self.0.index.log_status(id, Datatype::Checksums, Status::Started), "log checksums Started");

        let manager = self.clone();
        let chunk_size = self.0.config.chunk_size as usize;
        let cancel = CancelToken::new();
        let dir_for_job = dir.clone();

        let submitted = self.0.checksum_pool.submit(
            id,
            Datatype::Checksums,
            cancel,
            move |cancel_token| {
                let dir = dir_for_job.clone();
                async move {
                    tokio::task::spawn_blocking(move || -> Result<(), Error> {
                        let summer = Checksummer::new(chunk_size);
                        let result = summer.run(&dir.join("data"), &dir.join("checksums"), || cancel_token.is_cancelled())?;
                        // The worker pool's job signature only carries
                        // success/failure, so the whole-file MD5 the
                        // checksummer computed is handed back via its own
                        // small sidecar rather than threaded through a
                        // return value.
                        replace_file(dir.join("whole_md5"), result.whole_file_md5.as_bytes())?;
                        Ok(())
                    })
                    .await
                    .map_err(|err| anyhow::format_err!("checksum task panicked: {}", err))?
                }
            },
            move |outcome| {
                manager.on_checksum_complete(id, dir, expected_checksum, retries_left, outcome);
            },
        );

        if submitted.is_err() {
            self.clear_inflight(id, Datatype::Checksums);
        }
    }

    fn on_checksum_complete(
        &self,
        id: i64,
        dir: PathBuf,
        expected_checksum: String,
        retries_left: u32,
        outcome: super::types::JobOutcome,
    ) {
        self.clear_inflight(id, Datatype::Checksums);
        match outcome {
            super::types::JobOutcome::Finished => {
                let sidecar_len = std::fs::metadata(dir.join("checksums")).map(|m| m.len()).unwrap_or(0);
                match std::fs::read_to_string(dir.join("whole_md5")) {
                    Ok(actual) if actual.trim() == expected_checksum => {
                        expect_index_write(self.0.index.set_size(id, Datatype::Checksums, sidecar_len), "set checksum size");
                        expect_index_write(
                            self.0.index.log_status(id, Datatype::Checksums, Status::Finished),
                            "log checksums Finished",
                        );
                        self.0.readiness.notify(id, Datatype::Checksums);
                    }
                    Ok(_) => self.handle_mismatch(id, dir, expected_checksum, retries_left),
                    Err(err) => {
                        error!("unable to read whole-file md5 for entity {}: {}", id, err);
                        expect_index_write(
                            self.0.index.log_status(id, Datatype::Checksums, Status::Failed),
                            "log checksums Failed",
                        );
                        self.0.readiness.notify(id, Datatype::Checksums);
                    }
                }
            }
            super::types::JobOutcome::Failed(err) => {
                error!("checksumming failed for entity {}: {}", id, err);
                expect_index_write(self.0.index.log_status(id, Datatype::Checksums, Status::Failed), "log checksums Failed");
                self.0.readiness.notify(id, Datatype::Checksums);
            }
            super::types::JobOutcome::Cancelled => {
                info!("checksumming cancelled for entity {}", id);
            }
        }
    }

    /// Mismatch retry path: clears the bad copy and re-fetches, or gives up
    /// and marks the entity `Failed` once retries are exhausted.
    fn handle_mismatch(&self, id: i64, dir: PathBuf, expected_checksum: String, retries_left: u32) {
        warn!("checksum mismatch for entity {}, {} retries left", id, retries_left);
        let _ = std::fs::remove_file(dir.join("data"));
        let _ = std::fs::remove_file(dir.join("checksums"));
        let _ = std::fs::remove_file(dir.join("whole_md5"));

        if retries_left == 0 {
            expect_index_write(self.0.index.log_status(id, Datatype::Data, Status::Failed), "log data Failed");
            self.0.readiness.notify(id, Datatype::Data);
            return;
        }

        expect_index_write(self.0.index.reset(id), "reset entity after mismatch");

        let path = match self.0.index.get(id) {
            Ok(Some(rec)) => rec.upstream_path,
            _ => return,
        };
        self.submit_fetch(id, path, dir, expected_checksum, retries_left - 1);
    }

    /// Looks up or admits an entity for `path`, submitting fetch/checksum
    /// jobs as needed for the requested `mode`.
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<OpenResult, PrecacheError> {
        self.0.total_requests.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        match mode {
            OpenMode::Existing => self.open_existing(path, false).await,
            OpenMode::MetadataOnly => self.open_existing(path, true).await,
            OpenMode::ForceRefetch => self.open_force_refetch(path).await,
        }
    }

    async fn open_existing(&self, path: &str, metadata_only: bool) -> Result<OpenResult, PrecacheError> {
        let _guard = self.0.admission_lock.lock().await;

        if let Some(id) = self.0.index.find_by_path(path).map_err(PrecacheError::Internal)? {
            expect_index_write(self.0.index.touch(id), "touch entity");
            expect_index_write(self.0.index.increment_contention(id), "increment contention");
            return Ok(OpenResult { handle: self.build_handle(id)?, refetched: false });
        }

        let metadata = self
            .0
            .upstream
            .fetch_metadata(path)
            .await
            .map_err(|err| self.project_upstream_err(err))?;

        let id = if metadata_only {
            self.admit_metadata_only(path, metadata).await?
        } else {
            self.admit_fresh(path, metadata).await?
        };
        expect_index_write(self.0.index.increment_contention(id), "increment contention");
        Ok(OpenResult { handle: self.build_handle(id)?, refetched: false })
    }

    /// Like `admit_fresh` but does not submit the data/checksum jobs: the
    /// entity exists with metadata recorded, data/checksums remain `Queued`
    /// until a subsequent `Existing`/`ForceRefetch` open asks for them.
    async fn admit_metadata_only(&self, path: &str, metadata: UpstreamMetadata) -> Result<i64, PrecacheError> {
        let checksum_estimate = Self::checksum_size_estimate(metadata.size, self.0.config.chunk_size);
        let required = metadata.size + estimate_metadata_bytes(&metadata) + checksum_estimate;
        self.reserve_capacity(required).await?;

        let dir_name = random_entity_dirname();
        let dir = self.0.config.precache_location.join(&dir_name);
        std::fs::create_dir_all(&dir).map_err(|err| PrecacheError::Internal(err.into()))?;

        let id = expect_index_write(self.0.index.upsert_entity(path, &dir_name), "upsert entity");
        expect_index_write(self.0.index.set_checksum(id, &metadata.checksum), "set checksum");
        expect_index_write(self.0.index.set_modified_ts(id, metadata.modified_ts), "set modified_ts");

        let metadata_json = serde_json::json!({
            "checksum": metadata.checksum,
            "size": metadata.size,
            "created": metadata.created_ts,
            "modified": metadata.modified_ts,
            "avus": metadata.avus.iter().map(|a| serde_json::json!({
                "attribute": a.attribute, "value": a.value, "units": a.units,
            })).collect::<Vec<_>>(),
        });
        let metadata_bytes = serde_json::to_vec_pretty(&metadata_json).map_err(|err| PrecacheError::Internal(err.into()))?;
        replace_file(dir.join("metadata"), &metadata_bytes).map_err(PrecacheError::Internal)?;
        expect_index_write(
            self.0.index.set_size(id, Datatype::Metadata, metadata_bytes.len() as u64),
            "set metadata size",
        );
        expect_index_write(self.0.index.log_status(id, Datatype::Metadata, Status::Started), "log metadata Started");
        expect_index_write(self.0.index.log_status(id, Datatype::Metadata, Status::Finished), "log metadata Finished");
        self.0.readiness.notify(id, Datatype::Metadata);

        Ok(id)
    }

    /// Re-checks upstream metadata and re-fetches if it changed.
    async fn open_force_refetch(&self, path: &str) -> Result<OpenResult, PrecacheError> {
        let _guard = self.0.admission_lock.lock().await;

        let existing_id = self.0.index.find_by_path(path).map_err(PrecacheError::Internal)?;

        let metadata = self
            .0
            .upstream
            .fetch_metadata(path)
            .await
            .map_err(|err| self.project_upstream_err(err))?;

        let existing = match existing_id {
            Some(id) => self.0.index.get(id).map_err(PrecacheError::Internal)?,
            None => None,
        };

        let unchanged = existing
            .as_ref()
            .map(|rec| {
                rec.checksum.as_deref() == Some(metadata.checksum.as_str())
                    && rec.data_size == Some(metadata.size as i64)
                    && rec.modified_ts == Some(metadata.modified_ts)
            })
            .unwrap_or(false);

        if let Some(rec) = &existing {
            if unchanged {
                expect_index_write(self.0.index.touch(rec.id), "touch entity");
                expect_index_write(self.0.index.increment_contention(rec.id), "increment contention");
                return Ok(OpenResult { handle: self.build_handle(rec.id)?, refetched: false });
            }
            if rec.contention > 0 {
                return Err(PrecacheError::InUse);
            }
            self.0.invalidator.delete_entity_now(rec).await.map_err(PrecacheError::Internal)?;
        }

        let id = self.admit_fresh(path, metadata).await?;
        expect_index_write(self.0.index.increment_contention(id), "increment contention");
        Ok(OpenResult { handle: self.build_handle(id)?, refetched: true })
    }

    /// Decrements contention; idempotent.
    pub fn release(&self, handle: &EntityHandle) {
        if !handle.mark_released() {
            return;
        }
        expect_index_write(self.0.index.decrement_contention(handle.id), "decrement contention");
    }

    /// Deletes an entity entirely; fails if it's contended.
    pub async fn delete(&self, path: &str) -> Result<(), PrecacheError> {
        let record = self
            .0
            .index
            .get_by_path(path)
            .map_err(PrecacheError::Internal)?
            .ok_or(PrecacheError::NotFound)?;

        if record.contention > 0 {
            return Err(PrecacheError::InUse);
        }
        if self.0.inflight.lock().unwrap().iter().any(|(id, _)| *id == record.id) {
            return Err(PrecacheError::InUse);
        }

        self.0
            .invalidator
            .delete_entity_now(&record)
            .await
            .map_err(PrecacheError::Internal)
    }

    /// Estimated time of arrival for `datatype` on entity `id`.
    pub fn eta(&self, id: i64, datatype: Datatype) -> Result<Option<Eta>, Error> {
        let concurrency = match datatype {
            Datatype::Data => self.0.config.max_connections,
            Datatype::Checksums => self.0.config.checksum_concurrency,
            Datatype::Metadata => 1,
        };
        let queued_ahead = self.queued_ahead_bytes(id, datatype)?;
        eta_for_entity(&self.0.index, &self.0.rate_tracker, epoch_now(), id, datatype, concurrency, queued_ahead)
    }

    /// Sizes of every other entity currently inflight on the same channel as
    /// `(id, datatype)` — the `Q` term's raw input, since the worker pool
    /// itself exposes no per-job queue position.
    fn queued_ahead_bytes(&self, id: i64, datatype: Datatype) -> Result<Vec<u64>, Error> {
        let others: Vec<i64> = self
            .0
            .inflight
            .lock()
            .unwrap()
            .iter()
            .filter(|(other_id, dt)| *dt == datatype && *other_id != id)
            .map(|(other_id, _)| *other_id)
            .collect();

        let mut bytes = Vec::with_capacity(others.len());
        for other_id in others {
            if let Some(rec) = self.0.index.get(other_id)? {
                let size = match datatype {
                    Datatype::Data => rec.data_size,
                    Datatype::Checksums => rec.checksum_size,
                    Datatype::Metadata => None,
                };
                if let Some(size) = size {
                    bytes.push(size as u64);
                }
            }
        }
        Ok(bytes)
    }

    /// Waits for `datatype` on entity `id` to leave `Started`/`Queued`, up
    /// to `deadline` — the explicit readiness event the HTTP layer polls on.
    pub async fn wait_until_settled(&self, id: i64, datatype: Datatype, deadline: Duration) {
        self.0.readiness.wait_for(id, datatype, deadline).await;
    }

    /// Re-reads an entity's current handle without touching contention —
    /// used by the HTTP layer to re-check status after `wait_until_settled`
    /// returns, since the handle `open` returned is a snapshot.
    pub fn peek(&self, id: i64) -> Result<EntityHandle, PrecacheError> {
        self.build_handle(id)
    }

    /// Lists every entity currently tracked, with per-datatype availability.
    pub fn manifest(&self) -> Result<Vec<ManifestEntry>, Error> {
        let mut out = Vec::new();
        for id in self.0.index.all_ids()? {
            if let Some(rec) = self.0.index.get(id)? {
                out.push(ManifestEntry {
                    path: rec.upstream_path,
                    data: rec.data.status,
                    metadata: rec.metadata.status,
                    checksums: rec.checksums.status,
                    last_accessed: rec.last_access,
                    contention: rec.contention,
                });
            }
        }
        Ok(out)
    }

    /// Aggregate service status: commitment, rates, and request counters.
    pub fn status(&self) -> Result<ManagerStatus, Error> {
        self.0.rate_tracker.refresh(&self.0.index)?;
        let fetch_rate = self.0.rate_tracker.current(super::types::Channel::Fetch);
        let checksum_rate = self.0.rate_tracker.current(super::types::Channel::Checksum);
        let inflight = self.0.inflight.lock().unwrap();

        Ok(ManagerStatus {
            commitment_bytes: self.0.index.commitment()?,
            fetch_rate_mean: fetch_rate.map(|r| r.mean),
            fetch_rate_stderr: fetch_rate.map(|r| r.stderr),
            checksum_rate_mean: checksum_rate.map(|r| r.mean),
            checksum_rate_stderr: checksum_rate.map(|r| r.stderr),
            active_fetches: inflight.iter().filter(|(_, dt)| *dt == Datatype::Data).count(),
            active_checksums: inflight.iter().filter(|(_, dt)| *dt == Datatype::Checksums).count(),
            total_requests: self.0.total_requests.load(std::sync::atomic::Ordering::Relaxed),
            start_time: self.0.start_time,
        })
    }
}

/// Unwraps a tracking-index write, panicking on failure. A failed write
/// leaves the index and the on-disk state it records out of sync with no
/// safe way to continue serving this process, so the only correct response
/// is to crash rather than let callers paper over it with a logged warning.
fn expect_index_write<T>(result: Result<T, Error>, what: &str) -> T {
    result.unwrap_or_else(|err| panic!("tracking index write failed ({}): {}", what, err))
}

fn estimate_metadata_bytes(metadata: &UpstreamMetadata) -> u64 {
    // A generous flat estimate for the serialized metadata sidecar, refined
    // to the true value once it is actually written in `admit_fresh`.
    256 + metadata.avus.len() as u64 * 128
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::upstream::fake::{FakeObject, FakeUpstream};

    fn scratch_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "irobot-manager-test-{}",
            crate::tools::fs::random_entity_dirname()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn make_manager(precache_size: Option<u64>) -> (PrecacheManager, Arc<FakeUpstream>) {
        let index = Arc::new(TrackingIndex::open_in_memory().unwrap());
        let upstream = Arc::new(FakeUpstream::new());
        let mut config = Config::default();
        config.precache_location = scratch_dir();
        config.precache_size = match precache_size {
            Some(n) => crate::config::units::SizeLimit::Bytes(n),
            None => crate::config::units::SizeLimit::Unlimited,
        };
        config.chunk_size = 64 * 1024;
        let manager = PrecacheManager::new(index, upstream.clone() as Arc<dyn UpstreamGateway>, config);
        (manager, upstream)
    }

    #[tokio::test]
    async fn open_unknown_path_reports_not_found() {
        let (manager, _upstream) = make_manager(None);
        let err = manager.open("/seq/nope", OpenMode::Existing).await.unwrap_err();
        assert!(matches!(err, PrecacheError::NotFound));
    }

    #[tokio::test]
    async fn cold_admission_creates_queued_entity_and_submits_fetch() {
        let (manager, upstream) = make_manager(None);
        upstream.insert(
            "/seq/alpha",
            FakeObject { bytes: vec![1u8; 5000], checksum: "abc".into(), created_ts: 0, modified_ts: 0 },
        );

        let result = manager.open("/seq/alpha", OpenMode::Existing).await.unwrap();
        assert_eq!(result.handle.metadata.status, Status::Finished);
        assert!(result.handle.data.status == Status::Queued || result.handle.data.status == Status::Started);
        manager.release(&result.handle);
    }

    #[tokio::test]
    async fn duplicate_open_reuses_existing_entity_and_increments_contention() {
        let (manager, upstream) = make_manager(None);
        upstream.insert(
            "/seq/alpha",
            FakeObject { bytes: vec![1u8; 1000], checksum: "abc".into(), created_ts: 0, modified_ts: 0 },
        );

        let first = manager.open("/seq/alpha", OpenMode::Existing).await.unwrap();
        let second = manager.open("/seq/alpha", OpenMode::Existing).await.unwrap();
        assert_eq!(first.handle.id, second.handle.id);
        assert_eq!(upstream.fetch_data_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        manager.release(&first.handle);
        manager.release(&second.handle);
    }

    #[tokio::test]
    async fn precache_full_when_size_exceeds_limit_and_nothing_evictable() {
        let (manager, upstream) = make_manager(Some(1000));
        upstream.insert(
            "/seq/big",
            FakeObject { bytes: vec![1u8; 5000], checksum: "abc".into(), created_ts: 0, modified_ts: 0 },
        );

        let err = manager.open("/seq/big", OpenMode::Existing).await.unwrap_err();
        assert!(matches!(err, PrecacheError::PrecacheFull));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (manager, upstream) = make_manager(None);
        upstream.insert(
            "/seq/alpha",
            FakeObject { bytes: vec![1u8; 1000], checksum: "abc".into(), created_ts: 0, modified_ts: 0 },
        );
        let result = manager.open("/seq/alpha", OpenMode::Existing).await.unwrap();
        manager.release(&result.handle);
        manager.release(&result.handle);

        let record = manager.0.index.get(result.handle.id).unwrap().unwrap();
        assert_eq!(record.contention, 0);
    }

    #[tokio::test]
    async fn delete_fails_while_contended() {
        let (manager, upstream) = make_manager(None);
        upstream.insert(
            "/seq/alpha",
            FakeObject { bytes: vec![1u8; 1000], checksum: "abc".into(), created_ts: 0, modified_ts: 0 },
        );
        let result = manager.open("/seq/alpha", OpenMode::Existing).await.unwrap();
        let err = manager.delete("/seq/alpha").await.unwrap_err();
        assert!(matches!(err, PrecacheError::InUse));
        manager.release(&result.handle);
    }

    #[tokio::test]
    async fn manifest_lists_admitted_entities() {
        let (manager, upstream) = make_manager(None);
        upstream.insert(
            "/seq/alpha",
            FakeObject { bytes: vec![1u8; 1000], checksum: "abc".into(), created_ts: 0, modified_ts: 0 },
        );
        let result = manager.open("/seq/alpha", OpenMode::Existing).await.unwrap();
        let manifest = manager.manifest().unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].path, "/seq/alpha");
        manager.release(&result.handle);
    }
}
