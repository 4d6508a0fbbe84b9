//! Entity handles and the readiness-event registry.
//!
//! "Await ETA" semantics collapse into a pollable handle plus an explicit
//! readiness event the HTTP layer can wait on up to its deadline, rather
//! than a coroutine suspended mid-admission. The registry below is that
//! event: one `tokio::sync::Notify` per (entity, datatype), the same
//! primitive the worker pool's `CancelToken` uses for its own wakeups
//! (`backup::worker_pool`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::types::{Datatype, Status};
use super::tracking_index::StatusEntry;
use tokio::sync::Notify;

/// A snapshot of one entity's state as returned by `PrecacheManager::open`:
/// its id, its directory, a snapshot of its current per-datatype status,
/// and the file sizes.
#[derive(Debug, Clone)]
pub struct EntityHandle {
    pub id: i64,
    pub upstream_path: String,
    pub precache_dir: std::path::PathBuf,
    pub data: StatusEntry,
    pub metadata: StatusEntry,
    pub checksums: StatusEntry,
    pub data_size: Option<u64>,
    pub metadata_size: Option<u64>,
    pub checksum_size: Option<u64>,
    pub checksum: Option<String>,
    released: Arc<std::sync::atomic::AtomicBool>,
}

impl EntityHandle {
    pub(super) fn new(
        id: i64,
        upstream_path: String,
        precache_dir: std::path::PathBuf,
        data: StatusEntry,
        metadata: StatusEntry,
        checksums: StatusEntry,
        data_size: Option<u64>,
        metadata_size: Option<u64>,
        checksum_size: Option<u64>,
        checksum: Option<String>,
    ) -> Self {
        EntityHandle {
            id,
            upstream_path,
            precache_dir,
            data,
            metadata,
            checksums,
            data_size,
            metadata_size,
            checksum_size,
            checksum,
            released: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn is_data_ready(&self) -> bool {
        self.data.status == Status::Finished
    }

    /// Marks this handle as released, returning `true` the first time and
    /// `false` on every subsequent call — `release()` is required to be
    /// idempotent.
    pub(super) fn mark_released(&self) -> bool {
        self.released
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_ok()
    }
}

/// One `Notify` per (entity, datatype) that reaches `Finished` or `Failed`,
/// so HTTP handlers can wait for completion up to their request deadline
/// instead of polling.
pub struct ReadinessRegistry {
    notifiers: Mutex<HashMap<(i64, Datatype), Arc<Notify>>>,
}

impl ReadinessRegistry {
    pub fn new() -> Self {
        ReadinessRegistry {
            notifiers: Mutex::new(HashMap::new()),
        }
    }

    fn notifier_for(&self, id: i64, datatype: Datatype) -> Arc<Notify> {
        self.notifiers
            .lock()
            .unwrap()
            .entry((id, datatype))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wakes every waiter for (id, datatype). Called by job completion
    /// callbacks once a status transition lands.
    pub fn notify(&self, id: i64, datatype: Datatype) {
        self.notifier_for(id, datatype).notify_waiters();
    }

    /// Waits up to `deadline` for a readiness signal. Returns `true` if a
    /// signal arrived before the deadline, `false` on timeout. Callers must
    /// re-check actual status afterwards: a wakeup is not proof of success.
    pub async fn wait_for(&self, id: i64, datatype: Datatype, deadline: Duration) -> bool {
        let notifier = self.notifier_for(id, datatype);
        tokio::time::timeout(deadline, notifier.notified()).await.is_ok()
    }
}

impl Default for ReadinessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_times_out_when_nothing_ever_notifies() {
        let registry = ReadinessRegistry::new();
        let signalled = registry.wait_for(1, Datatype::Data, Duration::from_millis(20)).await;
        assert!(!signalled);
    }

    #[tokio::test]
    async fn wait_for_wakes_on_notify() {
        let registry = Arc::new(ReadinessRegistry::new());
        let waiter = registry.clone();
        let handle = tokio::spawn(async move { waiter.wait_for(1, Datatype::Data, Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.notify(1, Datatype::Data);

        assert!(handle.await.unwrap());
    }

    #[test]
    fn mark_released_is_idempotent() {
        let handle = EntityHandle::new(
            1,
            "/seq/a".into(),
            "/precache/a".into(),
            StatusEntry { status: Status::Finished, ts: 0 },
            StatusEntry { status: Status::Finished, ts: 0 },
            StatusEntry { status: Status::Finished, ts: 0 },
            Some(10),
            Some(5),
            Some(1),
            Some("abc".into()),
        );
        assert!(handle.mark_released());
        assert!(!handle.mark_released());
    }
}
