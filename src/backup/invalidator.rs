//! Temporal sweep and capacity eviction.
//!
//! A periodic scan that selects candidates under a snapshot and removes
//! them in deletion order, tracking rows before the on-disk artifact. The
//! "all evictions succeed together or none do" rule is implemented as a
//! plain two-phase select-then-delete with no partial commit in between.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Error;
use log::{error, info, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::units::DurationLimit;
use crate::tools::fs::tombstone_and_remove_dir;

use super::error::PrecacheError;
use super::tracking_index::{EntityRecord, TrackingIndex};

/// Broad upper bound on how many eviction candidates we ever pull into
/// memory for one sweep or one capacity-eviction pass.
const CANDIDATE_SCAN_LIMIT: i64 = 1_000_000;

pub struct Invalidator {
    index: Arc<TrackingIndex>,
    precache_root: PathBuf,
    age_threshold: DurationLimit,
    expiry: DurationLimit,
    /// One exclusive lock shared by the temporal sweep and capacity
    /// eviction, so they never run concurrently.
    eviction_lock: AsyncMutex<()>,
}

fn entity_total_size(rec: &EntityRecord) -> u64 {
    rec.data_size.unwrap_or(0) as u64 + rec.metadata_size.unwrap_or(0) as u64 + rec.checksum_size.unwrap_or(0) as u64
}

fn entity_dir(precache_root: &Path, rec: &EntityRecord) -> PathBuf {
    precache_root.join(&rec.precache_dir)
}

impl Invalidator {
    pub fn new(
        index: Arc<TrackingIndex>,
        precache_root: PathBuf,
        age_threshold: DurationLimit,
        expiry: DurationLimit,
    ) -> Self {
        Invalidator {
            index,
            precache_root,
            age_threshold,
            expiry,
            eviction_lock: AsyncMutex::new(()),
        }
    }

    /// Capacity eviction: frees at least `bytes_needed` by deleting the
    /// oldest eligible entities as a single all-or-nothing batch. Entities
    /// younger than `age_threshold` are never candidates.
    pub async fn free(&self, bytes_needed: u64) -> Result<(), PrecacheError> {
        let _guard = self.eviction_lock.lock().await;
        let now = crate::tools::time::epoch_now();

        let candidates = self
            .index
            .candidates_for_eviction(0, CANDIDATE_SCAN_LIMIT)
            .map_err(PrecacheError::Internal)?;

        let mut batch = Vec::new();
        let mut total = 0u64;
        for rec in candidates {
            if !self.age_threshold.has_elapsed_since(rec.last_access, now) {
                continue;
            }
            total += entity_total_size(&rec);
            batch.push(rec);
            if total >= bytes_needed {
                break;
            }
        }

        if total < bytes_needed {
            return Err(PrecacheError::PrecacheFull);
        }

        for rec in &batch {
            self.delete_entity(rec).map_err(PrecacheError::Internal)?;
        }

        info!(
            "capacity eviction freed {} bytes across {} entities",
            total,
            batch.len()
        );
        Ok(())
    }

    /// One pass of the temporal sweep: deletes every entity whose
    /// `last_access + expiry < now` and `contention == 0`. Returns the
    /// number of entities removed.
    pub async fn sweep_once(&self) -> Result<usize, Error> {
        let _guard = self.eviction_lock.lock().await;
        let now = crate::tools::time::epoch_now();

        let candidates = self.index.candidates_for_eviction(0, CANDIDATE_SCAN_LIMIT)?;
        let mut removed = 0;
        for rec in candidates {
            if !self.expiry.has_elapsed_since(rec.last_access, now) {
                continue;
            }
            if let Err(err) = self.delete_entity(&rec) {
                error!("temporal sweep failed to delete entity {}: {}", rec.id, err);
                continue;
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Deletes one entity immediately, outside the timer/capacity paths —
    /// used by the manager for `delete(path)` and for replacing an entity
    /// whose force-refetched metadata changed. Still takes the eviction
    /// lock, since it touches the same tracking rows and directory tree.
    pub async fn delete_entity_now(&self, rec: &EntityRecord) -> Result<(), Error> {
        let _guard = self.eviction_lock.lock().await;
        self.delete_entity(rec)
    }

    /// Deletes tracking rows before the directory, so an interrupted sweep
    /// may leave an orphan directory that startup repair cleans up, never a
    /// dangling row pointing at a missing directory. The tracking-index
    /// write is not allowed to fail silently: a failure here means the
    /// index and the directory tree it describes can no longer be trusted
    /// to agree, so it's fatal to the process rather than recoverable.
    fn delete_entity(&self, rec: &EntityRecord) -> Result<(), Error> {
        self.index
            .delete_entity(rec.id)
            .unwrap_or_else(|err| panic!("tracking index write failed (delete entity {}): {}", rec.id, err));
        let dir = entity_dir(&self.precache_root, rec);
        tombstone_and_remove_dir(&dir)?;
        Ok(())
    }

    /// Spawns the periodic temporal sweep task, on a timer whose period is
    /// at most half the expiry limit. No task is spawned when `expiry` is
    /// unlimited, since no entity can ever become eligible.
    pub fn spawn_periodic_sweep(self: Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if matches!(self.expiry, DurationLimit::Unlimited) {
            return None;
        }

        Some(tokio::spawn(async move {
            loop {
                let now = crate::tools::time::epoch_now();
                let period_secs = sweep_period_secs(self.expiry, now).unwrap_or(3600);
                tokio::time::sleep(std::time::Duration::from_secs(period_secs)).await;

                match self.sweep_once().await {
                    Ok(n) if n > 0 => info!("temporal sweep removed {} expired entities", n),
                    Ok(_) => {}
                    Err(err) => warn!("temporal sweep failed: {}", err),
                }
            }
        }))
    }
}

/// Half the time remaining until `expiry` would first trigger for an entity
/// accessed right now, used as the sweep's polling period. `None` only for
/// `Unlimited`, handled by the caller.
fn sweep_period_secs(expiry: DurationLimit, now: i64) -> Option<u64> {
    let deadline = expiry.deadline_after(now)?;
    let full = (deadline - now).max(2) as u64;
    Some((full / 2).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::types::{Datatype, Status};

    fn sample_index() -> (Arc<TrackingIndex>, PathBuf) {
        let index = Arc::new(TrackingIndex::open_in_memory().unwrap());
        let root = std::env::temp_dir().join(format!(
            "irobot-invalidator-test-{}",
            crate::tools::fs::random_entity_dirname()
        ));
        std::fs::create_dir_all(&root).unwrap();
        (index, root)
    }

    fn finish_entity(index: &TrackingIndex, path: &str, dir_name: &str, size: u64, root: &Path) -> i64 {
        let id = index.upsert_entity(path, dir_name).unwrap();
        index.log_status(id, Datatype::Data, Status::Started).unwrap();
        index.log_status(id, Datatype::Data, Status::Finished).unwrap();
        index.set_size(id, Datatype::Data, size).unwrap();
        std::fs::create_dir_all(root.join(dir_name)).unwrap();
        id
    }

    #[tokio::test]
    async fn free_is_a_no_op_when_nothing_is_old_enough() {
        let (index, root) = sample_index();
        finish_entity(&index, "/seq/a", "a", 100, &root);

        let invalidator = Invalidator::new(index.clone(), root, DurationLimit::Unlimited, DurationLimit::Unlimited);
        let result = invalidator.free(50).await;
        assert!(matches!(result, Err(PrecacheError::PrecacheFull)));
        assert_eq!(index.commitment().unwrap(), 100);
    }

    #[tokio::test]
    async fn free_evicts_oldest_entities_until_budget_met() {
        let (index, root) = sample_index();
        finish_entity(&index, "/seq/a", "a", 100, &root);
        finish_entity(&index, "/seq/b", "b", 100, &root);

        let invalidator = Invalidator::new(index.clone(), root, DurationLimit::Seconds(0), DurationLimit::Unlimited);
        invalidator.free(150).await.unwrap();

        assert!(index.commitment().unwrap() <= 100);
    }

    #[tokio::test]
    async fn free_leaves_contended_entities_alone() {
        let (index, root) = sample_index();
        let id = finish_entity(&index, "/seq/a", "a", 100, &root);
        index.increment_contention(id).unwrap();

        let invalidator = Invalidator::new(index.clone(), root, DurationLimit::Seconds(0), DurationLimit::Unlimited);
        let result = invalidator.free(50).await;
        assert!(matches!(result, Err(PrecacheError::PrecacheFull)));
        assert_eq!(index.commitment().unwrap(), 100);
    }

    #[test]
    fn sweep_period_is_half_the_remaining_expiry() {
        let period = sweep_period_secs(DurationLimit::Seconds(100), 0).unwrap();
        assert_eq!(period, 50);
    }

    #[test]
    fn sweep_period_is_none_for_unlimited_expiry() {
        assert!(sweep_period_secs(DurationLimit::Unlimited, 0).is_none());
    }
}
