//! Durable, transactional tracking store.
//!
//! Backed by `rusqlite` (bundled SQLite) as a single-writer embedded
//! relational engine, the same role `saketh-are-nearcore` uses it for.
//! Every mutating operation is serialised behind one lock, the same
//! discipline a single-writer directory-backed store applies to its own
//! filesystem operations, reapplied here to a SQL connection instead.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{format_err, Error};
use log::warn;
use rusqlite::{params, Connection, OptionalExtension};

use crate::tools::fs::tombstone_and_remove_dir;

use super::types::{Datatype, Status};

/// One (entity, datatype) "current status" row, as returned by
/// `current_status`.
#[derive(Debug, Clone, Copy)]
pub struct StatusEntry {
    pub status: Status,
    pub ts: i64,
}

/// A fully materialised view of one entity's current state.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub id: i64,
    pub upstream_path: String,
    pub precache_dir: String,
    pub last_access: i64,
    pub contention: i64,
    pub checksum: Option<String>,
    pub modified_ts: Option<i64>,
    pub data: StatusEntry,
    pub metadata: StatusEntry,
    pub checksums: StatusEntry,
    pub data_size: Option<i64>,
    pub metadata_size: Option<i64>,
    pub checksum_size: Option<i64>,
}

/// One sample for the rate estimator: `bytes` transferred over
/// `duration_secs` wall-clock seconds for one completed Started→Finished
/// span.
#[derive(Debug, Clone, Copy)]
pub struct RateSample {
    pub bytes: u64,
    pub duration_secs: f64,
}

pub struct TrackingIndex {
    conn: Mutex<Connection>,
}

impl TrackingIndex {
    /// Opens (creating if needed) the index at `path`, then brings it back
    /// in sync with `precache_root`: startup repair resets any row left
    /// mid-transition by a prior crash and deletes that entity's stale
    /// on-disk artifacts, then every directory under `precache_root` is
    /// reconciled against the index (an entity exists iff its directory
    /// does).
    pub fn open(path: &Path, precache_root: &Path) -> Result<TrackingIndex, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id              INTEGER PRIMARY KEY,
                upstream_path   TEXT NOT NULL UNIQUE,
                precache_dir    TEXT NOT NULL,
                last_access     INTEGER NOT NULL,
                contention      INTEGER NOT NULL DEFAULT 0,
                checksum        TEXT,
                modified_ts     INTEGER
            );

            CREATE TABLE IF NOT EXISTS sizes (
                entity_id   INTEGER NOT NULL REFERENCES entities(id),
                datatype    TEXT NOT NULL,
                bytes       INTEGER NOT NULL,
                PRIMARY KEY (entity_id, datatype)
            );

            CREATE TABLE IF NOT EXISTS status_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id   INTEGER NOT NULL REFERENCES entities(id),
                datatype    TEXT NOT NULL,
                status      INTEGER NOT NULL,
                ts          INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS status_log_lookup
                ON status_log (entity_id, datatype, status DESC, id DESC);

            CREATE INDEX IF NOT EXISTS entities_last_access
                ON entities (last_access);
            "#,
        )?;

        let index = TrackingIndex {
            conn: Mutex::new(conn),
        };

        for id in index.startup_repair()? {
            if let Some(rec) = index.get(id)? {
                let dir = precache_root.join(&rec.precache_dir);
                let _ = std::fs::remove_file(dir.join("data"));
                let _ = std::fs::remove_file(dir.join("checksums"));
                let _ = std::fs::remove_file(dir.join("whole_md5"));
            }
        }

        index.reconcile_with_disk(precache_root)?;

        Ok(index)
    }

    /// An entity exists iff its directory exists: removes any subdirectory
    /// of `precache_root` with no matching row, and drops any row whose
    /// `precache_dir` is missing on disk.
    fn reconcile_with_disk(&self, precache_root: &Path) -> Result<(), Error> {
        let tracked = self.all_paths_and_dirs()?;
        let tracked_dirs: std::collections::HashSet<String> =
            tracked.iter().map(|(_, _, dir)| dir.clone()).collect();

        if let Ok(entries) = std::fs::read_dir(precache_root) {
            for entry in entries.flatten() {
                if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if !tracked_dirs.contains(&name) {
                    warn!("removing orphaned precache directory {:?} with no tracking row", entry.path());
                    let _ = tombstone_and_remove_dir(&entry.path());
                }
            }
        }

        for (id, _upstream_path, dir) in tracked {
            if !precache_root.join(&dir).exists() {
                warn!("dropping entity {} whose directory {:?} is missing on disk", id, dir);
                self.delete_entity(id)?;
            }
        }

        Ok(())
    }

    /// In-memory index, used by tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<TrackingIndex, Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            r#"
            CREATE TABLE entities (
                id              INTEGER PRIMARY KEY,
                upstream_path   TEXT NOT NULL UNIQUE,
                precache_dir    TEXT NOT NULL,
                last_access     INTEGER NOT NULL,
                contention      INTEGER NOT NULL DEFAULT 0,
                checksum        TEXT,
                modified_ts     INTEGER
            );
            CREATE TABLE sizes (
                entity_id   INTEGER NOT NULL,
                datatype    TEXT NOT NULL,
                bytes       INTEGER NOT NULL,
                PRIMARY KEY (entity_id, datatype)
            );
            CREATE TABLE status_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id   INTEGER NOT NULL,
                datatype    TEXT NOT NULL,
                status      INTEGER NOT NULL,
                ts          INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(TrackingIndex { conn: Mutex::new(conn) })
    }

    /// Creates an entity and an initial `Queued` row for each datatype.
    pub fn upsert_entity(&self, upstream_path: &str, precache_dir: &str) -> Result<i64, Error> {
        let now = crate::tools::time::epoch_now();
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO entities (upstream_path, precache_dir, last_access, contention) VALUES (?1, ?2, ?3, 0)",
            params![upstream_path, precache_dir, now],
        )?;
        let id = tx.last_insert_rowid();

        for dt in Datatype::ALL {
            tx.execute(
                "INSERT INTO status_log (entity_id, datatype, status, ts) VALUES (?1, ?2, ?3, ?4)",
                params![id, dt.as_str(), Status::Queued as i64, now],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    /// Looks up an entity id by its unique upstream path.
    pub fn find_by_path(&self, upstream_path: &str) -> Result<Option<i64>, Error> {
        let conn = self.conn.lock().unwrap();
        let id = conn
            .query_row(
                "SELECT id FROM entities WHERE upstream_path = ?1",
                params![upstream_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Records the size of a (entity, datatype), failing if a differing
    /// size is already recorded — sizes are immutable once set.
    pub fn set_size(&self, id: i64, datatype: Datatype, bytes: u64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT bytes FROM sizes WHERE entity_id = ?1 AND datatype = ?2",
                params![id, datatype.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(existing) if existing as u64 != bytes => {
                return Err(format_err!(
                    "size mismatch for entity {} datatype {}: recorded {}, got {}",
                    id,
                    datatype,
                    existing,
                    bytes
                ));
            }
            Some(_) => return Ok(()),
            None => {}
        }

        conn.execute(
            "INSERT INTO sizes (entity_id, datatype, bytes) VALUES (?1, ?2, ?3)",
            params![id, datatype.as_str(), bytes as i64],
        )?;
        Ok(())
    }

    /// Appends a status transition, rejecting non-strictly-increasing moves.
    /// Callers that need the reset backward transition must go through
    /// `reset`, not this method.
    pub fn log_status(&self, id: i64, datatype: Datatype, status: Status) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let current = Self::current_status_one(&conn, id, datatype)?;
        if let Some(current) = current {
            if status <= current.status {
                return Err(format_err!(
                    "non-monotonic status transition for entity {} datatype {}: {} -> {}",
                    id,
                    datatype,
                    current.status,
                    status
                ));
            }
        }
        let now = crate::tools::time::epoch_now();
        conn.execute(
            "INSERT INTO status_log (entity_id, datatype, status, ts) VALUES (?1, ?2, ?3, ?4)",
            params![id, datatype.as_str(), status as i64, now],
        )?;
        Ok(())
    }

    /// Records the upstream-reported whole-file checksum once known.
    pub fn set_checksum(&self, id: i64, checksum: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE entities SET checksum = ?1 WHERE id = ?2",
            params![checksum, id],
        )?;
        Ok(())
    }

    /// Records the upstream-reported modification time once known, so a
    /// later force-refetch can compare against it alongside size and
    /// checksum.
    pub fn set_modified_ts(&self, id: i64, modified_ts: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE entities SET modified_ts = ?1 WHERE id = ?2",
            params![modified_ts, id],
        )?;
        Ok(())
    }

    /// Reset-to-Queued: erases status rows with status ≥ Started for
    /// `data`/`checksums`, drops their size rows, and re-inserts `Queued`.
    /// Metadata is left untouched.
    pub fn reset(&self, id: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let now = crate::tools::time::epoch_now();

        for dt in [Datatype::Data, Datatype::Checksums] {
            tx.execute(
                "DELETE FROM status_log WHERE entity_id = ?1 AND datatype = ?2 AND status >= ?3",
                params![id, dt.as_str(), Status::Started as i64],
            )?;
            tx.execute(
                "DELETE FROM sizes WHERE entity_id = ?1 AND datatype = ?2",
                params![id, dt.as_str()],
            )?;
            tx.execute(
                "INSERT INTO status_log (entity_id, datatype, status, ts) VALUES (?1, ?2, ?3, ?4)",
                params![id, dt.as_str(), Status::Queued as i64, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Updates `last_access` to now.
    pub fn touch(&self, id: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let now = crate::tools::time::epoch_now();
        conn.execute(
            "UPDATE entities SET last_access = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    pub fn increment_contention(&self, id: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE entities SET contention = contention + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn decrement_contention(&self, id: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE entities SET contention = MAX(contention - 1, 0) WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn current_status_one(
        conn: &Connection,
        id: i64,
        datatype: Datatype,
    ) -> Result<Option<StatusEntry>, Error> {
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT status, ts FROM status_log \
                 WHERE entity_id = ?1 AND datatype = ?2 \
                 ORDER BY status DESC, id DESC LIMIT 1",
                params![id, datatype.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(status, ts)| StatusEntry {
            status: Status::from_i64(status).expect("valid status id"),
            ts,
        }))
    }

    /// Derived view of the current status of every datatype for one entity.
    pub fn current_status(
        &self,
        id: i64,
    ) -> Result<(StatusEntry, StatusEntry, StatusEntry), Error> {
        let conn = self.conn.lock().unwrap();
        let data = Self::current_status_one(&conn, id, Datatype::Data)?
            .ok_or_else(|| format_err!("entity {} has no data status row", id))?;
        let metadata = Self::current_status_one(&conn, id, Datatype::Metadata)?
            .ok_or_else(|| format_err!("entity {} has no metadata status row", id))?;
        let checksums = Self::current_status_one(&conn, id, Datatype::Checksums)?
            .ok_or_else(|| format_err!("entity {} has no checksums status row", id))?;
        Ok((data, metadata, checksums))
    }

    /// Full record, used by the manager to build entity handles and the
    /// manifest view.
    pub fn get(&self, id: i64) -> Result<Option<EntityRecord>, Error> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String, i64, i64, Option<String>, Option<i64>)> = conn
            .query_row(
                "SELECT upstream_path, precache_dir, last_access, contention, checksum, modified_ts \
                 FROM entities WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
            )
            .optional()?;

        let (upstream_path, precache_dir, last_access, contention, checksum, modified_ts) = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let data = Self::current_status_one(&conn, id, Datatype::Data)?
            .unwrap_or(StatusEntry { status: Status::Queued, ts: last_access });
        let metadata = Self::current_status_one(&conn, id, Datatype::Metadata)?
            .unwrap_or(StatusEntry { status: Status::Queued, ts: last_access });
        let checksums = Self::current_status_one(&conn, id, Datatype::Checksums)?
            .unwrap_or(StatusEntry { status: Status::Queued, ts: last_access });

        let size_of = |dt: Datatype| -> Result<Option<i64>, Error> {
            Ok(conn
                .query_row(
                    "SELECT bytes FROM sizes WHERE entity_id = ?1 AND datatype = ?2",
                    params![id, dt.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        };

        Ok(Some(EntityRecord {
            id,
            upstream_path,
            precache_dir,
            last_access,
            contention,
            checksum,
            modified_ts,
            data,
            metadata,
            checksums,
            data_size: size_of(Datatype::Data)?,
            metadata_size: size_of(Datatype::Metadata)?,
            checksum_size: size_of(Datatype::Checksums)?,
        }))
    }

    pub fn get_by_path(&self, upstream_path: &str) -> Result<Option<EntityRecord>, Error> {
        let id = self.find_by_path(upstream_path)?;
        match id {
            Some(id) => self.get(id),
            None => Ok(None),
        }
    }

    /// Total bytes accounted across every entity.
    pub fn commitment(&self) -> Result<u64, Error> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row("SELECT COALESCE(SUM(bytes), 0) FROM sizes", [], |row| row.get(0))?;
        Ok(total as u64)
    }

    /// Entities whose `last_access <= now - min_age` and `contention == 0`,
    /// oldest first, for capacity/temporal eviction.
    pub fn candidates_for_eviction(&self, min_age_secs: i64, limit: i64) -> Result<Vec<EntityRecord>, Error> {
        let now = crate::tools::time::epoch_now();
        let cutoff = now - min_age_secs;
        let ids: Vec<i64> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id FROM entities WHERE last_access <= ?1 AND contention = 0 \
                 ORDER BY last_access ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![cutoff, limit], |row| row.get(0))?;
            rows.collect::<Result<Vec<i64>, _>>()?
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rec) = self.get(id)? {
                out.push(rec);
            }
        }
        Ok(out)
    }

    /// Removes an entity and all of its rows in one transaction. Tracking
    /// rows are removed before the caller removes the on-disk directory.
    pub fn delete_entity(&self, id: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM status_log WHERE entity_id = ?1", params![id])?;
        tx.execute("DELETE FROM sizes WHERE entity_id = ?1", params![id])?;
        tx.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Raw samples for `data` and `checksums`: one per entity whose
    /// Started→Finished span for that datatype has completed, used to
    /// derive the channel's production rate.
    pub fn rate_samples(&self, datatype: Datatype) -> Result<Vec<RateSample>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sizes.bytes, started.ts, finished.ts \
             FROM sizes \
             JOIN (SELECT entity_id, ts FROM status_log WHERE datatype = ?1 AND status = ?2) started \
               ON started.entity_id = sizes.entity_id \
             JOIN (SELECT entity_id, ts FROM status_log WHERE datatype = ?1 AND status = ?3) finished \
               ON finished.entity_id = sizes.entity_id \
             WHERE sizes.datatype = ?1 AND finished.ts > started.ts",
        )?;
        let rows = stmt.query_map(
            params![datatype.as_str(), Status::Started as i64, Status::Finished as i64],
            |row| {
                let bytes: i64 = row.get(0)?;
                let started_ts: i64 = row.get(1)?;
                let finished_ts: i64 = row.get(2)?;
                Ok((bytes, finished_ts - started_ts))
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            let (bytes, duration_secs) = row?;
            out.push(RateSample {
                bytes: bytes as u64,
                duration_secs: duration_secs as f64,
            });
        }
        Ok(out)
    }

    /// All entities currently in `Started` for any datatype, used by
    /// startup repair and by the ETA estimator's `W` term.
    pub fn started_entities(&self, datatype: Datatype) -> Result<Vec<i64>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT entity_id FROM status_log sl1 \
             WHERE datatype = ?1 AND status = ?2 \
             AND NOT EXISTS ( \
                SELECT 1 FROM status_log sl2 \
                WHERE sl2.entity_id = sl1.entity_id AND sl2.datatype = ?1 AND sl2.status > sl1.status \
             )",
        )?;
        let rows = stmt.query_map(params![datatype.as_str(), Status::Started as i64], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<i64>, _>>()?)
    }

    pub fn all_ids(&self) -> Result<Vec<i64>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM entities")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<i64>, _>>()?)
    }

    pub fn all_paths_and_dirs(&self) -> Result<Vec<(i64, String, String)>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, upstream_path, precache_dir FROM entities")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// For every (entity, datatype) whose current status is `Started`,
    /// resets it to `Queued` — such a row means the process crashed
    /// mid-work. Returns the ids touched so the caller can delete their
    /// on-disk artifacts.
    fn startup_repair(&self) -> Result<Vec<i64>, Error> {
        let mut repaired = Vec::new();
        for dt in [Datatype::Data, Datatype::Checksums] {
            for id in self.started_entities(dt)? {
                self.reset(id)?;
                repaired.push(id);
            }
        }
        self.compact()?;
        Ok(repaired)
    }

    /// Reclaims space from deleted rows.
    pub fn compact(&self) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_creates_queued_rows_for_every_datatype() {
        let idx = TrackingIndex::open_in_memory().unwrap();
        let id = idx.upsert_entity("/seq/alpha", "/precache/alpha").unwrap();
        let (data, metadata, checksums) = idx.current_status(id).unwrap();
        assert_eq!(data.status, Status::Queued);
        assert_eq!(metadata.status, Status::Queued);
        assert_eq!(checksums.status, Status::Queued);
    }

    #[test]
    fn log_status_rejects_non_monotonic_transitions() {
        let idx = TrackingIndex::open_in_memory().unwrap();
        let id = idx.upsert_entity("/seq/alpha", "/precache/alpha").unwrap();
        idx.log_status(id, Datatype::Data, Status::Started).unwrap();
        idx.log_status(id, Datatype::Data, Status::Finished).unwrap();
        assert!(idx.log_status(id, Datatype::Data, Status::Started).is_err());
    }

    #[test]
    fn set_size_rejects_differing_resubmission() {
        let idx = TrackingIndex::open_in_memory().unwrap();
        let id = idx.upsert_entity("/seq/alpha", "/precache/alpha").unwrap();
        idx.set_size(id, Datatype::Data, 100).unwrap();
        idx.set_size(id, Datatype::Data, 100).unwrap(); // idempotent
        assert!(idx.set_size(id, Datatype::Data, 200).is_err());
    }

    #[test]
    fn reset_clears_data_and_checksums_but_keeps_metadata() {
        let idx = TrackingIndex::open_in_memory().unwrap();
        let id = idx.upsert_entity("/seq/alpha", "/precache/alpha").unwrap();
        idx.log_status(id, Datatype::Metadata, Status::Started).unwrap();
        idx.log_status(id, Datatype::Metadata, Status::Finished).unwrap();
        idx.log_status(id, Datatype::Data, Status::Started).unwrap();
        idx.log_status(id, Datatype::Data, Status::Finished).unwrap();
        idx.set_size(id, Datatype::Data, 1000).unwrap();

        idx.reset(id).unwrap();

        let (data, metadata, _) = idx.current_status(id).unwrap();
        assert_eq!(data.status, Status::Queued);
        assert_eq!(metadata.status, Status::Finished);
        assert_eq!(idx.commitment().unwrap(), 0);
    }

    #[test]
    fn commitment_sums_every_recorded_size() {
        let idx = TrackingIndex::open_in_memory().unwrap();
        let a = idx.upsert_entity("/seq/a", "/precache/a").unwrap();
        let b = idx.upsert_entity("/seq/b", "/precache/b").unwrap();
        idx.set_size(a, Datatype::Data, 100).unwrap();
        idx.set_size(b, Datatype::Data, 250).unwrap();
        assert_eq!(idx.commitment().unwrap(), 350);
    }

    #[test]
    fn eviction_candidates_exclude_contended_entities() {
        let idx = TrackingIndex::open_in_memory().unwrap();
        let a = idx.upsert_entity("/seq/a", "/precache/a").unwrap();
        let b = idx.upsert_entity("/seq/b", "/precache/b").unwrap();
        idx.increment_contention(b).unwrap();

        let candidates = idx.candidates_for_eviction(-1, 10).unwrap();
        let ids: Vec<i64> = candidates.iter().map(|e| e.id).collect();
        assert!(ids.contains(&a));
        assert!(!ids.contains(&b));
    }

    #[test]
    fn rate_samples_only_include_completed_spans() {
        let idx = TrackingIndex::open_in_memory().unwrap();
        let id = idx.upsert_entity("/seq/a", "/precache/a").unwrap();
        idx.set_size(id, Datatype::Data, 1000).unwrap();
        // still Queued -> no sample yet
        assert!(idx.rate_samples(Datatype::Data).unwrap().is_empty());

        idx.log_status(id, Datatype::Data, Status::Started).unwrap();
        idx.log_status(id, Datatype::Data, Status::Finished).unwrap();
        let samples = idx.rate_samples(Datatype::Data).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].bytes, 1000);
    }
}
