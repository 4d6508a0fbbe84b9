//! Shared small types used across the precache subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The three artifacts the precache tracks independently for each entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datatype {
    Data,
    Metadata,
    Checksums,
}

impl Datatype {
    pub const ALL: [Datatype; 3] = [Datatype::Data, Datatype::Metadata, Datatype::Checksums];

    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Data => "data",
            Datatype::Metadata => "metadata",
            Datatype::Checksums => "checksums",
        }
    }

    pub fn parse(s: &str) -> Option<Datatype> {
        match s {
            "data" => Some(Datatype::Data),
            "metadata" => Some(Datatype::Metadata),
            "checksums" => Some(Datatype::Checksums),
            _ => None,
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The strictly-increasing status lattice a datatype moves through. The
/// discriminants are the numeric status ids the tracking index stores and
/// compares against directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i64)]
pub enum Status {
    Queued = 1,
    Started = 2,
    Finished = 3,
    Unknown = 4,
    Failed = 5,
}

impl Status {
    pub fn from_i64(n: i64) -> Option<Status> {
        match n {
            1 => Some(Status::Queued),
            2 => Some(Status::Started),
            3 => Some(Status::Finished),
            4 => Some(Status::Unknown),
            5 => Some(Status::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Started => "started",
            Status::Finished => "finished",
            Status::Unknown => "unknown",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker pool channel. `Data` fetches are bounded by the upstream
/// connection limit; `Checksum` jobs are bounded by the configured
/// checksum concurrency. Metadata has no channel: it is fetched
/// synchronously during admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Fetch,
    Checksum,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Fetch => "fetch",
            Channel::Checksum => "checksum",
        }
    }
}

/// Outcome reported by a worker pool job's completion callback.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Finished,
    Failed(String),
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lattice_is_strictly_ordered() {
        assert!(Status::Queued < Status::Started);
        assert!(Status::Started < Status::Finished);
        assert!(Status::Finished < Status::Unknown);
        assert!(Status::Unknown < Status::Failed);
    }

    #[test]
    fn status_roundtrips_through_i64() {
        for s in [
            Status::Queued,
            Status::Started,
            Status::Finished,
            Status::Unknown,
            Status::Failed,
        ] {
            assert_eq!(Status::from_i64(s as i64), Some(s));
        }
    }
}
