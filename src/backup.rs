//! Everything involved in getting one upstream object into the local
//! precache and keeping track of it afterwards.
//!
//! `tracking_index` owns the single source of truth for what the precache
//! currently holds (one SQLite row per entity, one status-history row per
//! datatype transition). Everything else in this module is built around
//! it: `worker_pool` runs the fetch and checksum jobs, `upstream` is the
//! external object store those jobs talk to, `rate_tracker` and `eta` turn
//! completed jobs into ETAs for the ones still running, `entity` is the
//! handle and readiness-event surface the manager hands callers, and
//! `invalidator` is what eventually removes entities again. `manager` ties
//! all of it into the one service object the HTTP layer holds.

pub mod checksummer;
pub mod entity;
pub mod error;
pub mod eta;
pub mod invalidator;
pub mod manager;
pub mod rate_tracker;
pub mod tracking_index;
pub mod types;
pub mod upstream;
pub mod worker_pool;

pub use entity::{EntityHandle, ReadinessRegistry};
pub use error::PrecacheError;
pub use eta::Eta;
pub use invalidator::Invalidator;
pub use manager::{ManifestEntry, OpenMode, OpenResult, PrecacheManager};
pub use tracking_index::TrackingIndex;
pub use types::{Channel, Datatype, Status};
pub use upstream::{BoundedUpstreamGateway, UpstreamError, UpstreamGateway, UpstreamMetadata};
