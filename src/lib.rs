//! `irobot-precache`: a brokerage service between an upstream
//! content-addressed object store and HTTP clients.
//!
//! Clients ask for large immutable data objects by upstream path; this
//! crate fetches each one's bulk data, its attribute/value/unit metadata,
//! and a block-wise MD5 checksum table into a local precache on disk, then
//! serves later requests — including byte ranges — from that local copy.
//! `backup` is the precache core (tracking index, worker pool, invalidator,
//! manager); `api2` and `server` are the HTTP surface in front of it;
//! `config` and `auth` are the ambient configuration/authentication layers
//! the core treats as external collaborators.

#[macro_use]
pub mod buildcfg;

pub mod api2;
pub mod auth;
pub mod backup;
pub mod config;
pub mod server;
pub mod tools;
