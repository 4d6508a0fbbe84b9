//! The HTTP-facing handlers the server dispatches into.
//!
//! Routing is a plain method/path match in `crate::server`; this module only
//! holds the per-endpoint request handlers and their shared response types.

pub mod config_endpoint;
pub mod data_object;
pub mod manifest;
pub mod status;
pub mod types;
