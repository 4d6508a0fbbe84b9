//! The HTTP daemon: binds a socket, accepts connections, and dispatches
//! requests into `api2`'s handlers.

pub mod http;

pub use http::{run, Daemon};
