//! Typed precache errors and their HTTP projection.
//!
//! `anyhow::Error` remains the default currency elsewhere, but the manager's
//! public surface needs callers to match on the *kind* of failure rather
//! than a message, so `PrecacheError` is a `thiserror`-derived enum with
//! typed returns from each manager operation instead of control-flow by
//! exception.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrecacheError {
    #[error("upstream path not found")]
    NotFound,

    #[error("upstream denied access")]
    Forbidden,

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("precache is full")]
    PrecacheFull,

    #[error("entity is in use")]
    InUse,

    #[error("no representation matches the Accept header")]
    Unacceptable,

    #[error("invalid or out-of-bounds range")]
    BadRange,

    #[error("request exceeded its deadline")]
    Deadline,

    /// Internal only: triggers `TrackingIndex::reset` and a bounded retry
    /// inside the manager. Never surfaced to HTTP directly.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PrecacheError {
    /// The HTTP status code this error kind projects onto.
    /// `ChecksumMismatch` has no direct projection: the manager always
    /// converts it into `UpstreamError` after exhausting retries.
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            PrecacheError::NotFound => StatusCode::NOT_FOUND,
            PrecacheError::Forbidden => StatusCode::FORBIDDEN,
            PrecacheError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            PrecacheError::PrecacheFull => StatusCode::INSUFFICIENT_STORAGE,
            PrecacheError::InUse => StatusCode::CONFLICT,
            PrecacheError::Unacceptable => StatusCode::NOT_ACCEPTABLE,
            PrecacheError::BadRange => StatusCode::RANGE_NOT_SATISFIABLE,
            PrecacheError::Deadline => StatusCode::GATEWAY_TIMEOUT,
            PrecacheError::ChecksumMismatch => StatusCode::BAD_GATEWAY,
            PrecacheError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            PrecacheError::NotFound => "NotFound",
            PrecacheError::Forbidden => "Forbidden",
            PrecacheError::UpstreamError(_) => "UpstreamError",
            PrecacheError::PrecacheFull => "PrecacheFull",
            PrecacheError::InUse => "InUse",
            PrecacheError::Unacceptable => "Unacceptable",
            PrecacheError::BadRange => "BadRange",
            PrecacheError::Deadline => "Deadline",
            PrecacheError::ChecksumMismatch => "ChecksumMismatch",
            PrecacheError::Internal(_) => "InternalError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_projections_cover_common_cases() {
        assert_eq!(PrecacheError::NotFound.http_status(), http::StatusCode::NOT_FOUND);
        assert_eq!(PrecacheError::PrecacheFull.http_status(), http::StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(PrecacheError::InUse.http_status(), http::StatusCode::CONFLICT);
        assert_eq!(PrecacheError::BadRange.http_status(), http::StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(PrecacheError::Deadline.http_status(), http::StatusCode::GATEWAY_TIMEOUT);
    }
}
