//! Epoch/RFC3339 helpers.
//!
//! Two small primitives built on top of `chrono`, which plays the
//! equivalent role in `MystenLabs-sui`, `harborgrid-justin-caddy`, and
//! `saketh-are-nearcore`.

use anyhow::Error;
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as seconds since the Unix epoch.
pub fn epoch_now() -> i64 {
    epoch_f64() as i64
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn epoch_f64() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(err) => -(err.duration().as_secs_f64()),
    }
}

/// Formats a Unix timestamp (seconds) as an RFC3339/ISO8601 UTC string, e.g.
/// `2026-07-31T12:00:00Z`.
pub fn epoch_to_rfc3339_utc(epoch: i64) -> Result<String, Error> {
    let dt = DateTime::<Utc>::from(UNIX_EPOCH + std::time::Duration::from_secs(epoch.max(0) as u64));
    Ok(dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_now_is_reasonable() {
        let t = epoch_now();
        assert!(t > 1_700_000_000);
    }

    #[test]
    fn rfc3339_formats_zulu_suffix() {
        let s = epoch_to_rfc3339_utc(0).unwrap();
        assert_eq!(s, "1970-01-01T00:00:00Z");
    }
}
