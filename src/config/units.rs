//! Parsers for the two bespoke config grammars used throughout
//! `precache.*`/`httpd.*` keys: durations (`h/d/w/y`, `unlimited`) and byte
//! sizes (`k/M/G/T` decimal, `ki/Mi/Gi/Ti` binary, `unlimited`).
//!
//! Neither grammar matches an existing crate exactly — `humantime` has no
//! calendar-relative year, and none of the pack's size parsers support the
//! decimal/binary split with an optional trailing `B` — so both are
//! hand-rolled here as small special-purpose parsers.

use anyhow::{bail, Error};
use chrono::{DateTime, Months, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::{Duration, UNIX_EPOCH};

/// A possibly-unlimited duration, as used by `precache.age_threshold` and
/// `precache.expiry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationLimit {
    Unlimited,
    /// A fixed number of seconds (from an `h`/`d`/`w` suffix).
    Seconds(u64),
    /// A calendar-relative number of years (from a `y` suffix): adding this
    /// to an instant crosses exactly that many 12-month boundaries, so it
    /// accounts for leap years rather than assuming a fixed 365-day year.
    Years(u32),
}

impl DurationLimit {
    /// `None` if unlimited, otherwise the duration added onto `epoch`
    /// (seconds since the Unix epoch).
    pub fn deadline_after(&self, epoch: i64) -> Option<i64> {
        match self {
            DurationLimit::Unlimited => None,
            DurationLimit::Seconds(secs) => Some(epoch + *secs as i64),
            DurationLimit::Years(years) => {
                let dt = DateTime::<Utc>::from(UNIX_EPOCH + Duration::from_secs(epoch.max(0) as u64));
                let shifted = dt.checked_add_months(Months::new(years * 12)).unwrap_or(dt);
                Some(shifted.timestamp())
            }
        }
    }

    /// Whether `epoch + self` has already passed, relative to `now`.
    pub fn has_elapsed_since(&self, epoch: i64, now: i64) -> bool {
        match self.deadline_after(epoch) {
            None => false,
            Some(deadline) => deadline < now,
        }
    }
}

static DURATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)(h|d|w|y)$").unwrap());

/// Parses a duration string: `unlimited`, or an integer followed by one of
/// `h` (hours), `d` (days), `w` (weeks), `y` (years, calendar-relative).
pub fn parse_duration(s: &str) -> Result<DurationLimit, Error> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("unlimited") {
        return Ok(DurationLimit::Unlimited);
    }

    let caps = match DURATION_RE.captures(s) {
        Some(c) => c,
        None => bail!("invalid duration '{}' (expected <n>h|d|w|y or 'unlimited')", s),
    };

    let n: u64 = caps[1].parse()?;
    let limit = match &caps[2] {
        "h" => DurationLimit::Seconds(n * 3600),
        "d" => DurationLimit::Seconds(n * 86400),
        "w" => DurationLimit::Seconds(n * 7 * 86400),
        "y" => DurationLimit::Years(n as u32),
        other => bail!("unknown duration unit '{}'", other),
    };
    Ok(limit)
}

/// A possibly-unlimited byte size, as used by `precache.size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeLimit {
    Unlimited,
    Bytes(u64),
}

impl SizeLimit {
    pub fn as_bytes(&self) -> Option<u64> {
        match self {
            SizeLimit::Unlimited => None,
            SizeLimit::Bytes(n) => Some(*n),
        }
    }
}

static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d+)(k|m|g|t)?(i)?b?$").unwrap());

/// Parses a byte-size string: `unlimited`, a bare integer, or an integer
/// followed by `k/M/G/T` (decimal, ×1000) or `ki/Mi/Gi/Ti` (binary, ×1024),
/// with an optional trailing `B`.
pub fn parse_bytesize(s: &str) -> Result<SizeLimit, Error> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("unlimited") {
        return Ok(SizeLimit::Unlimited);
    }

    let caps = match SIZE_RE.captures(s) {
        Some(c) => c,
        None => bail!("invalid byte size '{}'", s),
    };

    let n: u64 = caps[1].parse()?;
    let binary = caps.get(3).is_some();
    let multiplier: u64 = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 1,
        Some(ref u) if u == "k" => if binary { 1024 } else { 1000 },
        Some(ref u) if u == "m" => if binary { 1024 * 1024 } else { 1_000_000 },
        Some(ref u) if u == "g" => if binary { 1024 * 1024 * 1024 } else { 1_000_000_000 },
        Some(ref u) if u == "t" => {
            if binary {
                1024u64.pow(4)
            } else {
                1_000_000_000_000
            }
        }
        Some(other) => bail!("unknown byte size unit '{}'", other),
    };

    Ok(SizeLimit::Bytes(n * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unlimited() {
        assert_eq!(parse_duration("unlimited").unwrap(), DurationLimit::Unlimited);
        assert_eq!(parse_bytesize("unlimited").unwrap(), SizeLimit::Unlimited);
    }

    #[test]
    fn parses_absolute_durations() {
        assert_eq!(parse_duration("2h").unwrap(), DurationLimit::Seconds(7200));
        assert_eq!(parse_duration("1d").unwrap(), DurationLimit::Seconds(86400));
        assert_eq!(parse_duration("1w").unwrap(), DurationLimit::Seconds(604800));
    }

    #[test]
    fn parses_calendar_relative_years() {
        assert_eq!(parse_duration("2y").unwrap(), DurationLimit::Years(2));
    }

    #[test]
    fn parses_decimal_and_binary_byte_sizes() {
        assert_eq!(parse_bytesize("1k").unwrap(), SizeLimit::Bytes(1000));
        assert_eq!(parse_bytesize("1ki").unwrap(), SizeLimit::Bytes(1024));
        assert_eq!(parse_bytesize("1kiB").unwrap(), SizeLimit::Bytes(1024));
        assert_eq!(parse_bytesize("5G").unwrap(), SizeLimit::Bytes(5_000_000_000));
        assert_eq!(parse_bytesize("2Gi").unwrap(), SizeLimit::Bytes(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_bytesize("100").unwrap(), SizeLimit::Bytes(100));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("3x").is_err());
        assert!(parse_bytesize("3x").is_err());
    }

    #[test]
    fn years_deadline_accounts_for_leap_years() {
        // 2024-01-01 + 1y should land on 2025-01-01, not +365*86400 (which
        // would land a day early across 2024's leap day).
        let epoch_2024_01_01 = 1704067200;
        let dl = DurationLimit::Years(1);
        let deadline = dl.deadline_after(epoch_2024_01_01).unwrap();
        let expected = 1735689600; // 2025-01-01T00:00:00Z
        assert_eq!(deadline, expected);
    }
}
