//! Rate estimation for the fetch and checksum channels.
//!
//! A cheap linear-regression pass over historical samples recorded
//! elsewhere, recomputed on demand rather than updated incrementally. The
//! historical samples are Started→Finished spans from the tracking index
//! (`TrackingIndex::rate_samples`).

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Error;

use super::tracking_index::{RateSample, TrackingIndex};
use super::types::{Channel, Datatype};

/// Mean and standard error of a channel's throughput, in bytes/sec.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub mean: f64,
    pub stderr: f64,
}

/// Minimum span duration a sample must have to be used: spans shorter than
/// this are too noisy to derive a meaningful bytes/sec figure from.
const MIN_SAMPLE_DURATION_SECS: f64 = 0.05;

pub struct RateTracker {
    /// Last known good rate per channel. Retained across refreshes that
    /// find no samples (e.g. after full eviction) rather than reporting
    /// unknown, so this is updated only when a refresh actually produces
    /// samples.
    last_known: Mutex<HashMap<Channel, Rate>>,
}

impl RateTracker {
    pub fn new() -> Self {
        RateTracker {
            last_known: Mutex::new(HashMap::new()),
        }
    }

    /// Recomputes both channels' rates from the tracking index. A channel
    /// with no usable samples keeps its previously cached value untouched.
    pub fn refresh(&self, index: &TrackingIndex) -> Result<(), Error> {
        self.refresh_channel(index, Channel::Fetch, Datatype::Data)?;
        self.refresh_channel(index, Channel::Checksum, Datatype::Checksums)?;
        Ok(())
    }

    fn refresh_channel(
        &self,
        index: &TrackingIndex,
        channel: Channel,
        datatype: Datatype,
    ) -> Result<(), Error> {
        let samples = index.rate_samples(datatype)?;
        if let Some(rate) = Self::rate_from_samples(&samples) {
            self.last_known.lock().unwrap().insert(channel, rate);
        }
        Ok(())
    }

    fn rate_from_samples(samples: &[RateSample]) -> Option<Rate> {
        let per_sample_rates: Vec<f64> = samples
            .iter()
            .filter(|s| s.duration_secs >= MIN_SAMPLE_DURATION_SECS)
            .map(|s| s.bytes as f64 / s.duration_secs)
            .collect();

        if per_sample_rates.is_empty() {
            return None;
        }

        let n = per_sample_rates.len() as f64;
        let mean = per_sample_rates.iter().sum::<f64>() / n;

        if per_sample_rates.len() < 2 {
            return Some(Rate { mean, stderr: 0.0 });
        }

        let variance = per_sample_rates
            .iter()
            .map(|r| (r - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        let stderr = (variance / n).sqrt();

        Some(Rate { mean, stderr })
    }

    /// Current rate for `channel`, or `None` if never observed.
    pub fn current(&self, channel: Channel) -> Option<Rate> {
        self.last_known.lock().unwrap().get(&channel).copied()
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::types::Status;

    #[test]
    fn unknown_rate_before_any_completion() {
        let tracker = RateTracker::new();
        assert!(tracker.current(Channel::Fetch).is_none());
    }

    #[test]
    fn refresh_computes_mean_from_completed_spans() {
        let index = TrackingIndex::open_in_memory().unwrap();
        let id = index.upsert_entity("/seq/a", "/precache/a").unwrap();
        index.set_size(id, Datatype::Data, 10_000_000).unwrap();
        index.log_status(id, Datatype::Data, Status::Started).unwrap();
        // Force a span > MIN_SAMPLE_DURATION_SECS by editing ts directly
        // is not exposed; instead rely on real elapsed time being >= 0,
        // and accept a possibly-zero-duration sample being filtered out,
        // leaving the rate unknown. This still exercises the "no crash on
        // empty input" path.
        index.log_status(id, Datatype::Data, Status::Finished).unwrap();

        let tracker = RateTracker::new();
        tracker.refresh(&index).unwrap();
        // Either unknown (sub-resolution duration filtered) or a sane
        // positive rate -- both are acceptable outcomes of this timing-
        // sensitive test; what matters is refresh() never errors.
        if let Some(rate) = tracker.current(Channel::Fetch) {
            assert!(rate.mean > 0.0);
        }
    }

    #[test]
    fn retains_last_known_value_when_log_goes_empty() {
        let tracker = RateTracker::new();
        tracker
            .last_known
            .lock()
            .unwrap()
            .insert(Channel::Fetch, Rate { mean: 5_000_000.0, stderr: 100.0 });

        let empty_index = TrackingIndex::open_in_memory().unwrap();
        tracker.refresh(&empty_index).unwrap();

        let rate = tracker.current(Channel::Fetch).unwrap();
        assert_eq!(rate.mean, 5_000_000.0);
    }

    #[test]
    fn rate_from_samples_computes_stderr_across_multiple_samples() {
        let samples = vec![
            RateSample { bytes: 1_000_000, duration_secs: 1.0 },
            RateSample { bytes: 2_000_000, duration_secs: 1.0 },
            RateSample { bytes: 3_000_000, duration_secs: 1.0 },
        ];
        let rate = RateTracker::rate_from_samples(&samples).unwrap();
        assert_eq!(rate.mean, 2_000_000.0);
        assert!(rate.stderr > 0.0);
    }
}
