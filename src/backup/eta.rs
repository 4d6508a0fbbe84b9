//! ETA estimation for a single entity on a single channel.
//!
//! Builds directly on `RateTracker`'s mean/stderr figures. The estimate is
//! the sum of three terms — `W` (time left on whatever's currently
//! running), `Q` (queue-ahead time), `T` (this job's own transfer time) —
//! which map onto simple arithmetic over the rate and the tracking index's
//! `started_entities`/size data; no new statistical machinery is needed
//! beyond what `RateTracker` already provides.

use anyhow::Error;

use super::rate_tracker::{Rate, RateTracker};
use super::tracking_index::TrackingIndex;
use super::types::{Channel, Datatype, Status};

/// An ETA: a point estimate plus its standard error, both in seconds from
/// now, or the absolute epoch the estimate resolves to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Eta {
    pub at_epoch: i64,
    pub stderr_secs: f64,
}

/// Inputs needed to compute one entity's ETA on one channel, gathered by
/// the caller (the manager) from the tracking index and the job queue.
pub struct EtaInputs {
    pub size: u64,
    pub already_started_at: Option<i64>,
    /// Sizes of jobs strictly ahead of this one in the same channel's
    /// FIFO queue (the `Q` term).
    pub queued_ahead_bytes: Vec<u64>,
    pub channel_concurrency: usize,
    /// For jobs currently `Started` on this channel: `(size, started_at)`,
    /// used to compute `W`, the shortest remaining duration among them.
    pub in_flight: Vec<(u64, i64)>,
}

/// Computes the ETA for `inputs` given `rate`. Returns `None` if the rate
/// is unknown, since no ETA can be derived without one.
pub fn estimate(rate: Option<Rate>, now: i64, inputs: &EtaInputs) -> Option<Eta> {
    let rate = rate?;
    if rate.mean <= 0.0 {
        return None;
    }

    if let Some(started_at) = inputs.already_started_at {
        let t = inputs.size as f64 / rate.mean;
        let at_epoch = started_at + t.round() as i64;
        let stderr_secs = stderr_contribution(inputs.size, rate);
        return Some(Eta { at_epoch, stderr_secs });
    }

    let w = inputs
        .in_flight
        .iter()
        .map(|(size, started_at)| {
            let elapsed = (now - started_at).max(0) as f64;
            let remaining = *size as f64 / rate.mean - elapsed;
            remaining.max(0.0)
        })
        .fold(f64::INFINITY, f64::min);
    let w = if w.is_finite() { w } else { 0.0 };

    let ahead_total: u64 = inputs.queued_ahead_bytes.iter().sum();
    let concurrency = inputs.channel_concurrency.max(1) as f64;
    let q = (ahead_total as f64 / concurrency) / rate.mean;

    let t = inputs.size as f64 / rate.mean;

    let eta_secs = w + q + t;
    let at_epoch = now + eta_secs.round() as i64;
    let stderr_secs = stderr_contribution(inputs.size, rate);

    Some(Eta { at_epoch, stderr_secs })
}

/// `stderr_total = sqrt((size/mean^2 * stderr)^2)` collapsed to a single
/// term: the only contribution modelled is this entity's own transfer-time
/// uncertainty, since `W` and `Q` are derived from the same channel-wide
/// rate and summing correlated terms under the root would double-count the
/// shared uncertainty.
fn stderr_contribution(size: u64, rate: Rate) -> f64 {
    let term = (size as f64 / rate.mean.powi(2)) * rate.stderr;
    (term * term).sqrt()
}

/// Convenience used by the manager: for the combined data-then-checksum
/// pipeline, the checksum ETA's base time is the data ETA.
pub fn eta_for_entity(
    index: &TrackingIndex,
    tracker: &RateTracker,
    now: i64,
    id: i64,
    datatype: Datatype,
    channel_concurrency: usize,
    queued_ahead_bytes: Vec<u64>,
) -> Result<Option<Eta>, Error> {
    let channel = match datatype {
        Datatype::Data => Channel::Fetch,
        Datatype::Checksums => Channel::Checksum,
        Datatype::Metadata => return Ok(Some(Eta { at_epoch: now, stderr_secs: 0.0 })),
    };

    let record = match index.get(id)? {
        Some(r) => r,
        None => return Ok(None),
    };

    let (status, size) = match datatype {
        Datatype::Data => (record.data.status, record.data_size),
        Datatype::Checksums => (record.checksums.status, record.checksum_size),
        Datatype::Metadata => unreachable!(),
    };

    if status >= Status::Finished {
        return Ok(None);
    }

    let size = match size {
        Some(s) => s as u64,
        None => return Ok(None),
    };

    let rate = tracker.current(channel);

    let already_started_at = if status == Status::Started {
        Some(record.data.ts)
    } else {
        None
    };

    let in_flight: Vec<(u64, i64)> = index
        .started_entities(datatype)?
        .into_iter()
        .filter_map(|other_id| index.get(other_id).ok().flatten())
        .filter_map(|rec| {
            let (st, sz) = match datatype {
                Datatype::Data => (rec.data, rec.data_size),
                Datatype::Checksums => (rec.checksums, rec.checksum_size),
                Datatype::Metadata => unreachable!(),
            };
            sz.map(|s| (s as u64, st.ts))
        })
        .collect();

    let inputs = EtaInputs {
        size,
        already_started_at,
        queued_ahead_bytes,
        channel_concurrency,
        in_flight,
    };

    Ok(estimate(rate, now, &inputs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_rate_yields_null_eta() {
        let inputs = EtaInputs {
            size: 1000,
            already_started_at: None,
            queued_ahead_bytes: Vec::new(),
            channel_concurrency: 1,
            in_flight: Vec::new(),
        };
        assert!(estimate(None, 0, &inputs).is_none());
    }

    #[test]
    fn already_started_uses_start_time_plus_transfer_time() {
        let rate = Rate { mean: 1000.0, stderr: 0.0 };
        let inputs = EtaInputs {
            size: 5000,
            already_started_at: Some(100),
            queued_ahead_bytes: Vec::new(),
            channel_concurrency: 1,
            in_flight: Vec::new(),
        };
        let eta = estimate(Some(rate), 1000, &inputs).unwrap();
        assert_eq!(eta.at_epoch, 105);
    }

    #[test]
    fn queued_job_adds_wait_and_queue_ahead_time() {
        let rate = Rate { mean: 1000.0, stderr: 0.0 };
        let inputs = EtaInputs {
            size: 2000,
            already_started_at: None,
            queued_ahead_bytes: vec![3000],
            channel_concurrency: 1,
            in_flight: vec![(1000, 0)],
        };
        // W: job in flight has size 1000 @ rate 1000 => 1s total, elapsed 0 => W=1
        // Q: 3000 bytes ahead / 1 concurrency / 1000 rate = 3s
        // T: 2000 / 1000 = 2s
        let eta = estimate(Some(rate), 0, &inputs).unwrap();
        assert_eq!(eta.at_epoch, 6);
    }

    #[test]
    fn stderr_scales_with_size_and_rate_uncertainty() {
        let rate = Rate { mean: 1000.0, stderr: 10.0 };
        let inputs = EtaInputs {
            size: 1_000_000,
            already_started_at: None,
            queued_ahead_bytes: Vec::new(),
            channel_concurrency: 1,
            in_flight: Vec::new(),
        };
        let eta = estimate(Some(rate), 0, &inputs).unwrap();
        assert!(eta.stderr_secs > 0.0);
    }
}
