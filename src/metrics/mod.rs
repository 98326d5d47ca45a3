//! # Statistics Engine
//!
//! Turns per-thread snapshots of the agent's stats segments into one
//! aggregated report per measurement window.
//!
//! Throughput reports are exact sums of the per-thread counters plus an
//! inter-arrival check on the pooled transmit timestamps. Latency reports add
//! the pooled latency samples: mean, linear-interpolation percentiles with
//! order-statistic confidence intervals, and the independence and
//! stationarity verdicts from [`validity`].

pub mod validity;

use crate::error::ManagerError;
use crate::ipc::layout::{LatSample, Timespec};
use serde::Serialize;
use tracing::{debug, warn};
use validity::Independence;

pub const PERCENTILE_COUNT: usize = 8;

/// Percentiles reported for every latency window, in wire order.
pub const TRACKED_PERCENTILES: [f64; PERCENTILE_COUNT] =
    [50.0, 90.0, 95.0, 99.0, 99.9, 99.99, 99.999, 99.9999];

/// Normal quantile for a 95 % confidence interval.
pub const CI_Z: f64 = 1.96;

/// Request and byte counters of one thread, or their sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub rx_bytes: u64,
    pub rx_reqs: u64,
    pub tx_bytes: u64,
    pub tx_reqs: u64,
}

impl Counters {
    /// Sums wrap. The counters come from another process and nothing
    /// bounds them.
    fn accumulate(&mut self, other: &Counters) {
        let mut wrapped = false;
        for (total, value) in [
            (&mut self.rx_bytes, other.rx_bytes),
            (&mut self.rx_reqs, other.rx_reqs),
            (&mut self.tx_bytes, other.tx_bytes),
            (&mut self.tx_reqs, other.tx_reqs),
        ] {
            let (sum, overflow) = total.overflowing_add(value);
            *total = sum;
            wrapped |= overflow;
        }
        if wrapped {
            warn!("Counter sum wrapped around: {:?}", self);
        }
    }
}

/// Throughput part of a per-thread record, copied out of shared memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThroughputSnapshot {
    pub counters: Counters,
    /// Raw ring count; may exceed the number of valid timestamps.
    pub tx_count: u32,
    pub tx_timestamps: Vec<Timespec>,
}

/// Latency part of a per-thread record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencySnapshot {
    pub inc_idx: u32,
    pub samples: Vec<LatSample>,
}

/// Everything copied out of one stats segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadSnapshot {
    pub throughput: ThroughputSnapshot,
    /// Present for latency agents only.
    pub latency: Option<LatencySnapshot>,
}

impl ThreadSnapshot {
    /// Samples that belong to the current window: the first
    /// `min(per_thread_target, inc_idx)` entries.
    pub fn window_samples(&self, per_thread_target: u32) -> &[LatSample] {
        match &self.latency {
            Some(lat) => {
                let valid = per_thread_target.min(lat.inc_idx) as usize;
                &lat.samples[..valid.min(lat.samples.len())]
            }
            None => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThroughputReport {
    pub rx_bytes: u64,
    pub rx_reqs: u64,
    pub tx_bytes: u64,
    pub tx_reqs: u64,
    /// Length of the measurement window in seconds.
    pub duration_secs: f64,
    pub interarrival_correct: bool,
}

impl ThroughputReport {
    pub fn with_duration(mut self, duration_secs: f64) -> Self {
        self.duration_secs = duration_secs;
        self
    }
}

/// Order-statistic confidence interval around a percentile.
///
/// Indices are into the ascending-sorted pooled samples and may fall outside
/// it, in which case there is no value at that bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfidenceInterval {
    pub lower_index: i64,
    pub upper_index: i64,
    pub lower_value: Option<u64>,
    pub upper_value: Option<u64>,
}

impl ConfidenceInterval {
    /// Interval for quantile `q` (in `0..=1`) over ascending-sorted samples.
    pub fn from_sorted(sorted: &[u64], q: f64) -> Self {
        let (lower_index, upper_index) = ci_indices(sorted.len(), q);
        let value_at = |idx: i64| {
            usize::try_from(idx)
                .ok()
                .and_then(|i| sorted.get(i))
                .copied()
        };
        Self {
            lower_index,
            upper_index,
            lower_value: value_at(lower_index),
            upper_value: value_at(upper_index),
        }
    }
}

/// CI indices `j = floor(nq - z sqrt(nq(1-q)))`, `k = ceil(nq + z sqrt(nq(1-q))) + 1`.
pub fn ci_indices(n: usize, q: f64) -> (i64, i64) {
    let prod = n as f64 * q;
    let spread = CI_Z * (prod * (1.0 - q)).sqrt();
    let j = (prod - spread).floor() as i64;
    let k = (prod + spread).ceil() as i64 + 1;
    (j, k)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentileEstimate {
    pub percentile: f64,
    pub value: u64,
    pub ci: ConfidenceInterval,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyReport {
    pub throughput: ThroughputReport,
    pub sample_count: usize,
    /// Mean latency in nanoseconds, truncated.
    pub mean_latency: u64,
    pub percentiles: Vec<PercentileEstimate>,
    pub independence: Independence,
    pub stationary: bool,
}

impl LatencyReport {
    pub fn with_duration(mut self, duration_secs: f64) -> Self {
        self.throughput.duration_secs = duration_secs;
        self
    }
}

/// Sum the counters of every thread and check the pooled transmit
/// timestamps for exponential inter-arrival times.
///
/// The duration is left at zero for the caller to fill in.
pub fn aggregate_throughput(records: &[ThreadSnapshot]) -> Result<ThroughputReport, ManagerError> {
    if records.is_empty() {
        return Err(ManagerError::EmptySampleSet("throughput"));
    }

    let mut total = Counters::default();
    let mut tx_samples = Vec::new();
    for record in records {
        total.accumulate(&record.throughput.counters);
        tx_samples.extend(record.throughput.tx_timestamps.iter().map(Timespec::as_nanos_f64));
    }
    debug!(
        "Aggregated {} threads: {:?}, {} transmit timestamps",
        records.len(),
        total,
        tx_samples.len()
    );

    Ok(ThroughputReport {
        rx_bytes: total.rx_bytes,
        rx_reqs: total.rx_reqs,
        tx_bytes: total.tx_bytes,
        tx_reqs: total.tx_reqs,
        duration_secs: 0.0,
        interarrival_correct: validity::check_interarrival(&tx_samples),
    })
}

/// Full latency report over the samples of the current window.
pub fn aggregate_latency(
    records: &[ThreadSnapshot],
    per_thread_target: u32,
) -> Result<LatencyReport, ManagerError> {
    let throughput = aggregate_throughput(records)?;

    let mut pooled: Vec<LatSample> = records
        .iter()
        .flat_map(|r| r.window_samples(per_thread_target).iter().copied())
        .collect();
    if pooled.is_empty() {
        return Err(ManagerError::EmptySampleSet("latency"));
    }
    debug!("There are {} latency samples", pooled.len());

    let mut sorted: Vec<u64> = pooled.iter().map(LatSample::latency).collect();
    sorted.sort_unstable();
    let n = sorted.len();
    let mean_latency = (sorted.iter().map(|&v| v as u128).sum::<u128>() / n as u128) as u64;

    let percentiles = TRACKED_PERCENTILES
        .iter()
        .map(|&p| PercentileEstimate {
            percentile: p,
            value: crate::utils::percentile_linear(&sorted, p),
            ci: ConfidenceInterval::from_sorted(&sorted, p / 100.0),
        })
        .collect();

    // Chronological order; the sort is stable so simultaneous sends keep
    // their per-thread order.
    pooled.sort_by_key(|s| s.sent_at().as_nanos());
    let series: Vec<f64> = pooled.iter().map(|s| s.latency() as f64).collect();

    Ok(LatencyReport {
        throughput,
        sample_count: n,
        mean_latency,
        percentiles,
        independence: validity::check_independence(&series),
        stationary: validity::check_stationarity(&series),
    })
}
