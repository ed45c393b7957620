//! Per-worker samples and their per-role aggregation.
//!
//! Each benchmark worker produces exactly one [`Sample`] once its workload
//! is done. Samples of the same role are folded into an [`Aggregator`],
//! which keeps running totals and the time bounds of the whole group and
//! reduces the per-worker rates into min/max/average/stddev.
//!
//! Rates are computed in `f64` messages (or bytes) per second. A sample whose
//! end is not strictly after its start has no defined rate and every rate
//! accessor returns [`StatsError::DivisionUndefined`] for it instead of a
//! silent zero, infinity or NaN.

use crate::client::ConnectionStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by the statistical reductions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StatsError {
    /// A statistic was requested over zero samples
    #[error("no samples were collected")]
    EmptyAggregator,

    /// A rate was requested over a window that is empty or reversed
    #[error("rate is undefined for a non-positive duration")]
    DivisionUndefined,
}

/// Which side of the benchmark a worker plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    /// Short lowercase tag used in client ids and CSV rows
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "pub",
            Role::Subscriber => "sub",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => write!(f, "Publisher"),
            Role::Subscriber => write!(f, "Subscriber"),
        }
    }
}

/// Length of a time window in fractional seconds
fn window_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let delta = end.signed_duration_since(start);
    match delta.num_nanoseconds() {
        Some(ns) => ns as f64 / 1_000_000_000.0,
        // Only overflows for windows longer than ~292 years.
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

/// `amount / seconds`, refusing empty and reversed windows
fn per_second(amount: u64, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<f64, StatsError> {
    let secs = window_secs(start, end);
    if secs <= 0.0 {
        return Err(StatsError::DivisionUndefined);
    }
    Ok(amount as f64 / secs)
}

/// One worker's observed activity window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    client_id: String,
    job_msg_count: u64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    msg_count: u64,
    msg_bytes: u64,
}

impl Sample {
    /// Create an anonymous sample from its raw window and volume
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, msg_count: u64, msg_bytes: u64) -> Self {
        Self {
            client_id: String::new(),
            job_msg_count: msg_count,
            start,
            end,
            msg_count,
            msg_bytes,
        }
    }

    /// Build a sample from a connection's transport counters
    ///
    /// Counts are taken at the transport boundary rather than from the
    /// worker's own bookkeeping: publishers report what went out of the
    /// connection, subscribers what came in.
    pub fn from_connection(
        role: Role,
        client_id: impl Into<String>,
        job_msg_count: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        stats: &ConnectionStats,
    ) -> Self {
        let (msg_count, msg_bytes) = match role {
            Role::Publisher => (stats.out_messages, stats.out_bytes),
            Role::Subscriber => (stats.in_messages, stats.in_bytes),
        };
        Self::new(start, end, msg_count, msg_bytes).with_client(client_id, job_msg_count)
    }

    /// Attach the producing worker's identity and assigned workload
    pub fn with_client(mut self, client_id: impl Into<String>, job_msg_count: u64) -> Self {
        self.client_id = client_id.into();
        self.job_msg_count = job_msg_count;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Number of messages the worker was asked to publish or receive
    pub fn job_msg_count(&self) -> u64 {
        self.job_msg_count
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn msg_count(&self) -> u64 {
        self.msg_count
    }

    pub fn msg_bytes(&self) -> u64 {
        self.msg_bytes
    }

    /// `end - start`; may be zero or negative for degenerate samples
    pub fn duration(&self) -> chrono::Duration {
        self.end.signed_duration_since(self.start)
    }

    /// Duration in fractional seconds
    pub fn seconds(&self) -> f64 {
        window_secs(self.start, self.end)
    }

    /// Messages per second over the sample window
    pub fn rate(&self) -> Result<f64, StatsError> {
        per_second(self.msg_count, self.start, self.end)
    }

    /// Bytes per second over the sample window
    pub fn throughput(&self) -> Result<f64, StatsError> {
        per_second(self.msg_bytes, self.start, self.end)
    }
}

/// Min/max/average/stddev of the per-worker message rates of one role
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateStatistics {
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub stddev: f64,
}

/// Accumulates the samples of one role
///
/// The aggregator is filled by a single owner after all workers completed;
/// it contains no synchronization of its own. Time bounds and totals are
/// updated incrementally on every [`Aggregator::add_sample`].
#[derive(Debug, Clone)]
pub struct Aggregator {
    role: Role,
    samples: Vec<Sample>,
    total_messages: u64,
    total_bytes: u64,
    earliest_start: Option<DateTime<Utc>>,
    latest_end: Option<DateTime<Utc>>,
}

impl Aggregator {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            samples: Vec::new(),
            total_messages: 0,
            total_bytes: 0,
            earliest_start: None,
            latest_end: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Append a sample, keeping arrival order
    pub fn add_sample(&mut self, sample: Sample) {
        self.total_messages += sample.msg_count;
        self.total_bytes += sample.msg_bytes;
        self.earliest_start = Some(match self.earliest_start {
            Some(start) if start <= sample.start => start,
            _ => sample.start,
        });
        self.latest_end = Some(match self.latest_end {
            Some(end) if end >= sample.end => end,
            _ => sample.end,
        });
        self.samples.push(sample);
    }

    /// Samples in the order they were added
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn has_samples(&self) -> bool {
        !self.samples.is_empty()
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn earliest_start(&self) -> Option<DateTime<Utc>> {
        self.earliest_start
    }

    pub fn latest_end(&self) -> Option<DateTime<Utc>> {
        self.latest_end
    }

    fn bounds(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), StatsError> {
        match (self.earliest_start, self.latest_end) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(StatsError::EmptyAggregator),
        }
    }

    /// Span from the earliest sample start to the latest sample end
    pub fn combined_duration(&self) -> Result<chrono::Duration, StatsError> {
        let (start, end) = self.bounds()?;
        Ok(end.signed_duration_since(start))
    }

    /// Total messages over the combined duration
    pub fn combined_rate(&self) -> Result<f64, StatsError> {
        let (start, end) = self.bounds()?;
        per_second(self.total_messages, start, end)
    }

    /// Total bytes over the combined duration
    pub fn combined_throughput(&self) -> Result<f64, StatsError> {
        let (start, end) = self.bounds()?;
        per_second(self.total_bytes, start, end)
    }

    fn rates(&self) -> Result<Vec<f64>, StatsError> {
        if self.samples.is_empty() {
            return Err(StatsError::EmptyAggregator);
        }
        self.samples.iter().map(Sample::rate).collect()
    }

    pub fn min_rate(&self) -> Result<f64, StatsError> {
        Ok(self.rates()?.into_iter().fold(f64::INFINITY, f64::min))
    }

    pub fn max_rate(&self) -> Result<f64, StatsError> {
        Ok(self.rates()?.into_iter().fold(f64::NEG_INFINITY, f64::max))
    }

    pub fn average_rate(&self) -> Result<f64, StatsError> {
        let rates = self.rates()?;
        Ok(rates.iter().sum::<f64>() / rates.len() as f64)
    }

    /// Population standard deviation of the per-worker rates (divides by n)
    pub fn stddev_rate(&self) -> Result<f64, StatsError> {
        let rates = self.rates()?;
        let n = rates.len() as f64;
        let avg = rates.iter().sum::<f64>() / n;
        let variance = rates.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / n;
        Ok(variance.sqrt())
    }

    /// All four rate statistics in one pass over the samples
    pub fn rate_statistics(&self) -> Result<RateStatistics, StatsError> {
        let rates = self.rates()?;
        let n = rates.len() as f64;
        let average = rates.iter().sum::<f64>() / n;
        let variance = rates.iter().map(|r| (r - average).powi(2)).sum::<f64>() / n;
        Ok(RateStatistics {
            min: rates.iter().cloned().fold(f64::INFINITY, f64::min),
            max: rates.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            average,
            stddev: variance.sqrt(),
        })
    }
}
