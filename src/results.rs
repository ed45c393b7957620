//! Rendering and export of benchmark outcomes.
//!
//! [`Report`] is the text summary printed on stdout. [`ResultsManager`]
//! writes the optional CSV (one row per sample) and JSON ([`RunSummary`])
//! files.

use crate::{
    benchmark::{BenchmarkConfig, BenchmarkOutcome},
    metrics::{Aggregator, RateStatistics, Role, Sample, StatsError},
    utils::{comma_format, format_duration, human_bytes},
};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Column header of the CSV export
pub const CSV_HEADER: &str =
    "role,worker,client_id,msg_count,msg_bytes,start,end,duration_secs,msgs_per_sec,bytes_per_sec";

const UNDEFINED: &str = "undefined";

fn display_chrono(duration: chrono::Duration) -> String {
    match duration.to_std() {
        Ok(d) => format_duration(d),
        Err(_) => format!("-{}", format_duration((-duration).to_std().unwrap_or_default())),
    }
}

fn rate_text(rate: Result<f64, StatsError>) -> String {
    match rate {
        Ok(r) => comma_format(r as i64),
        Err(_) => UNDEFINED.to_string(),
    }
}

fn throughput_text(throughput: Result<f64, StatsError>) -> String {
    match throughput {
        Ok(t) => human_bytes(t),
        Err(_) => UNDEFINED.to_string(),
    }
}

/// Text report over both roles and the run's wall clock
///
/// Holds no state of its own; rendering it twice produces the same text.
pub struct Report<'a> {
    publishers: &'a Aggregator,
    subscribers: &'a Aggregator,
    wall_clock: Duration,
}

impl<'a> Report<'a> {
    pub fn new(publishers: &'a Aggregator, subscribers: &'a Aggregator, wall_clock: Duration) -> Self {
        Self {
            publishers,
            subscribers,
            wall_clock,
        }
    }

    pub fn from_outcome(outcome: &'a BenchmarkOutcome) -> Self {
        Self::new(&outcome.publishers, &outcome.subscribers, outcome.wall_clock)
    }

    /// Messages seen by both roles together
    pub fn combined_messages(&self) -> u64 {
        self.publishers.total_messages() + self.subscribers.total_messages()
    }

    /// Combined messages per second of wall-clock time
    pub fn combined_rate(&self) -> Result<f64, StatsError> {
        let secs = self.wall_clock.as_secs_f64();
        if secs <= 0.0 {
            return Err(StatsError::DivisionUndefined);
        }
        Ok(self.combined_messages() as f64 / secs)
    }

    fn write_sample(f: &mut fmt::Formatter<'_>, sample: &Sample) -> fmt::Result {
        write!(
            f,
            "{} msgs/sec | {} msgs in {} | {}/sec",
            rate_text(sample.rate()),
            comma_format(sample.msg_count() as i64),
            display_chrono(sample.duration()),
            throughput_text(sample.throughput())
        )
    }

    fn write_role(f: &mut fmt::Formatter<'_>, aggregator: &Aggregator) -> fmt::Result {
        if !aggregator.has_samples() {
            return Ok(());
        }
        let duration = aggregator
            .combined_duration()
            .map(display_chrono)
            .unwrap_or_else(|_| UNDEFINED.to_string());
        writeln!(
            f,
            "{} Stats ({}) {} msgs/sec | {} msgs in {} | {}/sec",
            aggregator.role(),
            aggregator.count(),
            rate_text(aggregator.combined_rate()),
            comma_format(aggregator.total_messages() as i64),
            duration,
            throughput_text(aggregator.combined_throughput())
        )?;

        if aggregator.count() > 1 {
            for (i, sample) in aggregator.samples().iter().enumerate() {
                write!(f, "  [{}] ", i + 1)?;
                Self::write_sample(f, sample)?;
                writeln!(f)?;
            }
            match aggregator.rate_statistics() {
                Ok(stats) => writeln!(
                    f,
                    "  min {} | avg {} | max {} | stddev {} msgs",
                    comma_format(stats.min as i64),
                    comma_format(stats.average as i64),
                    comma_format(stats.max as i64),
                    comma_format(stats.stddev as i64)
                )?,
                Err(e) => writeln!(f, "  min/avg/max/stddev {}: {}", UNDEFINED, e)?,
            }
        }
        Ok(())
    }
}

impl<'a> fmt::Display for Report<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.publishers.has_samples() && !self.subscribers.has_samples() {
            return writeln!(f, "No samples were collected, nothing to report");
        }
        writeln!(
            f,
            "STAN (Publishers/Subscribers) throughput is {} msgs/sec ({} msgs in {})",
            rate_text(self.combined_rate()),
            comma_format(self.combined_messages() as i64),
            format_duration(self.wall_clock)
        )?;
        Self::write_role(f, self.publishers)?;
        Self::write_role(f, self.subscribers)
    }
}

/// Quote a CSV field when it contains a delimiter or quote
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_rate(rate: Result<f64, StatsError>) -> String {
    rate.map(|r| format!("{:.2}", r)).unwrap_or_default()
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Render every sample of both roles as CSV, preceded by the run id
pub fn render_csv(run_id: &str, publishers: &Aggregator, subscribers: &Aggregator) -> String {
    let mut out = format!("#RunID, {}\n{}\n", run_id, CSV_HEADER);
    for aggregator in [publishers, subscribers] {
        for (i, sample) in aggregator.samples().iter().enumerate() {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{:.6},{},{}\n",
                aggregator.role().as_str(),
                i + 1,
                csv_field(sample.client_id()),
                sample.msg_count(),
                sample.msg_bytes(),
                timestamp(sample.start()),
                timestamp(sample.end()),
                sample.seconds(),
                csv_rate(sample.rate()),
                csv_rate(sample.throughput()),
            ));
        }
    }
    out
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Run parameters recorded next to the results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub backend: String,
    pub subject: String,
    pub num_pubs: usize,
    pub num_subs: usize,
    pub num_msgs: u64,
    pub message_size: usize,
    pub sync: bool,
    pub ignore_old: bool,
    pub max_pub_acks_inflight: usize,
    pub queue_group: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub wall_clock_secs: f64,
    pub system_info: SystemInfo,
}

/// Totals and statistics for one role
///
/// Values that cannot be computed (no samples, zero-length windows) are
/// serialized as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSummary {
    pub role: Role,
    pub workers: usize,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub duration_secs: Option<f64>,
    pub msgs_per_sec: Option<f64>,
    pub bytes_per_sec: Option<f64>,
    pub rate_statistics: Option<RateStatistics>,
    pub samples: Vec<Sample>,
}

impl RoleSummary {
    pub fn from_aggregator(aggregator: &Aggregator) -> Self {
        Self {
            role: aggregator.role(),
            workers: aggregator.count(),
            total_messages: aggregator.total_messages(),
            total_bytes: aggregator.total_bytes(),
            duration_secs: aggregator
                .combined_duration()
                .ok()
                .and_then(|d| d.to_std().ok())
                .map(|d| d.as_secs_f64()),
            msgs_per_sec: aggregator.combined_rate().ok(),
            bytes_per_sec: aggregator.combined_throughput().ok(),
            rate_statistics: aggregator.rate_statistics().ok(),
            samples: aggregator.samples().to_vec(),
        }
    }
}

/// A worker that did not produce a sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSummary {
    pub role: Role,
    pub worker: usize,
    pub cause: String,
}

/// Everything written to the JSON export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub metadata: RunMetadata,
    pub combined_messages: u64,
    pub combined_msgs_per_sec: Option<f64>,
    pub publishers: RoleSummary,
    pub subscribers: RoleSummary,
    pub failures: Vec<FailureSummary>,
}

impl RunSummary {
    pub fn new(outcome: &BenchmarkOutcome, config: &BenchmarkConfig, backend: &str) -> Self {
        let report = Report::from_outcome(outcome);
        Self {
            metadata: RunMetadata {
                run_id: outcome.run_id.clone(),
                backend: backend.to_string(),
                subject: config.subject.clone(),
                num_pubs: config.num_pubs,
                num_subs: config.num_subs,
                num_msgs: config.num_msgs,
                message_size: config.message_size,
                sync: config.sync,
                ignore_old: config.ignore_old,
                max_pub_acks_inflight: config.max_pub_acks_inflight,
                queue_group: config.queue_group.clone(),
                started_at: outcome.started_at,
                finished_at: outcome.finished_at,
                wall_clock_secs: outcome.wall_clock.as_secs_f64(),
                system_info: SystemInfo::default(),
            },
            combined_messages: report.combined_messages(),
            combined_msgs_per_sec: report.combined_rate().ok(),
            publishers: RoleSummary::from_aggregator(&outcome.publishers),
            subscribers: RoleSummary::from_aggregator(&outcome.subscribers),
            failures: outcome
                .failures
                .iter()
                .map(|f| FailureSummary {
                    role: f.role,
                    worker: f.worker,
                    cause: f.cause.to_string(),
                })
                .collect(),
        }
    }
}

/// Results manager for the optional file exports
#[derive(Debug, Default)]
pub struct ResultsManager {
    csv_file: Option<PathBuf>,
    json_file: Option<PathBuf>,
}

impl ResultsManager {
    pub fn new(csv_file: Option<&Path>, json_file: Option<&Path>) -> Self {
        Self {
            csv_file: csv_file.map(Path::to_path_buf),
            json_file: json_file.map(Path::to_path_buf),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.csv_file.is_some() || self.json_file.is_some()
    }

    /// Write every requested export; returns the files written
    pub fn finalize(
        &self,
        outcome: &BenchmarkOutcome,
        config: &BenchmarkConfig,
        backend: &str,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();

        if let Some(path) = &self.csv_file {
            let csv = render_csv(&outcome.run_id, &outcome.publishers, &outcome.subscribers);
            write_file(path, csv.as_bytes())?;
            info!("Saved metric data in csv file {}", path.display());
            written.push(path.clone());
        }

        if let Some(path) = &self.json_file {
            let summary = RunSummary::new(outcome, config, backend);
            let json = serde_json::to_string_pretty(&summary)?;
            write_file(path, json.as_bytes())?;
            info!("Saved run summary in json file {}", path.display());
            written.push(path.clone());
        }

        Ok(written)
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Cannot create {}", path.display()))?;
    file.write_all(contents)
        .and_then(|_| file.flush())
        .with_context(|| format!("Cannot write {}", path.display()))?;
    debug!("Wrote {} bytes to {}", contents.len(), path.display());
    Ok(())
}
