//! # Utility Functions and Helper Module
//!
//! Formatting and validation helpers shared by the benchmark harness, the
//! reporter and the command-line utilities.
//!
//! ## Key Functionality Categories
//!
//! - **Formatting**: Human-readable display of durations, byte counts and
//!   comma-grouped integers
//! - **Work Distribution**: Splitting a message count across publishers
//! - **Validation**: Input parameter validation with clear error messages
//!
//! ## Usage Examples
//!
//! ```rust
//! use stan_bench::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(human_bytes(1536.0), "1.50 KiB");
//! assert_eq!(comma_format(1_234_567), "1,234,567");
//! assert_eq!(msgs_per_client(10, 3), vec![4, 3, 3]);
//! ```

use anyhow::{anyhow, Result};
use std::time::Duration;
use uuid::Uuid;

/// Binary unit suffixes used by [`human_bytes`], in increasing order.
const BINARY_UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Generate a unique identifier for a benchmark run
///
/// The run id is written into the CSV and JSON exports so that several runs
/// appended to the same analysis pipeline can be told apart.
pub fn generate_run_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Format a duration in a human-readable way
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use stan_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_nanos(1250)), "1.25μs");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a byte quantity with a binary-prefixed unit
///
/// The value is divided by 1024 until the quotient drops below 1024, and the
/// result is rendered with two decimals. Values below 1024 keep the plain
/// `B` suffix (`500.00 B`). Used for totals as well as for per-second
/// throughput, where callers append `/sec`.
///
/// ```rust
/// # use stan_bench::utils::human_bytes;
/// assert_eq!(human_bytes(500.0), "500.00 B");
/// assert_eq!(human_bytes(2048.0), "2.00 KiB");
/// assert_eq!(human_bytes(3.0 * 1024.0 * 1024.0), "3.00 MiB");
/// ```
pub fn human_bytes(bytes: f64) -> String {
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < BINARY_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, BINARY_UNITS[unit])
}

/// Render an integer with comma thousands separators
///
/// Operates on the decimal digits only, so the output does not depend on the
/// process locale. The sign is kept in front of the grouped digits.
///
/// ```rust
/// # use stan_bench::utils::comma_format;
/// assert_eq!(comma_format(999), "999");
/// assert_eq!(comma_format(-1234), "-1,234");
/// ```
pub fn comma_format(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Split a message count across `clients` publishers
///
/// Every client gets `total / clients` messages and the remainder is handed
/// out one by one to the first clients. Returns an empty vector when either
/// argument is zero.
pub fn msgs_per_client(total: u64, clients: usize) -> Vec<u64> {
    if total == 0 || clients == 0 {
        return Vec::new();
    }
    let base = total / clients as u64;
    let extra = (total % clients as u64) as usize;
    (0..clients)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

/// Validate message payload size
///
/// A size of zero is allowed and publishes empty payloads. The upper bound
/// matches the default maximum payload accepted by NATS servers.
pub fn validate_message_size(message_size: usize) -> Result<()> {
    const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

    if message_size > MAX_PAYLOAD {
        return Err(anyhow!(
            "Message size {} bytes exceeds the {} bytes maximum payload",
            message_size,
            MAX_PAYLOAD
        ));
    }
    Ok(())
}

/// Validate the requested publisher and subscriber counts
pub fn validate_worker_counts(num_pubs: usize, num_subs: usize) -> Result<()> {
    const MAX_WORKERS: usize = 1024;

    if num_pubs == 0 && num_subs == 0 {
        return Err(anyhow!(
            "At least one publisher or one subscriber is required"
        ));
    }
    if num_pubs > MAX_WORKERS || num_subs > MAX_WORKERS {
        return Err(anyhow!(
            "Too many workers requested (pubs={}, subs={}, max {} per role)",
            num_pubs,
            num_subs,
            MAX_WORKERS
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test duration formatting with various time scales
    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0.0), "0.00 B");
        assert_eq!(human_bytes(500.0), "500.00 B");
        assert_eq!(human_bytes(1023.0), "1023.00 B");
        assert_eq!(human_bytes(1024.0), "1.00 KiB");
        assert_eq!(human_bytes(1536.0), "1.50 KiB");
        assert_eq!(human_bytes(2048.0), "2.00 KiB");
        assert_eq!(human_bytes(1_572_864.0), "1.50 MiB");
        assert_eq!(human_bytes(1_610_612_736.0), "1.50 GiB");
    }

    #[test]
    fn test_comma_format() {
        assert_eq!(comma_format(0), "0");
        assert_eq!(comma_format(999), "999");
        assert_eq!(comma_format(1000), "1,000");
        assert_eq!(comma_format(1_234_567), "1,234,567");
        assert_eq!(comma_format(-1234), "-1,234");
        assert_eq!(comma_format(-999), "-999");
        assert_eq!(comma_format(i64::MIN), "-9,223,372,036,854,775,808");
    }

    #[test]
    fn test_msgs_per_client() {
        assert_eq!(msgs_per_client(100, 4), vec![25, 25, 25, 25]);
        assert_eq!(msgs_per_client(10, 3), vec![4, 3, 3]);
        assert_eq!(msgs_per_client(2, 3), vec![1, 1, 0]);
        assert!(msgs_per_client(0, 3).is_empty());
        assert!(msgs_per_client(10, 0).is_empty());
        assert_eq!(msgs_per_client(100_000, 7).iter().sum::<u64>(), 100_000);
    }

    #[test]
    fn test_generate_run_id_is_unique() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    /// Test message size validation rules
    #[test]
    fn test_validate_message_size() {
        assert!(validate_message_size(0).is_ok());
        assert!(validate_message_size(128).is_ok());
        assert!(validate_message_size(64 * 1024 * 1024 + 1).is_err());
    }

    #[test]
    fn test_validate_worker_counts() {
        assert!(validate_worker_counts(1, 0).is_ok());
        assert!(validate_worker_counts(0, 1).is_ok());
        assert!(validate_worker_counts(10, 10).is_ok());
        assert!(validate_worker_counts(0, 0).is_err());
        assert!(validate_worker_counts(1025, 1).is_err());
    }
}
