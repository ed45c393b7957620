//! # STAN Bench Library
//!
//! Publisher, subscriber and throughput benchmark utilities for a streaming
//! pub/sub client. The three binaries (`stan-bench`, `stan-pub` and
//! `stan-sub`) are thin drivers around this library.
//!
//! ## Architecture Overview
//!
//! The library is organized into several key modules:
//!
//! - `client`: The messaging collaborator abstraction and its backends
//!   (an in-process loopback broker and a NATS client)
//! - `coordination`: Startup latch, queue-group progress and abort signal
//!   shared by concurrent workers
//! - `benchmark`: Worker harness that runs publishers and subscribers and
//!   collects one sample per worker
//! - `metrics`: Samples, per-role aggregation and rate statistics
//! - `results`: The text report and the CSV / JSON exports
//! - `cli` and `logging`: Command-line parsing and tracing setup
//! - `utils`: Formatting and validation helpers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use stan_bench::{BenchmarkConfig, BenchmarkRunner, LoopbackBroker, Report};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BenchmarkConfig {
//!         subject: "bench".to_string(),
//!         num_pubs: 4,
//!         num_subs: 2,
//!         num_msgs: 10_000,
//!         message_size: 128,
//!         sync: false,
//!         ignore_old: false,
//!         max_pub_acks_inflight: 512,
//!         ack_wait: Duration::from_secs(5),
//!         queue_group: None,
//!         client_id: "benchmark".to_string(),
//!     };
//!
//!     let broker = Arc::new(LoopbackBroker::new("test-cluster"));
//!     let outcome = BenchmarkRunner::new(config, broker).run().await?;
//!     print!("{}", Report::from_outcome(&outcome));
//!     Ok(())
//! }
//! ```

/// Worker harness
///
/// Contains `BenchmarkRunner` and `BenchmarkConfig`. The runner spawns one
/// task per publisher and subscriber, holds publishers back until every
/// subscriber is registered, and joins every worker before reducing samples.
pub mod benchmark;

/// Command-line interface and configuration
///
/// Argument structs for the three binaries, sharing connection and logging
/// options through flattened groups.
pub mod cli;

/// Messaging collaborator
///
/// The `Connector` / `StreamingConnection` traits every worker talks to, and
/// the backends implementing them.
pub mod client;

pub mod coordination;

pub mod logging;

/// Samples and statistical reduction
///
/// One `Sample` per worker, one `Aggregator` per role. Rate statistics use
/// population variance and fail explicitly on empty input or zero-length
/// windows.
pub mod metrics;

/// Report rendering and file exports
pub mod results;

pub mod utils;

// Re-export key types for convenient library usage

pub use benchmark::{BenchmarkConfig, BenchmarkOutcome, BenchmarkRunner, WorkerError, WorkerFailed};

pub use client::{
    connector_for, ClientError, ConnectOptions, Connector, LoopbackBroker, StartPosition,
    StreamingConnection, SubscriptionOptions,
};

pub use metrics::{Aggregator, RateStatistics, Role, Sample, StatsError};

pub use results::{Report, ResultsManager, RunSummary};

/// The current version of the benchmark utilities
///
/// Populated from Cargo.toml and written into the JSON export.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Shared by the CLI definitions and the library so that both agree on what
/// an unconfigured run looks like.
pub mod defaults {
    /// Default server URL
    pub const SERVER: &str = "nats://127.0.0.1:4222";

    /// Default streaming cluster ID
    pub const CLUSTER_ID: &str = "test-cluster";

    /// Default client ID prefix for benchmark workers
    pub const CLIENT_ID: &str = "benchmark";

    /// Default total number of messages to publish
    ///
    /// Split across publishers, so each of the default ten publishers sends
    /// 10,000 messages.
    pub const NUM_MSGS: u64 = 100_000;

    /// Default number of concurrent publishers
    pub const NUM_PUBS: usize = 10;

    /// Default number of concurrent subscribers
    pub const NUM_SUBS: usize = 0;

    /// Default message payload size in bytes
    pub const MESSAGE_SIZE: usize = 128;

    /// Default limit of unacknowledged asynchronous publishes per publisher
    pub const MAX_PUB_ACKS_INFLIGHT: usize = 512;

    /// Default acknowledgment wait, in the CLI duration syntax
    pub const ACK_WAIT: &str = "5s";
}
