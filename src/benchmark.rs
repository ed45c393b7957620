//! # Benchmark Engine Module
//!
//! This module runs one throughput benchmark: N publishers and M subscribers,
//! each a separate tokio task with its own connection, all working on one
//! subject. Every worker produces exactly one [`Sample`] derived from its
//! connection counters, and the harness folds those samples into one
//! [`Aggregator`] per role once every worker has finished.
//!
//! ## Key Components
//!
//! - **BenchmarkConfig**: Everything a run needs, built from the CLI and
//!   passed by value
//! - **BenchmarkRunner**: Spawns the workers, enforces the barriers and
//!   collects the samples
//! - **BenchmarkOutcome**: Both aggregators, the wall-clock window and the
//!   workers that failed
//!
//! ## Run Lifecycle
//!
//! 1. **Subscribers**: connect and register their subscription, then release
//!    their slot in the startup latch
//! 2. **Publishers**: start once every subscriber is ready; the wall clock
//!    starts once every publisher is connected
//! 3. **Completion**: the harness joins every worker task, successful or not
//! 4. **Reduction**: samples are drained from the per-role hand-off channels
//!    into the aggregators, in arrival order
//!
//! ## Failure Handling
//!
//! A worker that fails (or panics) does not take the run down. Its error is
//! recorded as a [`WorkerFailed`], the shared [`AbortSignal`] is raised so
//! subscribers waiting for messages that will never come give up, and the
//! outcome still carries the samples of every worker that completed.

use crate::{
    cli::BenchArgs,
    client::{AckFuture, ClientError, Connector, StartPosition, StreamingConnection, SubscriptionOptions},
    coordination::{AbortSignal, LatchGuard, QueueGroupTracker, StartupLatch, QUEUE_DONE_SENTINEL},
    metrics::{Aggregator, Role, Sample},
    utils::{
        comma_format, format_duration, generate_run_id, msgs_per_client, validate_message_size,
        validate_worker_counts,
    },
};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a single worker did not complete its workload
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("aborted after another worker failed")]
    Aborted,

    #[error("panicked: {0}")]
    Panicked(String),
}

/// A worker that ended with an error instead of a sample
#[derive(Debug, Error)]
#[error("{role} #{worker} failed: {cause}")]
pub struct WorkerFailed {
    pub role: Role,
    pub worker: usize,
    #[source]
    pub cause: WorkerError,
}

/// A helper struct to provide a single source of truth for displaying the
/// benchmark configuration at startup.
struct BenchmarkConfigDisplay<'a> {
    config: &'a BenchmarkConfig,
    backend: &'a str,
}

impl<'a> std::fmt::Display for BenchmarkConfigDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config;
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(
            f,
            "Starting benchmark [msgs={}, msgsize={} B, pubs={}, subs={}]",
            comma_format(config.num_msgs as i64),
            config.message_size,
            config.num_pubs,
            config.num_subs
        )?;
        writeln!(f, "  Subject:            {}", config.subject)?;
        writeln!(f, "  Backend:            {}", self.backend)?;
        writeln!(f, "  Client ID Prefix:   {}", config.client_id)?;
        if config.sync {
            writeln!(f, "  Publish Mode:       synchronous")?;
        } else {
            writeln!(
                f,
                "  Publish Mode:       asynchronous (max {} acks in flight)",
                config.max_pub_acks_inflight
            )?;
        }
        writeln!(f, "  Ack Wait:           {}", format_duration(config.ack_wait))?;
        if config.num_subs > 0 {
            let start = if config.ignore_old {
                "New messages only"
            } else {
                "All available"
            };
            writeln!(f, "  Subscriber Start:   {}", start)?;
            writeln!(
                f,
                "  Queue Group:        {}",
                config.queue_group.as_deref().unwrap_or("Not set")
            )?;
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Configuration for benchmark execution
///
/// Built once from the command line and handed to [`BenchmarkRunner`] by
/// value; workers share it read-only.
#[derive(Clone, Debug)]
pub struct BenchmarkConfig {
    /// Subject every worker publishes or subscribes on
    pub subject: String,

    /// Number of concurrent publishers
    pub num_pubs: usize,

    /// Number of concurrent subscribers
    pub num_subs: usize,

    /// Total messages to publish, split across publishers
    ///
    /// Each plain subscriber expects all of them; subscribers sharing a
    /// queue group expect this many between them.
    pub num_msgs: u64,

    /// Payload size in bytes
    pub message_size: usize,

    /// Wait for each acknowledgment before publishing the next message
    pub sync: bool,

    /// Subscribers start with new messages instead of everything stored
    pub ignore_old: bool,

    /// Upper bound on unacknowledged asynchronous publishes per publisher
    pub max_pub_acks_inflight: usize,

    /// How long an outstanding acknowledgment may take
    pub ack_wait: Duration,

    /// Queue group joined by every subscriber
    pub queue_group: Option<String>,

    /// Prefix of every worker's client id
    pub client_id: String,
}

impl BenchmarkConfig {
    /// Create benchmark configuration from CLI arguments
    ///
    /// ## Errors
    ///
    /// Returns an error when the combination of counts, sizes and limits
    /// cannot produce a meaningful run (see [`BenchmarkConfig::validate`]).
    pub fn from_args(args: &BenchArgs) -> Result<Self> {
        let config = Self {
            subject: args.subject.clone(),
            num_pubs: args.num_pubs,
            num_subs: args.num_subs,
            num_msgs: args.num_msgs,
            message_size: args.message_size,
            sync: args.sync,
            ignore_old: args.ignore_old,
            max_pub_acks_inflight: args.max_pub_acks_inflight,
            ack_wait: args.ack_wait,
            queue_group: args.queue_group.clone().filter(|g| !g.is_empty()),
            client_id: args.client_id.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.subject.trim().is_empty() {
            return Err(anyhow!("Subject must not be empty"));
        }
        if self.client_id.is_empty() {
            return Err(anyhow!("Client ID prefix must not be empty"));
        }
        validate_worker_counts(self.num_pubs, self.num_subs)?;
        validate_message_size(self.message_size)?;
        if self.num_msgs == 0 {
            return Err(anyhow!("Message count must be greater than 0"));
        }
        if self.max_pub_acks_inflight == 0 {
            return Err(anyhow!("Max publish acks in flight must be greater than 0"));
        }
        if self.ack_wait.is_zero() {
            return Err(anyhow!("Ack wait must be greater than 0"));
        }
        if self.queue_group.is_some() && self.num_subs == 0 {
            warn!("Queue group is set but no subscribers were requested");
        }
        Ok(())
    }

    /// Where every subscriber starts in the subject's history
    pub fn start_position(&self) -> StartPosition {
        if self.ignore_old {
            StartPosition::NewOnly
        } else {
            StartPosition::AllAvailable
        }
    }

    pub fn worker_client_id(&self, role: Role, worker: usize) -> String {
        format!("{}-{}-{}", self.client_id, role.as_str(), worker)
    }

    /// Messages each subscriber waits for before it is done
    fn expected_per_subscriber(&self) -> u64 {
        self.num_msgs
    }
}

/// Result of one benchmark run
#[derive(Debug)]
pub struct BenchmarkOutcome {
    pub run_id: String,
    pub publishers: Aggregator,
    pub subscribers: Aggregator,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// From the moment every publisher was connected until every worker finished
    pub wall_clock: Duration,
    pub failures: Vec<WorkerFailed>,
}

impl BenchmarkOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// State every worker task shares
#[derive(Clone)]
struct WorkerContext {
    config: Arc<BenchmarkConfig>,
    connector: Arc<dyn Connector>,
    abort: AbortSignal,
}

struct WorkerHandle {
    role: Role,
    worker: usize,
    handle: JoinHandle<Result<(), WorkerError>>,
}

/// Benchmark runner that coordinates publishers and subscribers
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    connector: Arc<dyn Connector>,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Run the benchmark to completion
    ///
    /// Worker failures are reported in [`BenchmarkOutcome::failures`]; an
    /// `Err` is only returned when the run could not be set up at all.
    pub async fn run(&self) -> Result<BenchmarkOutcome> {
        self.config.validate()?;
        info!(
            "\n{}",
            BenchmarkConfigDisplay {
                config: &self.config,
                backend: self.connector.name(),
            }
        );

        let run_id = generate_run_id();
        let config = Arc::new(self.config.clone());
        let ctx = WorkerContext {
            config: config.clone(),
            connector: self.connector.clone(),
            abort: AbortSignal::new(),
        };

        // Capacity matches the producer count so a send never waits.
        let (pub_tx, mut pub_rx) = mpsc::channel::<Sample>(config.num_pubs.max(1));
        let (sub_tx, mut sub_rx) = mpsc::channel::<Sample>(config.num_subs.max(1));
        let mut workers = Vec::with_capacity(config.num_pubs + config.num_subs);

        let subscribers_ready = StartupLatch::new(config.num_subs);
        let tracker = config
            .queue_group
            .as_ref()
            .map(|_| QueueGroupTracker::new(config.num_msgs, config.num_subs));
        for worker in 0..config.num_subs {
            let guard = subscribers_ready.guard();
            let fut = run_subscriber(ctx.clone(), worker, guard, tracker.clone(), sub_tx.clone());
            workers.push(spawn_worker(Role::Subscriber, worker, ctx.abort.clone(), fut));
        }
        subscribers_ready.wait().await;
        debug!("All {} subscribers are ready", config.num_subs);

        let publishers_connected = StartupLatch::new(config.num_pubs);
        let jobs = msgs_per_client(config.num_msgs, config.num_pubs);
        for (worker, job) in jobs.into_iter().enumerate() {
            let guard = publishers_connected.guard();
            let fut = run_publisher(ctx.clone(), worker, job, guard, pub_tx.clone());
            workers.push(spawn_worker(Role::Publisher, worker, ctx.abort.clone(), fut));
        }
        publishers_connected.wait().await;

        let started_at = Utc::now();
        let timer = Instant::now();
        drop(pub_tx);
        drop(sub_tx);

        let mut failures = Vec::new();
        for WorkerHandle {
            role,
            worker,
            handle,
        } in workers
        {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(WorkerError::Panicked(join_error.to_string())),
            };
            if let Err(cause) = result {
                failures.push(WorkerFailed {
                    role,
                    worker,
                    cause,
                });
            }
        }
        let wall_clock = timer.elapsed();
        let finished_at = Utc::now();

        let mut publishers = Aggregator::new(Role::Publisher);
        while let Some(sample) = pub_rx.recv().await {
            publishers.add_sample(sample);
        }
        let mut subscribers = Aggregator::new(Role::Subscriber);
        while let Some(sample) = sub_rx.recv().await {
            subscribers.add_sample(sample);
        }

        if failures.is_empty() {
            info!("Benchmark completed in {}", format_duration(wall_clock));
        } else {
            warn!(
                "Benchmark finished with {} failed worker(s) in {}",
                failures.len(),
                format_duration(wall_clock)
            );
        }

        Ok(BenchmarkOutcome {
            run_id,
            publishers,
            subscribers,
            started_at,
            finished_at,
            wall_clock,
            failures,
        })
    }
}

/// Spawn one worker task that always reports back, even on panic
fn spawn_worker<F>(role: Role, worker: usize, abort: AbortSignal, fut: F) -> WorkerHandle
where
    F: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let result = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(WorkerError::Panicked(panic_message(panic.as_ref()))),
        };
        if let Err(e) = &result {
            if !matches!(e, WorkerError::Aborted) {
                error!("{} #{} failed: {}", role, worker, e);
            }
            abort.trigger();
        }
        result
    });
    WorkerHandle {
        role,
        worker,
        handle,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn close_connection(conn: &dyn StreamingConnection) {
    if let Err(e) = conn.close().await {
        warn!("Closing '{}' failed: {}", conn.client_id(), e);
    }
}

async fn hand_off(tx: &mpsc::Sender<Sample>, sample: Sample) {
    if tx.send(sample).await.is_err() {
        warn!("Sample dropped: the harness is no longer collecting");
    }
}

async fn run_publisher(
    ctx: WorkerContext,
    worker: usize,
    job: u64,
    mut connected: LatchGuard,
    samples: mpsc::Sender<Sample>,
) -> Result<(), WorkerError> {
    let client_id = ctx.config.worker_client_id(Role::Publisher, worker);
    let conn = ctx.connector.connect(&client_id).await?;
    connected.arrive();

    let payload = Bytes::from(vec![0u8; ctx.config.message_size]);
    let start = Utc::now();
    let published = if ctx.config.sync {
        publish_sync(&ctx, conn.as_ref(), payload, job).await
    } else {
        publish_async(&ctx, conn.as_ref(), payload, job).await
    };
    let end = Utc::now();
    let stats = conn.stats();
    close_connection(conn.as_ref()).await;
    published?;

    debug!("Publisher '{}' sent {} messages", client_id, stats.out_messages);
    let sample = Sample::from_connection(Role::Publisher, client_id, job, start, end, &stats);
    hand_off(&samples, sample).await;
    Ok(())
}

async fn publish_sync(
    ctx: &WorkerContext,
    conn: &dyn StreamingConnection,
    payload: Bytes,
    job: u64,
) -> Result<(), WorkerError> {
    for _ in 0..job {
        if ctx.abort.is_triggered() {
            return Err(WorkerError::Aborted);
        }
        conn.publish(&ctx.config.subject, payload.clone()).await?;
    }
    Ok(())
}

async fn publish_async(
    ctx: &WorkerContext,
    conn: &dyn StreamingConnection,
    payload: Bytes,
    job: u64,
) -> Result<(), WorkerError> {
    let max_inflight = ctx.config.max_pub_acks_inflight;
    let mut inflight: FuturesUnordered<AckFuture> = FuturesUnordered::new();
    for _ in 0..job {
        if ctx.abort.is_triggered() {
            return Err(WorkerError::Aborted);
        }
        while inflight.len() >= max_inflight {
            next_ack(&mut inflight, ctx.config.ack_wait).await?;
        }
        let ack = conn.publish_async(&ctx.config.subject, payload.clone()).await?;
        inflight.push(ack);
    }
    while !inflight.is_empty() {
        next_ack(&mut inflight, ctx.config.ack_wait).await?;
    }
    Ok(())
}

/// Wait for one outstanding acknowledgment, bounded by `ack_wait`
async fn next_ack(
    inflight: &mut FuturesUnordered<AckFuture>,
    ack_wait: Duration,
) -> Result<(), ClientError> {
    match tokio::time::timeout(ack_wait, inflight.next()).await {
        Ok(Some(ack)) => ack.map(|_guid| ()),
        Ok(None) => Ok(()),
        Err(_) => Err(ClientError::AckTimeout(ack_wait)),
    }
}

async fn run_subscriber(
    ctx: WorkerContext,
    worker: usize,
    mut ready: LatchGuard,
    tracker: Option<Arc<QueueGroupTracker>>,
    samples: mpsc::Sender<Sample>,
) -> Result<(), WorkerError> {
    let client_id = ctx.config.worker_client_id(Role::Subscriber, worker);
    let conn = ctx.connector.connect(&client_id).await?;

    let options = SubscriptionOptions::new(ctx.config.start_position())
        .queue_group(ctx.config.queue_group.clone());
    let mut subscription = match conn.subscribe(&ctx.config.subject, options).await {
        Ok(subscription) => subscription,
        Err(e) => {
            close_connection(conn.as_ref()).await;
            return Err(e.into());
        }
    };
    ready.arrive();

    let expected = ctx.config.expected_per_subscriber();
    let mut received = 0u64;
    let mut sentinels = 0u64;
    let mut first: Option<DateTime<Utc>> = None;

    let aborted = ctx.abort.triggered();
    tokio::pin!(aborted);
    let outcome = loop {
        let message = tokio::select! {
            _ = &mut aborted => break Err(WorkerError::Aborted),
            message = subscription.next_message() => message,
        };
        let Some(message) = message else {
            break Err(ClientError::SubscriptionClosed(ctx.config.subject.clone()).into());
        };

        match &tracker {
            Some(group) => {
                if message.payload.as_ref() == QUEUE_DONE_SENTINEL {
                    sentinels += 1;
                    break Ok(());
                }
                received += 1;
                first.get_or_insert_with(Utc::now);
                if group.record_message() {
                    break Ok(());
                }
            }
            None => {
                received += 1;
                first.get_or_insert_with(Utc::now);
                if received >= expected {
                    break Ok(());
                }
            }
        }
    };
    let end = Utc::now();

    if let Err(e) = outcome {
        drop(subscription);
        close_connection(conn.as_ref()).await;
        return Err(e);
    }

    let finished = leave_subscription(&ctx, conn.as_ref(), subscription, tracker.as_deref()).await;
    let mut stats = conn.stats();
    close_connection(conn.as_ref()).await;
    finished?;

    // Sentinels are control traffic, not benchmark payload.
    stats.in_messages = stats.in_messages.saturating_sub(sentinels);
    stats.in_bytes = stats
        .in_bytes
        .saturating_sub(sentinels * QUEUE_DONE_SENTINEL.len() as u64);

    debug!("Subscriber '{}' received {} messages", client_id, received);
    let start = first.unwrap_or(end);
    let sample = Sample::from_connection(Role::Subscriber, client_id, expected, start, end, &stats);
    hand_off(&samples, sample).await;
    Ok(())
}

/// Close a finished subscription and wake the rest of its queue group
///
/// The subscription is removed before the sentinel is published so the
/// broker routes the sentinel to a member that is still waiting.
async fn leave_subscription(
    ctx: &WorkerContext,
    conn: &dyn StreamingConnection,
    subscription: crate::client::Subscription,
    tracker: Option<&QueueGroupTracker>,
) -> Result<(), WorkerError> {
    subscription.unsubscribe().await?;
    if let Some(group) = tracker {
        let remaining = group.member_done();
        if remaining > 0 {
            conn.publish(&ctx.config.subject, Bytes::from_static(QUEUE_DONE_SENTINEL))
                .await?;
        }
    }
    Ok(())
}
