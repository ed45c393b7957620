//! Messaging collaborator abstraction.
//!
//! The benchmark and the command-line utilities never speak a wire protocol
//! themselves. They go through [`Connector`] to open one
//! [`StreamingConnection`] per client id, and use that connection to
//! publish, publish with a deferred acknowledgment, and subscribe from a
//! [`StartPosition`]. Every connection exposes transport-level counters
//! ([`ConnectionStats`]) which the benchmark turns into samples.
//!
//! Two backends are provided and selected from the server URL:
//!
//! - `loopback://`: an in-process broker ([`LoopbackBroker`]) used by the
//!   test-suite and for local dry runs
//! - anything else: a NATS server reached through `async-nats`
//!   ([`NatsConnector`])

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

pub mod loopback;
pub mod nats;

pub use loopback::LoopbackBroker;
pub use nats::NatsConnector;

/// URL scheme that selects the in-process broker
pub const LOOPBACK_SCHEME: &str = "loopback://";

/// Boxed error carried by transport failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Acknowledgment of an asynchronous publish, resolving to the message guid
pub type AckFuture = BoxFuture<'static, Result<String, ClientError>>;

/// Errors surfaced by the messaging collaborator
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid connect options: {0}")]
    InvalidOptions(String),

    #[error("cannot connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("client id '{0}' is already connected")]
    DuplicateClientId(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("publish on '{subject}' failed: {source}")]
    Publish {
        subject: String,
        #[source]
        source: BoxError,
    },

    #[error("subscribe on '{subject}' failed: {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: BoxError,
    },

    #[error("acknowledgment failed: {0}")]
    Ack(String),

    #[error("no acknowledgment received within {0:?}")]
    AckTimeout(Duration),

    #[error("{feature} is not supported by the {backend} backend")]
    Unsupported {
        feature: String,
        backend: &'static str,
    },

    #[error("subscription on '{0}' was closed")]
    SubscriptionClosed(String),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Snapshot of a connection's transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub in_messages: u64,
    pub in_bytes: u64,
    pub out_messages: u64,
    pub out_bytes: u64,
}

/// Live counters updated by a backend as messages cross the connection
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    in_messages: AtomicU64,
    in_bytes: AtomicU64,
    out_messages: AtomicU64,
    out_bytes: AtomicU64,
}

impl ConnectionCounters {
    pub fn record_in(&self, bytes: usize) {
        self.in_messages.fetch_add(1, Ordering::Relaxed);
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.out_messages.fetch_add(1, Ordering::Relaxed);
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            in_messages: self.in_messages.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_messages: self.out_messages.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Where a new subscription starts in the subject's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only messages published after the subscription is registered
    #[default]
    NewOnly,
    /// The most recently stored message, then new ones
    LastReceived,
    /// Every stored message
    AllAvailable,
    /// Stored messages from this sequence number on
    Sequence(u64),
    /// Stored messages younger than this offset
    TimeDelta(Duration),
}

/// Per-subscription settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub queue_group: Option<String>,
    pub start: StartPosition,
}

impl SubscriptionOptions {
    pub fn new(start: StartPosition) -> Self {
        Self {
            queue_group: None,
            start,
        }
    }

    /// Join a queue group; `None` or an empty name keeps a plain subscription
    pub fn queue_group(mut self, group: Option<String>) -> Self {
        self.queue_group = group.filter(|g| !g.is_empty());
        self
    }
}

/// A message delivered to a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub subject: String,
    pub sequence: u64,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// Handle on an active subscription
///
/// Messages are read with [`Subscription::next_message`]. Dropping the
/// handle stops delivery in the background; [`Subscription::unsubscribe`]
/// additionally waits until the backend no longer routes to it.
pub struct Subscription {
    subject: String,
    messages: mpsc::UnboundedReceiver<StreamMessage>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a backend's delivery channel
    ///
    /// `task` must finish once `stop` fires (or is dropped) and only after the
    /// backend has detached the subscription.
    pub fn new(
        subject: impl Into<String>,
        messages: mpsc::UnboundedReceiver<StreamMessage>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            subject: subject.into(),
            messages,
            stop: Some(stop),
            task: Some(task),
        }
    }

    /// Next delivered message, `None` once the backend closed the stream
    pub async fn next_message(&mut self) -> Option<StreamMessage> {
        self.messages.recv().await
    }

    /// Stop delivery and wait for the backend to detach
    pub async fn unsubscribe(mut self) -> Result<(), ClientError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| ClientError::Task(e.to_string()))?;
        }
        debug!("Unsubscribed from '{}'", self.subject);
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// One client's connection to the streaming server
#[async_trait]
pub trait StreamingConnection: Send + Sync {
    fn client_id(&self) -> &str;

    /// Publish and wait for the server acknowledgment; returns the guid
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<String, ClientError>;

    /// Publish without waiting; the returned future resolves on acknowledgment
    ///
    /// The future may complete on any task; callers must not assume it is
    /// driven by the publishing task.
    async fn publish_async(&self, subject: &str, payload: Bytes) -> Result<AckFuture, ClientError>;

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription, ClientError>;

    /// Transport counters accumulated since the connection was opened
    fn stats(&self) -> ConnectionStats;

    async fn close(&self) -> Result<(), ClientError>;
}

/// Opens connections to one server (or cluster)
#[async_trait]
pub trait Connector: Send + Sync {
    /// Backend name for logs and error messages
    fn name(&self) -> &'static str;

    async fn connect(&self, client_id: &str) -> Result<Box<dyn StreamingConnection>, ClientError>;
}

/// TLS material for secure connections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub root_certificates: Vec<PathBuf>,
    pub client_certificate: Option<(PathBuf, PathBuf)>,
}

/// Server addresses and credentials shared by every connection of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub servers: Vec<String>,
    pub cluster_id: String,
    pub creds_file: Option<PathBuf>,
    pub user_password: Option<(String, String)>,
    pub tls: Option<TlsOptions>,
}

impl ConnectOptions {
    /// Options for a comma-separated list of server URLs
    pub fn new(servers: &str, cluster_id: impl Into<String>) -> Self {
        Self {
            servers: servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            cluster_id: cluster_id.into(),
            creds_file: None,
            user_password: None,
            tls: None,
        }
    }

    pub fn is_loopback(&self) -> bool {
        !self.servers.is_empty() && self.servers.iter().all(|s| s.starts_with(LOOPBACK_SCHEME))
    }

    /// Reject option combinations no backend can honor
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.servers.is_empty() {
            return Err(ClientError::InvalidOptions(
                "at least one server URL is required".to_string(),
            ));
        }
        if self.cluster_id.is_empty() {
            return Err(ClientError::InvalidOptions(
                "cluster id must not be empty".to_string(),
            ));
        }
        let wants_tls = self.servers.iter().any(|s| s.starts_with("tls://"));
        let has_tls_material = self
            .tls
            .as_ref()
            .map(|t| !t.root_certificates.is_empty() || t.client_certificate.is_some())
            .unwrap_or(false);
        if wants_tls && !has_tls_material {
            return Err(ClientError::InvalidOptions(
                "tls:// servers require a certificate directory or a client certificate and key"
                    .to_string(),
            ));
        }
        if self.is_loopback() != self.servers.iter().any(|s| s.starts_with(LOOPBACK_SCHEME)) {
            return Err(ClientError::InvalidOptions(
                "loopback:// cannot be mixed with network servers".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pick the backend matching the server URLs
pub fn connector_for(options: ConnectOptions) -> Result<Arc<dyn Connector>, ClientError> {
    options.validate()?;
    if options.is_loopback() {
        debug!("Using in-process loopback broker for cluster '{}'", options.cluster_id);
        Ok(Arc::new(LoopbackBroker::new(options.cluster_id)))
    } else {
        debug!("Using NATS backend for servers {:?}", options.servers);
        Ok(Arc::new(NatsConnector::new(options)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_split_servers() {
        let options = ConnectOptions::new("nats://a:4222, nats://b:4222,", "test-cluster");
        assert_eq!(options.servers, vec!["nats://a:4222", "nats://b:4222"]);
        assert!(!options.is_loopback());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_tls_requires_certificates() {
        let mut options = ConnectOptions::new("tls://demo:4443", "test-cluster");
        assert!(matches!(
            options.validate(),
            Err(ClientError::InvalidOptions(_))
        ));

        options.tls = Some(TlsOptions {
            root_certificates: vec![PathBuf::from("ca.pem")],
            client_certificate: None,
        });
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_loopback_cannot_mix_with_network_servers() {
        let options = ConnectOptions::new("loopback://, nats://a:4222", "test-cluster");
        assert!(!options.is_loopback());
        assert!(options.validate().is_err());

        let options = ConnectOptions::new("loopback://", "test-cluster");
        assert!(options.is_loopback());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_empty_options_rejected() {
        assert!(ConnectOptions::new("", "c").validate().is_err());
        assert!(ConnectOptions::new("loopback://", "").validate().is_err());
    }

    #[test]
    fn test_connector_selection() {
        let loopback = connector_for(ConnectOptions::new("loopback://", "c")).unwrap();
        assert_eq!(loopback.name(), "loopback");
        let nats = connector_for(ConnectOptions::new("nats://127.0.0.1:4222", "c")).unwrap();
        assert_eq!(nats.name(), "nats");
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = ConnectionCounters::default();
        counters.record_out(10);
        counters.record_out(5);
        counters.record_in(3);
        assert_eq!(
            counters.snapshot(),
            ConnectionStats {
                in_messages: 1,
                in_bytes: 3,
                out_messages: 2,
                out_bytes: 15,
            }
        );
    }

    #[test]
    fn test_subscription_options_ignore_empty_group() {
        let opts = SubscriptionOptions::new(StartPosition::AllAvailable).queue_group(Some(String::new()));
        assert_eq!(opts.queue_group, None);
        let opts = SubscriptionOptions::default().queue_group(Some("workers".to_string()));
        assert_eq!(opts.queue_group.as_deref(), Some("workers"));
        assert_eq!(opts.start, StartPosition::NewOnly);
    }
}
