//! NATS backend built on `async-nats`.
//!
//! Core NATS keeps no message history, so only live delivery is available:
//! [`StartPosition::NewOnly`] is honored directly and
//! [`StartPosition::AllAvailable`] degrades to it (there is nothing stored
//! to replay). Any other start position is rejected with
//! [`ClientError::Unsupported`]. A publish is acknowledged once the server
//! confirmed a flush covering it.

use super::{
    AckFuture, ClientError, ConnectOptions, ConnectionCounters, ConnectionStats, Connector,
    StartPosition,
    StreamMessage, StreamingConnection, Subscription, SubscriptionOptions,
};
use async_nats::ServerAddr;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Opens `async-nats` clients with the run's shared options
pub struct NatsConnector {
    options: ConnectOptions,
}

impl NatsConnector {
    pub fn new(options: ConnectOptions) -> Self {
        Self { options }
    }

    fn server_addrs(&self) -> Result<Vec<ServerAddr>, ClientError> {
        self.options
            .servers
            .iter()
            .map(|url| {
                ServerAddr::from_str(url).map_err(|e| ClientError::Connect {
                    url: url.clone(),
                    source: Box::new(e),
                })
            })
            .collect()
    }

    async fn client_options(&self, client_id: &str) -> Result<async_nats::ConnectOptions, ClientError> {
        let mut opts = async_nats::ConnectOptions::new().name(client_id);

        if let Some(path) = &self.options.creds_file {
            opts = opts
                .credentials_file(path)
                .await
                .map_err(|e| ClientError::InvalidOptions(format!(
                    "cannot load credentials from {}: {}",
                    path.display(),
                    e
                )))?;
        }
        if let Some((user, password)) = &self.options.user_password {
            opts = opts.user_and_password(user.clone(), password.clone());
        }
        if let Some(tls) = &self.options.tls {
            opts = opts.require_tls(true);
            for root in &tls.root_certificates {
                opts = opts.add_root_certificates(root.clone());
            }
            if let Some((cert, key)) = &tls.client_certificate {
                opts = opts.add_client_certificate(cert.clone(), key.clone());
            }
        }
        Ok(opts)
    }
}

#[async_trait]
impl Connector for NatsConnector {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn connect(&self, client_id: &str) -> Result<Box<dyn StreamingConnection>, ClientError> {
        let servers = self.server_addrs()?;
        let client = self
            .client_options(client_id)
            .await?
            .connect(servers.as_slice())
            .await
            .map_err(|e| ClientError::Connect {
                url: self.options.servers.join(","),
                source: Box::new(e),
            })?;

        debug!(
            "Client '{}' connected to {} (cluster '{}')",
            client_id,
            self.options.servers.join(","),
            self.options.cluster_id
        );
        Ok(Box::new(NatsConnection {
            client_id: client_id.to_string(),
            client,
            counters: Arc::new(ConnectionCounters::default()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct NatsConnection {
    client_id: String,
    client: async_nats::Client,
    counters: Arc<ConnectionCounters>,
    closed: AtomicBool,
}

impl NatsConnection {
    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ClientError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn send(&self, subject: &str, payload: Bytes) -> Result<(), ClientError> {
        self.ensure_open()?;
        let len = payload.len();
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| ClientError::Publish {
                subject: subject.to_string(),
                source: Box::new(e),
            })?;
        self.counters.record_out(len);
        Ok(())
    }
}

#[async_trait]
impl StreamingConnection for NatsConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<String, ClientError> {
        self.send(subject, payload).await?;
        self.client
            .flush()
            .await
            .map_err(|e| ClientError::Ack(e.to_string()))?;
        Ok(Uuid::new_v4().simple().to_string())
    }

    async fn publish_async(&self, subject: &str, payload: Bytes) -> Result<AckFuture, ClientError> {
        self.send(subject, payload).await?;
        let client = self.client.clone();
        let guid = Uuid::new_v4().simple().to_string();
        Ok(Box::pin(async move {
            client
                .flush()
                .await
                .map_err(|e| ClientError::Ack(e.to_string()))?;
            Ok(guid)
        }))
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription, ClientError> {
        self.ensure_open()?;
        match options.start {
            StartPosition::NewOnly => {}
            StartPosition::AllAvailable => {
                debug!("No stored history on core NATS, '{}' starts with new messages", subject);
            }
            other => {
                return Err(ClientError::Unsupported {
                    feature: format!("start position {:?}", other),
                    backend: "nats",
                })
            }
        }

        let result = match &options.queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(subject.to_string(), group.clone())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        };
        let mut subscriber = result.map_err(|e| ClientError::Subscribe {
            subject: subject.to_string(),
            source: Box::new(e),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let name = subject.to_string();
        let counters = self.counters.clone();
        let task = tokio::spawn(async move {
            let mut sequence = 0u64;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    next = subscriber.next() => match next {
                        Some(message) => {
                            counters.record_in(message.payload.len());
                            sequence += 1;
                            let delivered = StreamMessage {
                                subject: message.subject.to_string(),
                                sequence,
                                payload: message.payload,
                                timestamp: Utc::now(),
                            };
                            if tx.send(delivered).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                warn!("Unsubscribe from '{}' failed: {}", name, e);
            }
        });

        Ok(Subscription::new(subject, rx, stop_tx, task))
    }

    fn stats(&self) -> ConnectionStats {
        self.counters.snapshot()
    }

    async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Pending publishes must reach the server before the client goes away.
        self.client
            .flush()
            .await
            .map_err(|e| ClientError::Ack(e.to_string()))?;
        debug!("Client '{}' closed", self.client_id);
        Ok(())
    }
}
