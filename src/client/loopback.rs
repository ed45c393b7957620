//! In-process stand-in for a streaming server.
//!
//! Keeps an append-only log per subject so subscriptions can start from a
//! past position, fans messages out to plain subscribers and balances them
//! round-robin across queue-group members. Client ids are unique per
//! broker, like on a real streaming cluster. Acknowledgments are immediate.
//!
//! Routing happens synchronously inside `publish` while holding the broker
//! lock; deliveries go to unbounded channels so a slow subscriber never
//! blocks a publisher.

use super::{
    AckFuture, ClientError, ConnectionCounters, ConnectionStats, Connector, StartPosition,
    StreamMessage, StreamingConnection, Subscription, SubscriptionOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use uuid::Uuid;

struct RegisteredSubscriber {
    id: u64,
    owner: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<StreamMessage>,
    counters: Arc<ConnectionCounters>,
}

impl RegisteredSubscriber {
    fn deliver(&self, message: &StreamMessage) {
        if self.sender.send(message.clone()).is_ok() {
            self.counters.record_in(message.payload.len());
        }
    }
}

#[derive(Default)]
struct Channel {
    log: Vec<StreamMessage>,
    subscribers: Vec<RegisteredSubscriber>,
    queue_cursors: HashMap<String, usize>,
}

impl Channel {
    fn append(&mut self, subject: &str, payload: Bytes) -> StreamMessage {
        let message = StreamMessage {
            subject: subject.to_string(),
            sequence: self.log.len() as u64 + 1,
            payload,
            timestamp: Utc::now(),
        };
        self.log.push(message.clone());
        message
    }

    /// Indexes of the subscribers that receive the next message
    fn targets(&mut self) -> Vec<usize> {
        let mut targets = Vec::new();
        let mut groups: Vec<&str> = Vec::new();
        for (idx, sub) in self.subscribers.iter().enumerate() {
            match sub.queue_group.as_deref() {
                None => targets.push(idx),
                Some(group) if !groups.contains(&group) => groups.push(group),
                Some(_) => {}
            }
        }
        for group in groups {
            let members: Vec<usize> = self
                .subscribers
                .iter()
                .enumerate()
                .filter(|(_, s)| s.queue_group.as_deref() == Some(group))
                .map(|(idx, _)| idx)
                .collect();
            let cursor = self.queue_cursors.entry(group.to_string()).or_insert(0);
            targets.push(members[*cursor % members.len()]);
            *cursor += 1;
        }
        targets
    }

    fn route(&mut self, message: &StreamMessage) {
        for idx in self.targets() {
            self.subscribers[idx].deliver(message);
        }
    }

    fn group_has_members(&self, group: &str) -> bool {
        self.subscribers
            .iter()
            .any(|s| s.queue_group.as_deref() == Some(group))
    }

    fn backlog(&self, start: StartPosition) -> &[StreamMessage] {
        match start {
            StartPosition::NewOnly => &[],
            StartPosition::AllAvailable => &self.log,
            StartPosition::LastReceived => {
                let from = self.log.len().saturating_sub(1);
                &self.log[from..]
            }
            StartPosition::Sequence(seq) => {
                let from = (seq.saturating_sub(1) as usize).min(self.log.len());
                &self.log[from..]
            }
            StartPosition::TimeDelta(delta) => {
                let cutoff = chrono::Duration::from_std(delta)
                    .ok()
                    .and_then(|d| Utc::now().checked_sub_signed(d));
                match cutoff {
                    Some(cutoff) => {
                        let from = self.log.partition_point(|m| m.timestamp < cutoff);
                        &self.log[from..]
                    }
                    None => &self.log,
                }
            }
        }
    }
}

#[derive(Default)]
struct BrokerState {
    clients: HashSet<String>,
    channels: HashMap<String, Channel>,
    next_subscriber_id: u64,
}

/// Shared in-process broker; clones refer to the same state
#[derive(Clone)]
pub struct LoopbackBroker {
    cluster_id: String,
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// Number of messages stored for `subject`
    pub fn stored_messages(&self, subject: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(subject)
            .map(|c| c.log.len())
            .unwrap_or(0)
    }

    /// Number of subscriptions currently attached to `subject`
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(subject)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    fn publish(&self, subject: &str, payload: Bytes) {
        let mut state = self.state.lock();
        let channel = state.channels.entry(subject.to_string()).or_default();
        let message = channel.append(subject, payload);
        channel.route(&message);
        trace!("Routed '{}' #{}", subject, message.sequence);
    }

    fn register(
        &self,
        owner: &str,
        subject: &str,
        options: &SubscriptionOptions,
        counters: Arc<ConnectionCounters>,
    ) -> (u64, mpsc::UnboundedReceiver<StreamMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_subscriber_id += 1;
        let id = state.next_subscriber_id;
        let channel = state.channels.entry(subject.to_string()).or_default();

        let subscriber = RegisteredSubscriber {
            id,
            owner: owner.to_string(),
            queue_group: options.queue_group.clone(),
            sender,
            counters,
        };

        // A queue group shares one position: only its first member replays.
        let replay = match options.queue_group.as_deref() {
            Some(group) => !channel.group_has_members(group),
            None => true,
        };
        if replay {
            for message in channel.backlog(options.start) {
                subscriber.deliver(message);
            }
        }
        channel.subscribers.push(subscriber);
        (id, receiver)
    }

    fn unregister(&self, subject: &str, id: u64) {
        let mut state = self.state.lock();
        if let Some(channel) = state.channels.get_mut(subject) {
            channel.subscribers.retain(|s| s.id != id);
        }
    }

    fn disconnect(&self, client_id: &str) {
        let mut state = self.state.lock();
        state.clients.remove(client_id);
        for channel in state.channels.values_mut() {
            channel.subscribers.retain(|s| s.owner != client_id);
        }
    }
}

#[async_trait]
impl Connector for LoopbackBroker {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn connect(&self, client_id: &str) -> Result<Box<dyn StreamingConnection>, ClientError> {
        if client_id.is_empty() {
            return Err(ClientError::InvalidOptions(
                "client id must not be empty".to_string(),
            ));
        }
        if !self.state.lock().clients.insert(client_id.to_string()) {
            return Err(ClientError::DuplicateClientId(client_id.to_string()));
        }
        debug!("Client '{}' connected to loopback cluster '{}'", client_id, self.cluster_id);
        Ok(Box::new(LoopbackConnection {
            client_id: client_id.to_string(),
            broker: self.clone(),
            counters: Arc::new(ConnectionCounters::default()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackConnection {
    client_id: String,
    broker: LoopbackBroker,
    counters: Arc<ConnectionCounters>,
    closed: AtomicBool,
}

impl LoopbackConnection {
    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ClientError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn send(&self, subject: &str, payload: Bytes) -> Result<String, ClientError> {
        self.ensure_open()?;
        let len = payload.len();
        self.broker.publish(subject, payload);
        self.counters.record_out(len);
        Ok(Uuid::new_v4().simple().to_string())
    }
}

#[async_trait]
impl StreamingConnection for LoopbackConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<String, ClientError> {
        self.send(subject, payload)
    }

    async fn publish_async(&self, subject: &str, payload: Bytes) -> Result<AckFuture, ClientError> {
        let guid = self.send(subject, payload)?;
        Ok(Box::pin(async move { Ok(guid) }))
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription, ClientError> {
        self.ensure_open()?;
        let (id, receiver) =
            self.broker
                .register(&self.client_id, subject, &options, self.counters.clone());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let broker = self.broker.clone();
        let channel_subject = subject.to_string();
        let task = tokio::spawn(async move {
            // Fires on explicit stop and when the handle is dropped.
            let _ = stop_rx.await;
            broker.unregister(&channel_subject, id);
        });

        debug!(
            "Client '{}' subscribed to '{}' (queue={:?}, start={:?})",
            self.client_id, subject, options.queue_group, options.start
        );
        Ok(Subscription::new(subject, receiver, stop_tx, task))
    }

    fn stats(&self) -> ConnectionStats {
        self.counters.snapshot()
    }

    async fn close(&self) -> Result<(), ClientError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.disconnect(&self.client_id);
            debug!("Client '{}' disconnected from loopback broker", self.client_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn drain(sub: &mut Subscription, n: usize) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        for _ in 0..n {
            let msg = tokio::time::timeout(Duration::from_secs(1), sub.next_message())
                .await
                .expect("message not delivered in time")
                .expect("subscription closed");
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_duplicate_client_id_rejected() {
        let broker = LoopbackBroker::new("test-cluster");
        let conn = broker.connect("client-a").await.unwrap();
        assert!(matches!(
            broker.connect("client-a").await,
            Err(ClientError::DuplicateClientId(_))
        ));
        conn.close().await.unwrap();
        // The id is free again once the first connection closed.
        assert!(broker.connect("client-a").await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_counts_and_fan_out() {
        let broker = LoopbackBroker::new("test-cluster");
        let publisher = broker.connect("pub").await.unwrap();
        let sub_a = broker.connect("sub-a").await.unwrap();
        let sub_b = broker.connect("sub-b").await.unwrap();

        let mut a = sub_a.subscribe("foo", SubscriptionOptions::default()).await.unwrap();
        let mut b = sub_b.subscribe("foo", SubscriptionOptions::default()).await.unwrap();

        for _ in 0..3 {
            publisher.publish("foo", Bytes::from_static(b"hello")).await.unwrap();
        }

        assert_eq!(drain(&mut a, 3).await.len(), 3);
        let got = drain(&mut b, 3).await;
        assert_eq!(got.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);

        let out = publisher.stats();
        assert_eq!((out.out_messages, out.out_bytes), (3, 15));
        let inbound = sub_a.stats();
        assert_eq!((inbound.in_messages, inbound.in_bytes), (3, 15));
        assert_eq!(broker.stored_messages("foo"), 3);
    }

    #[tokio::test]
    async fn test_queue_group_round_robin() {
        let broker = LoopbackBroker::new("test-cluster");
        let publisher = broker.connect("pub").await.unwrap();
        let member_a = broker.connect("a").await.unwrap();
        let member_b = broker.connect("b").await.unwrap();
        let opts = SubscriptionOptions::default().queue_group(Some("workers".to_string()));

        let _a = member_a.subscribe("jobs", opts.clone()).await.unwrap();
        let _b = member_b.subscribe("jobs", opts).await.unwrap();

        for _ in 0..10 {
            publisher.publish("jobs", Bytes::from_static(b"x")).await.unwrap();
        }
        assert_eq!(member_a.stats().in_messages, 5);
        assert_eq!(member_b.stats().in_messages, 5);
    }

    #[tokio::test]
    async fn test_start_positions_replay_log() {
        let broker = LoopbackBroker::new("test-cluster");
        let publisher = broker.connect("pub").await.unwrap();
        for i in 0..5u8 {
            publisher.publish("log", Bytes::from(vec![i])).await.unwrap();
        }
        let subscriber = broker.connect("sub").await.unwrap();

        let mut all = subscriber
            .subscribe("log", SubscriptionOptions::new(StartPosition::AllAvailable))
            .await
            .unwrap();
        assert_eq!(drain(&mut all, 5).await.len(), 5);

        let mut last = subscriber
            .subscribe("log", SubscriptionOptions::new(StartPosition::LastReceived))
            .await
            .unwrap();
        assert_eq!(drain(&mut last, 1).await[0].sequence, 5);

        let mut from_seq = subscriber
            .subscribe("log", SubscriptionOptions::new(StartPosition::Sequence(4)))
            .await
            .unwrap();
        let got = drain(&mut from_seq, 2).await;
        assert_eq!(got.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![4, 5]);

        let mut recent = subscriber
            .subscribe(
                "log",
                SubscriptionOptions::new(StartPosition::TimeDelta(Duration::from_secs(60))),
            )
            .await
            .unwrap();
        assert_eq!(drain(&mut recent, 5).await.len(), 5);

        let mut new_only = subscriber
            .subscribe("log", SubscriptionOptions::new(StartPosition::NewOnly))
            .await
            .unwrap();
        publisher.publish("log", Bytes::from_static(b"n")).await.unwrap();
        assert_eq!(drain(&mut new_only, 1).await[0].sequence, 6);
    }

    #[tokio::test]
    async fn test_unsubscribe_detaches_before_returning() {
        let broker = LoopbackBroker::new("test-cluster");
        let conn = broker.connect("sub").await.unwrap();
        let sub = conn.subscribe("foo", SubscriptionOptions::default()).await.unwrap();
        assert_eq!(broker.subscriber_count("foo"), 1);
        sub.unsubscribe().await.unwrap();
        assert_eq!(broker.subscriber_count("foo"), 0);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_publish() {
        let broker = LoopbackBroker::new("test-cluster");
        let conn = broker.connect("pub").await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(
            conn.publish("foo", Bytes::new()).await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_publish_async_acks() {
        let broker = LoopbackBroker::new("test-cluster");
        let conn = broker.connect("pub").await.unwrap();
        let ack = conn.publish_async("foo", Bytes::from_static(b"abc")).await.unwrap();
        let guid = ack.await.unwrap();
        assert_eq!(guid.len(), 32);
        assert_eq!(conn.stats().out_bytes, 3);
    }
}
