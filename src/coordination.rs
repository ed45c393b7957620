//! # Worker Coordination Primitives
//!
//! Publishers and subscribers run as independent tokio tasks. The only
//! coordination between them is collected here:
//!
//! - [`StartupLatch`]: publishers wait until every subscriber has registered
//!   its subscription, so nothing published is missed. Each subscriber holds
//!   a [`LatchGuard`] that releases its slot exactly once, either explicitly
//!   or when the guard is dropped on an error or panic path.
//! - [`QueueGroupTracker`]: shared progress of subscribers that form one
//!   queue group, where the broker hands each message to a single member.
//! - [`AbortSignal`]: raised by the harness when a worker fails so that
//!   subscribers stop waiting for messages that will never arrive.
//!
//! The completion barrier itself is the harness joining every worker task.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Payload published by a queue-group member to wake the remaining members
pub const QUEUE_DONE_SENTINEL: &[u8] = b"done";

/// Count-down latch released once every participant has arrived
#[derive(Clone)]
pub struct StartupLatch {
    remaining: Arc<watch::Sender<usize>>,
}

impl StartupLatch {
    pub fn new(participants: usize) -> Self {
        let (tx, _rx) = watch::channel(participants);
        Self {
            remaining: Arc::new(tx),
        }
    }

    /// Slot for one participant; dropping it counts as arriving
    pub fn guard(&self) -> LatchGuard {
        LatchGuard {
            latch: Some(self.remaining.clone()),
        }
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Wait until every participant has arrived
    pub async fn wait(&self) {
        let mut rx = self.remaining.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|remaining| *remaining == 0).await;
    }
}

/// One participant's slot in a [`StartupLatch`]
pub struct LatchGuard {
    latch: Option<Arc<watch::Sender<usize>>>,
}

impl LatchGuard {
    /// Mark this participant ready; later calls and the drop are no-ops
    pub fn arrive(&mut self) {
        if let Some(latch) = self.latch.take() {
            latch.send_modify(|remaining| *remaining = remaining.saturating_sub(1));
        }
    }
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.arrive();
    }
}

/// Group-wide progress for subscribers sharing a queue group
///
/// The broker delivers each message to one member only, so the target is a
/// group total rather than a per-member count. The member that observes the
/// total reaching the target finishes; the others are woken through
/// [`QUEUE_DONE_SENTINEL`] messages published by departing members.
#[derive(Debug)]
pub struct QueueGroupTracker {
    target: u64,
    total_received: AtomicU64,
    members_left: AtomicUsize,
}

impl QueueGroupTracker {
    pub fn new(target: u64, members: usize) -> Arc<Self> {
        Arc::new(Self {
            target,
            total_received: AtomicU64::new(0),
            members_left: AtomicUsize::new(members),
        })
    }

    /// Count one data message; returns true once the group target is reached
    pub fn record_message(&self) -> bool {
        let total = self.total_received.fetch_add(1, Ordering::AcqRel) + 1;
        total >= self.target
    }

    pub fn is_complete(&self) -> bool {
        self.total_received.load(Ordering::Acquire) >= self.target
    }

    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Acquire)
    }

    /// Leave the group; returns how many members are still active
    pub fn member_done(&self) -> usize {
        let previous = self
            .members_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let left = previous.saturating_sub(1);
        debug!("Queue group member finished, {} still active", left);
        left
    }
}

/// Run-wide flag raised when any worker fails
#[derive(Clone)]
pub struct AbortSignal {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { flag: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.flag.send_if_modified(|raised| {
            let changed = !*raised;
            *raised = true;
            changed
        });
    }

    pub fn is_triggered(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolve once the signal has been raised
    pub async fn triggered(&self) {
        let mut rx = self.flag.subscribe();
        let _ = rx.wait_for(|raised| *raised).await;
    }
}
