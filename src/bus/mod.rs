//! In-process message bus for coordinating agents
//!
//! Per-agent mailboxes with priority-then-FIFO delivery. The bus is a
//! pure transport: no retry, no persistence, and messages published to
//! agents without an active subscription are dropped.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Message category on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Query,
    Result,
    Error,
    Status,
    Heartbeat,
}

/// Delivery priority. Critical drains before High before Normal before Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Message destination: a single agent or every current subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "agent_id", rename_all = "lowercase")]
pub enum Recipient {
    Agent(String),
    Broadcast,
}

/// Envelope exchanged between agents during a coordination round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Sending agent id
    pub from: String,

    /// Destination
    pub to: Recipient,

    pub kind: MessageKind,

    pub priority: MessagePriority,

    /// Correlates request/response pairs across the round
    pub correlation_id: Option<String>,

    /// Opaque payload
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(
        from: impl Into<String>,
        to: Recipient,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            from: from.into(),
            to,
            kind,
            priority: MessagePriority::Normal,
            correlation_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A message waiting in a mailbox, ordered by priority then publish sequence.
struct Queued {
    priority: MessagePriority,
    seq: u64,
    message: AgentMessage,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier publish first
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Mailbox {
    queue: Mutex<BinaryHeap<Queued>>,
    notify: Arc<Notify>,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&self, entry: Queued) {
        self.queue.lock().expect("mailbox lock poisoned").push(entry);
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<AgentMessage> {
        let mut queue = self.queue.lock().expect("mailbox lock poisoned");
        let mut out = Vec::with_capacity(queue.len());
        while let Some(entry) = queue.pop() {
            out.push(entry.message);
        }
        out
    }
}

/// In-process publish/subscribe hub keyed by agent id.
///
/// Each mailbox is independently locked, so publishes to different
/// agents never contend. Scoped to an orchestrator instance; there is
/// no process-wide bus.
///
/// # Examples
///
/// ```
/// use cohort::bus::{AgentMessage, MessageBus, MessageKind, Recipient};
///
/// let bus = MessageBus::new();
/// bus.subscribe("worker-1");
/// bus.publish(AgentMessage::new(
///     "orchestrator",
///     Recipient::Agent("worker-1".into()),
///     MessageKind::Query,
///     serde_json::json!({"ask": "status"}),
/// ));
/// assert_eq!(bus.drain("worker-1").len(), 1);
/// ```
pub struct MessageBus {
    mailboxes: DashMap<String, Arc<Mailbox>>,
    seq: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            mailboxes: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Open a mailbox for an agent. Idempotent: an existing mailbox and
    /// its pending messages are kept.
    pub fn subscribe(&self, agent_id: impl Into<String>) {
        self.mailboxes
            .entry(agent_id.into())
            .or_insert_with(|| Arc::new(Mailbox::new()));
    }

    /// Close an agent's mailbox, dropping any pending messages.
    pub fn unsubscribe(&self, agent_id: &str) {
        self.mailboxes.remove(agent_id);
    }

    /// Whether the agent currently has a mailbox.
    pub fn is_subscribed(&self, agent_id: &str) -> bool {
        self.mailboxes.contains_key(agent_id)
    }

    /// Publish a message.
    ///
    /// Direct messages to agents without a mailbox are dropped and
    /// counted; broadcast goes to every subscriber except the sender.
    pub fn publish(&self, message: AgentMessage) {
        metrics::counter!("cohort_bus_published_total").increment(1);

        match message.to.clone() {
            Recipient::Agent(agent_id) => {
                if let Some(mailbox) = self.mailboxes.get(&agent_id) {
                    let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
                    mailbox.push(Queued {
                        priority: message.priority,
                        seq,
                        message,
                    });
                } else {
                    metrics::counter!("cohort_bus_dropped_total").increment(1);
                    tracing::trace!(
                        agent_id = %agent_id,
                        from = %message.from,
                        "Dropped message for unsubscribed agent"
                    );
                }
            }
            Recipient::Broadcast => {
                let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
                for entry in self.mailboxes.iter() {
                    if entry.key() == &message.from {
                        continue;
                    }
                    entry.value().push(Queued {
                        priority: message.priority,
                        seq,
                        message: message.clone(),
                    });
                }
            }
        }
    }

    /// Remove and return all pending messages for an agent, highest
    /// priority first, publish order within a priority level.
    pub fn drain(&self, agent_id: &str) -> Vec<AgentMessage> {
        self.mailboxes
            .get(agent_id)
            .map(|mailbox| mailbox.drain())
            .unwrap_or_default()
    }

    /// Drain, waiting up to `timeout` for at least one message to arrive.
    ///
    /// Returns an empty vec if the deadline passes with nothing queued
    /// or the agent is not subscribed.
    pub async fn drain_wait(&self, agent_id: &str, timeout: Duration) -> Vec<AgentMessage> {
        let Some(notify) = self.mailboxes.get(agent_id).map(|m| m.notify.clone()) else {
            return Vec::new();
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = self.drain(agent_id);
            if !drained.is_empty() {
                return drained;
            }
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return self.drain(agent_id);
            }
        }
    }

    /// Number of open mailboxes.
    pub fn subscriber_count(&self) -> usize {
        self.mailboxes.len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
