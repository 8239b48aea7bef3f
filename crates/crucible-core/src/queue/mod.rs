//! Durable job queue abstraction
//!
//! An at-least-once message channel with per-queue TTL, dead-letter
//! routing and consumer-side flow control (one unacknowledged delivery per
//! consumer slot). The trait is the seam: the worker and gateway only see
//! [`JobQueue`]/[`QueueConsumer`], so tests run against a fake and the
//! embedded [`durable::DurableQueue`] broker can be swapped for a
//! networked one without touching either side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::core_types::RetryEnvelope;
use crate::errors::CrucibleError;

pub mod durable;

pub use durable::DurableQueue;

pub const CODE_EXECUTION_QUEUE: &str = "code_execution";
pub const CODE_EXECUTION_DLQ: &str = "code_execution_dlq";
pub const NOTIFICATIONS_QUEUE: &str = "notifications";

/// Declaration of one queue: name, optional message TTL, optional
/// dead-letter destination for expired or rejected messages, and how long
/// a claimed delivery may go unacknowledged before it is presumed
/// orphaned by a dead consumer and returned to the ready set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub message_ttl_ms: Option<u64>,
    pub dead_letter_to: Option<String>,
    #[serde(default = "default_redelivery_timeout_ms")]
    pub redelivery_timeout_ms: u64,
}

fn default_redelivery_timeout_ms() -> u64 {
    60_000
}

impl QueueSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            message_ttl_ms: None,
            dead_letter_to: None,
            redelivery_timeout_ms: default_redelivery_timeout_ms(),
        }
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.message_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn dead_letter_to(mut self, target: &str) -> Self {
        self.dead_letter_to = Some(target.to_string());
        self
    }

    pub fn redeliver_after(mut self, timeout_ms: u64) -> Self {
        self.redelivery_timeout_ms = timeout_ms;
        self
    }
}

/// The standard three-queue topology: a TTL-bounded main queue
/// dead-lettering into its DLQ, plus a TTL-bounded notification queue.
pub fn standard_topology(config: &QueueConfig) -> Vec<QueueSpec> {
    vec![
        QueueSpec::new(CODE_EXECUTION_QUEUE)
            .with_ttl(config.message_ttl_ms)
            .dead_letter_to(CODE_EXECUTION_DLQ),
        QueueSpec::new(CODE_EXECUTION_DLQ),
        QueueSpec::new(NOTIFICATIONS_QUEUE).with_ttl(config.notification_ttl_ms),
    ]
}

/// One persisted message: the journal file on disk is exactly this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub envelope: RetryEnvelope,
    pub enqueued_at: DateTime<Utc>,
}

/// An unacknowledged delivery held by a consumer slot.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub message: QueuedMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDepth {
    pub ready: usize,
    pub in_flight: usize,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably enqueue a payload; returns the assigned message id.
    async fn publish(
        &self,
        queue: &str,
        payload: serde_json::Value,
        envelope: RetryEnvelope,
    ) -> Result<String, CrucibleError>;

    /// Open a consumer slot with prefetch = 1.
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, CrucibleError>;

    async fn depth(&self, queue: &str) -> Result<QueueDepth, CrucibleError>;
}

#[async_trait]
pub trait QueueConsumer: Send {
    /// Await the next delivery. Fails if a previous delivery is still
    /// unacknowledged: the slot holds at most one message at a time.
    async fn next_delivery(&mut self) -> Result<Delivery, CrucibleError>;

    /// Acknowledge and discard the delivery.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), CrucibleError>;

    /// Reject: back onto the queue when `requeue`, otherwise to the
    /// queue's dead-letter destination (or dropped if it has none).
    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), CrucibleError>;
}
