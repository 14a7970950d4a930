//! At-least-once work queue with visibility timeouts and a dead-letter path.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use timetable_core::{JobId, MessageId};

use super::types::{DeadLetterEntry, Delivery, Receipt};

/// Queue abstraction.
///
/// A received message stays invisible for the visibility timeout; if it is neither
/// acknowledged nor released in that window it is delivered again.
#[async_trait::async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Enqueue a job-ready notification. A job that already has a live message keeps
    /// it and gets its id back.
    async fn enqueue(&self, job_id: JobId) -> Result<MessageId, QueueError>;

    /// Next visible message, if any.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Delete the message. Acknowledging an already deleted message is a no-op.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Negative acknowledgement: make the message visible again after `delay`.
    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Push the visibility deadline to `now + timeout`.
    async fn extend_visibility(&self, delivery: &Delivery, timeout: Duration)
    -> Result<(), QueueError>;

    /// Move the message to the dead-letter queue.
    async fn dead_letter(&self, delivery: &Delivery, reason: String) -> Result<(), QueueError>;

    /// Oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Move a dead-lettered message back onto the queue with a fresh receive count.
    async fn redrive(&self, message_id: MessageId) -> Result<MessageId, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    fn visibility_timeout(&self) -> Duration;

    /// Deliveries beyond this count are poison.
    fn max_receive_count(&self) -> u32;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),
    #[error("receipt for message {0} is stale")]
    StaleReceipt(MessageId),
    #[error("queue backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Ready to be received.
    pub visible: usize,
    /// Received and not yet acknowledged.
    pub in_flight: usize,
    /// Released with a backoff delay.
    pub delayed: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(120),
            max_receive_count: 3,
        }
    }
}

#[derive(Debug)]
struct Message {
    job_id: JobId,
    enqueued_at: DateTime<Utc>,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<Receipt>,
}

#[derive(Debug, Default)]
struct Inner {
    // MessageId is UUIDv7, so key order is enqueue order.
    messages: BTreeMap<MessageId, Message>,
    dead: Vec<DeadLetterEntry>,
}

impl Inner {
    fn push(&mut self, job_id: JobId, now: Instant) -> MessageId {
        if let Some((id, _)) = self.messages.iter().find(|(_, m)| m.job_id == job_id) {
            return *id;
        }
        let id = MessageId::new();
        self.messages.insert(
            id,
            Message {
                job_id,
                enqueued_at: Utc::now(),
                receive_count: 0,
                visible_at: now,
                receipt: None,
            },
        );
        id
    }

    fn current(&mut self, delivery: &Delivery) -> Result<&mut Message, QueueError> {
        let message = self
            .messages
            .get_mut(&delivery.message_id)
            .ok_or(QueueError::MessageNotFound(delivery.message_id))?;
        if message.receipt != Some(delivery.receipt) {
            return Err(QueueError::StaleReceipt(delivery.message_id));
        }
        Ok(message)
    }
}

/// In-memory queue for tests/dev.
///
/// Visibility follows `tokio::time`, so tests can expire deliveries with paused time.
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
}

impl InMemoryWorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait::async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, job_id: JobId) -> Result<MessageId, QueueError> {
        let mut inner = self.inner.lock().await;
        let id = inner.push(job_id, Instant::now());
        debug!(job_id = %job_id, message_id = %id, "enqueued");
        Ok(id)
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let Some((id, message)) = inner.messages.iter_mut().find(|(_, m)| m.visible_at <= now) else {
            return Ok(None);
        };

        let receipt = Receipt::new();
        message.receive_count += 1;
        message.receipt = Some(receipt);
        message.visible_at = now + self.config.visibility_timeout;

        Ok(Some(Delivery {
            message_id: *id,
            job_id: message.job_id,
            receipt,
            receive_count: message.receive_count,
            enqueued_at: message.enqueued_at,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner.lock().await.messages.remove(&delivery.message_id);
        Ok(())
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let message = inner.current(delivery)?;
        message.visible_at = Instant::now() + delay;
        message.receipt = None;
        Ok(())
    }

    async fn extend_visibility(
        &self,
        delivery: &Delivery,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let message = inner.current(delivery)?;
        message.visible_at = Instant::now() + timeout;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: String) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let message = inner
            .messages
            .remove(&delivery.message_id)
            .ok_or(QueueError::MessageNotFound(delivery.message_id))?;
        warn!(
            job_id = %message.job_id,
            message_id = %delivery.message_id,
            receive_count = message.receive_count,
            reason = %reason,
            "message dead-lettered"
        );
        inner.dead.push(DeadLetterEntry::new(delivery, reason));
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.dead.iter().take(limit).cloned().collect())
    }

    async fn redrive(&self, message_id: MessageId) -> Result<MessageId, QueueError> {
        let mut inner = self.inner.lock().await;
        let pos = inner
            .dead
            .iter()
            .position(|e| e.message_id == message_id)
            .ok_or(QueueError::MessageNotFound(message_id))?;
        let entry = inner.dead.remove(pos);
        let id = inner.push(entry.job_id, Instant::now());
        debug!(job_id = %entry.job_id, old_message_id = %message_id, message_id = %id, "redriven");
        Ok(id)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let mut stats = QueueStats {
            dead_lettered: inner.dead.len(),
            ..Default::default()
        };
        for message in inner.messages.values() {
            if message.visible_at <= now {
                stats.visible += 1;
            } else if message.receipt.is_some() {
                stats.in_flight += 1;
            } else {
                stats.delayed += 1;
            }
        }
        Ok(stats)
    }

    fn visibility_timeout(&self) -> Duration {
        self.config.visibility_timeout
    }

    fn max_receive_count(&self) -> u32 {
        self.config.max_receive_count
    }
}
