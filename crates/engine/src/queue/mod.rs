mod memory;
mod redis;

pub use memory::MemQueue;
pub use redis::RedisQueue;

use std::time::Duration;

use async_trait::async_trait;

/// One received message: opaque UTF-8 body plus the receipt handle that
/// deletes it.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub body: String,
    pub receipt: String,
}

/// Messaging contract the engine consumes.
///
/// Queues are at-least-once: a received message stays deliverable until
/// explicitly deleted by receipt, so consumers must tolerate duplicates
/// and only delete after handling succeeds.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Deterministic URL for a queue name, so callers can address a queue
    /// (including a previous incarnation's) without creating it.
    fn queue_url(&self, name: &str) -> String;

    /// Create a queue. Safe to call for an existing queue.
    async fn create_queue(&self, name: &str) -> Result<String, QueueError>;

    /// Delete a queue and everything still in it.
    async fn delete_queue(&self, url: &str) -> Result<(), QueueError>;

    /// Send one message body.
    async fn send(&self, url: &str, body: &str) -> Result<(), QueueError>;

    /// Receive up to one message, long-polling up to `wait`.
    async fn receive(
        &self,
        url: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    /// Delete a received message by receipt handle.
    async fn delete_message(&self, url: &str, receipt: &str) -> Result<(), QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),
}

impl From<QueueError> for factory_common::FactoryError {
    fn from(e: QueueError) -> Self {
        factory_common::FactoryError::Queue(e.to_string())
    }
}
