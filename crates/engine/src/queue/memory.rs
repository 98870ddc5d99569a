use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Delivery, Queue, QueueError};

/// In-process queue with the at-least-once contract of [`RedisQueue`].
///
/// Messages stay at the front of the queue until deleted by receipt, so a
/// consumer that fails its handler sees the same message again, which
/// is the behavior the scheduling tests assert on.
///
/// [`RedisQueue`]: super::RedisQueue
#[derive(Default)]
pub struct MemQueue {
    inner: Mutex<HashMap<String, VecDeque<MemMessage>>>,
    notify: Notify,
}

#[derive(Clone)]
struct MemMessage {
    receipt: String,
    body: String,
}

impl MemQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a queue currently exists.
    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains_key(name)
    }

    /// Snapshot the undeleted message bodies of a queue.
    pub fn messages(&self, name: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .get(name)
            .map(|q| q.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Queue for MemQueue {
    fn queue_url(&self, name: &str) -> String {
        name.to_string()
    }

    async fn create_queue(&self, name: &str) -> Result<String, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(name.to_string()).or_default();
        Ok(name.to_string())
    }

    async fn delete_queue(&self, url: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.remove(url) {
            Some(_) => {
                drop(inner);
                self.notify.notify_waiters();
                Ok(())
            }
            None => Err(QueueError::Command(format!("no such queue: {}", url))),
        }
    }

    async fn send(&self, url: &str, body: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(url) {
            Some(queue) => {
                queue.push_back(MemMessage {
                    receipt: Uuid::new_v4().to_string(),
                    body: body.to_string(),
                });
                drop(inner);
                self.notify.notify_waiters();
                Ok(())
            }
            None => Err(QueueError::Command(format!("no such queue: {}", url))),
        }
    }

    async fn receive(
        &self,
        url: &str,
        _consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            {
                let inner = self.inner.lock().unwrap();
                let queue = inner
                    .get(url)
                    .ok_or_else(|| QueueError::Command(format!("no such queue: {}", url)))?;
                if let Some(msg) = queue.front() {
                    return Ok(Some(Delivery {
                        body: msg.body.clone(),
                        receipt: msg.receipt.clone(),
                    }));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn delete_message(&self, url: &str, receipt: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(url) {
            Some(queue) => {
                queue.retain(|m| m.receipt != receipt);
                Ok(())
            }
            None => Err(QueueError::Command(format!("no such queue: {}", url))),
        }
    }
}
