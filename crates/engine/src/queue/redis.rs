use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::{Delivery, Queue, QueueError};

/// Consumer group created on every queue stream.
const CONSUMER_GROUP: &str = "factory";

/// Pause before handing back a pending entry, so a message whose handler
/// keeps failing cannot busy-loop the consumer. SQS gets this for free
/// from its visibility timeout; streams redeliver instantly.
const REDELIVERY_DELAY: Duration = Duration::from_secs(1);

/// Redis streams implementation of the queue contract.
///
/// Each queue is one stream with one consumer group. Receiving first
/// re-reads the consumer's own pending entries (`ID=0`) so messages that
/// were delivered but never deleted redeliver, then blocks on new
/// entries. Deleting a message is `XACK` by entry id.
pub struct RedisQueue {
    conn: MultiplexedConnection,
}

impl RedisQueue {
    /// Connect to Redis.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        tracing::info!("connecting to Redis");

        let client = ::redis::Client::open(redis_url)
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let queue = Self { conn };
        queue.health_check().await?;
        tracing::info!("Redis connection established");

        Ok(queue)
    }

    /// Verify the connection is alive (PING).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        if pong != "PONG" {
            return Err(QueueError::Command(format!(
                "unexpected PING response: {}",
                pong
            )));
        }
        Ok(())
    }

    async fn read_group(
        &self,
        url: &str,
        consumer: &str,
        id: &str,
        block: Option<Duration>,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();

        let mut cmd = ::redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(CONSUMER_GROUP).arg(consumer);
        if let Some(wait) = block {
            cmd.arg("BLOCK").arg(wait.as_millis() as u64);
        }
        cmd.arg("COUNT").arg(1).arg("STREAMS").arg(url).arg(id);

        let value: Option<::redis::Value> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        Ok(parse_xreadgroup_response(value))
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn queue_url(&self, name: &str) -> String {
        name.to_string()
    }

    async fn create_queue(&self, name: &str) -> Result<String, QueueError> {
        let mut conn = self.conn.clone();

        // XGROUP CREATE <stream> <group> $ MKSTREAM
        // $ = only read entries sent after creation.
        let result: Result<String, ::redis::RedisError> = ::redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(name)
            .arg(CONSUMER_GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                tracing::debug!(queue = name, group = CONSUMER_GROUP, "created queue");
            }
            Err(e) => {
                if e.to_string().contains("BUSYGROUP") {
                    tracing::debug!(queue = name, "queue already exists, skipping");
                } else {
                    return Err(QueueError::Command(format!(
                        "failed to create queue {}: {}",
                        name, e
                    )));
                }
            }
        }

        Ok(self.queue_url(name))
    }

    async fn delete_queue(&self, url: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        let _: i64 = ::redis::cmd("DEL")
            .arg(url)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        tracing::debug!(queue = url, "deleted queue");
        Ok(())
    }

    async fn send(&self, url: &str, body: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        let entry_id: String = ::redis::cmd("XADD")
            .arg(url)
            .arg("*")
            .arg("data")
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        tracing::debug!(queue = url, entry_id = %entry_id, "sent message");
        Ok(())
    }

    async fn receive(
        &self,
        url: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        // Pending first: redeliver our own unacknowledged entries, paced
        // within the long-poll budget.
        if let Some(delivery) = self.read_group(url, consumer, "0", None).await? {
            tokio::time::sleep(REDELIVERY_DELAY.min(wait)).await;
            tracing::debug!(
                queue = url,
                consumer = consumer,
                receipt = %delivery.receipt,
                "redelivered pending message"
            );
            return Ok(Some(delivery));
        }

        self.read_group(url, consumer, ">", Some(wait)).await
    }

    async fn delete_message(&self, url: &str, receipt: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        let _: i64 = ::redis::cmd("XACK")
            .arg(url)
            .arg(CONSUMER_GROUP)
            .arg(receipt)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        Ok(())
    }
}

/// Parse the XREADGROUP response into a delivery.
/// Redis returns: [[stream_name, [[entry_id, [field, value, ...]]]]]
fn parse_xreadgroup_response(value: Option<::redis::Value>) -> Option<Delivery> {
    let streams = match value? {
        ::redis::Value::Array(arr) => arr,
        _ => return None,
    };

    for stream_pair in streams {
        let pair = match stream_pair {
            ::redis::Value::Array(p) => p,
            _ => continue,
        };
        if pair.len() < 2 {
            continue;
        }

        let entries = match &pair[1] {
            ::redis::Value::Array(e) => e,
            _ => continue,
        };

        for entry in entries {
            let entry_pair = match entry {
                ::redis::Value::Array(ep) => ep,
                _ => continue,
            };
            if entry_pair.len() < 2 {
                continue;
            }

            let entry_id = match &entry_pair[0] {
                ::redis::Value::BulkString(b) => String::from_utf8_lossy(b).to_string(),
                _ => continue,
            };

            let fields = match &entry_pair[1] {
                ::redis::Value::Array(f) => f,
                _ => continue,
            };

            if let Some(body) = extract_data_field(fields) {
                return Some(Delivery {
                    body,
                    receipt: entry_id,
                });
            }
        }
    }

    None
}

/// Extract the "data" field from a stream entry's field/value pairs.
fn extract_data_field(fields: &[::redis::Value]) -> Option<String> {
    // Fields are [key, value, key, value, ...]
    let mut i = 0;
    while i + 1 < fields.len() {
        let key = match &fields[i] {
            ::redis::Value::BulkString(b) => String::from_utf8_lossy(b).to_string(),
            _ => {
                i += 2;
                continue;
            }
        };

        if key == "data" {
            return match &fields[i + 1] {
                ::redis::Value::BulkString(b) => Some(String::from_utf8_lossy(b).to_string()),
                _ => None,
            };
        }

        i += 2;
    }
    None
}
