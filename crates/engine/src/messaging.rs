use std::future::Future;

use factory_common::config::MessagingConfig;
use factory_common::ids::NodeId;
use factory_common::types::{RunMsg, ScheduleMsg};

use crate::queue::{Queue, QueueError};

/// Deterministic queue name for a node, so an agent can address (and a
/// reaper can delete) a queue knowing only the node id.
pub fn node_queue_name(cfg: &MessagingConfig, node_id: NodeId) -> String {
    format!("{}{}", cfg.node_queue_prefix, node_id)
}

/// Create the private queue for a node.
pub async fn create_node_queue(
    queue: &dyn Queue,
    cfg: &MessagingConfig,
    node_id: NodeId,
) -> Result<String, QueueError> {
    queue.create_queue(&node_queue_name(cfg, node_id)).await
}

/// Delete the private queue for a node.
pub async fn delete_node_queue(
    queue: &dyn Queue,
    cfg: &MessagingConfig,
    node_id: NodeId,
) -> Result<(), QueueError> {
    let url = queue.queue_url(&node_queue_name(cfg, node_id));
    queue.delete_queue(&url).await
}

/// Post one placement request to the schedule queue.
pub async fn send_schedule_message(
    queue: &dyn Queue,
    cfg: &MessagingConfig,
    msg: &ScheduleMsg,
) -> Result<(), QueueError> {
    let body = serde_json::to_string(msg).map_err(|e| QueueError::Command(e.to_string()))?;
    let url = queue.queue_url(&cfg.schedule_queue_name);

    tracing::debug!(queue = %url, body = %body, "sending schedule message");
    queue.send(&url, &body).await
}

/// Dispatch one run directive to a node's private queue.
pub async fn send_node_message(
    queue: &dyn Queue,
    cfg: &MessagingConfig,
    node_id: NodeId,
    msg: &RunMsg,
) -> Result<(), QueueError> {
    let body = serde_json::to_string(msg).map_err(|e| QueueError::Command(e.to_string()))?;
    let url = queue.queue_url(&node_queue_name(cfg, node_id));

    tracing::debug!(queue = %url, body = %body, "sending node message");
    queue.send(&url, &body).await
}

/// Long-poll one message from the schedule queue and hand the body to
/// `handler`. The message is deleted iff the handler reports success;
/// otherwise it stays queued and redelivers.
///
/// Returns whether a message was received at all.
pub async fn next_schedule_message<F, Fut>(
    queue: &dyn Queue,
    cfg: &MessagingConfig,
    consumer: &str,
    handler: F,
) -> Result<bool, QueueError>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = bool>,
{
    let url = queue.queue_url(&cfg.schedule_queue_name);
    next_message(queue, &url, consumer, cfg, handler).await
}

/// Like [`next_schedule_message`], for a node's private queue.
pub async fn next_node_message<F, Fut>(
    queue: &dyn Queue,
    cfg: &MessagingConfig,
    node_id: NodeId,
    consumer: &str,
    handler: F,
) -> Result<bool, QueueError>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = bool>,
{
    let url = queue.queue_url(&node_queue_name(cfg, node_id));
    next_message(queue, &url, consumer, cfg, handler).await
}

async fn next_message<F, Fut>(
    queue: &dyn Queue,
    url: &str,
    consumer: &str,
    cfg: &MessagingConfig,
    handler: F,
) -> Result<bool, QueueError>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = bool>,
{
    let delivery = match queue.receive(url, consumer, cfg.receive_wait()).await? {
        Some(d) => d,
        None => return Ok(false),
    };

    if handler(delivery.body).await {
        queue.delete_message(url, &delivery.receipt).await?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemQueue;
    use factory_common::ids::ClaimId;

    #[test]
    fn node_queue_names_are_prefixed_and_deterministic() {
        let cfg = MessagingConfig::default();
        let node_id = NodeId::new();
        let name = node_queue_name(&cfg, node_id);
        assert_eq!(name, format!("factory-node-{}", node_id));
        assert_eq!(name, node_queue_name(&cfg, node_id));
    }

    #[tokio::test]
    async fn handler_failure_leaves_message_queued() {
        let cfg = MessagingConfig {
            receive_wait_secs: 0,
            ..Default::default()
        };
        let queue = MemQueue::new();
        queue.create_queue(&cfg.schedule_queue_name).await.unwrap();

        let msg = ScheduleMsg {
            pool_id: "workers".to_string(),
            size: 2,
        };
        send_schedule_message(&queue, &cfg, &msg).await.unwrap();

        let received = next_schedule_message(&queue, &cfg, "pump", |_| async { false })
            .await
            .unwrap();
        assert!(received);
        assert_eq!(queue.messages(&cfg.schedule_queue_name).len(), 1);

        let received = next_schedule_message(&queue, &cfg, "pump", |body| async move {
            let decoded: ScheduleMsg = serde_json::from_str(&body).unwrap();
            decoded.size == 2
        })
        .await
        .unwrap();
        assert!(received);
        assert!(queue.messages(&cfg.schedule_queue_name).is_empty());
    }

    #[tokio::test]
    async fn run_directives_land_on_the_node_queue() {
        let cfg = MessagingConfig::default();
        let queue = MemQueue::new();
        let node_id = NodeId::new();
        create_node_queue(&queue, &cfg, node_id).await.unwrap();

        let msg = RunMsg {
            size: 3,
            claim_id: ClaimId::new(),
        };
        send_node_message(&queue, &cfg, node_id, &msg).await.unwrap();

        let bodies = queue.messages(&node_queue_name(&cfg, node_id));
        assert_eq!(bodies.len(), 1);
        let decoded: RunMsg = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(decoded, msg);
    }
}
