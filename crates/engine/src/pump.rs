use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use factory_common::types::{Claim, Node, ScheduleMsg};
use factory_common::{FactoryError, Result};

use crate::engine::{epoch_now, Engine};
use crate::messaging;

/// Consumer name the pump registers on the schedule queue.
const PUMP_CONSUMER: &str = "pump";

impl Engine {
    /// Run the singleton control loop until shutdown is signalled: a
    /// schedule-message consumer plus a periodic reaper for expired
    /// claims and nodes. Reap failures are transport-level and
    /// propagate; the orchestrator is expected to restart the process.
    pub async fn pump(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("started engine pump");

        let consumer = {
            let engine = Arc::clone(&self);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move { engine.handle_schedule_messages(shutdown_rx).await })
        };

        let period = self.config.pump.cycle_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let result = self.shutdown_pump(consumer).await;
                    tracing::info!("exited engine pump");
                    return result;
                }
                _ = ticker.tick() => {
                    tracing::debug!("started pump cycle");
                    metrics::counter!("factory.pump.cycles").increment(1);

                    if let Err(e) = self.expire_claims().await {
                        tracing::info!("exited engine pump");
                        return Err(FactoryError::Internal(format!(
                            "failed to expire claims: {}", e
                        )));
                    }
                    if let Err(e) = self.expire_nodes().await {
                        tracing::info!("exited engine pump");
                        return Err(FactoryError::Internal(format!(
                            "failed to expire nodes: {}", e
                        )));
                    }
                }
            }
        }
    }

    /// Drain the schedule queue: long-poll one message at a time, decode
    /// it, and attempt placement. The message is deleted only when
    /// placement succeeded; decode failures and placement failures leave
    /// it queued for redelivery.
    async fn handle_schedule_messages(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!("start handling schedule messages");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown_rx.changed() => break,
                r = messaging::next_schedule_message(
                    self.queue.as_ref(),
                    &self.config.messaging,
                    PUMP_CONSUMER,
                    |body| self.handle_schedule_body(body),
                ) => r,
            };

            if let Err(e) = received {
                tracing::error!(error = %e, "failed to receive next schedule message");
                break;
            }
        }

        tracing::info!("stopped handling schedule messages");
    }

    async fn handle_schedule_body(&self, body: String) -> bool {
        tracing::info!(body = %body, "received schedule message");

        let msg: ScheduleMsg = match serde_json::from_str(&body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "failed to decode schedule message");
                return false;
            }
        };

        if let Err(e) = self.schedule(&msg.pool_id, msg.size).await {
            tracing::info!(body = %body, error = %e, "failed to schedule request");
            return false;
        }

        true
    }

    /// Scan every claim scatter partition for lapsed claims and release
    /// each: capacity back, task re-submitted, record deleted.
    pub async fn expire_claims(&self) -> Result<()> {
        let expired = self.scan_expired_claims().await?;

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "found expired claims");
        }
        for claim in &expired {
            self.release(claim).await.map_err(|e| {
                FactoryError::Internal(format!("failed to release claim {}: {}", claim.id, e))
            })?;
            metrics::counter!("factory.claims.expired").increment(1);
        }

        Ok(())
    }

    /// Scan every node scatter partition for lapsed nodes; each is
    /// removed (record and queue) and its surviving claims evicted.
    pub async fn expire_nodes(&self) -> Result<()> {
        let expired = self.scan_expired_nodes().await?;

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "found expired nodes");
        }
        for node in &expired {
            self.delete_node(node.id).await.map_err(|e| {
                FactoryError::Internal(format!("failed to delete node {}: {}", node.id, e))
            })?;
            self.evict(node.id).await.map_err(|e| {
                FactoryError::Internal(format!(
                    "failed to evict claims of node {}: {}",
                    node.id, e
                ))
            })?;
            metrics::counter!("factory.nodes.expired").increment(1);
        }

        Ok(())
    }

    async fn scan_expired_claims(&self) -> Result<Vec<Claim>> {
        let now = epoch_now();
        let mut expired = Vec::new();
        for partition in 0..self.config.lifecycle.claim_scatter {
            expired.extend(
                self.store
                    .expired_claims(
                        partition,
                        now,
                        self.config.pump.max_expired_claims_per_partition,
                    )
                    .await
                    .map_err(FactoryError::from)?,
            );
        }
        Ok(expired)
    }

    async fn scan_expired_nodes(&self) -> Result<Vec<Node>> {
        let now = epoch_now();
        let mut expired = Vec::new();
        for partition in 0..self.config.lifecycle.node_scatter {
            expired.extend(
                self.store
                    .expired_nodes(
                        partition,
                        now,
                        self.config.pump.max_expired_nodes_per_partition,
                    )
                    .await
                    .map_err(FactoryError::from)?,
            );
        }
        Ok(expired)
    }

    async fn shutdown_pump(&self, consumer: JoinHandle<()>) -> Result<()> {
        tracing::info!("waiting for schedule routine to exit");

        match tokio::time::timeout(self.config.lifecycle.shutdown_grace(), consumer).await {
            Ok(_) => Ok(()),
            Err(_) => Err(FactoryError::Timeout(
                "pump schedule routine did not exit in time".to_string(),
            )),
        }
    }
}
