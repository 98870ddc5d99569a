use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use factory_common::ids::NodeId;
use factory_common::types::{Node, RunMsg};
use factory_common::{FactoryError, Result};

use crate::engine::{epoch_now, Engine};
use crate::exec::{ContainerRuntime, Executor};
use crate::messaging;
use crate::store::StoreError;

/// Why the agent's main loop ended.
enum AgentExit {
    /// Shutdown was requested; the node must be deregistered.
    Requested,
    /// The node record is gone (the pump removed us); nothing to clean.
    Removed,
    /// Heartbeat failed for a reason other than a missing record.
    Failed(FactoryError),
}

impl Engine {
    /// Run one node's lifecycle: register the node, create its queue,
    /// supervise the executor and the run-directive handler, and refresh
    /// the node record every heartbeat interval. On shutdown the node
    /// and its queue are removed and both child activities get a bounded
    /// grace period to finish.
    pub async fn run_agent(
        self: Arc<Self>,
        pool_id: &str,
        runtime: Arc<dyn ContainerRuntime>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::info!(pool_id, "starting node agent");

        let lifecycle = &self.config.lifecycle;
        let node = Node::register(
            pool_id,
            lifecycle.default_node_capacity,
            lifecycle.node_ttl(epoch_now()),
            lifecycle.node_scatter,
        );
        self.store
            .put_node(&node)
            .await
            .map_err(FactoryError::from)?;
        tracing::info!(node_id = %node.id, "registered node");

        messaging::create_node_queue(self.queue.as_ref(), &self.config.messaging, node.id)
            .await
            .map_err(FactoryError::from)?;

        // Internal stop signal for the child activities; flipped on
        // external shutdown or when the node record is gone.
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut executor = Executor::start(
            runtime,
            Arc::clone(&self.store),
            self.config.clone(),
            node.id,
            stop_rx.clone(),
        );

        let handler = {
            let engine = Arc::clone(&self);
            let incoming = executor.incoming();
            let stop_rx = stop_rx.clone();
            let node_id = node.id;
            tokio::spawn(async move {
                engine
                    .handle_node_messages(node_id, incoming, stop_rx)
                    .await
            })
        };

        let interval = lifecycle.agent_heartbeat_interval();
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break AgentExit::Requested,
                _ = executor.done() => {
                    break AgentExit::Failed(FactoryError::Runtime(
                        "executor terminated unexpectedly".to_string(),
                    ));
                }
                _ = ticker.tick() => {
                    tracing::debug!(node_id = %node.id, "agent heartbeat tick");

                    let ttl = self.config.lifecycle.node_ttl(epoch_now());
                    match self.store.increment_node_ttl(node.id, ttl).await {
                        Ok(()) => {}
                        Err(StoreError::NodeNotExists) => break AgentExit::Removed,
                        Err(e) => break AgentExit::Failed(e.into()),
                    }
                }
            }
        };

        let _ = stop_tx.send(true);

        let result = match outcome {
            AgentExit::Requested => self.delete_node(node.id).await,
            AgentExit::Removed => {
                tracing::info!(node_id = %node.id, "node record removed, shutting down");
                Ok(())
            }
            AgentExit::Failed(e) => {
                if let Err(cleanup) = self.delete_node(node.id).await {
                    tracing::warn!(
                        node_id = %node.id,
                        error = %cleanup,
                        "failed to clean up node after agent failure"
                    );
                }
                Err(e)
            }
        };

        tracing::info!("waiting for agent activities to exit");
        let joins = async {
            let _ = handler.await;
            executor.join().await;
        };
        let joined = match tokio::time::timeout(self.config.lifecycle.shutdown_grace(), joins).await
        {
            Ok(()) => Ok(()),
            Err(_) => Err(FactoryError::Timeout(
                "agent activities did not exit in time".to_string(),
            )),
        };

        tracing::info!("exited node agent");
        result.and(joined)
    }

    /// Consume run directives from the node's queue and forward each to
    /// the executor. The message is deleted only once the executor has
    /// accepted it; a busy executor leaves it queued for redelivery.
    async fn handle_node_messages(
        &self,
        node_id: NodeId,
        incoming: mpsc::Sender<RunMsg>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        tracing::info!(node_id = %node_id, "start handling node messages");
        let consumer = node_id.to_string();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = stop_rx.changed() => break,
                r = messaging::next_node_message(
                    self.queue.as_ref(),
                    &self.config.messaging,
                    node_id,
                    &consumer,
                    |body| self.handle_run_body(&incoming, body),
                ) => r,
            };

            if let Err(e) = received {
                tracing::error!(error = %e, "failed to receive next node message");
                break;
            }
        }

        tracing::info!("stopped handling node messages");
    }

    async fn handle_run_body(&self, incoming: &mpsc::Sender<RunMsg>, body: String) -> bool {
        tracing::info!(body = %body, "received run message");

        let msg: RunMsg = match serde_json::from_str(&body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "failed to decode run message");
                return false;
            }
        };

        match incoming
            .send_timeout(msg, self.config.executor.accept_timeout())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "executor did not accept run directive in time");
                false
            }
        }
    }
}
