use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use factory_common::types::{Claim, Node, RunMsg};
use factory_common::{FactoryError, Result};

use crate::engine::{epoch_now, Engine};
use crate::messaging;
use crate::store::StoreError;

impl Engine {
    /// Place one task on a node in the pool.
    ///
    /// Runs the two-phase claim under bounded exponential backoff: only
    /// the all-candidates-failed outcome is retried, any store error
    /// aborts. On success a claim is recorded and a run directive is sent
    /// to the chosen node's queue. If recording or sending fails after
    /// the deduction, the capacity comes back through the claim-expiry
    /// reaper.
    pub async fn schedule(&self, pool_id: &str, size: i64) -> Result<()> {
        let scheduling = &self.config.scheduling;
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(scheduling.backoff_base_ms.max(2) / 2)
            .max_delay(Duration::from_millis(scheduling.backoff_max_ms))
            .map(jitter)
            .take(scheduling.max_claim_retries as usize);

        let claimed = RetryIf::spawn(
            strategy,
            || self.try_claim(pool_id, size),
            |e: &FactoryError| e.is_no_capacity(),
        )
        .await?;

        let claim = Claim::reserve(
            pool_id,
            claimed.id,
            size,
            self.config.lifecycle.claim_ttl(epoch_now()),
            self.config.lifecycle.claim_scatter,
        );
        self.store.put_claim(&claim).await.map_err(FactoryError::from)?;

        let msg = RunMsg {
            size,
            claim_id: claim.id,
        };
        messaging::send_node_message(
            self.queue.as_ref(),
            &self.config.messaging,
            claimed.id,
            &msg,
        )
        .await?;

        metrics::counter!("factory.tasks.placed").increment(1);
        Ok(())
    }

    /// One placement attempt: query candidates by free capacity, then
    /// try the conditional deduction on each in index order. Candidates
    /// must not be reordered; that preserves progress across retries
    /// under contention.
    async fn try_claim(&self, pool_id: &str, size: i64) -> Result<Node> {
        tracing::debug!(pool_id, size, "querying nodes with enough capacity");
        let candidates = self
            .store
            .nodes_with_capacity(pool_id, size, self.config.scheduling.max_claim_candidates)
            .await
            .map_err(FactoryError::from)?;

        tracing::debug!(count = candidates.len(), "found candidate nodes");
        for node in candidates {
            match self.store.claim_node_capacity(node.id, size).await {
                Ok(()) => {
                    tracing::info!(node_id = %node.id, size, "claimed node capacity");
                    return Ok(node);
                }
                // Lost the race on this node, or it was deregistered
                // between query and update; next candidate.
                Err(StoreError::CapacityUnfit) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(FactoryError::NoCapacity)
    }
}
