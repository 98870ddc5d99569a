use factory_common::ids::NodeId;
use factory_common::types::Claim;
use factory_common::{FactoryError, Result};

use crate::engine::Engine;
use crate::messaging;

impl Engine {
    /// Release one claim: return its capacity, re-submit the task, then
    /// delete the claim record.
    ///
    /// The first two effects are expected to fail under normal races
    /// (node gone, node already full) and are warned and swallowed.
    /// Failing to delete the claim is fatal: a surviving record would be
    /// released again on every reap cycle.
    pub(crate) async fn release(&self, claim: &Claim) -> Result<()> {
        if let Err(e) = self
            .store
            .return_node_capacity(claim.node_id, claim.size)
            .await
        {
            tracing::warn!(
                claim_id = %claim.id,
                node_id = %claim.node_id,
                error = %e,
                "failed to return node capacity"
            );
        }

        if let Err(e) = self.submit(&claim.pool_id, claim.size).await {
            tracing::warn!(
                claim_id = %claim.id,
                error = %e,
                "failed to re-submit released claim as task"
            );
        }

        self.store
            .delete_claim(claim.id)
            .await
            .map_err(|e| FactoryError::Store(format!("failed to delete claim {}: {}", claim.id, e)))?;

        metrics::counter!("factory.claims.released").increment(1);
        Ok(())
    }

    /// Remove a node entirely: deregister the record and delete its
    /// queue. Both must succeed; a leftover queue leaks infrastructure.
    pub(crate) async fn delete_node(&self, node_id: NodeId) -> Result<()> {
        tracing::info!(node_id = %node_id, "deregistering node");
        self.store
            .deregister_node(node_id)
            .await
            .map_err(FactoryError::from)?;

        tracing::debug!(node_id = %node_id, "deleting node queue");
        messaging::delete_node_queue(self.queue.as_ref(), &self.config.messaging, node_id)
            .await?;

        Ok(())
    }
}
