use factory_common::ids::NodeId;
use factory_common::{FactoryError, Result};

use crate::engine::Engine;

impl Engine {
    /// Release every claim held against a node and re-submit each to the
    /// schedule queue. Aborts on the first release failure; the next reap
    /// cycle retries the remainder.
    ///
    /// Not protected by a distributed lock: two concurrent evictors can
    /// double-return capacity, bounded by the `cap < max` condition.
    pub async fn evict(&self, node_id: NodeId) -> Result<()> {
        tracing::info!(node_id = %node_id, "evicting node");

        let claims = self
            .store
            .node_claims(node_id)
            .await
            .map_err(FactoryError::from)?;

        tracing::info!(count = claims.len(), "found claims for eviction");
        for claim in &claims {
            self.release(claim).await.map_err(|e| {
                FactoryError::Internal(format!("failed to release claim {}: {}", claim.id, e))
            })?;
        }

        Ok(())
    }
}
