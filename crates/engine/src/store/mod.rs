mod memory;
mod postgres;

pub use memory::MemStore;
pub use postgres::PgStore;

use async_trait::async_trait;

use factory_common::ids::{ClaimId, NodeId};
use factory_common::types::{Claim, Node};

/// Persistence contract the engine consumes.
///
/// Each mutation carries its conditional semantics: the condition failing
/// is a distinct error variant, not a transport failure, because the
/// placement protocol and the lifecycle state machines branch on it.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a freshly registered node record.
    async fn put_node(&self, node: &Node) -> Result<(), StoreError>;

    /// Delete a node record. Condition: the node exists.
    async fn deregister_node(&self, id: NodeId) -> Result<(), StoreError>;

    /// Push a node's TTL into the future. Condition: the node exists.
    async fn increment_node_ttl(&self, id: NodeId, ttl: i64) -> Result<(), StoreError>;

    /// Atomically deduct capacity: `cap = cap - size` where the node
    /// exists and `cap >= size`. Condition miss is `CapacityUnfit`.
    async fn claim_node_capacity(&self, id: NodeId, size: i64) -> Result<(), StoreError>;

    /// Return capacity: `cap = cap + size` where the node exists and
    /// `cap < max`. Misses are `NodeNotExists` or `CapacityOverflow`.
    async fn return_node_capacity(&self, id: NodeId, size: i64) -> Result<(), StoreError>;

    /// Capacity-index query: nodes in `pool_id` with `cap >= size`,
    /// most free room first, ties in primary-key order.
    async fn nodes_with_capacity(
        &self,
        pool_id: &str,
        size: i64,
        limit: i64,
    ) -> Result<Vec<Node>, StoreError>;

    /// TTL-index scan: nodes in one scatter partition with
    /// `1 <= ttl <= now`.
    async fn expired_nodes(
        &self,
        partition: i32,
        now: i64,
        limit: i64,
    ) -> Result<Vec<Node>, StoreError>;

    /// Insert a claim record. Condition: the id is not already present.
    async fn put_claim(&self, claim: &Claim) -> Result<(), StoreError>;

    /// Delete a claim record. Condition: the claim exists.
    async fn delete_claim(&self, id: ClaimId) -> Result<(), StoreError>;

    /// Push a claim's TTL into the future. Condition: the claim exists
    /// and is bound to `node_id`.
    async fn increment_claim_ttl(
        &self,
        id: ClaimId,
        node_id: NodeId,
        ttl: i64,
    ) -> Result<(), StoreError>;

    /// All claims held against one node.
    async fn node_claims(&self, node_id: NodeId) -> Result<Vec<Claim>, StoreError>;

    /// TTL-index scan: claims in one scatter partition with
    /// `1 <= ttl <= now`.
    async fn expired_claims(
        &self,
        partition: i32,
        now: i64,
        limit: i64,
    ) -> Result<Vec<Claim>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store query error: {0}")]
    Query(String),

    #[error("store migration error: {0}")]
    Migration(String),

    #[error("node does not exist")]
    NodeNotExists,

    #[error("node capacity unfit for claim")]
    CapacityUnfit,

    #[error("node gone or already at max capacity")]
    CapacityOverflow,

    #[error("claim already exists")]
    ClaimExists,

    #[error("claim does not exist")]
    ClaimNotExists,
}

impl From<StoreError> for factory_common::FactoryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NodeNotExists | StoreError::ClaimNotExists => {
                factory_common::FactoryError::NotFound(e.to_string())
            }
            other => factory_common::FactoryError::Store(other.to_string()),
        }
    }
}
