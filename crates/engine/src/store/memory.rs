use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use factory_common::ids::{ClaimId, NodeId};
use factory_common::types::{Claim, Node};

use super::{Store, StoreError};

/// In-process store with the same conditional semantics as [`PgStore`].
///
/// Backs the integration and property tests; every mutation happens under
/// one lock, so each call is as atomic as a single conditional statement.
///
/// [`PgStore`]: super::PgStore
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    nodes: HashMap<NodeId, Node>,
    claims: HashMap<ClaimId, Claim>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot one node record, if present.
    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.inner.lock().unwrap().nodes.get(&id).cloned()
    }

    /// Snapshot all node records.
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.lock().unwrap().nodes.values().cloned().collect()
    }

    /// Snapshot one claim record, if present.
    pub fn claim(&self, id: ClaimId) -> Option<Claim> {
        self.inner.lock().unwrap().claims.get(&id).cloned()
    }

    /// Snapshot all claim records.
    pub fn claims(&self) -> Vec<Claim> {
        self.inner.lock().unwrap().claims.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn put_node(&self, node: &Node) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn deregister_node(&self, id: NodeId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NodeNotExists),
        }
    }

    async fn increment_node_ttl(&self, id: NodeId, ttl: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.get_mut(&id) {
            Some(node) => {
                node.ttl = ttl;
                Ok(())
            }
            None => Err(StoreError::NodeNotExists),
        }
    }

    async fn claim_node_capacity(&self, id: NodeId, size: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.get_mut(&id) {
            Some(node) if node.cap >= size => {
                node.cap -= size;
                Ok(())
            }
            _ => Err(StoreError::CapacityUnfit),
        }
    }

    async fn return_node_capacity(&self, id: NodeId, size: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.get_mut(&id) {
            Some(node) if node.cap < node.max => {
                node.cap += size;
                Ok(())
            }
            Some(_) => Err(StoreError::CapacityOverflow),
            None => Err(StoreError::NodeNotExists),
        }
    }

    async fn nodes_with_capacity(
        &self,
        pool_id: &str,
        size: i64,
        limit: i64,
    ) -> Result<Vec<Node>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut nodes: Vec<Node> = inner
            .nodes
            .values()
            .filter(|n| n.pool_id == pool_id && n.cap >= size)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| b.cap.cmp(&a.cap).then(a.id.cmp(&b.id)));
        nodes.truncate(limit as usize);
        Ok(nodes)
    }

    async fn expired_nodes(
        &self,
        partition: i32,
        now: i64,
        limit: i64,
    ) -> Result<Vec<Node>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut nodes: Vec<Node> = inner
            .nodes
            .values()
            .filter(|n| n.partition == partition && n.ttl >= 1 && n.ttl <= now)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.ttl);
        nodes.truncate(limit as usize);
        Ok(nodes)
    }

    async fn put_claim(&self, claim: &Claim) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.claims.contains_key(&claim.id) {
            return Err(StoreError::ClaimExists);
        }
        inner.claims.insert(claim.id, claim.clone());
        Ok(())
    }

    async fn delete_claim(&self, id: ClaimId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.claims.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StoreError::ClaimNotExists),
        }
    }

    async fn increment_claim_ttl(
        &self,
        id: ClaimId,
        node_id: NodeId,
        ttl: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.claims.get_mut(&id) {
            Some(claim) if claim.node_id == node_id => {
                claim.ttl = ttl;
                Ok(())
            }
            _ => Err(StoreError::ClaimNotExists),
        }
    }

    async fn node_claims(&self, node_id: NodeId) -> Result<Vec<Claim>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut claims: Vec<Claim> = inner
            .claims
            .values()
            .filter(|c| c.node_id == node_id)
            .cloned()
            .collect();
        claims.sort_by_key(|c| c.id);
        Ok(claims)
    }

    async fn expired_claims(
        &self,
        partition: i32,
        now: i64,
        limit: i64,
    ) -> Result<Vec<Claim>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut claims: Vec<Claim> = inner
            .claims
            .values()
            .filter(|c| c.partition == partition && c.ttl >= 1 && c.ttl <= now)
            .cloned()
            .collect();
        claims.sort_by_key(|c| c.ttl);
        claims.truncate(limit as usize);
        Ok(claims)
    }
}
