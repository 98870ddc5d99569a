use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ids::{ClaimId, NodeId};

/// A durable record that `size` capacity on a specific node is reserved
/// for one task.
///
/// For every live claim the reservation has already been deducted from the
/// node's `cap`; deleting a claim must return the capacity unless the node
/// itself is gone. A claim is alive iff stored and `ttl >= now`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub pool_id: String,
    /// Node the capacity was claimed on.
    pub node_id: NodeId,
    /// Capacity units reserved.
    pub size: i64,
    /// Absolute expiry, seconds since epoch.
    pub ttl: i64,
    /// Scatter partition in `[0, claim_scatter)` for TTL-index scans.
    pub partition: i32,
}

impl Claim {
    /// Build a claim record for capacity just deducted on `node_id`.
    pub fn reserve(pool_id: &str, node_id: NodeId, size: i64, ttl: i64, scatter: i32) -> Self {
        Self {
            id: ClaimId::new(),
            pool_id: pool_id.to_string(),
            node_id,
            size,
            ttl,
            partition: rand::thread_rng().gen_range(0..scatter),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.ttl < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_assigns_partition_in_range() {
        let node = NodeId::new();
        for _ in 0..100 {
            let claim = Claim::reserve("workers", node, 3, 1_700_000_030, 10);
            assert!((0..10).contains(&claim.partition));
            assert_eq!(claim.node_id, node);
        }
    }
}
