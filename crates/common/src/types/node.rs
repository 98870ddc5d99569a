use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// A registered worker node.
///
/// A node is alive iff it exists in the store and `ttl >= now`. Capacity
/// moves only through the store's conditional mutations, which keep
/// `0 <= cap <= max` under concurrent claimers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Scheduling domain this node serves.
    pub pool_id: String,
    /// Current free capacity.
    pub cap: i64,
    /// Original capacity; upper bound for `cap`.
    pub max: i64,
    /// Absolute expiry, seconds since epoch.
    pub ttl: i64,
    /// Scatter partition in `[0, node_scatter)` for TTL-index scans.
    pub partition: i32,
}

impl Node {
    /// Build a registration record: full capacity, fresh TTL, and a
    /// uniformly random scatter partition.
    pub fn register(pool_id: &str, capacity: i64, ttl: i64, scatter: i32) -> Self {
        Self {
            id: NodeId::new(),
            pool_id: pool_id.to_string(),
            cap: capacity,
            max: capacity,
            ttl,
            partition: rand::thread_rng().gen_range(0..scatter),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.ttl < now
    }
}
