use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration, deserialized from factory.toml.
///
/// Every tunable the engine consumes lives here and is injected at
/// construction; nothing reads module-level globals at runtime.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduling: SchedulingConfig,
    pub lifecycle: LifecycleConfig,
    pub pump: PumpConfig,
    pub executor: ExecutorConfig,
    pub messaging: MessagingConfig,
}

/// Placement protocol parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// How often the candidate query + conditional claim is retried.
    pub max_claim_retries: u32,
    /// Max number of candidate nodes considered per attempt.
    pub max_claim_candidates: i64,
    /// Initial backoff delay between placement attempts.
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay.
    pub backoff_max_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_claim_retries: 10,
            max_claim_candidates: 10,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
        }
    }
}

/// Node and claim lifetime parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Capacity units a node registers with (cap = max).
    pub default_node_capacity: i64,
    /// How long a fresh claim lives before its first executor heartbeat.
    pub claim_heartbeat_timeout_secs: i64,
    /// How often the agent refreshes its node record.
    pub agent_heartbeat_interval_secs: i64,
    /// Scatter partitions for the node TTL index.
    pub node_scatter: i32,
    /// Scatter partitions for the claim TTL index.
    pub claim_scatter: i32,
    /// Bounded grace period for activity shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_node_capacity: 10,
            claim_heartbeat_timeout_secs: 30,
            agent_heartbeat_interval_secs: 10,
            node_scatter: 10,
            claim_scatter: 10,
            shutdown_grace_secs: 5,
        }
    }
}

impl LifecycleConfig {
    /// TTL for a freshly registered or heartbeat-refreshed node:
    /// two missed agent heartbeats mean the node lapses.
    pub fn node_ttl(&self, now: i64) -> i64 {
        now + 2 * self.agent_heartbeat_interval_secs
    }

    /// TTL for a freshly created claim.
    pub fn claim_ttl(&self, now: i64) -> i64 {
        now + self.claim_heartbeat_timeout_secs
    }

    /// TTL for a claim refreshed by the executor heartbeat.
    pub fn claim_refresh_ttl(&self, now: i64) -> i64 {
        now + 2 * self.claim_heartbeat_timeout_secs
    }

    pub fn agent_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.agent_heartbeat_interval_secs as u64)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Pump loop parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Expiry reap tick interval.
    pub cycle_interval_secs: u64,
    /// Max expired claims reaped per scatter partition per cycle.
    pub max_expired_claims_per_partition: i64,
    /// Max expired nodes reaped per scatter partition per cycle.
    pub max_expired_nodes_per_partition: i64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 3,
            max_expired_claims_per_partition: 10,
            max_expired_nodes_per_partition: 10,
        }
    }
}

impl PumpConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}

/// Container executor parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// How often the executor enumerates running containers.
    pub running_interval_secs: u64,
    /// Bound on a container start invocation.
    pub run_timeout_secs: u64,
    /// Bound on short runtime invocations (version probe, ps).
    pub exec_timeout_secs: u64,
    /// Grace period passed to container stop; the invocation itself is
    /// bounded by one second more.
    pub stop_grace_secs: u64,
    /// Image started for each run directive.
    pub image: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            running_interval_secs: 5,
            run_timeout_secs: 10,
            exec_timeout_secs: 1,
            stop_grace_secs: 10,
            image: "redis".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn running_interval(&self) -> Duration {
        Duration::from_secs(self.running_interval_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs + 1)
    }

    /// How long the agent's message handler waits for the executor to
    /// accept a run directive before leaving the message for redelivery.
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs + 5)
    }
}

/// Queue naming and receive parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Name of the global schedule queue.
    pub schedule_queue_name: String,
    /// Prefix for per-node queue names.
    pub node_queue_prefix: String,
    /// Long-poll receive wait.
    pub receive_wait_secs: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            schedule_queue_name: "factory-scheduling".to_string(),
            node_queue_prefix: "factory-node-".to_string(),
            receive_wait_secs: 20,
        }
    }
}

impl MessagingConfig {
    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_secs)
    }
}
