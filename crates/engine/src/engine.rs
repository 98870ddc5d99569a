use std::sync::Arc;

use factory_common::config::EngineConfig;
use factory_common::types::ScheduleMsg;
use factory_common::Result;

use crate::messaging;
use crate::queue::Queue;
use crate::store::Store;

/// The scheduling and lifecycle engine shared by the pump, agent, and
/// client command paths.
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) queue: Arc<dyn Queue>,
    pub(crate) config: EngineConfig,
}

impl Engine {
    /// Create a new engine over the given store and queue handles.
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn Queue>, config: EngineConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Submit a task for placement by posting a schedule message; the
    /// pump picks it up asynchronously.
    pub async fn submit(&self, pool_id: &str, size: i64) -> Result<()> {
        let msg = ScheduleMsg {
            pool_id: pool_id.to_string(),
            size,
        };

        messaging::send_schedule_message(self.queue.as_ref(), &self.config.messaging, &msg)
            .await?;

        metrics::counter!("factory.tasks.submitted").increment(1);
        Ok(())
    }

    /// Place one task inline, bypassing the schedule queue. Same
    /// placement protocol as the pump path; used by the `run` command
    /// and manual dispatch.
    pub async fn run(&self, pool_id: &str, size: i64) -> Result<()> {
        tracing::info!(pool_id, size, "placing task inline");
        self.schedule(pool_id, size).await
    }
}

/// Current wall-clock time as seconds since epoch, the unit every TTL in
/// the store uses.
pub(crate) fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}
