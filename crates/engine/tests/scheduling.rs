//! End-to-end scheduling and lifecycle scenarios against the in-process
//! store and queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use factory_common::config::EngineConfig;
use factory_common::ids::ClaimId;
use factory_common::types::{Claim, Node, RunMsg, ScheduleMsg};
use factory_common::FactoryError;
use factory_engine::exec::{ContainerRuntime, ExecError, Executor, RunningContainer};
use factory_engine::messaging;
use factory_engine::queue::{MemQueue, Queue};
use factory_engine::store::{MemStore, Store};
use factory_engine::Engine;

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.messaging.receive_wait_secs = 1;
    config.scheduling.max_claim_retries = 2;
    config.scheduling.backoff_base_ms = 10;
    config.scheduling.backoff_max_ms = 40;
    config.executor.running_interval_secs = 1;
    config
}

async fn setup() -> (Arc<MemStore>, Arc<MemQueue>, Arc<Engine>) {
    let store = Arc::new(MemStore::new());
    let queue = Arc::new(MemQueue::new());
    let config = test_config();
    queue
        .create_queue(&config.messaging.schedule_queue_name)
        .await
        .unwrap();

    let engine = Arc::new(Engine::new(store.clone(), queue.clone(), config));
    (store, queue, engine)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn register_node(store: &MemStore, pool: &str, cap: i64) -> Node {
    let node = Node::register(pool, cap, now() + 3600, 10);
    store.put_node(&node).await.unwrap();
    node
}

async fn wait_until<F: Fn() -> bool>(deadline: Duration, cond: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Container runtime stub that records invocations.
#[derive(Default)]
struct StubRuntime {
    running: Mutex<Vec<RunningContainer>>,
    started: Mutex<Vec<ClaimId>>,
    stopped: Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn probe(&self) -> Result<String, ExecError> {
        Ok("stub".to_string())
    }

    async fn start_container(&self, claim_id: ClaimId) -> Result<String, ExecError> {
        self.started.lock().unwrap().push(claim_id);
        let container_id = format!("container-{}", claim_id);
        self.running.lock().unwrap().push(RunningContainer {
            container_id: container_id.clone(),
            claim_id,
        });
        Ok(container_id)
    }

    async fn running_containers(&self) -> Result<Vec<RunningContainer>, ExecError> {
        Ok(self.running.lock().unwrap().clone())
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), ExecError> {
        self.stopped.lock().unwrap().push(container_id.to_string());
        self.running
            .lock()
            .unwrap()
            .retain(|c| c.container_id != container_id);
        Ok(())
    }
}

/// One submit against one empty node places a claim, deducts
/// capacity, and delivers a run directive to the node's queue.
#[tokio::test]
async fn single_placement_through_the_pump() {
    let (store, queue, engine) = setup().await;
    let node = register_node(&store, "P", 10).await;
    messaging::create_node_queue(queue.as_ref(), &engine.config().messaging, node.id)
        .await
        .unwrap();

    engine.submit("P", 3).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pump = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.pump(shutdown_rx).await })
    };

    let placed = {
        let store = Arc::clone(&store);
        wait_until(Duration::from_secs(5), move || {
            store.claims().len() == 1
        })
        .await
    };
    assert!(placed, "pump did not place the submitted task");

    shutdown_tx.send(true).unwrap();
    pump.await.unwrap().unwrap();

    assert_eq!(store.node(node.id).unwrap().cap, 7);

    let claims = store.claims();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].size, 3);
    assert_eq!(claims[0].node_id, node.id);

    let node_queue = messaging::node_queue_name(&engine.config().messaging, node.id);
    let bodies = queue.messages(&node_queue);
    assert_eq!(bodies.len(), 1);
    let run: RunMsg = serde_json::from_str(&bodies[0]).unwrap();
    assert_eq!(run.size, 3);
    assert_eq!(run.claim_id, claims[0].id);

    // Placement succeeded, so the schedule message is gone.
    assert!(queue
        .messages(&engine.config().messaging.schedule_queue_name)
        .is_empty());
}

/// Two concurrent placements against cap 5: exactly one wins, the
/// other exhausts its retries, and no capacity is lost.
#[tokio::test]
async fn contention_admits_exactly_one() {
    let (store, queue, engine) = setup().await;
    let node = register_node(&store, "P", 5).await;
    messaging::create_node_queue(queue.as_ref(), &engine.config().messaging, node.id)
        .await
        .unwrap();

    let (first, second) = tokio::join!(engine.schedule("P", 3), engine.schedule("P", 3));

    let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one placement must win");

    let failure = if first.is_err() { first } else { second };
    assert!(matches!(failure.unwrap_err(), FactoryError::NoCapacity));

    assert_eq!(store.node(node.id).unwrap().cap, 2);
    assert_eq!(store.claims().len(), 1);
}

/// An expired claim is reaped: capacity returned, task
/// re-submitted, record deleted.
#[tokio::test]
async fn claim_expiry_releases_and_resubmits() {
    let (store, queue, engine) = setup().await;
    let node = register_node(&store, "P", 10).await;
    store.claim_node_capacity(node.id, 4).await.unwrap();

    let claim = Claim::reserve("P", node.id, 4, now() - 1, 10);
    store.put_claim(&claim).await.unwrap();

    engine.expire_claims().await.unwrap();

    assert!(store.claim(claim.id).is_none());
    assert_eq!(store.node(node.id).unwrap().cap, 10);

    let bodies = queue.messages(&engine.config().messaging.schedule_queue_name);
    assert_eq!(bodies.len(), 1);
    let msg: ScheduleMsg = serde_json::from_str(&bodies[0]).unwrap();
    assert_eq!(msg.pool_id, "P");
    assert_eq!(msg.size, 4);
}

/// An expired node is deregistered, its queue deleted, and its
/// outstanding claim released back to the schedule queue.
#[tokio::test]
async fn node_expiry_evicts_outstanding_claims() {
    let (store, queue, engine) = setup().await;

    let mut node = Node::register("P", 10, now() - 1, 10);
    node.cap = 8;
    store.put_node(&node).await.unwrap();
    messaging::create_node_queue(queue.as_ref(), &engine.config().messaging, node.id)
        .await
        .unwrap();

    let claim = Claim::reserve("P", node.id, 2, now() + 3600, 10);
    store.put_claim(&claim).await.unwrap();

    engine.expire_nodes().await.unwrap();

    assert!(store.node(node.id).is_none());
    let node_queue = messaging::node_queue_name(&engine.config().messaging, node.id);
    assert!(!queue.queue_exists(&node_queue));
    assert!(store.claim(claim.id).is_none());

    let bodies = queue.messages(&engine.config().messaging.schedule_queue_name);
    assert_eq!(bodies.len(), 1);
    let msg: ScheduleMsg = serde_json::from_str(&bodies[0]).unwrap();
    assert_eq!(msg.size, 2);
}

/// A cancelled agent deregisters its node and deletes its queue
/// within the shutdown grace period.
#[tokio::test]
async fn agent_shutdown_cleans_up_node_and_queue() {
    let (store, queue, engine) = setup().await;
    let runtime = Arc::new(StubRuntime::default());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent = {
        let engine = Arc::clone(&engine);
        let runtime: Arc<dyn ContainerRuntime> = runtime;
        tokio::spawn(async move { engine.run_agent("P", runtime, shutdown_rx).await })
    };

    let registered = {
        let store = Arc::clone(&store);
        wait_until(Duration::from_secs(5), move || store.nodes().len() == 1).await
    };
    assert!(registered, "agent did not register a node");

    let node = store.nodes().pop().unwrap();
    assert_eq!(node.pool_id, "P");
    assert_eq!(node.cap, 10);
    let node_queue = messaging::node_queue_name(&engine.config().messaging, node.id);
    assert!(queue.queue_exists(&node_queue));

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), agent)
        .await
        .expect("agent did not shut down within the grace period")
        .unwrap();
    result.unwrap();

    assert!(store.node(node.id).is_none());
    assert!(!queue.queue_exists(&node_queue));
}

/// An agent whose node record was reaped by the pump exits cleanly
/// without trying to clean up again.
#[tokio::test]
async fn agent_exits_cleanly_when_node_is_removed() {
    let (store, queue, _) = setup().await;
    let mut config = test_config();
    config.lifecycle.agent_heartbeat_interval_secs = 1;
    let engine = Arc::new(Engine::new(
        store.clone(),
        queue.clone(),
        config,
    ));
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(StubRuntime::default());

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run_agent("P", runtime, shutdown_rx).await })
    };

    let registered = {
        let store = Arc::clone(&store);
        wait_until(Duration::from_secs(5), move || store.nodes().len() == 1).await
    };
    assert!(registered);

    // Simulate the pump reaping this node between heartbeats.
    let node = store.nodes().pop().unwrap();
    store.deregister_node(node.id).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), agent)
        .await
        .expect("agent did not notice the missing node")
        .unwrap();
    result.unwrap();
}

/// When a claim disappears, the executor stops its container on the
/// next heartbeat tick; surviving claims get their TTL refreshed.
#[tokio::test]
async fn executor_stops_container_on_claim_loss() {
    let (store, _queue, engine) = setup().await;
    let node = register_node(&store, "P", 10).await;

    let kept = Claim::reserve("P", node.id, 1, now() + 30, 10);
    store.put_claim(&kept).await.unwrap();
    let lost = ClaimId::new();

    let runtime = Arc::new(StubRuntime::default());
    runtime.running.lock().unwrap().push(RunningContainer {
        container_id: "container-kept".to_string(),
        claim_id: kept.id,
    });
    runtime.running.lock().unwrap().push(RunningContainer {
        container_id: "container-lost".to_string(),
        claim_id: lost,
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    let executor = Executor::start(
        runtime.clone(),
        store.clone(),
        engine.config().clone(),
        node.id,
        stop_rx,
    );

    let stopped = {
        let runtime = Arc::clone(&runtime);
        wait_until(Duration::from_secs(5), move || {
            !runtime.stopped.lock().unwrap().is_empty()
        })
        .await
    };
    assert!(stopped, "executor never stopped the orphaned container");

    assert_eq!(
        *runtime.stopped.lock().unwrap(),
        vec!["container-lost".to_string()]
    );
    assert!(
        store.claim(kept.id).unwrap().ttl > now() + 30,
        "surviving claim TTL was not refreshed"
    );

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), executor.join())
        .await
        .expect("executor did not stop");
}

/// The executor accepts run directives and starts a labelled container
/// for each.
#[tokio::test]
async fn executor_starts_container_for_run_directive() {
    let (store, _queue, engine) = setup().await;
    let node = register_node(&store, "P", 10).await;

    let runtime = Arc::new(StubRuntime::default());
    let (stop_tx, stop_rx) = watch::channel(false);
    let executor = Executor::start(
        runtime.clone(),
        store.clone(),
        engine.config().clone(),
        node.id,
        stop_rx,
    );

    let claim_id = ClaimId::new();
    executor
        .incoming()
        .send(RunMsg { size: 1, claim_id })
        .await
        .unwrap();

    let started = {
        let runtime = Arc::clone(&runtime);
        wait_until(Duration::from_secs(5), move || {
            !runtime.started.lock().unwrap().is_empty()
        })
        .await
    };
    assert!(started);
    assert_eq!(*runtime.started.lock().unwrap(), vec![claim_id]);

    stop_tx.send(true).unwrap();
    executor.join().await;
}

/// A malformed schedule message is left on the queue; a well-formed one
/// behind it still gets placed once the bad one is drained by hand.
#[tokio::test]
async fn malformed_schedule_message_is_not_deleted() {
    let (store, queue, engine) = setup().await;
    let node = register_node(&store, "P", 10).await;
    messaging::create_node_queue(queue.as_ref(), &engine.config().messaging, node.id)
        .await
        .unwrap();

    let schedule_queue = engine.config().messaging.schedule_queue_name.clone();
    queue.send(&schedule_queue, "not json").await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pump = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.pump(shutdown_rx).await })
    };

    // The pump keeps seeing the malformed message but never deletes it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(queue.messages(&schedule_queue), ["not json".to_string()]);
    assert!(store.claims().is_empty());

    shutdown_tx.send(true).unwrap();
    pump.await.unwrap().unwrap();
}
