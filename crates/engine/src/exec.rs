use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use factory_common::config::{EngineConfig, ExecutorConfig};
use factory_common::ids::{ClaimId, NodeId};
use factory_common::types::RunMsg;
use factory_common::FactoryError;

use crate::engine::epoch_now;
use crate::store::{Store, StoreError};

/// Container label binding a container to its claim.
pub const CLAIM_LABEL: &str = "factory.claim";

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("container runtime not found: {0}")]
    NotFound(String),

    #[error("runtime invocation failed: {0}")]
    Invocation(String),

    #[error("runtime invocation timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected runtime output: {0}")]
    Output(String),
}

impl From<ExecError> for FactoryError {
    fn from(e: ExecError) -> Self {
        FactoryError::Runtime(e.to_string())
    }
}

/// One locally running container carrying a claim label.
#[derive(Clone, Debug)]
pub struct RunningContainer {
    pub container_id: String,
    pub claim_id: ClaimId,
}

/// Invocation contract for the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// One-shot availability probe; returns the server version.
    async fn probe(&self) -> Result<String, ExecError>;

    /// Start a detached container labelled with the claim; returns the
    /// container id.
    async fn start_container(&self, claim_id: ClaimId)
        -> Result<String, ExecError>;

    /// Enumerate locally running containers carrying the claim label.
    async fn running_containers(&self) -> Result<Vec<RunningContainer>, ExecError>;

    /// Gracefully stop a container.
    async fn stop_container(&self, container_id: &str) -> Result<(), ExecError>;
}

/// Docker implementation over the `docker` binary.
pub struct DockerRuntime {
    docker: PathBuf,
    config: ExecutorConfig,
}

impl DockerRuntime {
    /// Locate the docker binary on PATH; absence is fatal at startup.
    pub fn discover(config: ExecutorConfig) -> Result<Self, ExecError> {
        let docker = which::which("docker").map_err(|e| {
            ExecError::NotFound(format!("docker executable not on PATH: {}, is it installed?", e))
        })?;

        tracing::debug!(path = %docker.display(), "using docker executable");
        Ok(Self { docker, config })
    }

    async fn exec(&self, timeout: Duration, args: &[String]) -> Result<String, ExecError> {
        let output = tokio::time::timeout(
            timeout,
            Command::new(&self.docker).args(args).output(),
        )
        .await
        .map_err(|_| ExecError::Timeout(timeout))?
        .map_err(|e| ExecError::Invocation(e.to_string()))?;

        if !output.status.success() {
            return Err(ExecError::Invocation(format!(
                "docker {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn probe(&self) -> Result<String, ExecError> {
        let out = self
            .exec(
                self.config.exec_timeout(),
                &[
                    "version".to_string(),
                    "--format".to_string(),
                    "{{.Server.Version}}".to_string(),
                ],
            )
            .await?;
        Ok(out.trim().to_string())
    }

    async fn start_container(
        &self,
        claim_id: ClaimId,
    ) -> Result<String, ExecError> {
        let out = self
            .exec(
                self.config.run_timeout(),
                &[
                    "container".to_string(),
                    "run".to_string(),
                    "-d".to_string(),
                    "-l".to_string(),
                    format!("{}={}", CLAIM_LABEL, claim_id),
                    self.config.image.clone(),
                ],
            )
            .await?;

        let container_id = out.trim().to_string();
        if container_id.is_empty() {
            return Err(ExecError::Output("docker run printed no container id".to_string()));
        }
        Ok(container_id)
    }

    async fn running_containers(
        &self,
    ) -> Result<Vec<RunningContainer>, ExecError> {
        let out = self
            .exec(
                self.config.exec_timeout(),
                &[
                    "container".to_string(),
                    "ps".to_string(),
                    "-f".to_string(),
                    format!("label={}", CLAIM_LABEL),
                    "--format".to_string(),
                    format!("{{{{.ID}}}}\t{{{{.Label \"{}\"}}}}", CLAIM_LABEL),
                ],
            )
            .await?;

        let mut containers = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 2 {
                return Err(ExecError::Output(format!("unexpected docker ps line: '{}'", line)));
            }

            let claim_id: ClaimId = fields[1].trim().parse().map_err(|_| {
                ExecError::Output(format!("unparseable claim label on line: '{}'", line))
            })?;

            containers.push(RunningContainer {
                container_id: fields[0].trim().to_string(),
                claim_id,
            });
        }

        Ok(containers)
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), ExecError> {
        self.exec(
            self.config.stop_timeout(),
            &[
                "container".to_string(),
                "stop".to_string(),
                format!("-t={}", self.config.stop_grace_secs),
                container_id.to_string(),
            ],
        )
        .await?;
        Ok(())
    }
}

/// Supervision handle for the per-node container executor.
pub struct Executor {
    incoming_tx: mpsc::Sender<RunMsg>,
    handle: JoinHandle<()>,
    done_rx: watch::Receiver<bool>,
}

impl Executor {
    /// Start the executor loop for a node. It accepts run directives on
    /// the incoming channel, starts a container for each, and on a
    /// periodic tick refreshes the claim TTL of every running container.
    /// A container whose claim is gone gets stopped; any other failure is
    /// terminal and ends the loop.
    pub fn start(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn Store>,
        config: EngineConfig,
        node_id: NodeId,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(false);
        let handle = tokio::spawn(executor_loop(
            runtime,
            store,
            config,
            node_id,
            incoming_rx,
            stop_rx,
            done_tx,
        ));

        Self {
            incoming_tx,
            handle,
            done_rx,
        }
    }

    /// Sender half of the incoming run-directive channel.
    pub fn incoming(&self) -> mpsc::Sender<RunMsg> {
        self.incoming_tx.clone()
    }

    /// Resolves when the executor loop has terminated, for any reason.
    /// Cancel-safe; may be awaited repeatedly.
    pub async fn done(&mut self) {
        let _ = self.done_rx.changed().await;
    }

    /// Wait for the executor loop to finish.
    pub async fn join(self) {
        drop(self.incoming_tx);
        let _ = self.handle.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn executor_loop(
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn Store>,
    config: EngineConfig,
    node_id: NodeId,
    mut incoming_rx: mpsc::Receiver<RunMsg>,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
) {
    tracing::info!(node_id = %node_id, "start handling task runs");

    match runtime.probe().await {
        Ok(version) => tracing::info!(version = %version, "container runtime ready"),
        Err(e) => {
            tracing::error!(error = %e, "failed to probe container runtime");
            tracing::info!("stopped handling task runs");
            let _ = done_tx.send(true);
            return;
        }
    }

    let period = config.executor.running_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            msg = incoming_rx.recv() => {
                let msg = match msg {
                    Some(msg) => msg,
                    None => break,
                };

                tracing::info!(claim_id = %msg.claim_id, size = msg.size, "starting task run");
                match runtime.start_container(msg.claim_id).await {
                    Ok(container_id) => {
                        tracing::info!(
                            container_id = %container_id,
                            claim_id = %msg.claim_id,
                            "started container"
                        );
                        metrics::counter!("factory.containers.started").increment(1);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to start container");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = send_heartbeats(
                    runtime.as_ref(),
                    store.as_ref(),
                    &config,
                    node_id,
                ).await {
                    tracing::error!(error = %e, "failed to send claim heartbeats");
                    break;
                }
            }
        }
    }

    tracing::info!("stopped handling task runs");
    let _ = done_tx.send(true);
}

/// Refresh the claim TTL for every running labelled container. A claim
/// that no longer exists was reaped; its container is stopped and the
/// scan continues. Other store errors are fatal to the executor.
async fn send_heartbeats(
    runtime: &dyn ContainerRuntime,
    store: &dyn Store,
    config: &EngineConfig,
    node_id: NodeId,
) -> Result<(), FactoryError> {
    let containers = runtime
        .running_containers()
        .await
        .map_err(FactoryError::from)?;

    for container in containers {
        tracing::debug!(
            container_id = %container.container_id,
            claim_id = %container.claim_id,
            node_id = %node_id,
            "refreshing claim ttl"
        );

        let ttl = config.lifecycle.claim_refresh_ttl(epoch_now());
        match store
            .increment_claim_ttl(container.claim_id, node_id, ttl)
            .await
        {
            Ok(()) => {}
            Err(StoreError::ClaimNotExists) => {
                tracing::info!(
                    container_id = %container.container_id,
                    claim_id = %container.claim_id,
                    "claim no longer exists, stopping container"
                );
                runtime
                    .stop_container(&container.container_id)
                    .await
                    .map_err(FactoryError::from)?;
                metrics::counter!("factory.containers.stopped").increment(1);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
