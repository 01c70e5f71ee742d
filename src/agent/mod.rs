//! Provider agent.
//!
//! Four concurrent activities, sharing no mutable state except through the
//! backend:
//! - **Heartbeat loop**: runs for the lifetime of the process, fixed
//!   interval, failures logged and retried next tick.
//! - **Poll loop**: blocks while a job is being processed; at most one job
//!   in flight per agent.
//! - **Log streaming**: forwards the running container's output until EOF.
//! - **Usage sampling**: scoped exactly to one container run.
//!
//! The first two live here; the latter two are spawned per-run by
//! [`runner::JobRunner`].

pub mod client;
pub mod runner;
pub mod sysprobe;

pub use client::BackendClient;
pub use runner::JobRunner;

use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{Result, YardError};
use crate::jobs::sign_ack;
use crate::server::RegisterRequest;

const REGISTRATION_ATTEMPTS: u32 = 3;
const REGISTRATION_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct ProviderAgent {
    config: AgentConfig,
    client: BackendClient,
    runner: JobRunner,
    node_id: String,
    handshake_key: String,
}

impl ProviderAgent {
    /// Create an agent with a fresh node identity. The node id is stable
    /// for the lifetime of this process.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let node_id = Uuid::new_v4().to_string();
        let handshake_key = Uuid::new_v4().simple().to_string();
        let client = BackendClient::new(&config)?;
        let runner = JobRunner::new(config.clone(), client.clone(), node_id.clone());
        Ok(Self {
            config,
            client,
            runner,
            node_id,
            handshake_key,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run until the shutdown token fires: verify the container runtime,
    /// register, then heartbeat and poll.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        ensure_docker().await?;
        tracing::info!(node_id = %self.node_id, "Provider agent starting");

        self.register_with_retries().await?;
        self.spawn_heartbeat_loop(shutdown.clone());
        self.poll_loop(shutdown).await;

        tracing::info!(node_id = %self.node_id, "Provider agent stopped");
        Ok(())
    }

    async fn register_with_retries(&self) -> Result<()> {
        let request = RegisterRequest {
            node_id: self.node_id.clone(),
            specs: sysprobe::collect_specs(),
            container_supported: true,
            handshake_key: Some(self.handshake_key.clone()),
            payout_addr: None,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.register_node(&request).await {
                Ok(()) => {
                    tracing::info!(node_id = %self.node_id, "Node registered");
                    return Ok(());
                }
                Err(e) if attempt < REGISTRATION_ATTEMPTS => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        "Registration failed, retrying"
                    );
                    tokio::time::sleep(REGISTRATION_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_heartbeat_loop(&self, shutdown: CancellationToken) {
        let client = self.client.clone();
        let node_id = self.node_id.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = client.heartbeat(&node_id).await {
                            tracing::warn!(error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        });
    }

    /// Poll on a fixed interval; a claimed job is processed to completion
    /// before the next poll. A lost ack race abandons the cycle without
    /// retrying the same job.
    async fn poll_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let job = match self.client.poll_job(&self.node_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tracing::debug!("No pending jobs");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Poll failed");
                    continue;
                }
            };

            let signature = sign_ack(&self.handshake_key, &job.job_id);
            match self
                .client
                .ack_job(&self.node_id, &job.job_id, Some(signature))
                .await
            {
                Ok(()) => {
                    tracing::info!(job_id = %job.job_id, dataset = %job.dataset_name, "Job claimed");
                    if let Err(e) = self.runner.process(&job).await {
                        tracing::error!(job_id = %job.job_id, error = %e, "Job processing failed");
                    }
                }
                Err(YardError::JobUnavailable(_)) => {
                    tracing::debug!(job_id = %job.job_id, "Lost the claim race");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.job_id, error = %e, "Ack failed");
                }
            }
        }
    }
}

/// The agent refuses to start without a usable container runtime.
async fn ensure_docker() -> Result<()> {
    let output = Command::new("docker").arg("--version").output().await;
    match output {
        Ok(out) if out.status.success() => Ok(()),
        _ => Err(YardError::Docker(
            "docker runtime not found; install Docker to run a provider node".to_string(),
        )),
    }
}
