//! Node agent: reports health to the control plane and applies the
//! configuration it publishes through a node-local [`Deployer`]

use crate::config::AgentConfig;
use crate::deploy::{DeployRequest, Deployer, DeploymentResult};
use crate::fleet::{Heartbeat, NodeStatus};
use crate::model::RenderedFile;
use crate::validation::validate_hostname;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const FALLBACK_HOSTNAME: &str = "edge-node";

/// What `/edge/render-all` returns, as far as the agent cares
#[derive(Debug, Deserialize)]
pub struct PublishedRender {
    pub status: String,
    pub hash: String,
    pub files: Vec<RenderedFile>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

#[derive(Debug)]
pub enum SyncOutcome {
    /// Already serving this hash
    Unchanged,
    /// The control plane reported rejected tenants
    Skipped,
    Deployed(DeploymentResult),
}

pub struct EdgeAgent {
    config: AgentConfig,
    hostname: String,
    client: reqwest::Client,
    deployer: Arc<Deployer>,
    degraded: AtomicBool,
}

impl EdgeAgent {
    pub fn new(config: AgentConfig, deployer: Arc<Deployer>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("edge-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        let hostname = match &config.hostname {
            Some(name) => name.clone(),
            None => local_hostname(),
        };
        let hostname = validate_hostname(&hostname)
            .with_context(|| format!("Invalid node hostname {:?}", hostname))?
            .into_string();

        Ok(Self {
            config,
            hostname,
            client,
            deployer,
            degraded: AtomicBool::new(false),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Status reported in the next heartbeat
    pub fn status(&self) -> NodeStatus {
        if self.degraded.load(Ordering::Relaxed) {
            NodeStatus::Degraded
        } else {
            NodeStatus::Healthy
        }
    }

    pub fn heartbeat_body(&self) -> Heartbeat {
        Heartbeat {
            cluster_id: self.config.cluster.clone(),
            hostname: self.hostname.clone(),
            ip_address: self.config.ip_address.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            status: self.status().as_str().to_string(),
        }
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        let url = format!("{}/edge/heartbeat", self.config.base_url());
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&self.heartbeat_body())
            .send()
            .await
            .map_err(|e| anyhow!("Heartbeat request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Heartbeat rejected: {} - {}", status, body));
        }

        debug!(hostname = %self.hostname, status = %self.status().as_str(), "Heartbeat sent");
        Ok(())
    }

    pub async fn fetch_render(&self) -> Result<PublishedRender> {
        let url = format!("{}/edge/render-all", self.config.base_url());
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| anyhow!("Render request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Render request returned {} - {}", status, body));
        }

        response
            .json::<PublishedRender>()
            .await
            .context("Invalid render response")
    }

    /// Pull the published configuration and apply it if it changed
    pub async fn sync_once(&self) -> Result<SyncOutcome> {
        let render = self.fetch_render().await?;

        if render.status != "ok" {
            warn!(
                hash = %render.hash,
                rejected = render.errors.len(),
                "Control plane render is partial, not applying"
            );
            return Ok(SyncOutcome::Skipped);
        }

        let current = self.deployer.ledger().latest_successful()?;
        if current.map(|entry| entry.hash) == Some(render.hash.clone()) {
            return Ok(SyncOutcome::Unchanged);
        }

        let result = self
            .deployer
            .deploy(DeployRequest {
                files: render.files,
                hash: render.hash,
                tenant: None,
            })
            .await;

        self.degraded.store(!result.is_success(), Ordering::Relaxed);
        Ok(SyncOutcome::Deployed(result))
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            hostname = %self.hostname,
            cluster = %self.config.cluster,
            control_plane = %self.config.base_url(),
            "Edge agent started"
        );

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync = tokio::time::interval(self.config.sync_interval());
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        warn!(error = %e, "Heartbeat failed");
                    }
                }
                _ = sync.tick() => {
                    match self.sync_once().await {
                        Ok(SyncOutcome::Deployed(result)) if result.is_success() => {
                            info!(hash = %result.hash, files = result.files_written, "Applied new configuration");
                        }
                        Ok(SyncOutcome::Deployed(result)) => {
                            error!(
                                hash = %result.hash,
                                phase = ?result.final_phase,
                                error = ?result.error,
                                "Failed to apply configuration, rolled back"
                            );
                        }
                        Ok(SyncOutcome::Unchanged) | Ok(SyncOutcome::Skipped) => {}
                        Err(e) => warn!(error = %e, "Sync failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Edge agent stopped");
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeployConfig;
    use crate::control::CommandControl;
    use crate::db::Database;
    use crate::ledger::Ledger;
    use std::time::Duration;
    use tempfile::TempDir;

    fn agent_config(hostname: Option<&str>) -> AgentConfig {
        AgentConfig {
            control_plane_url: "http://127.0.0.1:1/".to_string(),
            token: "edge".to_string(),
            cluster: "eu-west".to_string(),
            hostname: hostname.map(str::to_string),
            ip_address: "10.1.0.4".to_string(),
            heartbeat_interval_secs: 30,
            sync_interval_secs: 30,
            database_path: ":memory:".to_string(),
            request_timeout_secs: 1,
            deploy: DeployConfig::default(),
        }
    }

    fn deployer(tmp: &TempDir) -> Arc<Deployer> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let control = CommandControl::new("true", "true", Duration::from_secs(5)).unwrap();
        Arc::new(Deployer::new(
            tmp.path().join("conf.d"),
            tmp.path().join("backups"),
            Arc::new(control),
            Ledger::new(db),
        ))
    }

    #[test]
    fn test_heartbeat_body() {
        let tmp = TempDir::new().unwrap();
        let agent = EdgeAgent::new(agent_config(Some("Edge-1.Example.com")), deployer(&tmp)).unwrap();

        let body = agent.heartbeat_body();
        assert_eq!(body.hostname, "edge-1.example.com");
        assert_eq!(body.cluster_id, "eu-west");
        assert_eq!(body.status, "HEALTHY");
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_rejects_invalid_hostname() {
        let tmp = TempDir::new().unwrap();
        assert!(EdgeAgent::new(agent_config(Some("bad host")), deployer(&tmp)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_control_plane_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let agent = EdgeAgent::new(agent_config(Some("edge-1")), deployer(&tmp)).unwrap();

        assert!(agent.send_heartbeat().await.is_err());
        assert!(agent.sync_once().await.is_err());
        assert_eq!(agent.status(), NodeStatus::Healthy);
    }
}
