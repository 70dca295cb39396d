//! Control plane: ties storage, compiler, deployer and fleet together

use crate::compiler::{Compiler, RenderOptions, RenderReport};
use crate::db::{format_timestamp, Database};
use crate::deploy::{managed_files, DeployError, DeployRequest, Deployer, DeploymentResult};
use crate::fleet::FleetRegistry;
use crate::host_lookup::{entries_from_filenames, HostLookup};
use crate::ledger::Ledger;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Render settings taken from configuration
#[derive(Debug, Clone, Default)]
pub struct RenderSettings {
    pub acme_webroot: Option<String>,
    pub stamp_generated_at: bool,
}

pub struct ControlPlane {
    db: Arc<Database>,
    deployer: Arc<Deployer>,
    hosts: Arc<dyn HostLookup>,
    fleet: FleetRegistry,
    render: RenderSettings,
}

impl ControlPlane {
    pub fn new(
        db: Arc<Database>,
        deployer: Arc<Deployer>,
        hosts: Arc<dyn HostLookup>,
        fleet: FleetRegistry,
        render: RenderSettings,
    ) -> Self {
        Self {
            db,
            deployer,
            hosts,
            fleet,
            render,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn ledger(&self) -> &Ledger {
        self.deployer.ledger()
    }

    pub fn fleet(&self) -> &FleetRegistry {
        &self.fleet
    }

    pub fn hosts(&self) -> &dyn HostLookup {
        self.hosts.as_ref()
    }

    /// Compile every stored tenant
    pub fn render_all(&self) -> Result<RenderReport> {
        let tenants = self.db.load_tenants().context("Failed to load tenants")?;
        let options = RenderOptions {
            generated_at: self
                .render
                .stamp_generated_at
                .then(|| format_timestamp(Utc::now())),
            acme_webroot: self.render.acme_webroot.clone(),
        };

        let report = Compiler::new(options).compile_all(&tenants);
        debug!(
            tenants = tenants.len(),
            files = report.files.len(),
            failures = report.failures.len(),
            hash = %report.hash,
            "Rendered all tenants"
        );
        Ok(report)
    }

    /// Deploy unless another deployment is running
    pub async fn try_deploy(&self, request: DeployRequest) -> Result<DeploymentResult, DeployError> {
        let result = self.deployer.try_deploy(request).await?;
        self.after_deploy(&result).await;
        Ok(result)
    }

    /// Deploy, waiting for the lock
    pub async fn deploy(&self, request: DeployRequest) -> DeploymentResult {
        let result = self.deployer.deploy(request).await;
        self.after_deploy(&result).await;
        result
    }

    /// Tenant-scoped deploys leave other tenants live, so the lookup is
    /// rebuilt from the directory rather than from the request
    async fn after_deploy(&self, result: &DeploymentResult) {
        if !result.is_success() {
            return;
        }
        match self.restore_host_lookup().await {
            Ok(hosts) => debug!(hosts, "Host lookup refreshed"),
            Err(e) => warn!(error = %e, "Failed to refresh host lookup"),
        }
    }

    /// Render everything and deploy it if it differs from the last
    /// successful deployment. Returns `None` when nothing was deployed.
    ///
    /// A render with tenant failures is not deployed: the failing tenants'
    /// files would be missing from the set and the deploy would remove them
    /// from the live directory.
    pub async fn render_and_deploy(&self) -> Result<Option<DeploymentResult>> {
        let report = self.render_all()?;

        if !report.is_complete() {
            warn!(
                failures = report.failures.len(),
                "Render has rejected tenants, not deploying"
            );
            return Ok(None);
        }

        if let Some(latest) = self.ledger().latest_successful()? {
            if latest.hash == report.hash {
                debug!(hash = %report.hash, "Configuration unchanged, skipping deploy");
                return Ok(None);
            }
        }

        let request = DeployRequest {
            files: report.files,
            hash: report.hash,
            tenant: None,
        };
        Ok(Some(self.deploy(request).await))
    }

    /// Rebuild the host lookup from what is currently live
    pub async fn restore_host_lookup(&self) -> Result<usize> {
        let names = managed_files(self.deployer.conf_dir())
            .await
            .with_context(|| {
                format!(
                    "Failed to read live directory {}",
                    self.deployer.conf_dir().display()
                )
            })?;
        self.hosts
            .replace_all(entries_from_filenames(names.iter().map(String::as_str)));
        Ok(self.hosts.len())
    }

    /// Periodic render-and-deploy until shutdown
    pub async fn run_scheduler(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Render scheduler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.render_and_deploy().await {
                        Ok(Some(result)) if result.is_success() => {
                            info!(hash = %result.hash, "Scheduled deploy committed");
                        }
                        Ok(Some(result)) => {
                            warn!(
                                hash = %result.hash,
                                phase = ?result.final_phase,
                                error = ?result.error,
                                "Scheduled deploy failed"
                            );
                        }
                        Ok(None) => {}
                        Err(e) => error!(error = %e, "Scheduled render failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Render scheduler stopped");
    }
}
