//! Deployment orchestrator
//!
//! Applies a rendered file set to the live configuration directory as a
//! transaction:
//!
//! ```text
//! Idle -> BackingUp -> Writing -> Validating -> Activating -> Committed
//!                        |            |             |
//!                        +------------+-------------+--> RollingBack -> RolledBack
//! (anything before the first live mutation)          --> AbortedNoChange
//! ```
//!
//! Only files whose names parse as `<slug>_<domain>.conf` are managed.
//! Anything else in the directory is never read, moved, or deleted. A
//! request scoped to one tenant manages only that tenant's files.
//! Deployments are serialized; every attempt that gets the lock appends
//! exactly one ledger entry.

use crate::config::DeployConfig;
use crate::control::{CommandControl, ControlError, ProxyControl};
use crate::ledger::{DeployStatus, Ledger};
use crate::model::{content_hash, RenderedFile};
use crate::validation::{parse_managed_filename, validate_slug};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Prefix of staging directories created inside the live directory
const STAGING_PREFIX: &str = ".edgeplane-staging-";
/// Prefix of backup directories created inside the backup root
const BACKUP_PREFIX: &str = "backup-";
/// Backups kept when no retention is configured
pub const DEFAULT_BACKUP_RETENTION: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    Idle,
    BackingUp,
    Writing,
    Validating,
    Activating,
    Committed,
    RollingBack,
    RolledBack,
    AbortedNoChange,
}

impl DeployPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeployPhase::Committed | DeployPhase::RolledBack | DeployPhase::AbortedNoChange
        )
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("a deployment is already in progress")]
    InProgress,

    #[error("invalid file set: {0}")]
    InvalidFileSet(String),

    #[error("hash mismatch: request carries {expected}, files hash to {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("backup failed: {0}")]
    Backup(#[source] io::Error),

    #[error("writing configuration failed: {0}")]
    Write(#[source] io::Error),

    #[error("configuration rejected by syntax check: {0}")]
    ValidationGate(#[source] ControlError),

    #[error("reload failed: {0}")]
    Activation(#[source] ControlError),
}

/// A file set to deploy, as sent by the renderer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub files: Vec<RenderedFile>,
    pub hash: String,
    /// Scope the deploy to one tenant: every file must belong to this slug,
    /// and only this slug's live files are replaced, removed or restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

impl DeployRequest {
    /// Build a request whose hash is computed from `files`
    pub fn from_files(files: Vec<RenderedFile>) -> Self {
        let hash = content_hash(&files);
        Self {
            files,
            hash,
            tenant: None,
        }
    }
}

/// Outcome of one deployment attempt
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
    pub status: DeployStatus,
    pub hash: String,
    pub final_phase: DeployPhase,
    /// Every phase entered, in order, starting with `Idle`
    pub phases: Vec<DeployPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub log: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_id: Option<String>,
    pub files_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
}

impl DeploymentResult {
    pub fn is_success(&self) -> bool {
        self.status == DeployStatus::Success
    }
}

/// Phase and log bookkeeping for one attempt
struct Attempt {
    phases: Vec<DeployPhase>,
    log: Vec<String>,
    backup_dir: Option<PathBuf>,
}

impl Attempt {
    fn new() -> Self {
        Self {
            phases: vec![DeployPhase::Idle],
            log: Vec::new(),
            backup_dir: None,
        }
    }

    fn enter(&mut self, phase: DeployPhase) {
        debug!(phase = ?phase, "Deploy phase");
        self.phases.push(phase);
    }

    fn note(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    fn phase(&self) -> DeployPhase {
        self.phases.last().copied().unwrap_or(DeployPhase::Idle)
    }
}

/// Serialized, transactional writer of the live configuration directory
pub struct Deployer {
    conf_dir: PathBuf,
    backup_root: PathBuf,
    backup_retention: usize,
    control: Arc<dyn ProxyControl>,
    ledger: Ledger,
    lock: Arc<Mutex<()>>,
}

impl Deployer {
    pub fn new(
        conf_dir: impl Into<PathBuf>,
        backup_root: impl Into<PathBuf>,
        control: Arc<dyn ProxyControl>,
        ledger: Ledger,
    ) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            backup_root: backup_root.into(),
            backup_retention: DEFAULT_BACKUP_RETENTION,
            control,
            ledger,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Deployer driving the configured syntax-check and reload commands
    pub fn from_config(config: &DeployConfig, ledger: Ledger) -> Result<Self, ControlError> {
        let control = CommandControl::new(
            &config.syntax_check_command,
            &config.reload_command,
            config.command_timeout(),
        )?;
        Ok(Self::new(&config.conf_dir, &config.backup_dir, Arc::new(control), ledger)
            .with_backup_retention(config.backup_retention))
    }

    /// Number of backup directories to keep; 0 keeps all of them
    pub fn with_backup_retention(mut self, retention: usize) -> Self {
        self.backup_retention = retention;
        self
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Deploy, waiting for any running deployment to finish first
    pub async fn deploy(self: &Arc<Self>, request: DeployRequest) -> DeploymentResult {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        self.run_detached(guard, request).await
    }

    /// Deploy, or fail with [`DeployError::InProgress`] without touching
    /// anything if another deployment holds the lock
    pub async fn try_deploy(
        self: &Arc<Self>,
        request: DeployRequest,
    ) -> Result<DeploymentResult, DeployError> {
        let guard = Arc::clone(&self.lock)
            .try_lock_owned()
            .map_err(|_| DeployError::InProgress)?;
        Ok(self.run_detached(guard, request).await)
    }

    /// Run on its own task so a dropped caller cannot stop a deploy halfway
    async fn run_detached(
        self: &Arc<Self>,
        guard: OwnedMutexGuard<()>,
        request: DeployRequest,
    ) -> DeploymentResult {
        let deployer = Arc::clone(self);
        let hash = request.hash.clone();

        let task = tokio::spawn(async move {
            let _guard = guard;
            deployer.execute(request).await
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(hash = %hash, error = %e, "Deployment task aborted");
                DeploymentResult {
                    status: DeployStatus::Failed,
                    hash,
                    final_phase: DeployPhase::Idle,
                    phases: vec![DeployPhase::Idle],
                    error: Some(format!("deployment task aborted: {}", e)),
                    log: String::new(),
                    ledger_id: None,
                    files_written: 0,
                    backup_dir: None,
                }
            }
        }
    }

    async fn execute(&self, request: DeployRequest) -> DeploymentResult {
        let mut attempt = Attempt::new();
        info!(
            hash = %request.hash,
            files = request.files.len(),
            conf_dir = %self.conf_dir.display(),
            "Starting deployment"
        );

        let outcome = self.transact(&request, &mut attempt).await;

        if let Err(e) = &outcome {
            attempt.note(format!("error: {}", e));
            if attempt.phase() != DeployPhase::AbortedNoChange {
                self.roll_back(&mut attempt, request.tenant.as_deref()).await;
            }
        }

        self.prune_backups(attempt.backup_dir.as_deref()).await;

        let status = if outcome.is_ok() {
            DeployStatus::Success
        } else {
            DeployStatus::Failed
        };
        let log = attempt.log.join("\n");

        let (ledger_id, ledger_error) = match self
            .ledger
            .append(&request.hash, status, &log, request.tenant.as_deref())
        {
            Ok(entry) => (Some(entry.id), None),
            Err(e) => {
                error!(hash = %request.hash, error = %e, "Failed to record deployment in ledger");
                (None, Some(format!("deployment was not recorded in the ledger: {:#}", e)))
            }
        };

        let final_phase = attempt.phase();
        match &outcome {
            Ok(()) => info!(hash = %request.hash, files = request.files.len(), "Deployment committed"),
            Err(e) => warn!(hash = %request.hash, phase = ?final_phase, error = %e, "Deployment failed"),
        }

        DeploymentResult {
            status,
            hash: request.hash,
            final_phase,
            phases: attempt.phases,
            error: match (outcome.as_ref().err(), ledger_error) {
                (Some(e), Some(ledger)) => Some(format!("{}; {}", e, ledger)),
                (Some(e), None) => Some(e.to_string()),
                (None, ledger) => ledger,
            },
            log,
            ledger_id,
            files_written: if outcome.is_ok() { request.files.len() } else { 0 },
            backup_dir: attempt.backup_dir,
        }
    }

    /// Drive the forward path. On error the attempt is left in the phase
    /// that failed, or in `AbortedNoChange` if the live directory was not
    /// touched.
    async fn transact(&self, request: &DeployRequest, attempt: &mut Attempt) -> Result<(), DeployError> {
        if let Err(e) = check_file_set(request) {
            attempt.enter(DeployPhase::AbortedNoChange);
            return Err(e);
        }

        let scope = request.tenant.as_deref();

        attempt.enter(DeployPhase::BackingUp);
        let backed_up = match self.back_up(attempt, scope).await {
            Ok(names) => names,
            Err(e) => {
                attempt.enter(DeployPhase::AbortedNoChange);
                return Err(DeployError::Backup(e));
            }
        };

        attempt.enter(DeployPhase::Writing);
        let staging = match self.stage(&request.files).await {
            Ok(staging) => staging,
            Err(e) => {
                attempt.enter(DeployPhase::AbortedNoChange);
                return Err(DeployError::Write(e));
            }
        };

        let swapped = self.swap_in(&staging, &request.files, &backed_up).await;
        remove_dir_quietly(&staging).await;
        swapped.map_err(DeployError::Write)?;
        attempt.note(format!(
            "wrote {} file(s) to {}",
            request.files.len(),
            self.conf_dir.display()
        ));

        attempt.enter(DeployPhase::Validating);
        let output = self
            .control
            .check_syntax(&self.conf_dir)
            .await
            .map_err(DeployError::ValidationGate)?;
        note_output(attempt, "syntax check", &output);

        attempt.enter(DeployPhase::Activating);
        let output = self
            .control
            .reload(&self.conf_dir)
            .await
            .map_err(DeployError::Activation)?;
        note_output(attempt, "reload", &output);

        attempt.enter(DeployPhase::Committed);
        Ok(())
    }

    /// Copy every managed file in scope into a fresh backup directory.
    /// Returns the names that were backed up.
    async fn back_up(&self, attempt: &mut Attempt, scope: Option<&str>) -> io::Result<Vec<String>> {
        tokio::fs::create_dir_all(&self.conf_dir).await?;
        let names = scoped(managed_files(&self.conf_dir).await?, scope);

        let dir = self.backup_root.join(format!(
            "{}{}-{}",
            BACKUP_PREFIX,
            Utc::now().format("%Y%m%dT%H%M%S%6fZ"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ));
        tokio::fs::create_dir_all(&dir).await?;

        for name in &names {
            if let Err(e) = tokio::fs::copy(self.conf_dir.join(name), dir.join(name)).await {
                remove_dir_quietly(&dir).await;
                return Err(e);
            }
        }

        attempt.note(format!("backed up {} file(s) to {}", names.len(), dir.display()));
        attempt.backup_dir = Some(dir);
        Ok(names)
    }

    /// Write the new set into a hidden staging directory inside the live
    /// directory so the final renames stay on one filesystem.
    async fn stage(&self, files: &[RenderedFile]) -> io::Result<PathBuf> {
        let staging = self.conf_dir.join(format!(
            "{}{}",
            STAGING_PREFIX,
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir(&staging).await?;

        for file in files {
            if let Err(e) = tokio::fs::write(staging.join(&file.filename), &file.content).await {
                remove_dir_quietly(&staging).await;
                return Err(e);
            }
        }
        Ok(staging)
    }

    /// Rename staged files over the live ones, then drop previously live
    /// files that are not part of the new set.
    async fn swap_in(
        &self,
        staging: &Path,
        files: &[RenderedFile],
        previous: &[String],
    ) -> io::Result<()> {
        for file in files {
            tokio::fs::rename(staging.join(&file.filename), self.conf_dir.join(&file.filename))
                .await?;
        }

        let keep: HashSet<&str> = files.iter().map(|f| f.filename.as_str()).collect();
        for name in previous {
            if !keep.contains(name.as_str()) {
                remove_file_if_exists(&self.conf_dir.join(name)).await?;
            }
        }
        Ok(())
    }

    /// Put the live directory back to the backed-up managed set and try to
    /// reload. Secondary failures are logged; the attempt stays failed.
    async fn roll_back(&self, attempt: &mut Attempt, scope: Option<&str>) {
        attempt.enter(DeployPhase::RollingBack);

        match self.restore(attempt.backup_dir.as_deref(), scope).await {
            Ok(restored) => attempt.note(format!("restored {} file(s) from backup", restored)),
            Err(e) => {
                error!(error = %e, "Rollback could not fully restore the backup");
                attempt.note(format!("restore incomplete: {}", e));
            }
        }

        match self.control.reload(&self.conf_dir).await {
            Ok(_) => attempt.note("reloaded previous configuration"),
            Err(e) => {
                warn!(error = %e, "Reload after rollback failed");
                attempt.note(format!("reload after rollback failed: {}", e));
            }
        }

        attempt.enter(DeployPhase::RolledBack);
    }

    async fn restore(&self, backup: Option<&Path>, scope: Option<&str>) -> io::Result<usize> {
        let backed_up = match backup {
            Some(dir) => scoped(managed_files(dir).await?, scope),
            None => Vec::new(),
        };

        if let Some(dir) = backup {
            let staging = self.conf_dir.join(format!(
                "{}{}",
                STAGING_PREFIX,
                uuid::Uuid::new_v4().simple()
            ));
            tokio::fs::create_dir(&staging).await?;
            let copied = async {
                for name in &backed_up {
                    tokio::fs::copy(dir.join(name), staging.join(name)).await?;
                    tokio::fs::rename(staging.join(name), self.conf_dir.join(name)).await?;
                }
                Ok::<_, io::Error>(())
            }
            .await;
            remove_dir_quietly(&staging).await;
            copied?;
        }

        let keep: HashSet<&str> = backed_up.iter().map(String::as_str).collect();
        for name in scoped(managed_files(&self.conf_dir).await?, scope) {
            if !keep.contains(name.as_str()) {
                remove_file_if_exists(&self.conf_dir.join(&name)).await?;
            }
        }

        Ok(backed_up.len())
    }

    /// Keep the newest `backup_retention` backup directories. The backup
    /// taken by the current attempt is never pruned.
    async fn prune_backups(&self, current: Option<&Path>) {
        if self.backup_retention == 0 {
            return;
        }

        let mut backups = match list_backups(&self.backup_root).await {
            Ok(backups) => backups,
            Err(e) => {
                warn!(error = %e, dir = %self.backup_root.display(), "Failed to list backups");
                return;
            }
        };
        if backups.len() <= self.backup_retention {
            return;
        }

        let excess = backups.len() - self.backup_retention;
        backups.retain(|dir| Some(dir.as_path()) != current);
        backups.sort();
        for dir in backups.into_iter().take(excess) {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(dir = %dir.display(), "Pruned old backup"),
                Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to prune backup"),
            }
        }
    }
}

fn check_file_set(request: &DeployRequest) -> Result<(), DeployError> {
    if let Some(scope) = &request.tenant {
        validate_slug(scope)
            .map_err(|e| DeployError::InvalidFileSet(format!("bad tenant scope: {}", e)))?;
    }

    let mut seen = HashSet::new();
    for file in &request.files {
        let Some((slug, _)) = parse_managed_filename(&file.filename) else {
            return Err(DeployError::InvalidFileSet(format!(
                "{:?} is not a managed configuration filename",
                file.filename
            )));
        };
        if let Some(scope) = &request.tenant {
            if slug.as_str() != scope.as_str() {
                return Err(DeployError::InvalidFileSet(format!(
                    "{:?} does not belong to tenant {}",
                    file.filename, scope
                )));
            }
        }
        if !seen.insert(file.filename.as_str()) {
            return Err(DeployError::InvalidFileSet(format!(
                "{:?} appears more than once",
                file.filename
            )));
        }
    }

    let actual = content_hash(&request.files);
    if actual != request.hash {
        return Err(DeployError::HashMismatch {
            expected: request.hash.clone(),
            actual,
        });
    }
    Ok(())
}

/// Keep the managed names owned by `scope`, or all of them when unscoped
fn scoped(names: Vec<String>, scope: Option<&str>) -> Vec<String> {
    let Some(scope) = scope else {
        return names;
    };
    names
        .into_iter()
        .filter(|name| {
            parse_managed_filename(name)
                .map(|(slug, _)| slug.as_str() == scope)
                .unwrap_or(false)
        })
        .collect()
}

fn note_output(attempt: &mut Attempt, step: &str, output: &str) {
    if output.is_empty() {
        attempt.note(format!("{}: ok", step));
    } else {
        attempt.note(format!("{}: {}", step, output));
    }
}

/// Sorted names of regular files in `dir` that the deployer manages.
/// Symlinks and anything else are ignored.
pub async fn managed_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if parse_managed_filename(&name).is_some() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

async fn list_backups(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let is_backup = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with(BACKUP_PREFIX))
            .unwrap_or(false);
        if is_backup && entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn remove_dir_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(dir = %path.display(), error = %e, "Failed to remove directory");
        }
    }
}
