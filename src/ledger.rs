//! Deployment ledger: one immutable entry per deployment attempt

use crate::db::{format_timestamp, Database, DeploymentRecord};
use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Maximum number of characters of log output kept per entry
pub const LOG_EXCERPT_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeployStatus {
    Success,
    Failed,
}

impl DeployStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Success => "SUCCESS",
            DeployStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(DeployStatus::Success),
            "FAILED" => Some(DeployStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last `LOG_EXCERPT_LIMIT` characters of a log; the tail holds the failure.
pub fn excerpt(log: &str) -> String {
    let count = log.chars().count();
    if count <= LOG_EXCERPT_LIMIT {
        return log.to_string();
    }
    log.chars().skip(count - LOG_EXCERPT_LIMIT).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub seq: i64,
    pub id: String,
    pub hash: String,
    pub status: DeployStatus,
    pub logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_slug: Option<String>,
    pub created_at: String,
}

impl LedgerEntry {
    fn from_record(record: DeploymentRecord) -> Result<Self> {
        let Some(status) = DeployStatus::parse(&record.status) else {
            bail!("Unknown deployment status {:?} in entry {}", record.status, record.id);
        };
        Ok(Self {
            seq: record.seq,
            id: record.id,
            hash: record.hash,
            status,
            logs: record.logs,
            tenant_slug: record.tenant_slug,
            created_at: record.created_at,
        })
    }
}

/// Append-only view over the `deployment_history` table
#[derive(Clone)]
pub struct Ledger {
    db: Arc<Database>,
}

impl Ledger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record an attempt. The log is cut to its last `LOG_EXCERPT_LIMIT`
    /// characters.
    pub fn append(
        &self,
        hash: &str,
        status: DeployStatus,
        log: &str,
        tenant_slug: Option<&str>,
    ) -> Result<LedgerEntry> {
        let mut record = DeploymentRecord {
            seq: 0,
            id: uuid::Uuid::new_v4().to_string(),
            hash: hash.to_string(),
            status: status.as_str().to_string(),
            logs: excerpt(log),
            tenant_slug: tenant_slug.map(str::to_string),
            created_at: format_timestamp(Utc::now()),
        };
        record.seq = self.db.insert_deployment(&record)?;
        debug!(id = %record.id, hash = %hash, status = %status, "Ledger entry appended");
        LedgerEntry::from_record(record)
    }

    /// Newest first
    pub fn list(&self, limit: usize) -> Result<Vec<LedgerEntry>> {
        convert(self.db.list_deployments(limit)?)
    }

    pub fn latest_successful(&self) -> Result<Option<LedgerEntry>> {
        self.db
            .latest_successful_deployment()?
            .map(LedgerEntry::from_record)
            .transpose()
    }

    /// Every attempt that carried `hash`, newest first
    pub fn find_by_hash(&self, hash: &str) -> Result<Vec<LedgerEntry>> {
        convert(self.db.find_deployments_by_hash(hash)?)
    }

    pub fn for_tenant(&self, slug: &str, limit: usize) -> Result<Vec<LedgerEntry>> {
        convert(self.db.list_tenant_deployments(slug, limit)?)
    }
}

fn convert(records: Vec<DeploymentRecord>) -> Result<Vec<LedgerEntry>> {
    records.into_iter().map(LedgerEntry::from_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_excerpt_keeps_tail() {
        assert_eq!(excerpt("short"), "short");

        let long = format!("{}END", "x".repeat(2000));
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), LOG_EXCERPT_LIMIT);
        assert!(cut.ends_with("END"));

        // Multi-byte characters are counted, not bytes
        let wide = "é".repeat(1500);
        assert_eq!(excerpt(&wide).chars().count(), LOG_EXCERPT_LIMIT);
    }

    #[test]
    fn test_append_and_list_newest_first() {
        let ledger = ledger();
        ledger.append("h1", DeployStatus::Success, "ok", None).unwrap();
        ledger.append("h2", DeployStatus::Failed, "boom", None).unwrap();
        ledger.append("h3", DeployStatus::Success, "ok", Some("acme")).unwrap();

        let hashes: Vec<_> = ledger.list(10).unwrap().into_iter().map(|e| e.hash).collect();
        assert_eq!(hashes, vec!["h3", "h2", "h1"]);
        assert_eq!(ledger.list(1).unwrap().len(), 1);
    }

    #[test]
    fn test_append_caps_log() {
        let ledger = ledger();
        let entry = ledger
            .append("h1", DeployStatus::Failed, &"e".repeat(5000), None)
            .unwrap();
        assert_eq!(entry.logs.len(), LOG_EXCERPT_LIMIT);
        assert_eq!(ledger.list(1).unwrap()[0].logs.len(), LOG_EXCERPT_LIMIT);
    }

    #[test]
    fn test_latest_successful_skips_failures() {
        let ledger = ledger();
        assert!(ledger.latest_successful().unwrap().is_none());

        ledger.append("good", DeployStatus::Success, "", None).unwrap();
        ledger.append("bad", DeployStatus::Failed, "", None).unwrap();

        assert_eq!(ledger.latest_successful().unwrap().unwrap().hash, "good");
    }

    #[test]
    fn test_find_by_hash_and_tenant() {
        let ledger = ledger();
        ledger.append("h1", DeployStatus::Failed, "", Some("acme")).unwrap();
        ledger.append("h1", DeployStatus::Success, "", None).unwrap();
        ledger.append("h2", DeployStatus::Success, "", Some("acme")).unwrap();

        let by_hash = ledger.find_by_hash("h1").unwrap();
        assert_eq!(by_hash.len(), 2);
        assert_eq!(by_hash[0].status, DeployStatus::Success);

        let acme = ledger.for_tenant("acme", 10).unwrap();
        assert_eq!(acme.len(), 2);
        assert!(ledger.for_tenant("globex", 10).unwrap().is_empty());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&DeployStatus::Success).unwrap(),
            "\"SUCCESS\""
        );
        assert_eq!(DeployStatus::parse("FAILED"), Some(DeployStatus::Failed));
        assert_eq!(DeployStatus::parse("failed"), None);
    }
}
