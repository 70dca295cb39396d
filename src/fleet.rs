//! Fleet registry: edge node identity and liveness from heartbeats
//!
//! Nodes report themselves; nothing here ever deletes a node. Whether a
//! node is stale is decided at read time from `last_seen_at`.

use crate::auth::constant_time_compare;
use crate::db::{format_timestamp, parse_timestamp, Database, EdgeNodeRecord, HeartbeatRecord};
use crate::validation::{validate_hostname, validate_identifier, validate_ipv4, ValidationError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Default heartbeat-miss threshold: three missed 30 s heartbeats
pub const DEFAULT_STALE_AFTER_SECS: u64 = 90;
/// Longest accepted stale window (30 days)
pub const MAX_STALE_AFTER_SECS: u64 = 30 * 24 * 60 * 60;
const MAX_VERSION_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("invalid or missing edge token")]
    Unauthorized,

    #[error("invalid {field}: {source}")]
    InvalidField {
        field: &'static str,
        #[source]
        source: ValidationError,
    },

    #[error("invalid node status {0:?}")]
    InvalidStatus(String),

    #[error("invalid agent version {0:?}")]
    InvalidVersion(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Self-reported node health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Draining,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Healthy => "HEALTHY",
            NodeStatus::Degraded => "DEGRADED",
            NodeStatus::Unhealthy => "UNHEALTHY",
            NodeStatus::Draining => "DRAINING",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HEALTHY" => Ok(NodeStatus::Healthy),
            "DEGRADED" => Ok(NodeStatus::Degraded),
            "UNHEALTHY" => Ok(NodeStatus::Unhealthy),
            "DRAINING" => Ok(NodeStatus::Draining),
            _ => Err(FleetError::InvalidStatus(s.to_string())),
        }
    }
}

/// Heartbeat body as sent by the edge agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Cluster id or name
    pub cluster_id: String,
    pub hostname: String,
    pub ip_address: String,
    pub version: String,
    pub status: String,
}

/// A node as reported to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: String,
    pub cluster_id: String,
    pub cluster_name: String,
    pub hostname: String,
    pub ip_address: String,
    pub version: String,
    pub status: String,
    pub last_seen_at: String,
    pub stale: bool,
}

impl NodeView {
    /// Fresh and willing to take traffic
    pub fn is_eligible(&self) -> bool {
        !self.stale
            && matches!(
                self.status.parse::<NodeStatus>(),
                Ok(NodeStatus::Healthy | NodeStatus::Degraded)
            )
    }
}

pub struct FleetRegistry {
    db: Arc<Database>,
    token: String,
    stale_after: Duration,
}

impl FleetRegistry {
    /// `stale_after_secs` is clamped to [`MAX_STALE_AFTER_SECS`]
    pub fn new(db: Arc<Database>, token: impl Into<String>, stale_after_secs: u64) -> Self {
        let secs = stale_after_secs.min(MAX_STALE_AFTER_SECS) as i64;
        Self {
            db,
            token: token.into(),
            stale_after: Duration::seconds(secs),
        }
    }

    /// Validate and record a heartbeat. Nothing is written unless the token
    /// matches and every field validates.
    pub fn heartbeat(&self, bearer: Option<&str>, heartbeat: &Heartbeat) -> Result<NodeView, FleetError> {
        self.heartbeat_at(bearer, heartbeat, Utc::now())
    }

    pub fn heartbeat_at(
        &self,
        bearer: Option<&str>,
        heartbeat: &Heartbeat,
        now: DateTime<Utc>,
    ) -> Result<NodeView, FleetError> {
        if !self.authorize(bearer) {
            warn!(hostname = %heartbeat.hostname, "Rejected heartbeat with bad token");
            return Err(FleetError::Unauthorized);
        }

        let record = validate_heartbeat(heartbeat, now)?;
        let node = self.db.record_heartbeat(&record)?;
        debug!(
            cluster = %node.cluster_name,
            hostname = %node.hostname,
            status = %node.status,
            "Heartbeat recorded"
        );
        Ok(self.view(node, now))
    }

    /// Whether `bearer` is the shared edge secret
    pub fn authorize(&self, bearer: Option<&str>) -> bool {
        bearer
            .map(|token| constant_time_compare(token, &self.token))
            .unwrap_or(false)
    }

    /// Every known node with its staleness as of `now`
    pub fn list_nodes(&self, now: DateTime<Utc>) -> Result<Vec<NodeView>, FleetError> {
        Ok(self
            .db
            .list_edge_nodes()?
            .into_iter()
            .map(|node| self.view(node, now))
            .collect())
    }

    /// Nodes that should receive configuration
    pub fn eligible_nodes(&self, now: DateTime<Utc>) -> Result<Vec<NodeView>, FleetError> {
        Ok(self
            .list_nodes(now)?
            .into_iter()
            .filter(NodeView::is_eligible)
            .collect())
    }

    fn view(&self, node: EdgeNodeRecord, now: DateTime<Utc>) -> NodeView {
        // An unparseable timestamp counts as never seen
        let stale = parse_timestamp(&node.last_seen_at)
            .map(|seen| now - seen > self.stale_after)
            .unwrap_or(true);

        NodeView {
            id: node.id,
            cluster_id: node.cluster_id,
            cluster_name: node.cluster_name,
            hostname: node.hostname,
            ip_address: node.ip_address,
            version: node.version,
            status: node.status,
            last_seen_at: node.last_seen_at,
            stale,
        }
    }
}

fn validate_heartbeat(heartbeat: &Heartbeat, now: DateTime<Utc>) -> Result<HeartbeatRecord, FleetError> {
    let cluster = validate_identifier(heartbeat.cluster_id.trim()).map_err(invalid("clusterId"))?;
    let hostname = validate_hostname(heartbeat.hostname.trim()).map_err(invalid("hostname"))?;
    let ip = validate_ipv4(heartbeat.ip_address.trim()).map_err(invalid("ipAddress"))?;
    let status: NodeStatus = heartbeat.status.trim().parse()?;

    let version = heartbeat.version.trim();
    let version_ok = !version.is_empty()
        && version.len() <= MAX_VERSION_LEN
        && version
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'+' | b'_'));
    if !version_ok {
        return Err(FleetError::InvalidVersion(heartbeat.version.clone()));
    }

    Ok(HeartbeatRecord {
        cluster_key: cluster.into_string(),
        hostname: hostname.into_string(),
        ip_address: ip.to_string(),
        version: version.to_string(),
        status: status.as_str().to_string(),
        seen_at: format_timestamp(now),
    })
}

fn invalid(field: &'static str) -> impl Fn(ValidationError) -> FleetError {
    move |source| FleetError::InvalidField { field, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "edge-secret";

    fn registry() -> FleetRegistry {
        FleetRegistry::new(
            Arc::new(Database::open_in_memory().unwrap()),
            TOKEN,
            DEFAULT_STALE_AFTER_SECS,
        )
    }

    fn heartbeat(hostname: &str) -> Heartbeat {
        Heartbeat {
            cluster_id: "local-cluster".to_string(),
            hostname: hostname.to_string(),
            ip_address: "127.0.0.1".to_string(),
            version: "1.0.0".to_string(),
            status: "HEALTHY".to_string(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_heartbeat_is_idempotent_per_node() {
        let registry = registry();
        let first = registry.heartbeat_at(Some(TOKEN), &heartbeat("edge-1"), at(0)).unwrap();
        let second = registry.heartbeat_at(Some(TOKEN), &heartbeat("edge-1"), at(30)).unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.last_seen_at > first.last_seen_at);

        let nodes = registry.list_nodes(at(30)).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].cluster_name, "local-cluster");
    }

    #[test]
    fn test_bad_token_mutates_nothing() {
        let registry = registry();
        for bearer in [None, Some("wrong"), Some("")] {
            let err = registry.heartbeat_at(bearer, &heartbeat("edge-1"), at(0)).unwrap_err();
            assert!(matches!(err, FleetError::Unauthorized));
        }
        assert!(registry.list_nodes(at(0)).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_fields_are_rejected() {
        let registry = registry();

        let mut hb = heartbeat("edge 1");
        assert!(matches!(
            registry.heartbeat_at(Some(TOKEN), &hb, at(0)),
            Err(FleetError::InvalidField { field: "hostname", .. })
        ));

        hb = heartbeat("edge-1");
        hb.ip_address = "not-an-ip".to_string();
        assert!(registry.heartbeat_at(Some(TOKEN), &hb, at(0)).is_err());

        hb = heartbeat("edge-1");
        hb.status = "ON_FIRE".to_string();
        assert!(matches!(
            registry.heartbeat_at(Some(TOKEN), &hb, at(0)),
            Err(FleetError::InvalidStatus(_))
        ));

        hb = heartbeat("edge-1");
        hb.version = "1.0; drop table".to_string();
        assert!(matches!(
            registry.heartbeat_at(Some(TOKEN), &hb, at(0)),
            Err(FleetError::InvalidVersion(_))
        ));

        assert!(registry.list_nodes(at(0)).unwrap().is_empty());
    }

    #[test]
    fn test_staleness_is_derived_at_read_time() {
        let registry = registry();
        registry.heartbeat_at(Some(TOKEN), &heartbeat("edge-1"), at(0)).unwrap();
        registry.heartbeat_at(Some(TOKEN), &heartbeat("edge-2"), at(60)).unwrap();

        let nodes = registry.list_nodes(at(120)).unwrap();
        let stale: Vec<_> = nodes.iter().map(|n| (n.hostname.as_str(), n.stale)).collect();
        assert_eq!(stale, vec![("edge-1", true), ("edge-2", false)]);

        // Exactly at the threshold still counts as fresh
        assert!(!registry.list_nodes(at(90)).unwrap()[0].stale);
    }

    #[test]
    fn test_huge_stale_window_is_clamped() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = FleetRegistry::new(db, TOKEN, u64::MAX);
        registry.heartbeat_at(Some(TOKEN), &heartbeat("edge-1"), at(0)).unwrap();

        assert!(!registry.list_nodes(at(60)).unwrap()[0].stale);
        let past_max = at(MAX_STALE_AFTER_SECS as i64 + 1);
        assert!(registry.list_nodes(past_max).unwrap()[0].stale);
    }

    #[test]
    fn test_eligible_nodes() {
        let registry = registry();
        registry.heartbeat_at(Some(TOKEN), &heartbeat("edge-1"), at(0)).unwrap();

        let mut draining = heartbeat("edge-2");
        draining.status = "draining".to_string();
        registry.heartbeat_at(Some(TOKEN), &draining, at(0)).unwrap();

        let mut degraded = heartbeat("edge-3");
        degraded.status = "DEGRADED".to_string();
        registry.heartbeat_at(Some(TOKEN), &degraded, at(0)).unwrap();

        let eligible: Vec<_> = registry
            .eligible_nodes(at(10))
            .unwrap()
            .into_iter()
            .map(|n| n.hostname)
            .collect();
        assert_eq!(eligible, vec!["edge-1", "edge-3"]);

        assert!(registry.eligible_nodes(at(1000)).unwrap().is_empty());
    }

    #[test]
    fn test_heartbeat_body_accepts_agent_json() {
        let hb: Heartbeat = serde_json::from_str(
            r#"{"clusterId":"local-cluster","hostname":"edge-1","ipAddress":"127.0.0.1",
                "version":"1.0.0","status":"HEALTHY","timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(hb.cluster_id, "local-cluster");
        assert_eq!(hb.ip_address, "127.0.0.1");
    }
}
