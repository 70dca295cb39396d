//! SQLite database for control-plane state
//!
//! Holds the tenant graph, the deployment ledger and the edge fleet. The
//! ledger table is append-only at the schema level: triggers abort any
//! UPDATE or DELETE.

use crate::model::{EdgePolicy, Target, Tenant, UpstreamPool};
use crate::validation::{validate_hostname, validate_slug};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 3;

/// Region assigned to clusters created implicitly by a heartbeat
pub const DEFAULT_CLUSTER_REGION: &str = "global";
/// Provider assigned to clusters created implicitly by a heartbeat
pub const DEFAULT_CLUSTER_PROVIDER: &str = "unknown";

/// Timestamp format used for every stored time: RFC 3339, UTC, millisecond
/// precision. Strings in this format sort chronologically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Enable WAL mode and foreign key enforcement
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
            if current_version < 3 {
                Self::migrate_v3(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: tenant graph
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: tenant graph");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            -- A hostname belongs to exactly one tenant
            CREATE TABLE IF NOT EXISTS domains (
                name TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                FOREIGN KEY (tenant_id) REFERENCES tenants(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_domains_tenant ON domains(tenant_id);

            -- seq preserves creation order; the first pool is the routed one
            CREATE TABLE IF NOT EXISTS upstream_pools (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                targets TEXT NOT NULL DEFAULT '[]',
                UNIQUE (tenant_id, name),
                FOREIGN KEY (tenant_id) REFERENCES tenants(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS edge_policies (
                tenant_id TEXT PRIMARY KEY,
                policy TEXT NOT NULL,
                FOREIGN KEY (tenant_id) REFERENCES tenants(id) ON DELETE CASCADE
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: append-only deployment ledger
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: deployment ledger");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deployment_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                hash TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('SUCCESS', 'FAILED')),
                logs TEXT NOT NULL DEFAULT '',
                tenant_slug TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deployment_history_hash ON deployment_history(hash);
            CREATE INDEX IF NOT EXISTS idx_deployment_history_tenant ON deployment_history(tenant_slug);

            CREATE TRIGGER IF NOT EXISTS deployment_history_no_update
            BEFORE UPDATE ON deployment_history
            BEGIN
                SELECT RAISE(ABORT, 'deployment_history is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS deployment_history_no_delete
            BEFORE DELETE ON deployment_history
            BEGIN
                SELECT RAISE(ABORT, 'deployment_history is append-only');
            END;

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    /// Migration v3: edge fleet
    fn migrate_v3(conn: &Connection) -> Result<()> {
        debug!("Applying migration v3: edge fleet");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS edge_clusters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                region TEXT NOT NULL,
                provider TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS edge_nodes (
                id TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL,
                hostname TEXT NOT NULL,
                ip_address TEXT NOT NULL,
                version TEXT NOT NULL,
                status TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (cluster_id, hostname),
                FOREIGN KEY (cluster_id) REFERENCES edge_clusters(id) ON DELETE CASCADE
            );

            INSERT INTO schema_migrations (version) VALUES (3);
        "#,
        )?;

        Ok(())
    }

    // ==================== Tenant Operations ====================

    /// Create or replace a tenant, keyed by slug.
    ///
    /// The slug and every domain are validated before anything is written,
    /// and the whole graph (domains, pools, policy) is replaced in one
    /// transaction. An existing tenant keeps its id. Returns the stored id.
    pub fn save_tenant(&self, tenant: &Tenant) -> Result<String> {
        let slug = validate_slug(&tenant.slug)?;
        let domains = tenant
            .domains
            .iter()
            .map(|d| validate_hostname(d))
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM tenants WHERE slug = ?1",
                params![slug.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE tenants SET name = ?1 WHERE id = ?2",
                    params![tenant.name, id],
                )?;
                tx.execute("DELETE FROM domains WHERE tenant_id = ?1", params![id])?;
                tx.execute("DELETE FROM upstream_pools WHERE tenant_id = ?1", params![id])?;
                tx.execute("DELETE FROM edge_policies WHERE tenant_id = ?1", params![id])?;
                id
            }
            None => {
                let id = if tenant.id.is_empty() {
                    uuid::Uuid::new_v4().simple().to_string()
                } else {
                    tenant.id.clone()
                };
                let created_at = if tenant.created_at.is_empty() {
                    format_timestamp(Utc::now())
                } else {
                    tenant.created_at.clone()
                };
                tx.execute(
                    "INSERT INTO tenants (id, name, slug, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![id, tenant.name, slug.as_str(), created_at],
                )?;
                id
            }
        };

        for domain in &domains {
            let owner: Option<String> = tx
                .query_row(
                    "SELECT t.slug FROM domains d JOIN tenants t ON t.id = d.tenant_id
                     WHERE d.name = ?1",
                    params![domain.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            match owner {
                Some(owner) if owner != slug.as_str() => {
                    bail!("Domain {} already belongs to tenant {}", domain, owner);
                }
                Some(_) => continue,
                None => {}
            }
            tx.execute(
                "INSERT INTO domains (name, tenant_id) VALUES (?1, ?2)",
                params![domain.as_str(), id],
            )?;
        }

        for pool in &tenant.pools {
            let targets = serde_json::to_string(&pool.targets)?;
            tx.execute(
                "INSERT INTO upstream_pools (tenant_id, name, targets) VALUES (?1, ?2, ?3)",
                params![id, pool.name, targets],
            )
            .with_context(|| format!("Failed to save pool {} for {}", pool.name, slug))?;
        }

        if let Some(policy) = &tenant.policy {
            tx.execute(
                "INSERT INTO edge_policies (tenant_id, policy) VALUES (?1, ?2)",
                params![id, serde_json::to_string(policy)?],
            )?;
        }

        tx.commit()?;
        debug!(tenant = %slug, id = %id, domains = domains.len(), "Tenant saved");
        Ok(id)
    }

    /// Load every tenant with its domains, pools and policy, ordered by slug
    pub fn load_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, slug, created_at FROM tenants ORDER BY slug")?;
        let shells = stmt
            .query_map([], tenant_shell)?
            .collect::<Result<Vec<_>, _>>()?;

        shells
            .into_iter()
            .map(|tenant| fill_tenant(&conn, tenant))
            .collect()
    }

    /// Get a single tenant by slug
    pub fn get_tenant(&self, slug: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock();
        let shell = conn
            .query_row(
                "SELECT id, name, slug, created_at FROM tenants WHERE slug = ?1",
                params![slug],
                tenant_shell,
            )
            .optional()
            .context("Failed to get tenant")?;

        shell.map(|tenant| fill_tenant(&conn, tenant)).transpose()
    }

    /// Delete a tenant and everything it owns
    pub fn delete_tenant(&self, slug: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM tenants WHERE slug = ?1", params![slug])?;
        Ok(rows > 0)
    }

    // ==================== Deployment Operations ====================

    /// Append a ledger entry. Returns its sequence number.
    pub fn insert_deployment(&self, record: &DeploymentRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO deployment_history (id, hash, status, logs, tenant_slug, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.hash,
                record.status,
                record.logs,
                record.tenant_slug,
                record.created_at
            ],
        )
        .context("Failed to append deployment history")?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent entries first
    pub fn list_deployments(&self, limit: usize) -> Result<Vec<DeploymentRecord>> {
        self.query_deployments(
            "SELECT seq, id, hash, status, logs, tenant_slug, created_at
             FROM deployment_history ORDER BY seq DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    pub fn latest_successful_deployment(&self) -> Result<Option<DeploymentRecord>> {
        Ok(self
            .query_deployments(
                "SELECT seq, id, hash, status, logs, tenant_slug, created_at
                 FROM deployment_history WHERE status = 'SUCCESS' ORDER BY seq DESC LIMIT 1",
                [],
            )?
            .into_iter()
            .next())
    }

    pub fn find_deployments_by_hash(&self, hash: &str) -> Result<Vec<DeploymentRecord>> {
        self.query_deployments(
            "SELECT seq, id, hash, status, logs, tenant_slug, created_at
             FROM deployment_history WHERE hash = ?1 ORDER BY seq DESC",
            params![hash],
        )
    }

    pub fn list_tenant_deployments(
        &self,
        tenant_slug: &str,
        limit: usize,
    ) -> Result<Vec<DeploymentRecord>> {
        self.query_deployments(
            "SELECT seq, id, hash, status, logs, tenant_slug, created_at
             FROM deployment_history WHERE tenant_slug = ?1 ORDER BY seq DESC LIMIT ?2",
            params![tenant_slug, limit as i64],
        )
    }

    fn query_deployments<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<DeploymentRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(params, |row| {
                Ok(DeploymentRecord {
                    seq: row.get(0)?,
                    id: row.get(1)?,
                    hash: row.get(2)?,
                    status: row.get(3)?,
                    logs: row.get(4)?,
                    tenant_slug: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // ==================== Edge Fleet Operations ====================

    /// Record a node heartbeat in one transaction.
    ///
    /// `cluster_key` is matched against cluster ids first, then names. An
    /// unknown key creates a cluster named after it. The node is upserted on
    /// `(cluster_id, hostname)`.
    pub fn record_heartbeat(&self, heartbeat: &HeartbeatRecord) -> Result<EdgeNodeRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let cluster = resolve_or_create_cluster(&tx, &heartbeat.cluster_key, &heartbeat.seen_at)?;

        tx.execute(
            "INSERT INTO edge_nodes
                (id, cluster_id, hostname, ip_address, version, status, last_seen_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT (cluster_id, hostname) DO UPDATE SET
                ip_address = excluded.ip_address,
                version = excluded.version,
                status = excluded.status,
                last_seen_at = excluded.last_seen_at",
            params![
                uuid::Uuid::new_v4().to_string(),
                cluster.id,
                heartbeat.hostname,
                heartbeat.ip_address,
                heartbeat.version,
                heartbeat.status,
                heartbeat.seen_at
            ],
        )?;

        let node = tx.query_row(
            &format!("{} WHERE n.cluster_id = ?1 AND n.hostname = ?2", NODE_SELECT),
            params![cluster.id, heartbeat.hostname],
            node_from_row,
        )?;

        tx.commit()?;
        Ok(node)
    }

    pub fn get_edge_cluster(&self, key: &str) -> Result<Option<EdgeClusterRecord>> {
        let conn = self.conn.lock();
        find_cluster(&conn, key)
    }

    pub fn list_edge_clusters(&self) -> Result<Vec<EdgeClusterRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, region, provider, created_at FROM edge_clusters ORDER BY name",
        )?;
        let clusters = stmt
            .query_map([], cluster_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(clusters)
    }

    /// All nodes, ordered by cluster name then hostname
    pub fn list_edge_nodes(&self) -> Result<Vec<EdgeNodeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY c.name, n.hostname",
            NODE_SELECT
        ))?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }
}

const NODE_SELECT: &str = "SELECT n.id, n.cluster_id, c.name, n.hostname, n.ip_address, n.version,
        n.status, n.last_seen_at, n.created_at
     FROM edge_nodes n JOIN edge_clusters c ON c.id = n.cluster_id";

fn tenant_shell(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        created_at: row.get(3)?,
        domains: Vec::new(),
        pools: Vec::new(),
        policy: None,
    })
}

fn fill_tenant(conn: &Connection, mut tenant: Tenant) -> Result<Tenant> {
    let mut stmt = conn.prepare("SELECT name FROM domains WHERE tenant_id = ?1 ORDER BY name")?;
    tenant.domains = stmt
        .query_map(params![tenant.id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    let mut stmt =
        conn.prepare("SELECT name, targets FROM upstream_pools WHERE tenant_id = ?1 ORDER BY seq")?;
    let pools = stmt
        .query_map(params![tenant.id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    tenant.pools = pools
        .into_iter()
        .map(|(name, targets)| {
            let targets: Vec<Target> = serde_json::from_str(&targets)
                .with_context(|| format!("Corrupt targets for pool {} of {}", name, tenant.slug))?;
            Ok(UpstreamPool { name, targets })
        })
        .collect::<Result<Vec<_>>>()?;

    let policy: Option<String> = conn
        .query_row(
            "SELECT policy FROM edge_policies WHERE tenant_id = ?1",
            params![tenant.id],
            |row| row.get(0),
        )
        .optional()?;
    tenant.policy = policy
        .map(|json| serde_json::from_str::<EdgePolicy>(&json))
        .transpose()
        .with_context(|| format!("Corrupt policy for {}", tenant.slug))?;

    Ok(tenant)
}

fn find_cluster(conn: &Connection, key: &str) -> Result<Option<EdgeClusterRecord>> {
    let by_id = conn
        .query_row(
            "SELECT id, name, region, provider, created_at FROM edge_clusters WHERE id = ?1",
            params![key],
            cluster_from_row,
        )
        .optional()?;
    if by_id.is_some() {
        return Ok(by_id);
    }

    conn.query_row(
        "SELECT id, name, region, provider, created_at FROM edge_clusters WHERE name = ?1",
        params![key],
        cluster_from_row,
    )
    .optional()
    .context("Failed to look up edge cluster")
}

fn resolve_or_create_cluster(
    conn: &Connection,
    key: &str,
    now: &str,
) -> Result<EdgeClusterRecord> {
    if let Some(cluster) = find_cluster(conn, key)? {
        return Ok(cluster);
    }

    let cluster = EdgeClusterRecord {
        id: uuid::Uuid::new_v4().to_string(),
        name: key.to_string(),
        region: DEFAULT_CLUSTER_REGION.to_string(),
        provider: DEFAULT_CLUSTER_PROVIDER.to_string(),
        created_at: now.to_string(),
    };
    conn.execute(
        "INSERT INTO edge_clusters (id, name, region, provider, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            cluster.id,
            cluster.name,
            cluster.region,
            cluster.provider,
            cluster.created_at
        ],
    )?;
    info!(cluster = %cluster.name, id = %cluster.id, "Created edge cluster from heartbeat");
    Ok(cluster)
}

fn cluster_from_row(row: &Row<'_>) -> rusqlite::Result<EdgeClusterRecord> {
    Ok(EdgeClusterRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        region: row.get(2)?,
        provider: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<EdgeNodeRecord> {
    Ok(EdgeNodeRecord {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        cluster_name: row.get(2)?,
        hostname: row.get(3)?,
        ip_address: row.get(4)?,
        version: row.get(5)?,
        status: row.get(6)?,
        last_seen_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

// ==================== Record Types ====================

/// Deployment ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Insertion order; 0 before the row is stored
    pub seq: i64,
    pub id: String,
    pub hash: String,
    /// `SUCCESS` or `FAILED`
    pub status: String,
    pub logs: String,
    pub tenant_slug: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeClusterRecord {
    pub id: String,
    pub name: String,
    pub region: String,
    pub provider: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeNodeRecord {
    pub id: String,
    pub cluster_id: String,
    pub cluster_name: String,
    pub hostname: String,
    pub ip_address: String,
    pub version: String,
    pub status: String,
    pub last_seen_at: String,
    pub created_at: String,
}

/// Already-validated heartbeat to persist
#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub cluster_key: String,
    pub hostname: String,
    pub ip_address: String,
    pub version: String,
    pub status: String,
    pub seen_at: String,
}
