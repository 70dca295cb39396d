//! Tenant import from a TOML seed file
//!
//! ```toml
//! [[tenants]]
//! slug = "tenant1"
//! name = "Tenant One"
//! domains = ["tenant1.localtest.me"]
//!
//! [[tenants.pools]]
//! name = "default-pool"
//! targets = [{ host = "tenant1-upstream", port = 80, weight = 100 }]
//!
//! [tenants.policy]
//! rate_limit = { rps = 100, burst = 200 }
//! headers = { "X-Powered-By" = "edgeplane" }
//! ```

use crate::db::Database;
use crate::model::{EdgePolicy, Tenant, UpstreamPool};
use crate::validation::{sanitize_header_value, validate_header_name};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub tenants: Vec<SeedTenant>,
}

#[derive(Debug, Deserialize)]
pub struct SeedTenant {
    /// Generated when omitted
    #[serde(default)]
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub pools: Vec<UpstreamPool>,
    pub policy: Option<EdgePolicy>,
}

/// What an import did
#[derive(Debug, Default)]
pub struct SeedSummary {
    pub imported: Vec<String>,
    /// `(slug, reason)` for every tenant that was skipped
    pub rejected: Vec<(String, String)>,
}

pub fn load_seed(path: impl AsRef<Path>) -> Result<SeedFile> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse seed file {}", path.display()))
}

/// Upsert every tenant by slug. A tenant that fails validation is skipped
/// and reported; the others are still imported.
pub fn apply_seed(db: &Database, seed: SeedFile) -> SeedSummary {
    let mut summary = SeedSummary::default();

    for entry in seed.tenants {
        let slug = entry.slug.clone();
        let result = sanitize_policy(entry.policy).and_then(|policy| {
            db.save_tenant(&Tenant {
                id: entry.id,
                name: entry.name,
                slug: entry.slug,
                created_at: String::new(),
                domains: entry.domains,
                pools: entry.pools,
                policy,
            })
        });

        match result {
            Ok(id) => {
                info!(tenant = %slug, id = %id, "Seeded tenant");
                summary.imported.push(slug);
            }
            Err(e) => {
                warn!(tenant = %slug, error = %e, "Skipping seed tenant");
                summary.rejected.push((slug, format!("{:#}", e)));
            }
        }
    }

    summary
}

/// Strip line breaks from header values so stored policies are clean.
/// Header names are not rewritten; a bad name rejects the tenant.
fn sanitize_policy(policy: Option<EdgePolicy>) -> Result<Option<EdgePolicy>> {
    let Some(mut policy) = policy else {
        return Ok(None);
    };

    let mut headers = BTreeMap::new();
    for (name, value) in policy.headers {
        validate_header_name(&name)?;
        let value = sanitize_header_value(&value)?;
        headers.insert(name, value.into_string());
    }
    policy.headers = headers;
    Ok(Some(policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = r#"
[[tenants]]
slug = "tenant1"
name = "Tenant One"
domains = ["tenant1.localtest.me"]

[[tenants.pools]]
name = "default-pool"
targets = [{ host = "tenant1-upstream", port = 80, weight = 100 }]

[tenants.policy]
rate_limit = { rps = 100, burst = 200 }
headers = { "X-Powered-By" = "edgeplane\r\n" }

[[tenants]]
slug = "Bad_Slug"
name = "Broken"

[[tenants]]
slug = "tenant2"
name = "Tenant Two"
domains = ["tenant2.localtest.me"]
"#;

    #[test]
    fn test_apply_seed_isolates_bad_tenants() {
        let db = Database::open_in_memory().unwrap();
        let seed: SeedFile = toml::from_str(SEED).unwrap();

        let summary = apply_seed(&db, seed);
        assert_eq!(summary.imported, vec!["tenant1", "tenant2"]);
        assert_eq!(summary.rejected.len(), 1);
        assert_eq!(summary.rejected[0].0, "Bad_Slug");

        let tenant = db.get_tenant("tenant1").unwrap().unwrap();
        assert_eq!(tenant.pools[0].targets[0].weight, Some(100));
        let policy = tenant.policy.unwrap();
        assert_eq!(
            policy.headers.get("X-Powered-By").map(String::as_str),
            Some("edgeplane")
        );
    }

    #[test]
    fn test_seed_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        apply_seed(&db, toml::from_str(SEED).unwrap());
        apply_seed(&db, toml::from_str(SEED).unwrap());

        let tenants = db.load_tenants().unwrap();
        assert_eq!(tenants.len(), 2);
        assert_eq!(tenants[0].pools.len(), 1);
    }

    #[test]
    fn test_bad_header_name_rejects_tenant() {
        let db = Database::open_in_memory().unwrap();
        let seed: SeedFile = toml::from_str(
            r#"
[[tenants]]
slug = "acme"
name = "Acme"

[tenants.policy]
headers = { "X Bad" = "v" }
"#,
        )
        .unwrap();

        let summary = apply_seed(&db, seed);
        assert!(summary.imported.is_empty());
        assert!(db.get_tenant("acme").unwrap().is_none());
    }

    #[test]
    fn test_load_seed_reports_path() {
        let err = load_seed("/nonexistent/seed.toml").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/seed.toml"));
    }
}
