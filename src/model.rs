//! Tenant graph consumed by the compiler and the rendered file set it produces
//!
//! These are raw records as stored or imported. Nothing here has been
//! validated; the compiler validates once at its boundary.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A customer organization together with everything needed to render it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub domains: Vec<String>,
    /// Ordered by creation; only the first pool is routed to
    #[serde(default)]
    pub pools: Vec<UpstreamPool>,
    #[serde(default)]
    pub policy: Option<EdgePolicy>,
}

/// Named, weighted set of backend targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamPool {
    pub name: String,
    #[serde(default)]
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// Defaults to 1 when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl Target {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Tenant-level traffic and security rules
///
/// When `ip_allow_list` is non-empty it wins: the deny list is ignored and
/// everything not allowed is denied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgePolicy {
    /// Custom response headers, name -> value
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub ip_allow_list: Vec<String>,
    #[serde(default)]
    pub ip_deny_list: Vec<String>,
    #[serde(default)]
    pub security_headers: SecurityHeaders,
}

/// Request rate limit; zero is legal and blocks all traffic through the zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub rps: u32,
    pub burst: u32,
}

/// Toggles for the common security response headers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityHeaders {
    #[serde(default)]
    pub hsts: bool,
    #[serde(default)]
    pub x_frame_options: bool,
    #[serde(default)]
    pub x_content_type_options: bool,
    #[serde(default)]
    pub csp: bool,
}

/// One file of a rendered configuration set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedFile {
    pub filename: String,
    pub content: String,
}

impl RenderedFile {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

/// SHA-256 over a file set, independent of the order files are listed in.
///
/// Files are sorted by name and each name and content is length-prefixed,
/// so no two distinct sets share a serialization.
pub fn content_hash(files: &[RenderedFile]) -> String {
    let mut sorted: Vec<&RenderedFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.filename.cmp(&b.filename));

    let mut hasher = Sha256::new();
    for file in sorted {
        hasher.update((file.filename.len() as u64).to_be_bytes());
        hasher.update(file.filename.as_bytes());
        hasher.update((file.content.len() as u64).to_be_bytes());
        hasher.update(file.content.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_ignores_order() {
        let a = RenderedFile::new("a_a.com.conf", "one");
        let b = RenderedFile::new("b_b.com.conf", "two");

        let forward = content_hash(&[a.clone(), b.clone()]);
        let reverse = content_hash(&[b, a]);
        assert_eq!(forward, reverse);
        assert_eq!(forward.len(), 64);
    }

    #[test]
    fn test_content_hash_detects_changes() {
        let base = content_hash(&[RenderedFile::new("a_a.com.conf", "one")]);
        let edited = content_hash(&[RenderedFile::new("a_a.com.conf", "one ")]);
        let renamed = content_hash(&[RenderedFile::new("a_b.com.conf", "one")]);
        assert_ne!(base, edited);
        assert_ne!(base, renamed);

        // Moving bytes between name and content must not collide
        let left = content_hash(&[RenderedFile::new("ab", "c")]);
        let right = content_hash(&[RenderedFile::new("a", "bc")]);
        assert_ne!(left, right);
    }

    #[test]
    fn test_empty_set_hash_is_stable() {
        assert_eq!(content_hash(&[]), content_hash(&[]));
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: EdgePolicy = toml::from_str(
            r#"
ip_allow_list = ["10.0.0.1"]

[headers]
X-Test = "Value"
"#,
        )
        .unwrap();

        assert_eq!(policy.headers.get("X-Test").map(String::as_str), Some("Value"));
        assert!(policy.rate_limit.is_none());
        assert!(policy.ip_deny_list.is_empty());
        assert!(!policy.security_headers.hsts);
    }
}
