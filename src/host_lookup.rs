//! Hostname to tenant resolution
//!
//! Rebuilt from the live directory after every successful deploy, so it
//! always answers for what the proxy is actually serving.

use crate::validation::{parse_managed_filename, validate_hostname};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Resolves a request hostname to the slug of the tenant serving it
pub trait HostLookup: Send + Sync {
    fn resolve(&self, hostname: &str) -> Option<String>;

    /// Replace the whole table
    fn replace_all(&self, entries: HashMap<String, String>);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryHostLookup {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryHostLookup {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostLookup for InMemoryHostLookup {
    fn resolve(&self, hostname: &str) -> Option<String> {
        let host = validate_hostname(hostname).ok()?;
        self.entries.read().get(host.as_str()).cloned()
    }

    fn replace_all(&self, entries: HashMap<String, String>) {
        *self.entries.write() = entries;
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// hostname -> slug for every managed filename in `names`
pub fn entries_from_filenames<'a>(names: impl IntoIterator<Item = &'a str>) -> HashMap<String, String> {
    names
        .into_iter()
        .filter_map(parse_managed_filename)
        .map(|(slug, host)| (host.into_string(), slug.into_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_after_replace() {
        let lookup = InMemoryHostLookup::new();
        assert!(lookup.is_empty());

        lookup.replace_all(entries_from_filenames([
            "acme_acme.io.conf",
            "acme_www.acme.io.conf",
            "globex_globex.com.conf",
        ]));

        assert_eq!(lookup.len(), 3);
        assert_eq!(lookup.resolve("www.acme.io").as_deref(), Some("acme"));
        assert_eq!(lookup.resolve("GLOBEX.com").as_deref(), Some("globex"));
        assert_eq!(lookup.resolve("unknown.io"), None);
        assert_eq!(lookup.resolve("bad host"), None);

        lookup.replace_all(HashMap::new());
        assert_eq!(lookup.resolve("www.acme.io"), None);
    }

    #[test]
    fn test_foreign_filenames_are_skipped() {
        let entries = entries_from_filenames(["default.conf", "acme_acme.io.conf", "notes.txt"]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get("acme.io").map(String::as_str), Some("acme"));
    }
}
