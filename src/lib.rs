//! Edgeplane - control plane for a multi-tenant reverse-proxy edge
//!
//! This library provides:
//! - Validation of every operator-supplied value that reaches proxy config
//! - A deterministic compiler from tenants to per-domain nginx files
//! - Transactional deployment of file sets with backup and rollback
//! - An append-only ledger of deployment attempts
//! - A fleet registry fed by edge node heartbeats

pub mod agent;
pub mod api;
pub mod auth;
pub mod compiler;
pub mod config;
pub mod control;
pub mod db;
pub mod deploy;
pub mod error;
pub mod fleet;
pub mod host_lookup;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod seed;
pub mod template;
pub mod validation;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
