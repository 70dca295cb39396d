use crate::fleet::MAX_STALE_AFTER_SECS;
use crate::validation::{validate_identifier, validate_ipv4};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Control-plane configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Live directory and proxy control commands
    #[serde(default)]
    pub deploy: DeployConfig,

    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub fleet: FleetConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// TOML file of tenants imported at startup (optional)
    pub seed_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 3001)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token for operator endpoints.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Shared secret presented by edge agents.
    /// If not set, a random token is generated at startup and logged
    pub edge_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
            admin_token: None,
            edge_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite database file (default: ./edgeplane.db)
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeployConfig {
    /// Live configuration directory the proxy includes
    #[serde(default = "default_conf_dir")]
    pub conf_dir: String,

    /// Root under which one backup directory per deploy is created
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,

    /// Number of backup directories kept (0 keeps all)
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,

    /// Syntax check command; `{conf_dir}` is substituted
    #[serde(default = "default_syntax_check_command")]
    pub syntax_check_command: String,

    /// Reload command; `{conf_dir}` is substituted
    #[serde(default = "default_reload_command")]
    pub reload_command: String,

    /// Timeout for each external command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            conf_dir: default_conf_dir(),
            backup_dir: default_backup_dir(),
            backup_retention: default_backup_retention(),
            syntax_check_command: default_syntax_check_command(),
            reload_command: default_reload_command(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl DeployConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    fn validate(&self, section: &str, errors: &mut Vec<String>) {
        if self.conf_dir.trim().is_empty() {
            errors.push(format!("{}.conf_dir must not be empty", section));
        }
        if self.backup_dir.trim().is_empty() {
            errors.push(format!("{}.backup_dir must not be empty", section));
        }
        if Path::new(&self.backup_dir).starts_with(&self.conf_dir) {
            errors.push(format!(
                "{}.backup_dir must not be inside conf_dir ({})",
                section, self.conf_dir
            ));
        }
        for (name, command) in [
            ("syntax_check_command", &self.syntax_check_command),
            ("reload_command", &self.reload_command),
        ] {
            match shell_words::split(command) {
                Ok(argv) if !argv.is_empty() => {}
                Ok(_) => errors.push(format!("{}.{} must not be empty", section, name)),
                Err(e) => errors.push(format!("{}.{} is not a valid command: {}", section, name, e)),
            }
        }
        if self.command_timeout_secs == 0 {
            errors.push(format!("{}.command_timeout_secs must be at least 1", section));
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RenderConfig {
    /// Serve ACME HTTP-01 challenges from this directory (optional)
    pub acme_webroot: Option<String>,

    /// Write a "Generated at" comment into every file. Off by default so
    /// unchanged data renders to the same hash.
    #[serde(default)]
    pub stamp_generated_at: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FleetConfig {
    /// A node is stale after this many seconds without a heartbeat
    #[serde(default = "default_heartbeat_miss")]
    pub heartbeat_miss_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            heartbeat_miss_secs: default_heartbeat_miss(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SchedulerConfig {
    /// Render-and-deploy interval in seconds (0 disables the scheduler)
    #[serde(default)]
    pub interval_secs: u64,
}

impl SchedulerConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_database_path() -> String {
    "./edgeplane.db".to_string()
}

fn default_conf_dir() -> String {
    "/etc/nginx/conf.d".to_string()
}

fn default_backup_dir() -> String {
    "./backups".to_string()
}

fn default_backup_retention() -> usize {
    10
}

fn default_syntax_check_command() -> String {
    "nginx -t".to_string()
}

fn default_reload_command() -> String {
    "nginx -s reload".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

fn default_heartbeat_miss() -> u64 {
    90
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must not be 0".to_string());
        }
        for (name, token) in [
            ("admin_token", &self.server.admin_token),
            ("edge_token", &self.server.edge_token),
        ] {
            if matches!(token, Some(t) if t.trim().is_empty()) {
                errors.push(format!("server.{} must not be empty when set", name));
            }
        }
        if self.database.path.trim().is_empty() {
            errors.push("database.path must not be empty".to_string());
        }
        self.deploy.validate("deploy", &mut errors);
        if self.fleet.heartbeat_miss_secs == 0 {
            errors.push("fleet.heartbeat_miss_secs must be at least 1".to_string());
        }
        if self.fleet.heartbeat_miss_secs > MAX_STALE_AFTER_SECS {
            errors.push(format!(
                "fleet.heartbeat_miss_secs must be at most {}",
                MAX_STALE_AFTER_SECS
            ));
        }
        if let Some(webroot) = &self.render.acme_webroot {
            // Emitted verbatim into a `root` directive
            let unsafe_char = |c: char| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"');
            if webroot.is_empty() || webroot.contains(unsafe_char) {
                errors.push(format!("render.acme_webroot {:?} is not a usable path", webroot));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Edge agent configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Base URL of the control plane, e.g. http://10.0.0.1:3001
    pub control_plane_url: String,

    /// Shared secret matching the control plane's `server.edge_token`
    pub token: String,

    /// Cluster id or name this node belongs to
    #[serde(default = "default_cluster")]
    pub cluster: String,

    /// Reported hostname (default: the machine's hostname)
    pub hostname: Option<String>,

    /// Reported IPv4 address
    #[serde(default = "default_agent_ip")]
    pub ip_address: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// SQLite file for the node-local deployment ledger
    #[serde(default = "default_agent_database")]
    pub database_path: String,

    /// Request timeout for calls to the control plane
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub deploy: DeployConfig,
}

fn default_cluster() -> String {
    "local-cluster".to_string()
}

fn default_agent_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    30
}

fn default_agent_database() -> String {
    "./edge-agent.db".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl AgentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !(self.control_plane_url.starts_with("http://")
            || self.control_plane_url.starts_with("https://"))
        {
            errors.push(format!(
                "control_plane_url {:?} must start with http:// or https://",
                self.control_plane_url
            ));
        }
        if self.token.trim().is_empty() {
            errors.push("token must not be empty".to_string());
        }
        if let Err(e) = validate_identifier(&self.cluster) {
            errors.push(format!("cluster: {}", e));
        }
        if let Err(e) = validate_ipv4(&self.ip_address) {
            errors.push(format!("ip_address: {}", e));
        }
        if self.heartbeat_interval_secs == 0 || self.sync_interval_secs == 0 {
            errors.push("heartbeat and sync intervals must be at least 1 second".to_string());
        }
        self.deploy.validate("deploy", &mut errors);

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.control_plane_url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
seed_file = "tenants.toml"

[server]
port = 8080
bind = "0.0.0.0"
admin_token = "admin"

[database]
path = "/var/lib/edgeplane/state.db"

[deploy]
conf_dir = "/etc/nginx/tenants"
backup_dir = "/var/backups/edgeplane"
syntax_check_command = "nginx -t -c /etc/nginx/nginx.conf"
command_timeout_secs = 10

[render]
acme_webroot = "/var/www/html"

[scheduler]
interval_secs = 60
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.admin_token.as_deref(), Some("admin"));
        assert!(config.server.edge_token.is_none());
        assert_eq!(config.deploy.conf_dir, "/etc/nginx/tenants");
        assert_eq!(config.deploy.reload_command, "nginx -s reload");
        assert_eq!(config.deploy.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.render.acme_webroot.as_deref(), Some("/var/www/html"));
        assert!(!config.render.stamp_generated_at);
        assert_eq!(config.fleet.heartbeat_miss_secs, 90);
        assert_eq!(config.scheduler.interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.seed_file.as_deref(), Some("tenants.toml"));
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.deploy.syntax_check_command, "nginx -t");
        assert_eq!(config.deploy.backup_retention, 10);
        assert!(config.scheduler.interval().is_none());
        assert!(config.render.acme_webroot.is_none());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let toml = r#"
[server]
port = 0
admin_token = ""

[deploy]
conf_dir = "/etc/nginx/conf.d"
backup_dir = "/etc/nginx/conf.d/backups"
reload_command = ""
command_timeout_secs = 0

[render]
acme_webroot = "/var/www; evil"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("server.port"));
        assert!(err.contains("server.admin_token"));
        assert!(err.contains("backup_dir must not be inside conf_dir"));
        assert!(err.contains("deploy.reload_command"));
        assert!(err.contains("command_timeout_secs"));
        assert!(err.contains("acme_webroot"));
    }

    #[test]
    fn test_heartbeat_miss_is_bounded() {
        let config: Config = toml::from_str("[fleet]\nheartbeat_miss_secs = 9223372036854775807\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("fleet.heartbeat_miss_secs must be at most"));

        let config: Config = toml::from_str("[fleet]\nheartbeat_miss_secs = 2592000\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_agent_config() {
        let toml = r#"
control_plane_url = "http://10.0.0.1:3001/"
token = "edge-secret"
cluster = "eu-west"

[deploy]
conf_dir = "/etc/nginx/conf.d"
backup_dir = "/var/backups/edge"
"#;
        let config: AgentConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.base_url(), "http://10.0.0.1:3001");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.ip_address, "127.0.0.1");
        assert!(config.hostname.is_none());
    }

    #[test]
    fn test_agent_config_rejects_bad_values() {
        let toml = r#"
control_plane_url = "ftp://cp"
token = " "
cluster = "eu west"
ip_address = "localhost"
"#;
        let config: AgentConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("control_plane_url"));
        assert!(err.contains("token"));
        assert!(err.contains("cluster"));
        assert!(err.contains("ip_address"));
    }
}
