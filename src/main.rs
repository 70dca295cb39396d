use edgeplane::api::{ApiConfig, ApiServer};
use edgeplane::config::Config;
use edgeplane::db::Database;
use edgeplane::deploy::Deployer;
use edgeplane::fleet::FleetRegistry;
use edgeplane::host_lookup::InMemoryHostLookup;
use edgeplane::ledger::Ledger;
use edgeplane::pipeline::{ControlPlane, RenderSettings};
use edgeplane::seed::{apply_seed, load_seed};
use edgeplane::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edgeplane=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let db = Arc::new(Database::open(&config.database.path)?);
    info!(path = %config.database.path, "Database opened");

    if let Some(ref seed_path) = config.seed_file {
        let summary = apply_seed(&db, load_seed(seed_path)?);
        info!(
            path = %seed_path,
            imported = summary.imported.len(),
            rejected = summary.rejected.len(),
            "Seed file applied"
        );
    }

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });
    let edge_token = config.server.edge_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated edge token (configure edge_token to set a fixed value)");
        token
    });

    let deployer = Arc::new(Deployer::from_config(&config.deploy, Ledger::new(Arc::clone(&db)))?);
    let fleet = FleetRegistry::new(Arc::clone(&db), edge_token, config.fleet.heartbeat_miss_secs);
    let plane = Arc::new(ControlPlane::new(
        Arc::clone(&db),
        deployer,
        Arc::new(InMemoryHostLookup::new()),
        fleet,
        RenderSettings {
            acme_webroot: config.render.acme_webroot.clone(),
            stamp_generated_at: config.render.stamp_generated_at,
        },
    ));

    match plane.restore_host_lookup().await {
        Ok(hosts) => info!(hosts, "Host lookup restored from live directory"),
        Err(e) => warn!(error = %e, "Could not restore host lookup, starting empty"),
    }

    let api_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid API bind address");
            anyhow::anyhow!("Invalid API bind address: {}", e)
        })?;

    let api = Arc::new(ApiServer::new(
        ApiConfig {
            bind_addr: api_addr,
            admin_token,
        },
        Arc::clone(&plane),
        shutdown_rx.clone(),
    ));

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "API server error");
        }
    });

    let scheduler_handle = config.scheduler.interval().map(|interval| {
        let plane = Arc::clone(&plane);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { plane.run_scheduler(interval, shutdown).await })
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = api_handle.await;
        if let Some(handle) = scheduler_handle {
            let _ = handle.await;
        }
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Truncate only after the lock is held
        file.set_len(0)?;
        use std::io::Write;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting edge control plane");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_token_configured = config.server.admin_token.is_some(),
        edge_token_configured = config.server.edge_token.is_some(),
        "Server configuration"
    );
    info!(
        conf_dir = %config.deploy.conf_dir,
        backup_dir = %config.deploy.backup_dir,
        backup_retention = config.deploy.backup_retention,
        syntax_check = %config.deploy.syntax_check_command,
        reload = %config.deploy.reload_command,
        command_timeout_secs = config.deploy.command_timeout_secs,
        "Deploy settings"
    );
    info!(
        heartbeat_miss_secs = config.fleet.heartbeat_miss_secs,
        scheduler_interval_secs = config.scheduler.interval_secs,
        "Fleet and scheduler settings"
    );
}
