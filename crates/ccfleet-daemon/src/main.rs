//! ccfleet Daemon
//!
//! Serves the operator API, launches coding agents into isolated worktrees,
//! and runs periodic registry maintenance.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use ccfleet_core::config::{Config, RegistrySettings, load_config};
use ccfleet_daemon::orchestration::{InstanceManager, ManagerConfig};
use ccfleet_daemon::server::{AppState, build_router};
use ccfleet_daemon::storage::Database;
use ccfleet_daemon::terminal::{MultiplexerConfig, TerminalMultiplexer, default_shell};
use ccfleet_daemon::worktree::{WorktreeLayout, WorktreeManager};

#[derive(Parser, Debug)]
#[command(name = "ccfleet-daemon")]
#[command(version, about = "ccfleet daemon - coding-agent fleet orchestrator")]
struct Args {
    /// TCP bind address (overrides `daemon.addr`)
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Database file path
    #[arg(long, env = "CCFLEET_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Project directory whose `.ccfleet/settings.json` is layered over the
    /// global settings
    #[arg(long, env = "CCFLEET_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Base directory for git worktrees
    #[arg(long)]
    worktree_dir: Option<PathBuf>,

    /// Agent executable started in every child instance's terminal
    #[arg(long)]
    agent_bin: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "CCFLEET_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "CCFLEET_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(addr) = self.addr {
            config.daemon.addr = addr.to_string();
        }
        if let Some(path) = &self.db_path {
            config.daemon.database_path = Some(path.clone());
        }
        if let Some(dir) = &self.worktree_dir {
            config.worktree.base_dir = Some(dir.clone());
        }
        if let Some(bin) = &self.agent_bin {
            config.daemon.agent_bin.clone_from(bin);
        }
        if let Some(level) = &self.log_level {
            config.daemon.log_level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.project_dir.as_deref())?;
    args.apply(&mut config);

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!("ccfleet_daemon={}", config.daemon.log_level);
    let _metrics_guard = ccfleet_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        metrics_endpoint,
    );

    let addr: SocketAddr = config.daemon.addr.parse()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        agent_bin = %config.daemon.agent_bin.display(),
        "Starting ccfleet-daemon"
    );

    let db_path = match &config.daemon.database_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let layout = WorktreeLayout::from_settings(&config.worktree, &default_worktree_dir()?);
    let worktrees = WorktreeManager::new(layout, config.worktree.setup_script.clone());

    let terminals = Arc::new(TerminalMultiplexer::new(MultiplexerConfig {
        shell: config.daemon.shell.clone().unwrap_or_else(default_shell),
        terminate_grace: Duration::from_secs(config.daemon.terminate_timeout_secs),
        ..MultiplexerConfig::default()
    }));

    let manager = Arc::new(InstanceManager::new(
        db.clone(),
        worktrees,
        Arc::clone(&terminals),
        ManagerConfig::from_config(&config)?,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = tokio::spawn(run_maintenance(
        Arc::clone(&manager),
        config.registry.clone(),
        shutdown_rx,
    ));

    let state = AppState {
        manager,
        db,
        default_max_parallelism: i64::from(config.daemon.default_max_parallelism),
        terminal_root: dirs::home_dir().unwrap_or_else(std::env::temp_dir),
    };
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // The `true` parameter unsets $NOTIFY_SOCKET so agent processes
    // don't notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    info!(addr = %addr, "HTTP server ready");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = maintenance.await;
    let destroyed = terminals.destroy_all().await;
    info!(sessions = destroyed, "Daemon stopped");
    Ok(())
}

/// Periodic cleanup of finished instances and stale-instance reporting.
async fn run_maintenance(
    manager: Arc<InstanceManager>,
    settings: RegistrySettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(settings.maintenance_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        match manager.cleanup(settings.cleanup_after_hours).await {
            Ok(report) if !report.instances.is_empty() => info!(
                instances = report.instances.len(),
                worktrees = report.worktrees_removed,
                "Cleaned up finished instances"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Instance cleanup failed"),
        }

        match manager
            .reap_stale(settings.stale_after_minutes, settings.reap_stale)
            .await
        {
            Ok(stale) if !stale.is_empty() => warn!(
                count = stale.len(),
                terminated = settings.reap_stale,
                "Stale instances detected"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Stale instance scan failed"),
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        () = sigterm => info!("Received SIGTERM shutdown signal"),
    }
}

/// Default database path: ~/.ccfleet/daemon.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".ccfleet").join("daemon.db"))
}

/// Default worktree base directory: ~/.ccfleet/worktrees/
fn default_worktree_dir() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".ccfleet").join("worktrees"))
}
