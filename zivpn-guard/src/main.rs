// ZIVPN Connection Guard Daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use zivpn_guard::{
    config::{self, load_config},
    conntrack::{ConntrackCli, FlowTable},
    enforcer::Enforcer,
    registry::{Registry, SqliteRegistry},
    scheduler::{self, SchedulerSettings},
    state_file,
    status::StatusSurface,
    types::Config,
};

/// Extra time the enforcement loop gets beyond the cycle grace period to
/// write its final state and return
const SHUTDOWN_MARGIN_SECS: u64 = 5;

#[derive(Parser)]
#[command(name = "zivpn-guard")]
#[command(about = "Per-user device limit enforcement for ZIVPN UDP", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/zivpn-guard/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the enforcement loop until SIGTERM/SIGINT (default)
    Run,
    /// Run a single enforcement cycle and exit
    Once,
    /// Print Online or Offline for a port
    PortStatus {
        /// Port to check
        port: String,
    },
    /// Print the status of every user, or of one user
    UserStatus {
        /// Only show this user
        username: Option<String>,
    },
}

/// Shared components built from the config
struct Components {
    table: Arc<dyn FlowTable>,
    registry: Arc<dyn Registry>,
    enforcer: Arc<Enforcer>,
}

fn build_components(config: &Config) -> Components {
    let fallback_port = config::resolve_fallback_port(config);
    let enforcer_config = config::enforcer_config(config, fallback_port);

    let table: Arc<dyn FlowTable> = Arc::new(ConntrackCli::new(
        config.conntrack.binary.clone(),
        Duration::from_secs(config.conntrack.teardown_timeout),
    ));
    let registry: Arc<dyn Registry> =
        Arc::new(SqliteRegistry::new(config.general.database_path.clone()));
    let enforcer = Arc::new(Enforcer::new(
        enforcer_config,
        table.clone(),
        registry.clone(),
    ));

    Components {
        table,
        registry,
        enforcer,
    }
}

fn main() -> Result<()> {
    // 2 threads is sufficient: 1 for the enforcement loop, 1 for process spawns and SQLite
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("zivpn-guard")
        .thread_stack_size(2 * 1024 * 1024) // 2MB stack (vs 8MB default)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    let components = build_components(&config);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(&config, components).await,
        Command::Once => run_once(components).await,
        Command::PortStatus { port } => port_status(components, &port).await,
        Command::UserStatus { username } => user_status(components, username.as_deref()).await,
    }
}

async fn run_daemon(config: &Config, components: Components) -> Result<()> {
    let port_space = components.enforcer.config().port_space;

    log::info!("Starting zivpn-guard daemon");
    log::info!(
        "Port space: fallback {}, dynamic {}-{}",
        port_space.fallback,
        port_space.dynamic_start,
        port_space.dynamic_end
    );
    log::info!("User database: {:?}", config.general.database_path);
    log::info!(
        "Poll interval: {}s (backoff {}s)",
        config.schedule.poll_interval,
        config.schedule.backoff_interval
    );

    let settings = SchedulerSettings {
        poll_interval: Duration::from_secs(config.schedule.poll_interval),
        backoff_interval: Duration::from_secs(config.schedule.backoff_interval),
        shutdown_grace: Duration::from_secs(config.schedule.shutdown_grace),
        state_file: Some(config.general.state_file.clone()),
    };
    let stop_timeout = settings.shutdown_grace + Duration::from_secs(SHUTDOWN_MARGIN_SECS);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loop_handle = tokio::spawn(scheduler::run(
        components.enforcer.clone(),
        settings,
        shutdown_rx,
    ));

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    log::info!("Daemon started successfully");

    tokio::select! {
        _ = sigterm.recv() => {
            log::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            log::info!("Received SIGINT");
        }

        // The loop only returns on shutdown, so an early exit is fatal
        loop_result = &mut loop_handle => {
            match loop_result {
                Ok(()) => log::error!("Enforcement loop exited unexpectedly"),
                Err(e) => log::error!("Enforcement loop panicked: {}", e),
            }
            state_file::cleanup(&config.general.state_file);
            anyhow::bail!("Enforcement loop terminated, aborting daemon for systemd restart");
        }
    }

    log::info!("Shutting down gracefully...");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(stop_timeout, &mut loop_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Enforcement loop panicked during shutdown: {}", e),
        Err(_) => {
            log::warn!("Enforcement loop did not stop in time, aborting it");
            loop_handle.abort();
        }
    }

    state_file::cleanup(&config.general.state_file);

    log::info!("Shutdown complete");
    Ok(())
}

async fn run_once(components: Components) -> Result<()> {
    let report = components.enforcer.run_cycle().await?;

    println!("flows:              {}", report.flows);
    println!("users checked:      {}", report.users);
    println!("users skipped:      {}", report.skipped_users);
    println!("over quota:         {}", report.breaches);
    println!("flows evicted:      {}", report.evicted);
    println!("eviction failures:  {}", report.eviction_failures);

    Ok(())
}

fn status_surface(components: &Components) -> StatusSurface {
    StatusSurface::new(
        components.enforcer.config(),
        components.table.clone(),
        components.registry.clone(),
    )
}

async fn port_status(components: Components, port: &str) -> Result<()> {
    let active = status_surface(&components).is_port_active(port).await;
    println!("{}", if active { "Online" } else { "Offline" });
    Ok(())
}

async fn user_status(components: Components, username: Option<&str>) -> Result<()> {
    let today = chrono::Local::now().date_naive();
    let statuses = status_surface(&components).user_statuses(today).await?;

    let mut found = false;
    for (user, status) in statuses {
        if username.is_some_and(|name| name != user.username) {
            continue;
        }
        found = true;
        println!("{}\t{}", user.username, status);
    }

    if let Some(name) = username {
        if !found {
            anyhow::bail!("No such user: {}", name);
        }
    }

    Ok(())
}
