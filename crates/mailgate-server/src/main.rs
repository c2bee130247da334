//! mailgate-server: TCP tunnel gateway for sandboxed clients.
//!
//! By default the binary runs as a supervisor that forks a single worker
//! (itself, with `--worker`) and restarts it whenever it dies. The worker
//! runs the WebSocket gateway on a single-threaded runtime.

use anyhow::Context;
use clap::Parser;
use mailgate_server::{CliOverrides, GatewayServer, ProcessSupervisor, ServerConfig, WorkerCommand};
use std::ffi::OsString;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// mailgate-server: TCP tunnel gateway
#[derive(Parser, Debug)]
#[command(name = "mailgate-server", version, about = "TCP tunnel gateway over WebSocket")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.mailgate/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Delay before restarting a dead worker, in milliseconds
    #[arg(long)]
    restart_delay_ms: Option<u64>,

    /// Run the gateway in this process without a supervisor
    #[arg(long)]
    no_supervise: bool,

    /// Internal: run as a supervised worker
    #[arg(long, hide = true)]
    worker: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind.clone(),
        log_level: cli.log_level.clone(),
        restart_delay_ms: cli.restart_delay_ms,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(Some(&config_path), &overrides)
        .with_context(|| format!("failed to load config {}", cli.config))?;

    init_tracing(&config.log_level);

    match &config.source {
        Some(path) => info!(path = %path.display(), "loaded config file"),
        None => info!(path = %cli.config, "config file not found, using defaults"),
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    if cli.worker || cli.no_supervise {
        install_fault_hook();
        runtime.block_on(run_worker(config))
    } else {
        runtime.block_on(run_supervisor(&cli, &config))
    }
}

fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

/// A panic is an unexpected fault: log it and let the supervisor restart us.
fn install_fault_hook() {
    std::panic::set_hook(Box::new(|panic| {
        error!(pid = std::process::id(), fault = %panic, "uncaught fault, worker exiting");
        std::process::exit(1);
    }));
}

async fn run_worker(config: ServerConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr(),
        "starting mailgate worker"
    );

    let server = GatewayServer::bind(&config)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_addr()))?;
    server.run(shutdown_signal()).await?;

    info!("mailgate worker stopped");
    Ok(())
}

async fn run_supervisor(cli: &Cli, config: &ServerConfig) -> anyhow::Result<()> {
    let args: Vec<OsString> = vec![
        "--worker".into(),
        "--config".into(),
        cli.config.clone().into(),
        "--port".into(),
        config.port.to_string().into(),
        "--bind".into(),
        config.bind.to_string().into(),
        "--log-level".into(),
        config.log_level.clone().into(),
    ];

    let command = WorkerCommand::current_exe(args).context("cannot locate own executable")?;
    let supervisor = ProcessSupervisor::new(command, config.restart_delay);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        restart_delay_ms = config.restart_delay.as_millis() as u64,
        "starting mailgate supervisor"
    );
    let started = supervisor.run(shutdown_signal()).await;
    info!(workers = started, "mailgate supervisor stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => warn!("exited on SIGINT"),
                    _ = sigterm.recv() => warn!("exited on SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
