//! lamco-x11-rdp-server - X11 Remote Desktop Server
//!
//! Entry point for the server binary. Runs either the listener (default) or,
//! with `--worker`, the handover daemon that adopts sessions from a
//! listener. `SIGUSR1` makes the listener hand every session to the worker.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lamco_x11_rdp_server::config::{Config, LoggingConfig};
use lamco_x11_rdp_server::handover::HandoverDaemon;
use lamco_x11_rdp_server::security::CertificateGenerator;
use lamco_x11_rdp_server::server::{RdpListener, ServerRuntime};
use lamco_x11_rdp_server::utils::{format_user_error, log_startup_diagnostics};
use lamco_x11_rdp_server::x11::X11Backend;

/// Command-line arguments for lamco-x11-rdp-server
#[derive(Parser, Debug)]
#[command(name = "lamco-x11-rdp-server")]
#[command(version, about = "X11 Remote Desktop Server", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, env = "LAMCO_RDP_CONFIG", default_value = "/etc/lamco-x11-rdp-server/config.toml")]
    pub config: String,

    /// Listen address
    #[arg(short, long, env = "LAMCO_RDP_LISTEN_ADDR")]
    pub listen: Option<String>,

    /// Listen port
    #[arg(short, long, env = "LAMCO_RDP_PORT")]
    pub port: Option<u16>,

    /// Run as handover worker instead of listener
    #[arg(long)]
    pub worker: bool,

    /// Generate a self-signed certificate at the configured paths and exit
    #[arg(long)]
    pub generate_cert: bool,

    /// Verbose logging (can be specified multiple times); overrides logging.level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Write logs to file (in addition to stdout); overrides logging.log_dir
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = Config::load(&args.config);
    let logging = match &loaded {
        Ok(config) => config.logging.clone(),
        Err(_) => Config::default_config().logging,
    };
    init_logging(&args, &logging)?;

    info!("════════════════════════════════════════════════════════");
    info!("  lamco-x11-rdp-server v{}", env!("CARGO_PKG_VERSION"));
    info!("  Built: {} {}", env!("BUILD_DATE"), env!("BUILD_TIME"));
    info!("  Commit: {}", env!("GIT_HASH"));
    info!("  Profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });
    info!("  Mode: {}", if args.worker { "handover worker" } else { "listener" });
    info!("════════════════════════════════════════════════════════");

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config: {:#}, using defaults", e);
            Config::default_config()
        }
    };

    if let Err(e) = run(args, config).await {
        eprintln!("{}", format_user_error(&e));
        return Err(e);
    }
    Ok(())
}

async fn run(args: Args, config: Config) -> Result<()> {
    let config = config.with_overrides(args.listen.clone(), args.port);

    if args.generate_cert {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        CertificateGenerator::generate_and_save(
            &hostname,
            365,
            &config.security.cert_path,
            &config.security.key_path,
        )
        .context("Failed to generate TLS certificate")?;
        info!("Certificate written to {:?}", config.security.cert_path);
        return Ok(());
    }

    info!("Configuration loaded successfully");
    tracing::debug!("Config: {:?}", config);

    log_startup_diagnostics(config.capture.display.as_deref());

    let backend = X11Backend::connect(config.capture.display.as_deref())
        .context("Failed to connect to X server")?;
    let runtime = ServerRuntime::builder(config)
        .desktop(Arc::new(backend))
        .build()
        .context("Failed to initialize server runtime")?;

    if args.worker {
        run_worker(runtime).await
    } else {
        run_listener(runtime).await
    }
}

async fn run_listener(runtime: Arc<ServerRuntime>) -> Result<()> {
    let handover_socket = runtime.config().handover.socket_path.clone();
    let listener = RdpListener::new(runtime);
    listener.start().await.context("Failed to start listener")?;

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hand_over = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hand_over.recv() => {
                info!("SIGUSR1: handing sessions over to {:?}", handover_socket);
                let results = listener.hand_over_all(&handover_socket).await;
                let moved = results.iter().filter(|(_, r)| r.is_ok()).count();
                info!("Handed over {} of {} sessions", moved, results.len());
            }
        }
    }

    info!("Shutting down");
    listener.stop().await?;
    info!("Server shut down");
    Ok(())
}

async fn run_worker(runtime: Arc<ServerRuntime>) -> Result<()> {
    let daemon = HandoverDaemon::new(runtime);
    daemon.start().await.context("Failed to start handover daemon")?;

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }

    info!("Shutting down");
    daemon.stop().await?;
    info!("Worker shut down");
    Ok(())
}

fn init_logging(args: &Args, logging: &LoggingConfig) -> Result<()> {
    let log_level = logging.effective_level(args.verbose);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // x11rb at info: debug logs every request
        tracing_subscriber::EnvFilter::new(format!(
            "lamco_x11_rdp_server={level},x11rb=info,rustls=info,warn",
            level = log_level
        ))
    });

    // If log file is specified, write to both stdout and file
    if let Some(log_file_path) = &logging.log_file(args.log_file.as_deref()) {
        let directory = log_file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(directory)
            .with_context(|| format!("Failed to create log directory {:?}", directory))?;
        let file_name = log_file_path
            .file_name()
            .context("Log file path must name a file")?;
        let file = tracing_appender::rolling::never(directory, file_name);

        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .pretty()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
        info!("Logging to file: {:?}", log_file_path);
    } else {
        // Stdout only
        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().compact())
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().pretty())
                    .init();
            }
        }
    }

    Ok(())
}
