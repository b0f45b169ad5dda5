//! Udpx - UDP Reverse Proxy
//!
//! This is the main entry point for the Udpx application.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use udpx::config::{load_config, load_config_dir, Config, ServerConfig};
use udpx::error::UdpxError;
use udpx::helper::DEFAULT_API_PORT;
use udpx::proxy::resolve_bind_addr;
use udpx::registry::Registry;

/// Udpx - UDP reverse proxy with a session table per listening port
#[derive(Parser, Debug)]
#[command(name = "udpx")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory of *.toml proxy configuration files
    #[arg(short = 'c', long, default_value = "./config")]
    config_path: PathBuf,

    /// Single configuration file, used instead of --config-path
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Enable the HTTP management API
    #[arg(short, long)]
    api: bool,

    /// Port for the management API
    #[arg(short = 'p', long, default_value_t = DEFAULT_API_PORT)]
    api_bind_port: u16,

    /// Local address for proxy sockets (overrides [server].bind_address)
    #[arg(short, long)]
    bind: Option<String>,

    /// Datagram buffer size in bytes (overrides [server].buffer_size)
    #[arg(short = 'B', long)]
    buffer_size: Option<usize>,

    /// Default client idle timeout in ms (overrides [server].default_client_timeout)
    #[arg(long)]
    client_timeout: Option<u64>,

    /// Default upstream re-resolution interval in ms (overrides [server].default_resolve_ttl)
    #[arg(long)]
    resolve_ttl: Option<u64>,

    /// Packet workers per proxy (overrides [server].workers)
    #[arg(long)]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Shortcut for --log-level debug
    #[arg(short, long)]
    debug: bool,

    /// Only log errors; takes precedence over --debug
    #[arg(short, long)]
    quiet: bool,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

impl Args {
    fn effective_log_level(&self) -> &str {
        if self.quiet {
            "error"
        } else if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    fn apply_overrides(&self, server: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            server.bind_address = bind.clone();
        }
        if let Some(size) = self.buffer_size {
            server.buffer_size = size;
        }
        if let Some(ms) = self.client_timeout {
            server.default_client_timeout = ms;
        }
        if let Some(ms) = self.resolve_ttl {
            server.default_resolve_ttl = ms;
        }
        if let Some(workers) = self.workers {
            server.workers = workers;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(args.effective_log_level(), args.json_log)?;

    // Load configuration
    let mut config = load_configuration(&args)?;
    args.apply_overrides(&mut config.server);
    config
        .server
        .validate()
        .map_err(UdpxError::Config)?;

    info!("Udpx v{}", udpx::VERSION);
    info!(
        "Loaded {} proxy configurations, binding on {}",
        config.proxies.len(),
        config.server.bind_address
    );

    if config.proxies.is_empty() {
        if !args.api {
            bail!("No proxy configurations found and the management API is disabled");
        }
        warn!("No proxy configurations found, waiting for API requests");
    }

    let registry = Arc::new(Registry::new(config.server.clone()));
    let registered = registry.register_all(config.proxies).await;
    info!("Started {} proxies", registered);

    // Setup shutdown signal
    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!("Signal handling failed: {:#}", e);
        }
        signal_shutdown.cancel();
    });

    let result = if args.api {
        let addr = resolve_bind_addr(&config.server.bind_address, args.api_bind_port)
            .await
            .with_context(|| format!("Invalid API bind address: {}", config.server.bind_address))?;
        udpx::api::serve(addr, registry.clone(), shutdown.clone()).await
    } else {
        shutdown.cancelled().await;
        Ok(())
    };

    registry.shutdown_all().await;
    info!("All proxies stopped");
    result
}

/// Load the single config file if given, otherwise the config directory
fn load_configuration(args: &Args) -> Result<Config> {
    match &args.config_file {
        Some(path) => {
            let config = load_config(path)?;
            info!("Configuration loaded from: {:?}", path);
            Ok(config)
        }
        None => {
            let config = load_config_dir(&args.config_path)?;
            info!("Configuration loaded from directory: {:?}", args.config_path);
            Ok(config)
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        // On Windows, only handle Ctrl+C
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
