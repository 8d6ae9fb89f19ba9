//! ASR Hub server - standalone headless speech-recognition middleware.
//!
//! Accepts live audio over HTTP+SSE, WebSocket, Socket.IO and Redis,
//! orchestrates per-session detection pipelines, and dispatches finalized
//! utterances to pooled ASR backends.
//!
//! Exit codes: 0 normal, 2 configuration error, 3 failed to bind ports,
//! 4 mandatory provider unavailable.

mod config;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use asrhub_core::bootstrap::{bootstrap_hub, BackendFactory};
use asrhub_core::config::PoolConfig;
use asrhub_core::effects::ServiceSet;
use asrhub_core::provider::{AsrBackend, MockBackend};
use asrhub_core::{start_server, HubError, ServerError};
use clap::Parser;
use tokio::signal;

use crate::config::ServerConfig;

const EXIT_CONFIG: u8 = 2;
const EXIT_BIND: u8 = 3;
const EXIT_PROVIDER: u8 = 4;

/// ASR Hub server - headless speech-recognition middleware.
#[derive(Parser, Debug)]
#[command(name = "asrhub-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind host (overrides config file).
    #[arg(long, env = "API_HOST")]
    host: Option<String>,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "API_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration (env overrides applied inside).
    let mut config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // CLI overrides win over file and environment.
    if let Some(host) = args.host {
        config.api_host = host;
    }
    if let Some(port) = args.port {
        config.api_port = port;
    }

    let log_level = if config.debug {
        log::LevelFilter::Debug
    } else {
        args.log_level
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    log::info!(
        "ASR Hub server v{} ({})",
        env!("CARGO_PKG_VERSION"),
        config.app_env
    );
    log::info!(
        "Configuration: api={}:{}, socketio={}, redis={}",
        config.api_host,
        config.api_port,
        config.socketio_enabled,
        config.redis_enabled
    );

    let mut hub_config = config.to_hub_config();
    // A config file that tunes the hub without listing providers still gets
    // the default pool.
    if hub_config.providers.is_empty() {
        hub_config
            .providers
            .insert("default".to_string(), PoolConfig::default());
    }

    // Provider factories, one per enabled pool. Model-backed factories plug
    // in here; the built-in mock keeps the hub runnable without any model.
    let mut factories: HashMap<String, BackendFactory> = HashMap::new();
    for name in hub_config
        .providers
        .iter()
        .filter(|(_, p)| p.enabled)
        .map(|(name, _)| name.clone())
    {
        let backend_name = name.clone();
        factories.insert(
            name,
            Arc::new(move || {
                Arc::new(MockBackend::new(
                    backend_name.clone(),
                    vec![String::new()],
                    std::time::Duration::from_millis(50),
                )) as Arc<dyn AsrBackend>
            }),
        );
    }

    let services = match bootstrap_hub(hub_config, factories, ServiceSet::reference()) {
        Ok(services) => services,
        Err(HubError::Configuration(message)) => {
            log::error!("Configuration incoherent: {message}");
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(HubError::ProviderFailure(message)) => {
            log::error!("Mandatory provider unavailable: {message}");
            return ExitCode::from(EXIT_PROVIDER);
        }
        Err(err) => {
            log::error!("Bootstrap failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    log::info!("Services bootstrapped successfully");
    services.start_background_tasks();

    let app_state = services.app_state();
    let server = start_server(app_state);
    tokio::pin!(server);

    let exit = tokio::select! {
        result = &mut server => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(err @ ServerError::Bind { .. }) => {
                log::error!("{err}");
                return ExitCode::from(EXIT_BIND);
            }
            Err(err) => {
                log::error!("Server error: {err}");
                ExitCode::FAILURE
            }
        },
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received, cleaning up...");
            ExitCode::SUCCESS
        }
    };

    services.shutdown().await;
    log::info!("Shutdown complete");
    exit
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
