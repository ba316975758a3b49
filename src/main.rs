mod command;
mod config;
mod connection;
mod session;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use command::{CommandRouter, UnlockActuator};
use config::GatewayConfig;
use connection::{spawn_heartbeat, ConnectionManager};
use session::SessionLoop;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "doorlink.toml".to_string());

    let config = match GatewayConfig::load(Path::new(&config_path)) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(path = %config_path, error = %format!("{e:#}"), "configuration load failed");
            return ExitCode::FAILURE;
        }
    };

    info!("Doorlink gateway starting");
    info!("  broker: {}", config.broker_addr);
    info!("  devices: {}", config.devices.len());

    let manager = Arc::new(ConnectionManager::new(config.clone()));

    // Bounded initial dialing; an unreachable broker at startup is fatal.
    match manager.connect_with_retries().await {
        Ok(attempts) => info!(attempts, "broker session ready"),
        Err(e) => {
            error!(error = %e, "broker unreachable at startup, exiting");
            return ExitCode::FAILURE;
        }
    }

    spawn_heartbeat(manager.clone());

    let actuator = Arc::new(UnlockActuator::new(config.clone(), manager.clone()));
    let router = CommandRouter::new(config.clone(), actuator);
    let session = SessionLoop::new(manager.clone(), router);

    tokio::select! {
        () = session.run() => {
            error!("session loop exited unexpectedly");
            ExitCode::FAILURE
        }
        _ = tokio::signal::ctrl_c() => {
            info!("termination signal received, shutting down");
            manager.teardown().await;
            info!("broker session closed");
            ExitCode::SUCCESS
        }
    }
}
