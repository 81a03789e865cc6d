mod cloud;
mod command;
mod config;
mod error;
mod sensor;
mod supervisor;
mod telemetry;
#[cfg(test)]
mod test_support;

use cloud::{MqttCloudChannel, MqttSettings};
use error::ServiceError;
use sensor::{GattConfig, GattSensorLink};
use std::process::ExitCode;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::sync::watch;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind(), "{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ServiceError> {
    let path = config::resolve_path(std::env::args().nth(1));
    info!("NEAI relay starting, config {}", path.display());

    let config = config::load(&path)?;
    config.validate()?;
    let sensor_link = Arc::new(GattSensorLink::new(GattConfig::from_config(&config)?));
    let cloud = Arc::new(MqttCloudChannel::new(MqttSettings::from_config(&config)));
    let supervisor = Supervisor::new(config, sensor_link, cloud)?;
    info!("  Device: {}", supervisor.identity().unique_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown_tx.send_replace(true);
    });

    supervisor.run(shutdown_rx).await
}

/// Resolve on SIGINT or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                    _ = sigterm.recv() => info!("SIGTERM received"),
                }
            }
            Err(e) => {
                error!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received");
    }
}
