use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing::{error, info};

use habana_ai_operator::config::{LogFormat, Settings};
use habana_ai_operator::controller::{run_controller, ControllerState};
use habana_ai_operator::rest_api::run_server;
use habana_ai_operator::Result;

/// Respects `RUST_LOG` if set, otherwise defaults to INFO level.
fn initialize_logging(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_target(false)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .compact()
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Arc::new(Settings::parse());
    initialize_logging(settings.log_format);

    info!(
        "Starting habana-ai-operator {} (device plugin image {})",
        env!("CARGO_PKG_VERSION"),
        settings.device_plugin_image
    );

    let client = Client::try_default().await?;
    let state = Arc::new(ControllerState::new(client, settings.clone()));

    let bind_address = settings.metrics_bind_address;
    tokio::spawn(async move {
        if let Err(e) = run_server(bind_address).await {
            error!("Metrics server stopped: {}", e);
        }
    });

    run_controller(state).await?;

    info!("Controller stopped");
    Ok(())
}
