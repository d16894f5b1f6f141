use anyhow::{Context, Result};
use clap::Parser;
use hub_remote::config::{Cli, RemoteAccessConfig};
use hub_remote::telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_logging(&cli.log_config()).context("failed to initialise logging")?;
    let config = RemoteAccessConfig::try_from(cli)?;
    telemetry::install_metrics(config.metrics_listen)?;

    info!(
        target: "hub_remote::bridge",
        device_id = config.device_id.as_deref().unwrap_or("unset"),
        endpoint = config.cloud_endpoint.as_deref().unwrap_or("unset"),
        gateway = %config.gateway_socket.display(),
        enabled = config.cloud_enabled,
        "starting hub-remote"
    );
    hub_remote::run(config).await
}
