//! Zenoh gateway for DTU-attached sensor buses.
//!
//! Polls sensors behind transparent-transmission endpoints and publishes
//! measurements to Zenoh.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use sensorlink_framework::{BridgeArgs, BridgeConfig, BridgeRunner, Publish};
use zenoh_bridge_dtu::commands::CommandHandler;
use zenoh_bridge_dtu::{Gateway, GatewayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("dtu.json5");

    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut runner = BridgeRunner::new_with_args("dtu", config, Some(&args))
        .await
        .context("Failed to start gateway")?
        .with_status_publishing();

    tracing::info!(config = ?args.config, "Loaded configuration");

    let publisher: Arc<dyn Publish> = Arc::new(runner.publisher());
    let gateway = Arc::new(Gateway::new(runner.config(), publisher));

    gateway.start_scheduler();
    let activated = gateway.activate_all().await;
    tracing::info!(
        endpoints = activated,
        sensors = gateway.sensors().len(),
        "Gateway running"
    );

    let (commands_stop, commands_rx) = watch::channel(false);
    let commands = CommandHandler::new(gateway.clone(), args.config.clone());
    let command_key = gateway.context().topics.command_key();
    let session = runner.session().clone();
    runner.spawn_with_error(
        "commands".to_string(),
        commands.run(session, command_key, commands_rx),
    );

    let metadata = gateway.status_metadata();
    let stopping = gateway.clone();
    runner
        .run_until_shutdown(Some(metadata), async move {
            let _ = commands_stop.send(true);
            stopping.shutdown().await;
        })
        .await
        .context("Gateway stopped with an error")?;

    Ok(())
}
