//! Administrative commands received over Zenoh.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use zenoh::sample::SampleKind;

use sensorlink_common::decode_auto;

use crate::gateway::{Gateway, GatewayError};

/// A command on `<prefix>/@/commands/sensor`, tagged by `type`.
///
/// ```json
/// { "type": "set_interval", "sensor_id": "s1", "interval_secs": 30 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorCommand {
    Open { sensor_id: String },
    Close { sensor_id: String },
    Detach { sensor_id: String },
    SetInterval { sensor_id: String, interval_secs: i64 },
    Probe { sensor_id: String },
    SaveConfig,
}

/// Applies commands to a gateway.
pub struct CommandHandler {
    gateway: Arc<Gateway>,
    config_path: PathBuf,
}

impl CommandHandler {
    /// `config_path` is where `save_config` writes.
    pub fn new(gateway: Arc<Gateway>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            gateway,
            config_path: config_path.into(),
        }
    }

    pub async fn handle(&self, command: SensorCommand) -> Result<(), GatewayError> {
        debug!(command = ?command, "Handling command");
        match command {
            SensorCommand::Open { sensor_id } => self.gateway.open_sensor(&sensor_id).await,
            SensorCommand::Close { sensor_id } => self.gateway.close_sensor(&sensor_id).await,
            SensorCommand::Detach { sensor_id } => self.gateway.detach_sensor(&sensor_id).await,
            SensorCommand::SetInterval {
                sensor_id,
                interval_secs,
            } => self.gateway.set_interval(&sensor_id, interval_secs),
            SensorCommand::Probe { sensor_id } => self.gateway.probe_sensor(&sensor_id).await,
            SensorCommand::SaveConfig => self.gateway.save_config(&self.config_path),
        }
    }

    /// Decode a JSON or CBOR payload and apply it. Failures are logged.
    pub async fn handle_payload(&self, payload: &[u8]) {
        let command: SensorCommand = match decode_auto(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(payload_len = payload.len(), error = %e, "Invalid command");
                return;
            }
        };

        if let Err(e) = self.handle(command.clone()).await {
            warn!(command = ?command, error = %e, "Command failed");
        }
    }

    /// Subscribe to `key` and apply commands until `shutdown` flips to `true`.
    pub async fn run(
        self,
        session: Arc<zenoh::Session>,
        key: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let subscriber = session
            .declare_subscriber(&key)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to subscribe to {}: {}", key, e))?;

        info!(key = %key, "Listening for commands");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                sample = subscriber.recv_async() => {
                    match sample {
                        Ok(sample) => {
                            if sample.kind() == SampleKind::Delete {
                                trace!(key = %sample.key_expr(), "Ignoring delete sample");
                                continue;
                            }
                            let payload = sample.payload().to_bytes();
                            self.handle_payload(&payload).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "Command subscriber closed");
                            break;
                        }
                    }
                }
            }
        }

        subscriber
            .undeclare()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to undeclare subscriber: {}", e))?;

        info!("Command listener stopped");
        Ok(())
    }
}
