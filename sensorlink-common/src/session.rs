use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

/// Open the broker session described by `config`.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    let mut zenoh_config = zenoh::Config::default();

    let mode_str = match config.mode.as_str() {
        "client" | "peer" | "router" => format!("\"{}\"", config.mode),
        other => {
            return Err(Error::Config(format!(
                "Invalid Zenoh mode: '{}'. Expected 'client', 'peer', or 'router'",
                other
            )));
        }
    };

    zenoh_config
        .insert_json5("mode", &mode_str)
        .map_err(|e| Error::Config(format!("Failed to set mode: {}", e)))?;

    insert_endpoints(&mut zenoh_config, "connect/endpoints", &config.connect)?;
    insert_endpoints(&mut zenoh_config, "listen/endpoints", &config.listen)?;

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Connecting to broker"
    );

    let session = zenoh::open(zenoh_config)
        .await
        .map_err(|e| Error::Broker(e.to_string()))?;

    tracing::info!(zid = %session.zid(), "Connected to broker");

    Ok(session)
}

fn insert_endpoints(config: &mut zenoh::Config, key: &str, endpoints: &[String]) -> Result<()> {
    if endpoints.is_empty() {
        return Ok(());
    }

    let endpoints_json = serde_json::to_string(endpoints)
        .map_err(|e| Error::encode(crate::serialization::Format::Json, e))?;

    config
        .insert_json5(key, &endpoints_json)
        .map_err(|e| Error::Config(format!("Failed to set {}: {}", key, e)))
}
