//! SensorLink Common Library
//!
//! Shared types and utilities for the SensorLink DTU gateway:
//!
//! - [`measurement`] - Decoded sensor replies (`MeasurementResult`, `MeasureItem`)
//! - [`serialization`] - JSON/CBOR encoding and decoding
//! - [`config`] - Configuration loading and saving (JSON5 format)
//! - [`session`] - Broker (Zenoh) session management
//! - [`topic`] - Measurement topics and gateway control keys
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod measurement;
pub mod serialization;
pub mod session;
pub mod topic;

pub use config::{
    BaseConfig, LogFormat, LoggingConfig, ZenohConfig, load_config, parse_config, save_config,
    strip_comment_lines,
};
pub use error::{Error, Result};
pub use measurement::{
    ERROR_REPLY_FLAG, MeasureItem, MeasurementResult, ResultStatus, current_timestamp_millis,
};
pub use serialization::{Format, decode, decode_auto, encode};
pub use session::connect;
pub use topic::{TopicBuilder, measure_topic, parse_measure_topic};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
///
/// # Example
///
/// ```ignore
/// use sensorlink_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
