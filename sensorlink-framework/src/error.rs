//! Error types for the gateway framework.

use thiserror::Error;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors raised while loading, running or publishing from a gateway.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// Broker connection error.
    #[error("Zenoh connection error: {0}")]
    ZenohConnection(String),

    /// Broker session error.
    #[error("Zenoh session error: {0}")]
    ZenohSession(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Publishing error.
    #[error("Failed to publish to {key}: {message}")]
    Publish { key: String, message: String },

    /// Worker error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a worker error.
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    /// Create a publish error for `key`.
    pub fn publish(key: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::Publish {
            key: key.into(),
            message: msg.to_string(),
        }
    }
}

impl From<zenoh::Error> for BridgeError {
    fn from(err: zenoh::Error) -> Self {
        Self::ZenohSession(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<json5::Error> for BridgeError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

impl From<sensorlink_common::Error> for BridgeError {
    fn from(err: sensorlink_common::Error) -> Self {
        use sensorlink_common::Error as Common;

        let message = err.to_string();
        match err {
            Common::Config(msg) => Self::Config(msg),
            Common::ConfigFile { path, source } => {
                if source.kind() == std::io::ErrorKind::NotFound {
                    Self::ConfigNotFound {
                        path: path.display().to_string(),
                    }
                } else {
                    Self::Io(source)
                }
            }
            Common::ConfigParse { .. } => Self::ConfigParse(message),
            Common::Broker(msg) => Self::ZenohConnection(msg),
            Common::Topic { .. } => Self::ConfigValidation(message),
            Common::Encode { .. } | Common::Decode { .. } => Self::Serialization(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_error_message() {
        let err = BridgeError::publish("sensor/oxygen/measure", "session closed");
        assert_eq!(
            err.to_string(),
            "Failed to publish to sensor/oxygen/measure: session closed"
        );
    }

    #[test]
    fn test_topic_error_maps_to_validation() {
        let err: BridgeError = sensorlink_common::Error::Topic {
            segment: "a/b".to_string(),
            reason: "reserved character '/'".to_string(),
        }
        .into();
        assert!(matches!(err, BridgeError::ConfigValidation(ref m) if m.contains("a/b")));
    }

    #[test]
    fn test_missing_config_file_maps_to_not_found() {
        let err: BridgeError = sensorlink_common::Error::ConfigFile {
            path: "/etc/dtu.json5".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }
        .into();
        assert!(matches!(err, BridgeError::ConfigNotFound { ref path } if path == "/etc/dtu.json5"));
    }
}
