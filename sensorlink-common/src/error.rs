use std::path::PathBuf;

use thiserror::Error;

use crate::serialization::Format;

/// Errors from the shared gateway plumbing: configuration files, the broker
/// session, payload encoding and topic segments.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file '{}': {source}", path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {origin}: {reason}")]
    ConfigParse { origin: String, reason: String },

    #[error("Broker session error: {0}")]
    Broker(String),

    #[error("Failed to encode {format:?} payload: {reason}")]
    Encode { format: Format, reason: String },

    #[error("Failed to decode {format:?} payload: {reason}")]
    Decode { format: Format, reason: String },

    #[error("Invalid topic segment '{segment}': {reason}")]
    Topic { segment: String, reason: String },
}

impl Error {
    pub fn encode(format: Format, reason: impl ToString) -> Self {
        Self::Encode {
            format,
            reason: reason.to_string(),
        }
    }

    pub fn decode(format: Format, reason: impl ToString) -> Self {
        Self::Decode {
            format,
            reason: reason.to_string(),
        }
    }
}

/// Result type alias using the common [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
