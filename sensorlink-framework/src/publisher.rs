//! Broker publisher.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use sensorlink_common::{Format, encode};

use crate::error::{BridgeError, Result};

/// The `publish(topic, payload)` capability the gateway core depends on.
///
/// The gateway only ever hands over a topic and an encoded payload; what
/// broker sits behind it is the implementor's business.
#[async_trait]
pub trait Publish: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Publisher backed by a Zenoh session.
///
/// Topics are used verbatim as key expressions. The key prefix is only used
/// for the gateway's own status and control keys.
#[derive(Clone, Debug)]
pub struct Publisher {
    session: Arc<zenoh::Session>,
    key_prefix: String,
    format: Format,
}

impl Publisher {
    /// Create a new publisher.
    pub fn new(
        session: Arc<zenoh::Session>,
        key_prefix: impl Into<String>,
        format: Format,
    ) -> Self {
        Self {
            session,
            key_prefix: key_prefix.into(),
            format,
        }
    }

    /// Get the key prefix.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Get the serialization format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    /// Build a full key expression from a suffix under the prefix.
    pub fn build_key(&self, suffix: &str) -> String {
        build_key(&self.key_prefix, suffix)
    }

    /// Encode `value` in the publisher's format and put it on `key`.
    pub async fn publish_value<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let payload =
            encode(value, self.format).map_err(|e| BridgeError::Serialization(e.to_string()))?;
        self.publish_raw(key, payload).await
    }

    /// Publish raw bytes to a key.
    pub async fn publish_raw(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.session
            .put(key, payload)
            .await
            .map_err(|e| BridgeError::publish(key, e))?;

        tracing::trace!(key = %key, "Published");
        Ok(())
    }

    /// Publish a JSON value to a key regardless of the configured format.
    pub async fn publish_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(key, payload).await
    }
}

#[async_trait]
impl Publish for Publisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.publish_raw(topic, payload).await
    }
}

/// Join a prefix and a suffix into one key expression.
pub fn build_key(prefix: &str, suffix: &str) -> String {
    match (prefix.is_empty(), suffix.is_empty()) {
        (_, true) => prefix.to_string(),
        (true, false) => suffix.to_string(),
        (false, false) => format!("{}/{}", prefix, suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_key() {
        assert_eq!(build_key("sensorlink/dtu", "@/status"), "sensorlink/dtu/@/status");
        assert_eq!(build_key("sensorlink/dtu", ""), "sensorlink/dtu");
        assert_eq!(build_key("", "sensor/oxygen/measure"), "sensor/oxygen/measure");
    }
}
