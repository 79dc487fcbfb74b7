//! Configuration traits and utilities.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};
use crate::{LoggingConfig, ZenohConfig};

/// Trait for gateway configuration documents.
///
/// Implementors get JSON5 loading (with `#` comment lines stripped),
/// validation on load, and saving back to disk.
///
/// # Example
///
/// ```ignore
/// use serde::{Deserialize, Serialize};
/// use sensorlink_framework::{BridgeConfig, ZenohConfig, LoggingConfig};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// pub struct MyGatewayConfig {
///     pub zenoh: ZenohConfig,
///     pub logging: LoggingConfig,
///     pub gateway: MyGatewaySection,
/// }
///
/// impl BridgeConfig for MyGatewayConfig {
///     fn zenoh(&self) -> &ZenohConfig { &self.zenoh }
///     fn logging(&self) -> &LoggingConfig { &self.logging }
///     fn key_prefix(&self) -> &str { &self.gateway.key_prefix }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned + Serialize {
    /// Get the Zenoh configuration.
    fn zenoh(&self) -> &ZenohConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Key prefix for status and control keys.
    fn key_prefix(&self) -> &str;

    /// Validate the configuration.
    ///
    /// Called automatically after loading and before saving.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Load configuration from a JSON5 file.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;

        tracing::debug!(path = %path.display(), "Loaded configuration");

        Ok(config)
    }

    /// Parse and validate configuration from a JSON5 string.
    fn parse(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(&sensorlink_common::strip_comment_lines(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to `path` as pretty JSON.
    fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        let written = sensorlink_common::save_config(self, path.as_ref())?;

        tracing::info!(
            path = %path.as_ref().display(),
            bytes = written,
            "Saved configuration"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        zenoh: ZenohConfig,
        #[serde(default)]
        logging: LoggingConfig,
        key_prefix: String,
    }

    impl BridgeConfig for TestConfig {
        fn zenoh(&self) -> &ZenohConfig {
            &self.zenoh
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }

        fn key_prefix(&self) -> &str {
            &self.key_prefix
        }

        fn validate(&self) -> Result<()> {
            if self.key_prefix.is_empty() {
                return Err(BridgeError::validation("key_prefix cannot be empty"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.json5");
        assert!(matches!(result, Err(BridgeError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_parse_validates() {
        let result = TestConfig::parse(r#"{ key_prefix: "" }"#);
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json5");

        let config = TestConfig::parse("# site A\n{ key_prefix: \"farm/dtu\" }").unwrap();
        config.save(&path).unwrap();

        let reloaded = TestConfig::load(&path).unwrap();
        assert_eq!(reloaded.key_prefix(), "farm/dtu");
        assert_eq!(reloaded.zenoh().mode, "peer");
    }
}
