//! Configuration for the DTU gateway.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sensorlink_common::topic::{DEFAULT_GATEWAY_PREFIX, validate_segment};
use sensorlink_framework::{BridgeConfig, BridgeError, LoggingConfig, Result, ZenohConfig};

use crate::failure::FailurePolicy;
use crate::sensor::TaskKind;

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// DTU gateway settings
    pub gateway: DtuConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig for GatewayConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn key_prefix(&self) -> &str {
        &self.gateway.key_prefix
    }

    fn validate(&self) -> Result<()> {
        self.gateway.validate()
    }
}

/// DTU gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtuConfig {
    /// Gateway name, reported in status messages
    #[serde(default = "default_name")]
    pub name: String,

    /// Key prefix for status and command keys (default: "sensorlink/dtu")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub failure: FailureConfig,

    #[serde(default)]
    pub registers: RegisterMap,

    /// Sensors, in configuration order
    pub sensors: Vec<SensorConfig>,
}

fn default_name() -> String {
    "dtu".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_GATEWAY_PREFIX.to_string()
}

/// One sensor on a DTU bus.
///
/// Field names follow the persisted document format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Globally unique sensor identifier
    #[serde(rename = "sensorID")]
    pub sensor_id: String,

    /// Device address on the bus
    pub addr: u8,

    /// Poll procedure selector
    #[serde(rename = "type", default)]
    pub kind: TaskKind,

    /// Attach endpoint, "host" or "host:port"
    pub attach: String,

    /// Poll interval in seconds
    pub interval: i64,
}

/// Connection settings for attach endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Port used when `attach` has none (default: 502)
    #[serde(default = "default_port")]
    pub default_port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bounded wait for a reply
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

fn default_port() -> u16 {
    502
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_response_timeout_ms() -> u64 {
    2000
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

/// Time wheel and queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_slots")]
    pub slots: usize,

    /// Capacity of each endpoint's task queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_slots() -> usize {
    180
}

fn default_queue_capacity() -> usize {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            slots: default_slots(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Failure threshold and ban backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureConfig {
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_threshold() -> u32 {
    3
}

fn default_base_backoff_secs() -> u64 {
    30
}

fn default_max_backoff_secs() -> u64 {
    600
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl FailureConfig {
    pub fn policy(&self) -> FailurePolicy {
        FailurePolicy {
            threshold: self.threshold,
            base_backoff: Duration::from_secs(self.base_backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

/// Register blocks sent in read requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMap {
    /// Register address and count for a measurement read
    #[serde(default = "default_measure_block")]
    pub measure: Vec<u8>,

    /// Register address and count for a connectivity probe
    #[serde(default = "default_probe_block")]
    pub probe: Vec<u8>,

    /// Item names for the dissolved oxygen reply, in payload order
    #[serde(default = "default_oxygen_items")]
    pub oxygen_items: Vec<String>,
}

fn default_measure_block() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x04]
}

fn default_probe_block() -> Vec<u8> {
    vec![0x20, 0x02, 0x00, 0x01]
}

fn default_oxygen_items() -> Vec<String> {
    vec!["Oxygen".to_string(), "Temp".to_string()]
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            measure: default_measure_block(),
            probe: default_probe_block(),
            oxygen_items: default_oxygen_items(),
        }
    }
}

impl DtuConfig {
    /// Validate the gateway section.
    pub fn validate(&self) -> Result<()> {
        if self.sensors.is_empty() {
            return Err(BridgeError::validation("At least one sensor must be configured"));
        }

        if self.scheduler.tick_ms == 0 {
            return Err(BridgeError::validation("scheduler.tick_ms must be > 0"));
        }
        if self.scheduler.slots == 0 {
            return Err(BridgeError::validation("scheduler.slots must be > 0"));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(BridgeError::validation("scheduler.queue_capacity must be > 0"));
        }
        if self.failure.threshold == 0 {
            return Err(BridgeError::validation("failure.threshold must be > 0"));
        }
        if self.registers.measure.len() != 4 || self.registers.probe.len() != 4 {
            return Err(BridgeError::validation(
                "registers.measure and registers.probe must be 4 bytes",
            ));
        }

        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for sensor in &self.sensors {
            validate_segment(&sensor.sensor_id).map_err(|e| {
                BridgeError::validation(format!("Invalid sensorID '{}': {}", sensor.sensor_id, e))
            })?;

            if !ids.insert(sensor.sensor_id.as_str()) {
                return Err(BridgeError::validation(format!(
                    "Duplicate sensorID '{}'",
                    sensor.sensor_id
                )));
            }

            if sensor.attach.trim().is_empty() {
                return Err(BridgeError::validation(format!(
                    "Sensor '{}' has no attach endpoint",
                    sensor.sensor_id
                )));
            }

            if sensor.interval <= 0 {
                return Err(BridgeError::validation(format!(
                    "Sensor '{}' interval must be > 0",
                    sensor.sensor_id
                )));
            }

            if !keys.insert((sensor.addr, sensor.attach.as_str(), sensor.kind)) {
                return Err(BridgeError::validation(format!(
                    "Sensor '{}' duplicates address {} of type {} on {}",
                    sensor.sensor_id,
                    sensor.addr,
                    u8::from(sensor.kind),
                    sensor.attach
                )));
            }
        }

        Ok(())
    }

    /// Distinct attach endpoints, in configuration order.
    pub fn endpoints(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.sensors
            .iter()
            .filter(|s| seen.insert(s.attach.as_str()))
            .map(|s| s.attach.clone())
            .collect()
    }
}
