//! Measurement results decoded from sensor bus replies.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bit set in the function code of an exception reply.
pub const ERROR_REPLY_FLAG: u8 = 0x80;

/// A single named value decoded from a reply payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureItem {
    pub name: String,
    pub value: f64,
}

impl MeasureItem {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Outcome flag carried by every published result.
///
/// Serialized as a number: `0` for a normal reply, `1` for an exception reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ResultStatus {
    #[default]
    Ok,
    Error,
}

impl From<ResultStatus> for u8 {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Ok => 0,
            ResultStatus::Error => 1,
        }
    }
}

impl TryFrom<u8> for ResultStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(ResultStatus::Ok),
            1 => Ok(ResultStatus::Error),
            other => Err(format!("invalid result status {}", other)),
        }
    }
}

/// The result of one exchange with a sensor, as published to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    /// Configured sensor identifier (empty until the poll procedure fills it in).
    #[serde(default)]
    pub sensor_id: String,

    /// Device address on the bus.
    pub device_addr: u8,

    /// Function code with the exception bit cleared.
    pub func_code: u8,

    /// Number of decoded items.
    pub info_count: usize,

    /// Decoded values, in payload order.
    #[serde(default)]
    pub items: Vec<MeasureItem>,

    /// Register echoed by a write reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_reg: Option<Vec<u8>>,

    /// Data echoed by a write reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_data: Option<Vec<u8>>,

    /// Address of the attach endpoint the reply came through.
    pub node_ip: String,

    pub status: ResultStatus,

    /// Unix epoch milliseconds when the reply was decoded.
    pub timestamp: i64,
}

impl MeasurementResult {
    /// Start a result from the header of a validated reply frame.
    ///
    /// An exception reply (function code above `0x80`) is flagged as
    /// [`ResultStatus::Error`] and the original function code is restored.
    pub fn new(device_addr: u8, func_code: u8, node_ip: impl Into<String>) -> Self {
        let (func_code, status) = if func_code > ERROR_REPLY_FLAG {
            (func_code - ERROR_REPLY_FLAG, ResultStatus::Error)
        } else {
            (func_code, ResultStatus::Ok)
        };

        Self {
            sensor_id: String::new(),
            device_addr,
            func_code,
            info_count: 0,
            items: Vec::new(),
            write_reg: None,
            write_data: None,
            node_ip: node_ip.into(),
            status,
            timestamp: current_timestamp_millis(),
        }
    }

    pub fn with_sensor_id(mut self, sensor_id: impl Into<String>) -> Self {
        self.sensor_id = sensor_id.into();
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == ResultStatus::Error
    }

    /// Append decoded items and keep `info_count` in step.
    pub fn extend_items(&mut self, items: impl IntoIterator<Item = MeasureItem>) {
        self.items.extend(items);
        self.info_count = self.items.len();
    }

    /// Record the register/data pair echoed by a write reply.
    pub fn set_write_echo(&mut self, register: &[u8], data: &[u8]) {
        self.write_reg = Some(register.to_vec());
        self.write_data = Some(data.to_vec());
    }

    /// Look up a decoded value by name.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .map(|item| item.value)
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_reply_is_ok() {
        let mut result = MeasurementResult::new(0x01, 0x03, "10.0.0.5:8899");
        result.extend_items([MeasureItem::new("Oxygen", 8.25), MeasureItem::new("Temp", 21.3)]);

        assert!(!result.is_error());
        assert_eq!(result.func_code, 0x03);
        assert_eq!(result.info_count, 2);
        assert_eq!(result.value("Temp"), Some(21.3));
        assert_eq!(result.value("Salinity"), None);
    }

    #[test]
    fn test_exception_reply_clears_flag() {
        let result = MeasurementResult::new(0x01, 0x83, "10.0.0.5:8899");

        assert!(result.is_error());
        assert_eq!(result.func_code, 0x03);
    }

    #[test]
    fn test_status_serializes_as_number() {
        let result = MeasurementResult::new(0x02, 0x86, "dtu").with_sensor_id("pond-2");
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["status"], 1);
        assert_eq!(json["sensor_id"], "pond-2");
        assert!(json.get("write_reg").is_none());
    }

    #[test]
    fn test_write_echo_fields() {
        let mut result = MeasurementResult::new(0x01, 0x06, "dtu");
        result.set_write_echo(&[0x10, 0x04], &[0x00, 0x64]);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["write_reg"], serde_json::json!([16, 4]));
        assert_eq!(json["write_data"], serde_json::json!([0, 100]));
    }

    #[test]
    fn test_invalid_status_rejected() {
        assert!(ResultStatus::try_from(7).is_err());
    }
}
