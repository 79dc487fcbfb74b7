use crate::error::{Error, Result};

/// Root segment of every measurement topic.
pub const MEASURE_ROOT: &str = "sensor";

/// Default key prefix for gateway control and status keys.
pub const DEFAULT_GATEWAY_PREFIX: &str = "sensorlink/dtu";

/// Build the measurement topic for a task kind.
///
/// # Example
/// ```
/// use sensorlink_common::topic::measure_topic;
///
/// assert_eq!(measure_topic("oxygen"), "sensor/oxygen/measure");
/// ```
pub fn measure_topic(kind: &str) -> String {
    format!("{}/{}/measure", MEASURE_ROOT, kind)
}

/// Extract the task kind from a measurement topic.
pub fn parse_measure_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(MEASURE_ROOT), Some(kind), Some("measure"), None) if !kind.is_empty() => Some(kind),
        _ => None,
    }
}

/// Check that a string can be used as one key-expression segment.
///
/// Sensor identifiers end up inside status keys, so they must not contain
/// separators or wildcard characters.
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::Topic {
            segment: String::new(),
            reason: "empty segment".to_string(),
        });
    }
    if let Some(c) = segment
        .chars()
        .find(|c| matches!(c, '/' | '*' | '$' | '?' | '#' | '@'))
    {
        return Err(Error::Topic {
            segment: segment.to_string(),
            reason: format!("reserved character '{}'", c),
        });
    }
    Ok(())
}

/// Builder for the gateway's administrative keys.
///
/// Keys follow `<prefix>/@/...`; the `@` marks a control channel that carries
/// no measurements.
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    prefix: String,
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_GATEWAY_PREFIX)
    }
}

impl TopicBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Gateway status key.
    ///
    /// # Example
    /// ```
    /// use sensorlink_common::topic::TopicBuilder;
    ///
    /// assert_eq!(TopicBuilder::default().status_key(), "sensorlink/dtu/@/status");
    /// ```
    pub fn status_key(&self) -> String {
        format!("{}/@/status", self.prefix)
    }

    /// Key carrying status changes of one sensor.
    pub fn sensor_status_key(&self, sensor_id: &str) -> String {
        format!("{}/@/sensors/{}/status", self.prefix, sensor_id)
    }

    /// Wildcard over all sensor status keys.
    pub fn sensor_status_wildcard(&self) -> String {
        format!("{}/@/sensors/*/status", self.prefix)
    }

    /// Key the gateway listens on for administrative sensor commands.
    pub fn command_key(&self) -> String {
        format!("{}/@/commands/sensor", self.prefix)
    }
}
