//! Poll procedures and the context they run in.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use sensorlink_common::{MeasurementResult, TopicBuilder, measure_topic};
use sensorlink_framework::Publish;

use crate::codec::{
    CodecError, FUNC_READ, FUNC_WRITE, decode_items, read_request, split_and_validate,
    split_write_echo,
};
use crate::config::RegisterMap;
use crate::failure::FailureTracker;
use crate::sensor::{SensorDescriptor, SensorStatus, SensorTable, TaskKind};
use crate::session::{SessionError, SessionRegistry};
use crate::task::SensorTask;

/// Why a poll did not produce a measurement.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Device {addr} answered with exception code {func_code:#04x}")]
    ErrorReply { addr: u8, func_code: u8 },

    #[error("Reply from address {got}, expected {expected}")]
    AddressMismatch { expected: u8, got: u8 },

    #[error("Unknown sensor '{0}'")]
    UnknownSensor(String),
}

/// A poll procedure run by an endpoint worker for one task.
///
/// Sensors use [`DefaultPollProcedure`] unless a custom procedure is attached.
#[async_trait]
pub trait PollProcedure: Send + Sync {
    async fn run(&self, task: &SensorTask, ctx: &PollContext) -> Result<(), PollError>;
}

/// Status change event published on `<prefix>/@/sensors/<id>/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SensorStatusEvent {
    pub sensor_id: String,
    pub status: SensorStatus,
    pub previous: SensorStatus,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    pub timestamp: i64,
}

/// Shared services a poll procedure works with.
pub struct PollContext {
    pub sensors: Arc<SensorTable>,
    pub sessions: Arc<SessionRegistry>,
    pub failures: Arc<FailureTracker>,
    pub publisher: Arc<dyn Publish>,
    pub registers: RegisterMap,
    pub topics: TopicBuilder,
}

impl PollContext {
    pub fn sensor(&self, sensor_id: &str) -> Result<Arc<SensorDescriptor>, PollError> {
        self.sensors
            .get(sensor_id)
            .ok_or_else(|| PollError::UnknownSensor(sensor_id.to_string()))
    }

    /// Send `request` on the task's endpoint and return the raw reply.
    pub async fn exchange(&self, task: &SensorTask, request: &[u8]) -> Result<Vec<u8>, PollError> {
        let session = self.sessions.get_or_create(&task.attach);
        Ok(session.send_and_await(request).await?)
    }

    /// Read the measurement block and decode it into named items.
    pub async fn measure(
        &self,
        task: &SensorTask,
        item_names: &[String],
    ) -> Result<MeasurementResult, PollError> {
        let request = read_request(task.address, &self.registers.measure);
        let session = self.sessions.get_or_create(&task.attach);
        let frame = session.send_and_await(&request).await?;
        decode_reply(&frame, task, session.address(), item_names)
    }

    /// Clear failures and bring the sensor back to `Normal`.
    pub async fn record_success(&self, sensor: &SensorDescriptor) {
        if self.failures.clear(sensor.id()) {
            tracing::info!(sensor = %sensor.id(), "Sensor recovered");
        }
        if let Some(previous) = sensor.transition_unless_closed(SensorStatus::Normal) {
            self.publish_status(sensor, previous).await;
        }
    }

    /// Count a failed exchange; past the threshold the sensor is detached.
    pub async fn record_failure(&self, sensor: &SensorDescriptor, error: &PollError) {
        let record = self.failures.record_failure(sensor.id());
        tracing::warn!(
            sensor = %sensor.id(),
            endpoint = %sensor.attach(),
            failures = record.consecutive_failures,
            retry_at = ?record.retry_at,
            error = %error,
            "Poll failed"
        );

        if self.failures.policy().exceeded(record.consecutive_failures) {
            if let Some(previous) = sensor.transition_unless_closed(SensorStatus::Detach) {
                tracing::warn!(sensor = %sensor.id(), "Sensor detached");
                self.publish_status(sensor, previous).await;
            }
        }
    }

    /// Publish the sensor's current status.
    pub async fn publish_status(&self, sensor: &SensorDescriptor, previous: SensorStatus) {
        let record = self.failures.record(sensor.id());
        let event = SensorStatusEvent {
            sensor_id: sensor.id().to_string(),
            status: sensor.status(),
            previous,
            consecutive_failures: record.consecutive_failures,
            retry_at: record.retry_at,
            timestamp: Utc::now().timestamp_millis(),
        };

        let key = self.topics.sensor_status_key(sensor.id());
        match serde_json::to_vec(&event) {
            Ok(payload) => {
                if let Err(e) = self.publisher.publish(&key, payload).await {
                    tracing::warn!(sensor = %sensor.id(), error = %e, "Failed to publish status");
                }
            }
            Err(e) => {
                tracing::warn!(sensor = %sensor.id(), error = %e, "Failed to encode status");
            }
        }
    }

    /// Publish a measurement on `sensor/<kind>/measure`.
    pub async fn publish_measurement(&self, kind: &str, result: &MeasurementResult) {
        let topic = measure_topic(kind);
        let payload = match serde_json::to_vec(result) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(sensor = %result.sensor_id, error = %e, "Failed to encode measurement");
                return;
            }
        };

        if let Err(e) = self.publisher.publish(&topic, payload).await {
            tracing::warn!(sensor = %result.sensor_id, topic = %topic, error = %e, "Failed to publish measurement");
        }
    }
}

/// Validate a reply frame and turn it into a result for `task`.
pub fn decode_reply(
    frame: &[u8],
    task: &SensorTask,
    node: &str,
    item_names: &[String],
) -> Result<MeasurementResult, PollError> {
    let (meta, payload) = split_and_validate(frame)?;

    if meta.addr != task.address {
        return Err(PollError::AddressMismatch {
            expected: task.address,
            got: meta.addr,
        });
    }
    if meta.is_error_reply() {
        return Err(PollError::ErrorReply {
            addr: meta.addr,
            func_code: meta.func_code,
        });
    }

    let mut result =
        MeasurementResult::new(meta.addr, meta.func_code, node).with_sensor_id(&task.sensor_id);

    match meta.func_code {
        FUNC_READ => result.extend_items(decode_items(payload, item_names)?),
        FUNC_WRITE => {
            let (register, data) = split_write_echo(payload)?;
            result.set_write_echo(register, data);
        }
        fc => return Err(CodecError::UnsupportedFunctionCode(fc).into()),
    }

    Ok(result)
}

/// The built-in procedure, chosen by task kind.
///
/// Banned and closed sensors are skipped without touching their failure record.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPollProcedure;

#[async_trait]
impl PollProcedure for DefaultPollProcedure {
    async fn run(&self, task: &SensorTask, ctx: &PollContext) -> Result<(), PollError> {
        let sensor = ctx.sensor(&task.sensor_id)?;

        if ctx.failures.is_banned(sensor.id()) {
            tracing::trace!(sensor = %sensor.id(), "Sensor banned, skipping");
            return Ok(());
        }
        if sensor.is_closed() {
            tracing::trace!(sensor = %sensor.id(), "Sensor closed, skipping");
            return Ok(());
        }

        match task.kind {
            TaskKind::DissolvedOxygen => {
                let kind = task.kind.measure_kind().unwrap_or("oxygen");
                match ctx.measure(task, &ctx.registers.oxygen_items).await {
                    Ok(result) => {
                        tracing::debug!(
                            sensor = %sensor.id(),
                            items = result.info_count,
                            "Measurement received"
                        );
                        ctx.record_success(&sensor).await;
                        ctx.publish_measurement(kind, &result).await;
                        Ok(())
                    }
                    Err(e) => {
                        ctx.record_failure(&sensor, &e).await;
                        Err(e)
                    }
                }
            }
            TaskKind::Reserved(code) => {
                tracing::debug!(sensor = %sensor.id(), kind = code, "No procedure for task type");
                Ok(())
            }
        }
    }
}

/// Check that a sensor answers on its endpoint.
///
/// Success clears the failure record and sets `Normal`; failure bans the
/// sensor and sets `Detach`. Closed sensors are not probed. Returns whether
/// the sensor answered.
pub async fn probe_sensor(ctx: &PollContext, sensor: &SensorDescriptor) -> bool {
    if sensor.is_closed() {
        tracing::debug!(sensor = %sensor.id(), "Sensor closed, not probing");
        return false;
    }

    tracing::info!(sensor = %sensor.id(), endpoint = %sensor.attach(), "Probing sensor");

    let task = SensorTask::from_sensor(sensor);
    let request = read_request(sensor.address(), &ctx.registers.probe);
    let outcome = match ctx.exchange(&task, &request).await {
        Ok(frame) => split_and_validate(&frame).map(|_| ()).map_err(PollError::from),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            tracing::info!(sensor = %sensor.id(), endpoint = %sensor.attach(), "Sensor reachable");
            ctx.failures.clear(sensor.id());
            if let Some(previous) = sensor.transition_unless_closed(SensorStatus::Normal) {
                ctx.publish_status(sensor, previous).await;
            }
            true
        }
        Err(e) => {
            let record = ctx.failures.ban(sensor.id());
            tracing::warn!(
                sensor = %sensor.id(),
                endpoint = %sensor.attach(),
                retry_at = ?record.retry_at,
                error = %e,
                "Sensor unreachable"
            );
            if let Some(previous) = sensor.transition_unless_closed(SensorStatus::Detach) {
                ctx.publish_status(sensor, previous).await;
            }
            false
        }
    }
}

/// Runs [`probe_sensor`] as a queued task, so an on-demand probe shares the
/// endpoint's queue with regular polls.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProbeProcedure;

#[async_trait]
impl PollProcedure for ProbeProcedure {
    async fn run(&self, task: &SensorTask, ctx: &PollContext) -> Result<(), PollError> {
        let sensor = ctx.sensor(&task.sensor_id)?;
        probe_sensor(ctx, &sensor).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::crc_bytes;
    use sensorlink_common::ResultStatus;

    fn task() -> SensorTask {
        SensorTask {
            sensor_id: "s1".to_string(),
            address: 1,
            kind: TaskKind::DissolvedOxygen,
            attach: "dtu-1".to_string(),
            procedure: None,
        }
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc_bytes(body));
        frame
    }

    fn names() -> Vec<String> {
        vec!["Oxygen".to_string(), "Temp".to_string()]
    }

    #[test]
    fn test_decode_measurement_reply() {
        let reply = frame(&[0x01, 0x03, 0x08, 0x03, 0x39, 0x00, 0x02, 0x00, 0xD5, 0x00, 0x01]);
        let result = decode_reply(&reply, &task(), "10.0.0.5:8899", &names()).unwrap();

        assert_eq!(result.sensor_id, "s1");
        assert_eq!(result.node_ip, "10.0.0.5:8899");
        assert_eq!(result.status, ResultStatus::Ok);
        assert_eq!(result.info_count, 2);
        assert_eq!(result.value("Oxygen"), Some(8.25));
        assert_eq!(result.value("Temp"), Some(21.3));
    }

    #[test]
    fn test_decode_write_echo() {
        let reply = frame(&[0x01, 0x06, 0x10, 0x04, 0x00, 0x64]);
        let result = decode_reply(&reply, &task(), "n", &names()).unwrap();
        assert_eq!(result.write_reg, Some(vec![0x10, 0x04]));
        assert_eq!(result.write_data, Some(vec![0x00, 0x64]));
        assert!(result.items.is_empty());
    }

    #[test]
    fn test_decode_failures() {
        let error = frame(&[0x01, 0x83, 0x02]);
        assert!(matches!(
            decode_reply(&error, &task(), "n", &names()),
            Err(PollError::ErrorReply { func_code: 0x83, .. })
        ));

        let other = frame(&[0x02, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x01]);
        assert!(matches!(
            decode_reply(&other, &task(), "n", &names()),
            Err(PollError::AddressMismatch { expected: 1, got: 2 })
        ));

        let short = frame(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x01]);
        assert!(matches!(
            decode_reply(&short, &task(), "n", &names()),
            Err(PollError::Codec(CodecError::ItemCountMismatch { .. }))
        ));

        let mut corrupt = short.clone();
        corrupt[3] ^= 0x01;
        assert!(matches!(
            decode_reply(&corrupt, &task(), "n", &names()),
            Err(PollError::Codec(CodecError::FrameIntegrity { .. }))
        ));
    }
}
