//! The gateway service: scheduler, sessions, queues and workers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use sensorlink_common::TopicBuilder;
use sensorlink_framework::{BridgeConfig, BridgeError, Publish};

use crate::config::GatewayConfig;
use crate::failure::FailureTracker;
use crate::poll::{PollContext, PollProcedure, ProbeProcedure, probe_sensor};
use crate::sensor::{SensorDescriptor, SensorStatus, SensorTable};
use crate::session::{SessionOptions, SessionRegistry};
use crate::task::{SensorTask, SensorWheel, TaskPayload, push_callback};
use crate::timewheel::{Repetition, SchedulerError};
use crate::worker::PollWorker;

/// Errors from gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Unknown sensor '{0}'")]
    UnknownSensor(String),

    #[error("Endpoint '{0}' is already active")]
    EndpointActive(String),

    #[error("Endpoint '{0}' is not active")]
    EndpointInactive(String),

    #[error("Invalid interval {0}s: must be > 0")]
    InvalidInterval(i64),

    #[error(transparent)]
    Config(#[from] BridgeError),
}

/// Queue and worker of one active endpoint.
struct EndpointHandle {
    queue: mpsc::Sender<SensorTask>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

/// Owns everything the gateway runs: the time wheel, the session registry,
/// the failure tracker, the sensor table and one queue/worker per endpoint.
pub struct Gateway {
    base: GatewayConfig,
    wheel: Arc<SensorWheel>,
    ctx: Arc<PollContext>,
    queue_capacity: usize,
    endpoints: Mutex<HashMap<String, EndpointHandle>>,
    wheel_shutdown: watch::Sender<bool>,
    wheel_task: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(config: &GatewayConfig, publisher: Arc<dyn Publish>) -> Self {
        let gateway = &config.gateway;
        let ctx = PollContext {
            sensors: Arc::new(SensorTable::from_configs(&gateway.sensors)),
            sessions: Arc::new(SessionRegistry::new(SessionOptions::from(&gateway.endpoint))),
            failures: Arc::new(FailureTracker::new(gateway.failure.policy())),
            publisher,
            registers: gateway.registers.clone(),
            topics: TopicBuilder::new(gateway.key_prefix.clone()),
        };
        let (wheel_shutdown, _) = watch::channel(false);

        Self {
            base: config.clone(),
            wheel: Arc::new(SensorWheel::new(
                gateway.scheduler.tick(),
                gateway.scheduler.slots,
            )),
            ctx: Arc::new(ctx),
            queue_capacity: gateway.scheduler.queue_capacity,
            endpoints: Mutex::new(HashMap::new()),
            wheel_shutdown,
            wheel_task: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<PollContext> {
        &self.ctx
    }

    pub fn sensors(&self) -> &SensorTable {
        &self.ctx.sensors
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.ctx.failures
    }

    fn sensor(&self, sensor_id: &str) -> Result<Arc<SensorDescriptor>, GatewayError> {
        self.ctx
            .sensors
            .get(sensor_id)
            .ok_or_else(|| GatewayError::UnknownSensor(sensor_id.to_string()))
    }

    /// Start the timer loop that drives the time wheel.
    pub fn start_scheduler(&self) {
        let mut task = self.wheel_task.lock();
        if task.is_none() {
            *task = Some(self.wheel.start(self.wheel_shutdown.subscribe()));
        }
    }

    /// Advance the time wheel by one tick by hand.
    pub fn tick(&self) -> usize {
        self.wheel.tick()
    }

    /// Probe the sensors of `endpoint`, then start its queue and worker and
    /// schedule them.
    ///
    /// Probes run before the worker exists, so they never share the link
    /// with queued polls.
    pub async fn activate_endpoint(&self, endpoint: &str) -> Result<(), GatewayError> {
        if self.endpoints.lock().contains_key(endpoint) {
            return Err(GatewayError::EndpointActive(endpoint.to_string()));
        }

        let sensors = self.ctx.sensors.attached_to(endpoint);
        tracing::info!(endpoint = %endpoint, sensors = sensors.len(), "Activating endpoint");

        for sensor in &sensors {
            if !sensor.is_closed() {
                probe_sensor(&self.ctx, sensor).await;
            }
        }

        let queue = {
            let mut endpoints = self.endpoints.lock();
            if endpoints.contains_key(endpoint) {
                return Err(GatewayError::EndpointActive(endpoint.to_string()));
            }

            let (worker, queue) = PollWorker::new(endpoint, self.queue_capacity, self.ctx.clone());
            let (shutdown, shutdown_rx) = watch::channel(false);
            let worker = worker.spawn(shutdown_rx);
            endpoints.insert(
                endpoint.to_string(),
                EndpointHandle {
                    queue: queue.clone(),
                    shutdown,
                    worker,
                },
            );
            queue
        };

        for sensor in sensors {
            match self.schedule_on(&sensor, queue.clone()) {
                Ok(()) => {
                    tracing::info!(
                        sensor = %sensor.id(),
                        interval_secs = sensor.interval_secs(),
                        "Sensor scheduled"
                    );
                }
                Err(e) => {
                    tracing::warn!(sensor = %sensor.id(), error = %e, "Failed to schedule sensor");
                }
            }
        }

        Ok(())
    }

    /// Activate every configured endpoint, in configuration order.
    ///
    /// Returns the number of endpoints activated; already active ones are skipped.
    pub async fn activate_all(&self) -> usize {
        let mut activated = 0;
        for endpoint in self.ctx.sensors.endpoints() {
            match self.activate_endpoint(&endpoint).await {
                Ok(()) => activated += 1,
                Err(e) => tracing::warn!(endpoint = %endpoint, error = %e, "Skipping endpoint"),
            }
        }
        activated
    }

    /// Unschedule an endpoint's sensors, drain and stop its worker, and
    /// close its link.
    pub async fn deactivate_endpoint(&self, endpoint: &str) -> Result<(), GatewayError> {
        let handle = self
            .endpoints
            .lock()
            .remove(endpoint)
            .ok_or_else(|| GatewayError::EndpointInactive(endpoint.to_string()))?;

        for sensor in self.ctx.sensors.attached_to(endpoint) {
            if let Err(e) = self.wheel.remove_task(&sensor.task_key()) {
                tracing::debug!(sensor = %sensor.id(), error = %e, "Sensor was not scheduled");
            }
        }

        let _ = handle.shutdown.send(true);
        drop(handle.queue);
        if let Err(e) = handle.worker.await {
            tracing::warn!(endpoint = %endpoint, error = %e, "Poll worker ended abnormally");
        }

        if let Some(session) = self.ctx.sessions.remove(endpoint) {
            session.close().await;
        }

        tracing::info!(endpoint = %endpoint, "Endpoint deactivated");
        Ok(())
    }

    pub fn active_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.endpoints.lock().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    fn queue_for(&self, endpoint: &str) -> Result<mpsc::Sender<SensorTask>, GatewayError> {
        self.endpoints
            .lock()
            .get(endpoint)
            .map(|h| h.queue.clone())
            .ok_or_else(|| GatewayError::EndpointInactive(endpoint.to_string()))
    }

    fn interval_of(sensor: &SensorDescriptor) -> Duration {
        Duration::from_secs(u64::try_from(sensor.interval_secs()).unwrap_or(1))
    }

    fn schedule_on(
        &self,
        sensor: &Arc<SensorDescriptor>,
        queue: mpsc::Sender<SensorTask>,
    ) -> Result<(), GatewayError> {
        self.wheel.add_task(
            Self::interval_of(sensor),
            Repetition::Infinite,
            sensor.task_key(),
            TaskPayload::new(sensor.clone(), queue),
            push_callback(Arc::downgrade(&self.wheel)),
        )?;
        Ok(())
    }

    /// Schedule a sensor on its (active) endpoint with infinite repetitions.
    pub fn schedule_sensor(&self, sensor_id: &str) -> Result<(), GatewayError> {
        let sensor = self.sensor(sensor_id)?;
        let queue = self.queue_for(sensor.attach())?;
        self.schedule_on(&sensor, queue)
    }

    /// Stop scheduling a sensor. A task already queued still runs.
    pub fn unschedule_sensor(&self, sensor_id: &str) -> Result<(), GatewayError> {
        let sensor = self.sensor(sensor_id)?;
        self.wheel.remove_task(&sensor.task_key())?;
        Ok(())
    }

    pub fn is_scheduled(&self, sensor_id: &str) -> bool {
        self.ctx
            .sensors
            .get(sensor_id)
            .is_some_and(|s| self.wheel.contains(&s.task_key()))
    }

    /// Re-snapshot the sensor into its scheduled payload.
    fn refresh_task(&self, sensor: &Arc<SensorDescriptor>) -> Result<(), GatewayError> {
        let key = sensor.task_key();
        let Some(current) = self.wheel.payload(&key) else {
            return Ok(());
        };
        self.wheel.update_task(
            &key,
            Self::interval_of(sensor),
            current.refresh(sensor.clone()),
        )?;
        Ok(())
    }

    /// Change a sensor's poll interval.
    pub fn set_interval(&self, sensor_id: &str, interval_secs: i64) -> Result<(), GatewayError> {
        if interval_secs <= 0 {
            return Err(GatewayError::InvalidInterval(interval_secs));
        }
        let sensor = self.sensor(sensor_id)?;
        sensor.set_interval_secs(interval_secs);
        self.refresh_task(&sensor)?;
        tracing::info!(sensor = %sensor_id, interval_secs, "Interval updated");
        Ok(())
    }

    /// Replace the sensor's default procedure.
    pub fn set_procedure(
        &self,
        sensor_id: &str,
        procedure: Arc<dyn PollProcedure>,
    ) -> Result<(), GatewayError> {
        let sensor = self.sensor(sensor_id)?;
        sensor.set_procedure(procedure);
        self.refresh_task(&sensor)
    }

    /// Go back to the default procedure. Returns whether a custom one was set.
    pub fn clear_procedure(&self, sensor_id: &str) -> Result<bool, GatewayError> {
        let sensor = self.sensor(sensor_id)?;
        let cleared = sensor.clear_procedure();
        if cleared {
            self.refresh_task(&sensor)?;
        }
        Ok(cleared)
    }

    async fn set_status(&self, sensor_id: &str, status: SensorStatus) -> Result<(), GatewayError> {
        let sensor = self.sensor(sensor_id)?;
        if let Some(previous) = sensor.set_status(status) {
            tracing::info!(sensor = %sensor_id, from = %previous, to = %status, "Sensor status set");
            self.ctx.publish_status(&sensor, previous).await;
        }
        Ok(())
    }

    /// Re-open a sensor. Its failure record is cleared so it polls on the next tick.
    pub async fn open_sensor(&self, sensor_id: &str) -> Result<(), GatewayError> {
        self.sensor(sensor_id)?;
        self.ctx.failures.clear(sensor_id);
        self.set_status(sensor_id, SensorStatus::Normal).await
    }

    /// Close a sensor. It stays scheduled but is not polled.
    pub async fn close_sensor(&self, sensor_id: &str) -> Result<(), GatewayError> {
        self.set_status(sensor_id, SensorStatus::Closed).await
    }

    pub async fn detach_sensor(&self, sensor_id: &str) -> Result<(), GatewayError> {
        self.set_status(sensor_id, SensorStatus::Detach).await
    }

    /// Probe a sensor. On an active endpoint the probe is queued behind
    /// pending polls; otherwise it runs right away.
    pub async fn probe_sensor(&self, sensor_id: &str) -> Result<(), GatewayError> {
        let sensor = self.sensor(sensor_id)?;
        let queue = match self.queue_for(sensor.attach()) {
            Ok(queue) => queue,
            Err(_) => {
                probe_sensor(&self.ctx, &sensor).await;
                return Ok(());
            }
        };

        let mut task = SensorTask::from_sensor(&sensor);
        task.procedure = Some(Arc::new(ProbeProcedure));
        queue
            .send(task)
            .await
            .map_err(|_| GatewayError::EndpointInactive(sensor.attach().to_string()))
    }

    pub fn sensor_status(&self, sensor_id: &str) -> Result<SensorStatus, GatewayError> {
        Ok(self.sensor(sensor_id)?.status())
    }

    /// Current configuration, with live intervals. Status is never included.
    pub fn config_snapshot(&self) -> GatewayConfig {
        let mut config = self.base.clone();
        config.gateway.sensors = self.ctx.sensors.to_configs();
        config
    }

    pub fn save_config(&self, path: impl AsRef<Path>) -> Result<(), GatewayError> {
        self.config_snapshot().save(path)?;
        Ok(())
    }

    /// Metadata for the gateway status message.
    pub fn status_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.base.gateway.name,
            "endpoints": self.active_endpoints(),
            "sensors": self.ctx.sensors.len(),
            "scheduled": self.wheel.len(),
        })
    }

    /// Stop the timer, drain and stop every worker, close every link.
    pub async fn shutdown(&self) {
        let _ = self.wheel_shutdown.send(true);
        let wheel_task = self.wheel_task.lock().take();
        if let Some(task) = wheel_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Time wheel task ended abnormally");
            }
        }

        let endpoints: Vec<String> = self.endpoints.lock().keys().cloned().collect();
        for endpoint in endpoints {
            if let Err(e) = self.deactivate_endpoint(&endpoint).await {
                tracing::debug!(endpoint = %endpoint, error = %e, "Endpoint already stopped");
            }
        }

        self.ctx.sessions.close_all().await;
        tracing::info!("Gateway stopped");
    }
}
