//! Scheduled task identity and payloads.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::poll::PollProcedure;
use crate::sensor::{SensorDescriptor, TaskKind};
use crate::timewheel::{TaskCallback, TimeWheel};

/// The wheel type used by the gateway.
pub type SensorWheel = TimeWheel<TaskKey, TaskPayload>;

/// Identity of one recurring poll task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub address: u8,
    pub attach: String,
    pub kind: TaskKind,
}

impl TaskKey {
    pub fn new(address: u8, attach: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            address,
            attach: attach.into(),
            kind,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}/{}", self.attach, self.address, u8::from(self.kind))
    }
}

/// What a worker needs to run one poll, snapshotted when scheduled.
#[derive(Clone)]
pub struct SensorTask {
    pub sensor_id: String,
    pub address: u8,
    pub kind: TaskKind,
    pub attach: String,
    pub procedure: Option<Arc<dyn PollProcedure>>,
}

impl fmt::Debug for SensorTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorTask")
            .field("sensor_id", &self.sensor_id)
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("attach", &self.attach)
            .field("custom_procedure", &self.procedure.is_some())
            .finish()
    }
}

impl SensorTask {
    pub fn from_sensor(sensor: &SensorDescriptor) -> Self {
        Self {
            sensor_id: sensor.id().to_string(),
            address: sensor.address(),
            kind: sensor.kind(),
            attach: sensor.attach().to_string(),
            procedure: sensor.procedure(),
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.address, self.attach.clone(), self.kind)
    }
}

/// Payload stored in the wheel: the task plus the endpoint queue it goes to.
#[derive(Clone, Debug)]
pub struct TaskPayload {
    pub task: SensorTask,
    pub queue: mpsc::Sender<SensorTask>,
    pub sensor: Arc<SensorDescriptor>,
    /// Set while a push for this key is waiting for queue capacity.
    deferred: Arc<AtomicBool>,
}

impl TaskPayload {
    pub fn new(sensor: Arc<SensorDescriptor>, queue: mpsc::Sender<SensorTask>) -> Self {
        Self {
            task: SensorTask::from_sensor(&sensor),
            queue,
            sensor,
            deferred: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Re-snapshot the sensor, keeping the queue and any waiting push.
    pub fn refresh(&self, sensor: Arc<SensorDescriptor>) -> Self {
        Self {
            task: SensorTask::from_sensor(&sensor),
            queue: self.queue.clone(),
            sensor,
            deferred: self.deferred.clone(),
        }
    }

    /// Whether a push for this key is still waiting for queue capacity.
    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }
}

/// Wheel callback that pushes due tasks onto their endpoint queue.
///
/// Closed sensors are skipped but stay scheduled. A full queue hands the push
/// to a spawned task so the timer loop never waits on a worker; at most one
/// such push per key waits at a time, and ticks that come due meanwhile are
/// dropped. A closed queue removes the task from the wheel.
pub fn push_callback(wheel: Weak<SensorWheel>) -> TaskCallback<TaskPayload> {
    Arc::new(move |payload: TaskPayload| push_task(&wheel, payload))
}

fn push_task(wheel: &Weak<SensorWheel>, payload: TaskPayload) {
    let TaskPayload {
        task,
        queue,
        sensor,
        deferred,
    } = payload;

    if sensor.is_closed() {
        tracing::trace!(sensor = %task.sensor_id, "Sensor closed, skipping");
        return;
    }

    if deferred.load(Ordering::Acquire) {
        tracing::warn!(
            sensor = %task.sensor_id,
            endpoint = %task.attach,
            "Previous poll still waiting for queue capacity, skipping tick"
        );
        return;
    }

    match queue.try_send(task) {
        Ok(()) => {}
        Err(TrySendError::Full(task)) => {
            let handle = match Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    tracing::warn!(
                        sensor = %task.sensor_id,
                        endpoint = %task.attach,
                        "Task queue full outside a runtime, dropping task"
                    );
                    return;
                }
            };
            if deferred.swap(true, Ordering::AcqRel) {
                return;
            }

            tracing::debug!(
                sensor = %task.sensor_id,
                endpoint = %task.attach,
                "Task queue full, waiting for a free slot"
            );
            let wheel = wheel.clone();
            handle.spawn(async move {
                let result = queue.send(task).await;
                deferred.store(false, Ordering::Release);
                if let Err(e) = result {
                    deschedule(&wheel, &e.0);
                }
            });
        }
        Err(TrySendError::Closed(task)) => deschedule(wheel, &task),
    }
}

fn deschedule(wheel: &Weak<SensorWheel>, task: &SensorTask) {
    tracing::info!(
        sensor = %task.sensor_id,
        endpoint = %task.attach,
        "Task queue closed, removing task"
    );
    if let Some(wheel) = wheel.upgrade() {
        if let Err(e) = wheel.remove_task(&task.key()) {
            tracing::debug!(sensor = %task.sensor_id, error = %e, "Task already removed");
        }
    }
}
