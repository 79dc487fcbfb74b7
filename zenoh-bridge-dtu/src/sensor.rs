//! Sensor descriptors and their runtime state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::SensorConfig;
use crate::poll::PollProcedure;
use crate::task::TaskKey;

/// Poll procedure selector carried by each sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum TaskKind {
    /// Dissolved oxygen and temperature probe.
    #[default]
    DissolvedOxygen,
    /// Type code with no built-in procedure.
    Reserved(u8),
}

impl From<u8> for TaskKind {
    fn from(code: u8) -> Self {
        match code {
            0 => TaskKind::DissolvedOxygen,
            other => TaskKind::Reserved(other),
        }
    }
}

impl From<TaskKind> for u8 {
    fn from(kind: TaskKind) -> Self {
        match kind {
            TaskKind::DissolvedOxygen => 0,
            TaskKind::Reserved(code) => code,
        }
    }
}

impl TaskKind {
    /// Measurement kind used in the publish topic, if this type has one.
    pub fn measure_kind(&self) -> Option<&'static str> {
        match self {
            TaskKind::DissolvedOxygen => Some("oxygen"),
            TaskKind::Reserved(_) => None,
        }
    }
}

/// Sensor status state machine.
///
/// `Normal <-> Detach` is driven by poll outcomes; `Closed` is entered and
/// left only by administrative action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    #[default]
    Normal,
    Detach,
    Closed,
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SensorStatus::Normal => "normal",
            SensorStatus::Detach => "detach",
            SensorStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct SensorState {
    status: SensorStatus,
    interval_secs: i64,
    procedure: Option<Arc<dyn PollProcedure>>,
}

/// A configured sensor plus its mutable runtime state.
pub struct SensorDescriptor {
    id: String,
    address: u8,
    kind: TaskKind,
    attach: String,
    state: RwLock<SensorState>,
}

impl fmt::Debug for SensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SensorDescriptor")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("attach", &self.attach)
            .field("status", &state.status)
            .field("interval_secs", &state.interval_secs)
            .field("custom_procedure", &state.procedure.is_some())
            .finish()
    }
}

impl SensorDescriptor {
    pub fn new(
        id: impl Into<String>,
        address: u8,
        kind: TaskKind,
        attach: impl Into<String>,
        interval_secs: i64,
    ) -> Self {
        Self {
            id: id.into(),
            address,
            kind,
            attach: attach.into(),
            state: RwLock::new(SensorState {
                status: SensorStatus::Normal,
                interval_secs,
                procedure: None,
            }),
        }
    }

    /// Build from configuration. Every sensor starts `Normal`.
    pub fn from_config(config: &SensorConfig) -> Self {
        Self::new(
            config.sensor_id.clone(),
            config.addr,
            config.kind,
            config.attach.clone(),
            config.interval,
        )
    }

    /// Persistable view; status is not part of it.
    pub fn to_config(&self) -> SensorConfig {
        SensorConfig {
            sensor_id: self.id.clone(),
            addr: self.address,
            kind: self.kind,
            attach: self.attach.clone(),
            interval: self.interval_secs(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn attach(&self) -> &str {
        &self.attach
    }

    pub fn task_key(&self) -> TaskKey {
        TaskKey::new(self.address, self.attach.clone(), self.kind)
    }

    pub fn status(&self) -> SensorStatus {
        self.state.read().status
    }

    pub fn is_closed(&self) -> bool {
        self.status() == SensorStatus::Closed
    }

    /// Set the status, returning the previous one if it changed.
    pub fn set_status(&self, status: SensorStatus) -> Option<SensorStatus> {
        let mut state = self.state.write();
        let previous = std::mem::replace(&mut state.status, status);
        (previous != status).then_some(previous)
    }

    /// Move to `status` unless the sensor is closed.
    ///
    /// Poll outcomes use this so they never override an administrative close.
    pub fn transition_unless_closed(&self, status: SensorStatus) -> Option<SensorStatus> {
        let mut state = self.state.write();
        if state.status == SensorStatus::Closed || state.status == status {
            return None;
        }
        Some(std::mem::replace(&mut state.status, status))
    }

    pub fn interval_secs(&self) -> i64 {
        self.state.read().interval_secs
    }

    pub fn set_interval_secs(&self, interval_secs: i64) {
        self.state.write().interval_secs = interval_secs;
    }

    pub fn procedure(&self) -> Option<Arc<dyn PollProcedure>> {
        self.state.read().procedure.clone()
    }

    pub fn set_procedure(&self, procedure: Arc<dyn PollProcedure>) {
        self.state.write().procedure = Some(procedure);
    }

    /// Remove the custom procedure. Returns whether one was set.
    pub fn clear_procedure(&self) -> bool {
        self.state.write().procedure.take().is_some()
    }
}

/// All configured sensors, in configuration order, indexed by id.
#[derive(Debug, Default)]
pub struct SensorTable {
    sensors: Vec<Arc<SensorDescriptor>>,
    index: HashMap<String, usize>,
}

impl SensorTable {
    pub fn from_configs(configs: &[SensorConfig]) -> Self {
        let mut table = Self::default();
        for config in configs {
            table.insert(SensorDescriptor::from_config(config));
        }
        table
    }

    /// Add a sensor. A sensor with the same id replaces the old entry.
    pub fn insert(&mut self, sensor: SensorDescriptor) -> Arc<SensorDescriptor> {
        let sensor = Arc::new(sensor);
        match self.index.get(sensor.id()) {
            Some(&pos) => self.sensors[pos] = sensor.clone(),
            None => {
                self.index.insert(sensor.id().to_string(), self.sensors.len());
                self.sensors.push(sensor.clone());
            }
        }
        sensor
    }

    pub fn get(&self, sensor_id: &str) -> Option<Arc<SensorDescriptor>> {
        self.index.get(sensor_id).map(|&pos| self.sensors[pos].clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SensorDescriptor>> {
        self.sensors.iter()
    }

    /// Sensors reachable through `endpoint`, in configuration order.
    pub fn attached_to(&self, endpoint: &str) -> Vec<Arc<SensorDescriptor>> {
        self.sensors
            .iter()
            .filter(|s| s.attach() == endpoint)
            .cloned()
            .collect()
    }

    /// Distinct attach endpoints, in configuration order.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = Vec::new();
        for sensor in &self.sensors {
            if !endpoints.iter().any(|e| e == sensor.attach()) {
                endpoints.push(sensor.attach().to_string());
            }
        }
        endpoints
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn to_configs(&self) -> Vec<SensorConfig> {
        self.sensors.iter().map(|s| s.to_config()).collect()
    }
}
