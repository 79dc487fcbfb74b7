//! Zenoh gateway for DTU-attached sensor buses.
//!
//! Each attach endpoint (DTU) is a transparent TCP link to a serial bus
//! shared by several sensors. The gateway polls every sensor on a fixed
//! interval, one exchange at a time per link, and publishes decoded
//! measurements to Zenoh.
//!
//! # Key Expressions
//!
//! ```text
//! sensor/<kind>/measure                   measurements (JSON)
//! <prefix>/@/status                       gateway status
//! <prefix>/@/sensors/<sensorID>/status    sensor status changes
//! <prefix>/@/commands/sensor              administrative commands
//! ```
//!
//! # Flow
//!
//! time wheel tick -> due task -> endpoint queue -> poll worker ->
//! request frame -> endpoint session -> reply frame -> failure tracker /
//! sensor status -> publish

pub mod codec;
pub mod commands;
pub mod config;
pub mod failure;
pub mod gateway;
pub mod poll;
pub mod sensor;
pub mod session;
pub mod task;
pub mod timewheel;
pub mod worker;

pub use config::GatewayConfig;
pub use gateway::{Gateway, GatewayError};
pub use poll::{DefaultPollProcedure, PollContext, PollError, PollProcedure};
pub use sensor::{SensorStatus, TaskKind};
