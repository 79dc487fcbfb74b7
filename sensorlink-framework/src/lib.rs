//! SensorLink Gateway Framework
//!
//! Process-level plumbing shared by SensorLink gateways.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading, validation and saving
//! - [`BridgeRunner`] for managing gateway lifecycle (startup, shutdown, signal handling)
//! - [`Publish`] capability and its Zenoh-backed [`Publisher`]
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeStatus`] for standardized status reporting

mod args;
mod config;
mod error;
mod publisher;
mod runner;
mod status;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use publisher::{Publish, Publisher, build_key};
pub use runner::BridgeRunner;
pub use status::{BridgeStatus, StatusPublisher};

// Re-export commonly used types from sensorlink-common
pub use sensorlink_common::{
    Format, LogFormat, LoggingConfig, MeasureItem, MeasurementResult, ResultStatus, TopicBuilder,
    ZenohConfig,
};
