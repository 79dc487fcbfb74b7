//! Gateway runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;

use tokio::signal;
use tokio::task::JoinHandle;

use sensorlink_common::{Format, LoggingConfig, connect, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::Publisher;
use crate::status::StatusPublisher;

/// Runner that owns the lifecycle of a gateway process.
///
/// Handles:
/// - Logging initialization
/// - Zenoh connection
/// - Task spawning and management
/// - Graceful shutdown on Ctrl+C, with a caller-supplied drain step
/// - Status publishing (optional)
///
/// # Example
///
/// ```ignore
/// use sensorlink_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("dtu.json5");
///     let config = GatewayConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("dtu", config, Some(&args)).await?;
///     let gateway = Gateway::new(/* ... */);
///     gateway.activate_all().await;
///
///     runner.run_until_shutdown(None, async move { gateway.shutdown().await }).await?;
///     Ok(())
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Gateway name for logging and status.
    name: String,
    /// Gateway version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Zenoh session.
    session: Arc<zenoh::Session>,
    /// Publisher for measurements and status.
    publisher: Publisher,
    /// Status publisher (optional).
    status_publisher: Option<StatusPublisher>,
    /// Spawned tasks.
    tasks: Vec<JoinHandle<()>>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new runner.
    ///
    /// This will:
    /// 1. Initialize logging from the config
    /// 2. Connect to Zenoh
    /// 3. Create the publisher
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None).await
    }

    /// Create a new runner with CLI args for log level override.
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let configured = config.logging();
        let log_config = match args {
            Some(args) => LoggingConfig {
                level: args.effective_log_level(&configured.level),
                format: configured.format,
            },
            None => configured.clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(gateway = %name, version = %version, "Starting gateway");

        let session = Arc::new(
            connect(config.zenoh())
                .await
                .map_err(|e| BridgeError::ZenohConnection(e.to_string()))?,
        );

        tracing::info!(zid = %session.zid(), "Connected to Zenoh");

        let publisher = Publisher::new(session.clone(), config.key_prefix(), Format::Json);

        Ok(Self {
            name,
            version,
            config,
            session,
            publisher,
            status_publisher: None,
            tasks: Vec::new(),
        })
    }

    /// Enable status publishing.
    ///
    /// When enabled, the runner publishes "running" on startup and "offline" on shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = Some(StatusPublisher::new(
            self.publisher.clone(),
            &self.name,
            &self.version,
        ));
        self
    }

    /// Set a custom serialization format for the publisher.
    pub fn with_format(mut self, format: Format) -> Self {
        self.publisher = Publisher::new(self.session.clone(), self.config.key_prefix(), format);
        if self.status_publisher.is_some() {
            self.status_publisher = Some(StatusPublisher::new(
                self.publisher.clone(),
                &self.name,
                &self.version,
            ));
        }
        self
    }

    /// Get the gateway name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the gateway version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    /// Get a clone of the publisher.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Spawn a background task.
    ///
    /// The task is aborted on shutdown, after the shutdown hook has run.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(future));
    }

    /// Spawn a background task that returns a Result.
    ///
    /// Errors are logged.
    pub fn spawn_with_error<F, E>(&mut self, name: String, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(task = %name, error = %e, "Task failed");
            }
        });
        self.tasks.push(handle);
    }

    /// Run until Ctrl+C is received.
    pub async fn run(self) -> Result<()> {
        self.run_until_shutdown(None, async {}).await
    }

    /// Run until Ctrl+C, then await `on_shutdown` before tearing down.
    ///
    /// Order on shutdown:
    /// 1. `on_shutdown` runs to completion (drain workers, stop schedulers)
    /// 2. Remaining spawned tasks are aborted
    /// 3. "offline" status is published (if enabled)
    /// 4. The Zenoh session is closed
    pub async fn run_until_shutdown<F>(
        self,
        metadata: Option<serde_json::Value>,
        on_shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_running(metadata).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(
            gateway = %self.name,
            tasks = self.tasks.len(),
            "Gateway running. Press Ctrl+C to stop."
        );

        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }

        tracing::info!(gateway = %self.name, "Received shutdown signal");

        on_shutdown.await;

        for task in &self.tasks {
            task.abort();
        }

        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline().await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        if let Err(e) = self.session.close().await {
            tracing::warn!(error = %e, "Error closing Zenoh session");
        }

        tracing::info!(gateway = %self.name, "Goodbye!");

        Ok(())
    }
}
