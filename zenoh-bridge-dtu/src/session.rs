//! Connections to attach endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::codec::{FUNC_READ, FUNC_WRITE};
use crate::config::EndpointConfig;
use sensorlink_common::ERROR_REPLY_FLAG;

/// Errors from an exchange with an attach endpoint.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Endpoint {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("Endpoint {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    #[error("I/O error on {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Endpoint {endpoint} sent a frame with unsupported function code {func_code:#04x}")]
    UnsupportedFrame { endpoint: String, func_code: u8 },
}

/// Connection settings for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub default_port: u16,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&EndpointConfig::default())
    }
}

impl From<&EndpointConfig> for SessionOptions {
    fn from(config: &EndpointConfig) -> Self {
        Self {
            default_port: config.default_port,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
        }
    }
}

/// Socket address for an endpoint given as "host" or "host:port".
pub fn socket_address(endpoint: &str, default_port: u16) -> String {
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            endpoint.to_string()
        }
        _ => format!("{}:{}", endpoint, default_port),
    }
}

/// The single link to one attach endpoint.
///
/// The link is opened lazily and re-opened on the next exchange after any
/// failure. Callers serialize exchanges; the internal lock only protects the
/// connection slot.
#[derive(Debug)]
pub struct EndpointSession {
    endpoint: String,
    address: String,
    options: SessionOptions,
    conn: tokio::sync::Mutex<Option<TcpStream>>,
}

impl EndpointSession {
    pub fn new(endpoint: impl Into<String>, options: SessionOptions) -> Self {
        let endpoint = endpoint.into();
        let address = socket_address(&endpoint, options.default_port);
        Self {
            endpoint,
            address,
            options,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    /// Endpoint identifier as configured.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Resolved `host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Whether a link is currently held. Returns false while an exchange is in flight.
    pub fn is_connected(&self) -> bool {
        self.conn.try_lock().is_ok_and(|conn| conn.is_some())
    }

    /// Open the link now if it is not already open.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut conn = self.conn.lock().await;
        self.ensure_connected(&mut conn).await.map(|_| ())
    }

    async fn ensure_connected<'a>(
        &self,
        conn: &'a mut Option<TcpStream>,
    ) -> Result<&'a mut TcpStream, SessionError> {
        let healthy = conn.as_ref().is_some_and(|s| s.peer_addr().is_ok());
        if !healthy {
            if conn.take().is_some() {
                tracing::debug!(endpoint = %self.endpoint, "Dropping stale link");
            }

            let stream = timeout(self.options.connect_timeout, TcpStream::connect(&self.address))
                .await
                .map_err(|_| SessionError::Unreachable {
                    endpoint: self.endpoint.clone(),
                    reason: format!(
                        "connect timed out after {}ms",
                        self.options.connect_timeout.as_millis()
                    ),
                })?
                .map_err(|e| SessionError::Unreachable {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                })?;

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Failed to set TCP_NODELAY");
            }

            tracing::info!(endpoint = %self.endpoint, address = %self.address, "Connected to endpoint");
            *conn = Some(stream);
        }

        conn.as_mut().ok_or_else(|| SessionError::Unreachable {
            endpoint: self.endpoint.clone(),
            reason: "no connection".to_string(),
        })
    }

    /// Write `request` and wait for one reply frame.
    ///
    /// The link is dropped on timeout or I/O error so a late reply cannot be
    /// mistaken for the answer to the next request.
    pub async fn send_and_await(&self, request: &[u8]) -> Result<Vec<u8>, SessionError> {
        let mut conn = self.conn.lock().await;
        let stream = self.ensure_connected(&mut conn).await?;

        let result = match timeout(self.options.response_timeout, self.exchange(stream, request)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout_ms: self.options.response_timeout.as_millis() as u64,
            }),
        };

        if result.is_err() {
            *conn = None;
        }
        result
    }

    async fn exchange(&self, stream: &mut TcpStream, request: &[u8]) -> Result<Vec<u8>, SessionError> {
        stream.write_all(request).await.map_err(|e| self.io(e))?;
        stream.flush().await.map_err(|e| self.io(e))?;

        let mut frame = vec![0u8; 3];
        stream.read_exact(&mut frame).await.map_err(|e| self.io(e))?;

        let remaining = match frame[1] {
            FUNC_READ => frame[2] as usize + 2,
            FUNC_WRITE => 5,
            fc if fc > ERROR_REPLY_FLAG => 2,
            fc => {
                return Err(SessionError::UnsupportedFrame {
                    endpoint: self.endpoint.clone(),
                    func_code: fc,
                });
            }
        };

        let start = frame.len();
        frame.resize(start + remaining, 0);
        stream
            .read_exact(&mut frame[start..])
            .await
            .map_err(|e| self.io(e))?;

        tracing::trace!(endpoint = %self.endpoint, bytes = frame.len(), "Received frame");
        Ok(frame)
    }

    fn io(&self, source: std::io::Error) -> SessionError {
        SessionError::Io {
            endpoint: self.endpoint.clone(),
            source,
        }
    }

    /// Drop the link. The next exchange reconnects.
    pub async fn close(&self) {
        if let Some(mut stream) = self.conn.lock().await.take() {
            let _ = stream.shutdown().await;
            tracing::info!(endpoint = %self.endpoint, "Closed endpoint link");
        }
    }
}

/// At most one session per endpoint identifier.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    options: SessionOptions,
    sessions: Mutex<HashMap<String, Arc<EndpointSession>>>,
}

impl SessionRegistry {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Session for `endpoint`, created on first use.
    pub fn get_or_create(&self, endpoint: &str) -> Arc<EndpointSession> {
        self.sessions
            .lock()
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(EndpointSession::new(endpoint, self.options)))
            .clone()
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<EndpointSession>> {
        self.sessions.lock().get(endpoint).cloned()
    }

    pub fn remove(&self, endpoint: &str) -> Option<Arc<EndpointSession>> {
        self.sessions.lock().remove(endpoint)
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Close and forget every session.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}
