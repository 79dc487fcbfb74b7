//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use sensorlink_framework::{BridgeConfig, Publish};
use zenoh_bridge_dtu::GatewayConfig;
use zenoh_bridge_dtu::codec::crc_bytes;

/// Publisher that keeps everything in memory.
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingPublisher {
    pub fn on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, p)| serde_json::from_slice(p).ok())
            .collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.messages.lock().iter().filter(|(t, _)| t == topic).count()
    }
}

#[async_trait]
impl Publish for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> sensorlink_framework::Result<()> {
        self.messages.lock().push((topic.to_string(), payload));
        Ok(())
    }
}

/// How the fake DTU answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Oxygen 8.25, Temp 21.3 for every read.
    Respond,
    /// Read the request, never answer.
    Silent,
    /// Exception reply.
    Error,
}

/// A transparent-transmission endpoint with sensors behind it.
pub struct FakeDtu {
    pub address: String,
    mode: Arc<Mutex<Mode>>,
    requests: Arc<AtomicUsize>,
}

impl FakeDtu {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mode = Arc::new(Mutex::new(Mode::Respond));
        let requests = Arc::new(AtomicUsize::new(0));

        let (m, r) = (mode.clone(), requests.clone());
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let (mode, requests) = (m.clone(), r.clone());
                tokio::spawn(async move {
                    let mut request = [0u8; 8];
                    while socket.read_exact(&mut request).await.is_ok() {
                        requests.fetch_add(1, Ordering::SeqCst);
                        let current = *mode.lock();
                        let reply = match current {
                            Mode::Respond => frame(&[
                                request[0], 0x03, 0x08, 0x03, 0x39, 0x00, 0x02, 0x00, 0xD5, 0x00,
                                0x01,
                            ]),
                            Mode::Error => frame(&[request[0], 0x83, 0x02]),
                            Mode::Silent => continue,
                        };
                        if socket.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            address,
            mode,
            requests,
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend_from_slice(&crc_bytes(body));
    frame
}

/// Gateway config with short timeouts and no ban backoff.
///
/// `sensors` is a list of `(sensorID, addr, attach)`; all poll every second.
pub fn config(sensors: &[(&str, u8, &str)]) -> GatewayConfig {
    let sensors: Vec<String> = sensors
        .iter()
        .map(|(id, addr, attach)| {
            format!(
                r#"{{ sensorID: "{}", addr: {}, type: 0, attach: "{}", interval: 1 }}"#,
                id, addr, attach
            )
        })
        .collect();

    GatewayConfig::parse(&format!(
        r#"{{ gateway: {{
            endpoint: {{ connect_timeout_ms: 500, response_timeout_ms: 150 }},
            failure: {{ threshold: 3, base_backoff_secs: 0, max_backoff_secs: 0 }},
            sensors: [{}]
        }} }}"#,
        sensors.join(",")
    ))
    .unwrap()
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
