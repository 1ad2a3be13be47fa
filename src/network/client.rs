//! Client-side handle to a remote device.
//!
//! Connecting is two-phase. [`DeviceProxy::new`] only validates the address
//! and performs no I/O, so handles are cheap to construct. The first call,
//! or an explicit [`DeviceProxy::wait_ready`], opens the TCP stream.
//!
//! The stream is cached and reused. Any I/O or framing failure drops it, so
//! the next call reconnects from scratch; the failing call itself is never
//! retried here.

use super::error_mapping::error_from_response;
use super::protocol::{
    read_frame, write_frame, AttributeWrite, DeviceRequest, DeviceResponse, DeviceState,
    EncodedValue, RequestType,
};
use crate::detector::{AttributeSpec, DetectorSettings, SettingValue};
use crate::error::{TemError, TemResult};
use crate::hardware::BackendMode;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

/// Default bound on a single request/response exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on an `Acquire` call, which blocks for the whole exposure.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(600);

/// Normalize a device address to `host:port`.
///
/// Accepts `host:port`, `tcp://host:port` and bracketed IPv6 hosts.
pub fn normalize_address(input: &str) -> TemResult<String> {
    let trimmed = input.trim();
    let bare = trimmed.strip_prefix("tcp://").unwrap_or(trimmed);
    let bare = bare.trim_end_matches('/');

    let invalid = |reason: &str| TemError::Configuration(format!("invalid device address '{input}': {reason}"));

    if bare.is_empty() {
        return Err(invalid("empty"));
    }
    if bare.contains("://") {
        return Err(invalid("only tcp:// addresses are supported"));
    }
    let (host, port) = bare
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() || host == "[]" {
        return Err(invalid("missing host"));
    }
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| invalid("port must be 1-65535"))?;

    Ok(bare.to_string())
}

/// Handle to one remote device.
pub struct DeviceProxy {
    name: String,
    address: String,
    stream: Mutex<Option<TcpStream>>,
    next_id: AtomicU32,
    request_timeout: Duration,
    acquire_timeout: Duration,
}

impl DeviceProxy {
    /// Create a handle for the device `name` at `address`. No I/O.
    pub fn new(name: impl Into<String>, address: &str) -> TemResult<Self> {
        Ok(Self {
            name: name.into(),
            address: normalize_address(address)?,
            stream: Mutex::new(None),
            next_id: AtomicU32::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        })
    }

    /// Bound on every call except `acquire`.
    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Bound on `acquire`, separate from the request timeout because a
    /// capture lasts as long as the physical exposure.
    #[must_use]
    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    /// Name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalised `host:port`.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a stream is currently cached. Says nothing about liveness.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Poll until the device answers a ping, or `wait` elapses.
    ///
    /// Fails with `ProxyUnavailable` carrying the last observed error.
    pub async fn wait_ready(&self, wait: Duration, poll_interval: Duration) -> TemResult<()> {
        let deadline = Instant::now() + wait;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = self
                .call_with_timeout(RequestType::Ping, Bytes::new(), remaining.min(self.request_timeout))
                .await;

            let last_error = match attempt {
                Ok(_) => {
                    info!(device = %self.name, address = %self.address, attempts, "Device ready");
                    return Ok(());
                }
                Err(e) => e,
            };

            debug!(device = %self.name, attempts, error = %last_error, "Device not ready yet");

            if Instant::now() + poll_interval >= deadline {
                return Err(TemError::ProxyUnavailable {
                    kind: self.name.clone(),
                    address: self.address.clone(),
                    reason: format!(
                        "not ready within {wait:?} after {attempts} attempt(s): {last_error}"
                    ),
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Liveness probe.
    pub async fn ping(&self) -> TemResult<()> {
        self.call(RequestType::Ping, Bytes::new()).await.map(|_| ())
    }

    /// Device state.
    pub async fn state(&self) -> TemResult<DeviceState> {
        let payload = self.call(RequestType::State, Bytes::new()).await?;
        let text = String::from_utf8_lossy(&payload);
        DeviceState::parse(&text)
            .ok_or_else(|| TemError::Protocol(format!("unknown device state '{text}'")))
    }

    /// Read one attribute.
    pub async fn read_attribute(&self, name: &str) -> TemResult<SettingValue> {
        let payload = self
            .call(RequestType::ReadAttribute, Bytes::copy_from_slice(name.as_bytes()))
            .await?;
        decode_json(&payload)
    }

    /// Write one attribute; the device validates it.
    pub async fn write_attribute(&self, name: &str, value: SettingValue) -> TemResult<()> {
        let body = encode_json(&AttributeWrite {
            name: name.to_string(),
            value,
        })?;
        self.call(RequestType::WriteAttribute, body).await.map(|_| ())
    }

    /// All settings, read under a single lock on the remote side.
    pub async fn read_snapshot(&self) -> TemResult<DetectorSettings> {
        let payload = self.call(RequestType::ReadSnapshot, Bytes::new()).await?;
        decode_json(&payload)
    }

    /// Attribute schema of the device.
    pub async fn list_attributes(&self) -> TemResult<Vec<AttributeSpec>> {
        let payload = self.call(RequestType::ListAttributes, Bytes::new()).await?;
        decode_json(&payload)
    }

    /// Ask a microscope device for one image from `detector`.
    pub async fn acquire(&self, detector: &str) -> TemResult<EncodedValue> {
        let payload = self
            .call_with_timeout(
                RequestType::Acquire,
                Bytes::copy_from_slice(detector.as_bytes()),
                self.acquire_timeout,
            )
            .await?;
        EncodedValue::decode(&payload)
    }

    /// Backend mode of a microscope device.
    pub async fn backend_mode(&self) -> TemResult<BackendMode> {
        let payload = self.call(RequestType::BackendMode, Bytes::new()).await?;
        match payload.as_ref() {
            b"real" => Ok(BackendMode::Real),
            b"simulated" => Ok(BackendMode::Simulated),
            other => Err(TemError::Protocol(format!(
                "unknown backend mode '{}'",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    async fn call(&self, request_type: RequestType, payload: Bytes) -> TemResult<Bytes> {
        self.call_with_timeout(request_type, payload, self.request_timeout)
            .await
    }

    async fn call_with_timeout(
        &self,
        request_type: RequestType,
        payload: Bytes,
        limit: Duration,
    ) -> TemResult<Bytes> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = DeviceRequest::new(request_id, request_type, payload);

        let mut guard = self.stream.lock().await;
        let outcome = timeout(limit, async {
            if guard.is_none() {
                let stream = TcpStream::connect(&self.address).await?;
                stream.set_nodelay(true)?;
                debug!(device = %self.name, address = %self.address, "Connected");
                *guard = Some(stream);
            }
            let stream = guard
                .as_mut()
                .ok_or_else(|| TemError::Protocol("connection vanished".into()))?;
            exchange(stream, &request).await
        })
        .await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                guard.take();
                return Err(e);
            }
            Err(_) => {
                guard.take();
                return Err(TemError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("{request_type:?} to {} timed out after {limit:?}", self.address),
                )));
            }
        };
        drop(guard);

        if response.is_success() {
            Ok(response.payload)
        } else {
            Err(error_from_response(&response))
        }
    }
}

async fn exchange(stream: &mut TcpStream, request: &DeviceRequest) -> TemResult<DeviceResponse> {
    write_frame(stream, &request.encode()).await?;
    let body = read_frame(stream).await?.ok_or_else(|| {
        TemError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "device closed the connection",
        ))
    })?;
    let response = DeviceResponse::decode(&body)?;
    if response.request_id != request.request_id {
        return Err(TemError::Protocol(format!(
            "response id {} does not match request id {}",
            response.request_id, request.request_id
        )));
    }
    Ok(response)
}

fn encode_json<T: serde::Serialize>(value: &T) -> TemResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| TemError::Protocol(format!("failed to encode payload: {e}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(payload: &[u8]) -> TemResult<T> {
    serde_json::from_slice(payload)
        .map_err(|e| TemError::Protocol(format!("failed to decode payload: {e}")))
}

impl std::fmt::Debug for DeviceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProxy")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
