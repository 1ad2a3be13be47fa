//! Wire format for device requests and responses.
//!
//! Every message travels as one frame: a little-endian `u32` body length
//! followed by the body. Bodies are the hand-packed `DeviceRequest` /
//! `DeviceResponse` layouts below.
//!
//! ```text
//! request  = type:u8 | id:u32 | payload_len:u32 | payload | timestamp:u64
//! response = status:u8 | id:u32 | payload_len:u32 | payload
//!          | error_len:u32 | error utf8 | timestamp:u64
//! encoded  = format_len:u32 | format utf8 | data
//! ```

use crate::detector::SettingValue;
use crate::error::{TemError, TemResult};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body (a 4096 x 4096 float32 image is 64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024 + 64 * 1024;

const REQUEST_HEADER_LEN: usize = 17;
const RESPONSE_HEADER_LEN: usize = 21;

/// Operation requested of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestType {
    /// Liveness probe.
    Ping = 0,
    /// Device state.
    State = 1,
    /// Read one attribute.
    ReadAttribute = 2,
    /// Write one attribute.
    WriteAttribute = 3,
    /// Read every attribute at once.
    ReadSnapshot = 4,
    /// Attribute schema.
    ListAttributes = 5,
    /// Acquire one image.
    Acquire = 6,
    /// Backend mode of the microscope.
    BackendMode = 7,
}

impl RequestType {
    /// Decode a wire tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestType::Ping),
            1 => Some(RequestType::State),
            2 => Some(RequestType::ReadAttribute),
            3 => Some(RequestType::WriteAttribute),
            4 => Some(RequestType::ReadSnapshot),
            5 => Some(RequestType::ListAttributes),
            6 => Some(RequestType::Acquire),
            7 => Some(RequestType::BackendMode),
            _ => None,
        }
    }
}

/// Outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseStatus {
    /// Request succeeded.
    Success = 0,
    /// Unclassified failure.
    Error = 1,
    /// Malformed or unsupported request.
    InvalidRequest = 2,
    /// No such attribute.
    UnknownAttribute = 3,
    /// Value rejected by validation.
    InvalidValue = 4,
    /// Detector kind not configured.
    UnknownDetectorKind = 5,
    /// Settings holder unreachable.
    ProxyUnavailable = 6,
    /// Capture failed on the instrument.
    AcquisitionFailed = 7,
    /// Request timed out.
    Timeout = 8,
}

impl ResponseStatus {
    /// Decode a wire tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResponseStatus::Success),
            1 => Some(ResponseStatus::Error),
            2 => Some(ResponseStatus::InvalidRequest),
            3 => Some(ResponseStatus::UnknownAttribute),
            4 => Some(ResponseStatus::InvalidValue),
            5 => Some(ResponseStatus::UnknownDetectorKind),
            6 => Some(ResponseStatus::ProxyUnavailable),
            7 => Some(ResponseStatus::AcquisitionFailed),
            8 => Some(ResponseStatus::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coarse device state, reported by the `State` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceState {
    /// Operating normally.
    On,
    /// Startup fault recorded.
    Fault,
}

impl DeviceState {
    /// `ON` or `FAULT`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::On => "ON",
            DeviceState::Fault => "FAULT",
        }
    }

    /// Parse `ON` or `FAULT`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ON" => Some(DeviceState::On),
            "FAULT" => Some(DeviceState::Fault),
            _ => None,
        }
    }
}

/// Payload of a `WriteAttribute` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeWrite {
    /// Attribute name.
    pub name: String,
    /// New value.
    pub value: SettingValue,
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn read_u32(data: &[u8], at: usize) -> TemResult<u32> {
    data.get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| TemError::Protocol(format!("truncated u32 at offset {at}")))
}

fn read_u64(data: &[u8], at: usize) -> TemResult<u64> {
    data.get(at..at + 8)
        .and_then(|s| s.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| TemError::Protocol(format!("truncated u64 at offset {at}")))
}

/// One request frame.
#[derive(Debug, Clone)]
pub struct DeviceRequest {
    /// Echoed in the response.
    pub request_id: u32,
    /// Requested operation.
    pub request_type: RequestType,
    /// Operation-specific body.
    pub payload: Bytes,
    /// Send time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl DeviceRequest {
    /// Request stamped with the current time.
    pub fn new(request_id: u32, request_type: RequestType, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            request_type,
            payload: payload.into(),
            timestamp: now_millis(),
        }
    }

    /// Payload interpreted as UTF-8 text.
    pub fn payload_str(&self) -> TemResult<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| TemError::Protocol(format!("payload is not UTF-8: {e}")))
    }

    /// Frame body bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_HEADER_LEN + self.payload.len());

        buf.push(self.request_type as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());

        buf
    }

    /// Parse a frame body.
    pub fn decode(data: &[u8]) -> TemResult<Self> {
        if data.len() < REQUEST_HEADER_LEN {
            return Err(TemError::Protocol(
                "Insufficient data for DeviceRequest".to_string(),
            ));
        }

        let request_type = RequestType::from_u8(data[0])
            .ok_or_else(|| TemError::Protocol(format!("Invalid request type {}", data[0])))?;

        let request_id = read_u32(data, 1)?;
        let payload_len = read_u32(data, 5)? as usize;

        if data.len() != REQUEST_HEADER_LEN + payload_len {
            return Err(TemError::Protocol("Payload size mismatch".to_string()));
        }

        let payload = Bytes::copy_from_slice(&data[9..9 + payload_len]);
        let timestamp = read_u64(data, 9 + payload_len)?;

        Ok(DeviceRequest {
            request_id,
            request_type,
            payload,
            timestamp,
        })
    }
}

/// One response frame.
#[derive(Debug, Clone)]
pub struct DeviceResponse {
    /// Id of the request answered, 0 if it could not be decoded.
    pub request_id: u32,
    /// Outcome.
    pub status: ResponseStatus,
    /// Result body, or JSON error detail.
    pub payload: Bytes,
    /// Human-readable error, empty on success.
    pub error_message: String,
    /// Send time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl DeviceResponse {
    /// Successful response.
    pub fn success(request_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Success,
            payload: payload.into(),
            error_message: String::new(),
            timestamp: now_millis(),
        }
    }

    /// Failed response with a detail payload.
    pub fn error(
        request_id: u32,
        status: ResponseStatus,
        message: String,
        detail: impl Into<Bytes>,
    ) -> Self {
        Self {
            request_id,
            status,
            payload: detail.into(),
            error_message: message,
            timestamp: now_millis(),
        }
    }

    /// Whether `status` is `Success`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Frame body bytes.
    pub fn encode(&self) -> Vec<u8> {
        let error_bytes = self.error_message.as_bytes();
        let mut buf =
            Vec::with_capacity(RESPONSE_HEADER_LEN + self.payload.len() + error_bytes.len());

        buf.push(self.status as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);

        buf.extend_from_slice(&(error_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(error_bytes);

        buf.extend_from_slice(&self.timestamp.to_le_bytes());

        buf
    }

    /// Parse a frame body.
    pub fn decode(data: &[u8]) -> TemResult<Self> {
        if data.len() < RESPONSE_HEADER_LEN {
            return Err(TemError::Protocol(
                "Insufficient data for DeviceResponse".to_string(),
            ));
        }

        let status = ResponseStatus::from_u8(data[0])
            .ok_or_else(|| TemError::Protocol(format!("Invalid response status {}", data[0])))?;

        let request_id = read_u32(data, 1)?;
        let payload_len = read_u32(data, 5)? as usize;

        let payload_end = 9 + payload_len;
        if data.len() < payload_end + 4 {
            return Err(TemError::Protocol("Payload size mismatch".to_string()));
        }
        let payload = Bytes::copy_from_slice(&data[9..payload_end]);

        let error_len = read_u32(data, payload_end)? as usize;
        let error_end = payload_end + 4 + error_len;
        if data.len() != error_end + 8 {
            return Err(TemError::Protocol(
                "Error message size mismatch".to_string(),
            ));
        }

        let error_message = String::from_utf8(data[payload_end + 4..error_end].to_vec())
            .map_err(|e| TemError::Protocol(e.to_string()))?;
        let timestamp = read_u64(data, error_end)?;

        Ok(DeviceResponse {
            request_id,
            status,
            payload,
            error_message,
            timestamp,
        })
    }
}

/// An atomic two-part value: a text `format` part and a binary `data` part.
///
/// Image acquisitions put the metadata JSON in `format` and the raw pixel
/// bytes in `data`. Both parts always travel in the same frame.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedValue {
    /// Format description; acquisition metadata JSON for images.
    pub format: String,
    /// Raw data.
    pub data: Bytes,
}

impl EncodedValue {
    /// `u32 format_len | format | data`.
    pub fn encode(&self) -> Vec<u8> {
        let format = self.format.as_bytes();
        let mut buf = Vec::with_capacity(4 + format.len() + self.data.len());
        buf.extend_from_slice(&(format.len() as u32).to_le_bytes());
        buf.extend_from_slice(format);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Inverse of `encode`.
    pub fn decode(data: &[u8]) -> TemResult<Self> {
        let format_len = read_u32(data, 0)? as usize;
        let format_end = 4 + format_len;
        if data.len() < format_end {
            return Err(TemError::Protocol(format!(
                "encoded value declares {format_len} format bytes but only {} remain",
                data.len() - 4
            )));
        }
        let format = String::from_utf8(data[4..format_end].to_vec())
            .map_err(|e| TemError::Protocol(e.to_string()))?;
        Ok(Self {
            format,
            data: Bytes::copy_from_slice(&data[format_end..]),
        })
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> TemResult<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(TemError::Protocol(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> TemResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TemError::Protocol(format!(
            "incoming frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}
