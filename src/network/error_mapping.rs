//! Mapping between [`TemError`] and wire response statuses.
//!
//! Each error kind the caller must be able to tell apart gets its own
//! [`ResponseStatus`]. The error response payload carries a small JSON
//! detail record so that the client can rebuild the same `TemError`
//! variant, fields included, on its side of the connection.
//!
//! | TemError              | ResponseStatus        |
//! |-----------------------|-----------------------|
//! | UnknownDetectorKind   | UnknownDetectorKind   |
//! | ProxyUnavailable      | ProxyUnavailable      |
//! | AcquisitionFailed     | AcquisitionFailed     |
//! | UnknownAttribute      | UnknownAttribute      |
//! | InvalidValue          | InvalidValue          |
//! | Protocol              | InvalidRequest        |
//! | Io / Config / Remote  | Error                 |

use super::protocol::{DeviceResponse, ResponseStatus};
use crate::error::TemError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ErrorDetail {
    UnknownDetectorKind {
        detector: String,
        available: Vec<String>,
    },
    ProxyUnavailable {
        detector: String,
        address: String,
        reason: String,
    },
    AcquisitionFailed {
        message: String,
    },
    UnknownAttribute {
        name: String,
    },
    InvalidValue {
        name: String,
        reason: String,
    },
}

/// Wire status for an error.
#[must_use]
pub fn status_for(err: &TemError) -> ResponseStatus {
    match err {
        TemError::UnknownDetectorKind { .. } => ResponseStatus::UnknownDetectorKind,
        TemError::ProxyUnavailable { .. } => ResponseStatus::ProxyUnavailable,
        TemError::AcquisitionFailed(_) => ResponseStatus::AcquisitionFailed,
        TemError::UnknownAttribute(_) => ResponseStatus::UnknownAttribute,
        TemError::InvalidValue { .. } => ResponseStatus::InvalidValue,
        TemError::Protocol(_) => ResponseStatus::InvalidRequest,
        TemError::Io(_)
        | TemError::Config(_)
        | TemError::Configuration(_)
        | TemError::Remote { .. } => ResponseStatus::Error,
    }
}

fn detail_for(err: &TemError) -> Option<ErrorDetail> {
    let detail = match err {
        TemError::UnknownDetectorKind { kind, available } => ErrorDetail::UnknownDetectorKind {
            detector: kind.clone(),
            available: available.clone(),
        },
        TemError::ProxyUnavailable {
            kind,
            address,
            reason,
        } => ErrorDetail::ProxyUnavailable {
            detector: kind.clone(),
            address: address.clone(),
            reason: reason.clone(),
        },
        TemError::AcquisitionFailed(message) => ErrorDetail::AcquisitionFailed {
            message: message.clone(),
        },
        TemError::UnknownAttribute(name) => ErrorDetail::UnknownAttribute { name: name.clone() },
        TemError::InvalidValue { name, reason } => ErrorDetail::InvalidValue {
            name: name.clone(),
            reason: reason.clone(),
        },
        _ => return None,
    };
    Some(detail)
}

/// Build the error response for `err`.
#[must_use]
pub fn error_response(request_id: u32, err: &TemError) -> DeviceResponse {
    let detail = detail_for(err)
        .and_then(|d| serde_json::to_vec(&d).ok())
        .unwrap_or_default();
    DeviceResponse::error(request_id, status_for(err), err.to_string(), detail)
}

/// Rebuild a `TemError` from a non-success response.
#[must_use]
pub fn error_from_response(response: &DeviceResponse) -> TemError {
    if let Ok(detail) = serde_json::from_slice::<ErrorDetail>(&response.payload) {
        return match detail {
            ErrorDetail::UnknownDetectorKind {
                detector,
                available,
            } => TemError::UnknownDetectorKind {
                kind: detector,
                available,
            },
            ErrorDetail::ProxyUnavailable {
                detector,
                address,
                reason,
            } => TemError::ProxyUnavailable {
                kind: detector,
                address,
                reason,
            },
            ErrorDetail::AcquisitionFailed { message } => TemError::AcquisitionFailed(message),
            ErrorDetail::UnknownAttribute { name } => TemError::UnknownAttribute(name),
            ErrorDetail::InvalidValue { name, reason } => TemError::InvalidValue { name, reason },
        };
    }

    match response.status {
        ResponseStatus::AcquisitionFailed => {
            TemError::AcquisitionFailed(response.error_message.clone())
        }
        ResponseStatus::UnknownAttribute => {
            TemError::UnknownAttribute(response.error_message.clone())
        }
        status => TemError::Remote {
            status: status.to_string(),
            message: response.error_message.clone(),
        },
    }
}
