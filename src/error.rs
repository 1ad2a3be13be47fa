//! Error types for the microscope control stack.
//!
//! `TemError` is the single error type shared by every device in this crate.
//! Built on `thiserror`, it keeps the three acquisition failure kinds distinct
//! so that a remote caller can tell them apart after they cross a process
//! boundary:
//!
//! - **`UnknownDetectorKind`**: the caller asked for a detector that is not in
//!   the configured address table. Raised before any remote call is made.
//! - **`ProxyUnavailable`**: a settings holder could not be reached within the
//!   bounded connection wait.
//! - **`AcquisitionFailed`**: the vendor client reported an error during
//!   capture. Never converted into simulated output.
//!
//! The remaining variants cover attribute access on settings holders, the
//! wire protocol, I/O and configuration. `kind()` returns a stable label used
//! in structured logs and mirrored by the wire status codes in
//! [`crate::network::error_mapping`].

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type TemResult<T> = std::result::Result<T, TemError>;

/// Errors shared by every device in the crate.
#[derive(Error, Debug)]
pub enum TemError {
    /// Detector kind is not in the address table.
    #[error("Unknown detector '{kind}'. Available: [{}]", available.join(", "))]
    UnknownDetectorKind { kind: String, available: Vec<String> },

    /// Settings holder did not become ready in time.
    #[error("Settings holder for '{kind}' at {address} is unavailable: {reason}")]
    ProxyUnavailable {
        kind: String,
        address: String,
        reason: String,
    },

    /// Vendor client failed during capture.
    #[error("Acquisition failed: {0}")]
    AcquisitionFailed(String),

    /// No attribute with this name.
    #[error("Unknown attribute '{0}'")]
    UnknownAttribute(String),

    /// Value has the wrong type or is out of range.
    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    /// Malformed or unexpected wire data.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Remote failure with no more specific kind.
    #[error("Remote error ({status}): {message}")]
    Remote { status: String, message: String },
}

impl TemError {
    /// Stable label for this error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            TemError::UnknownDetectorKind { .. } => "unknown_detector_kind",
            TemError::ProxyUnavailable { .. } => "proxy_unavailable",
            TemError::AcquisitionFailed(_) => "acquisition_failed",
            TemError::UnknownAttribute(_) => "unknown_attribute",
            TemError::InvalidValue { .. } => "invalid_value",
            TemError::Protocol(_) => "protocol",
            TemError::Io(_) => "io",
            TemError::Config(_) | TemError::Configuration(_) => "configuration",
            TemError::Remote { .. } => "remote",
        }
    }

    /// Whether retrying the whole call later can reasonably succeed.
    ///
    /// Only an unreachable dependency is transient. Bad input will fail the
    /// same way again, and a failed exposure is left to the caller.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, TemError::ProxyUnavailable { .. } | TemError::Io(_))
    }
}

impl From<figment::Error> for TemError {
    fn from(value: figment::Error) -> Self {
        TemError::Config(Box::new(value))
    }
}
