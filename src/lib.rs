//! # TEM DAQ Core Library
//!
//! Remote device control and image acquisition for a transmission electron
//! microscope. Detector configuration lives in independent settings-holder
//! devices; the microscope device owns the instrument (or its simulation)
//! and turns a detector name into one image plus its metadata.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-backed configuration (TOML file + `TEM_DAQ_` env).
//! - **`detector`**: detector settings, the settings-holder device and
//!   per-kind capture profiles.
//! - **`encoder`**: the atomic (metadata, payload) transfer unit.
//! - **`error`**: the `TemError` taxonomy shared by every device.
//! - **`hardware`**: the `Real | Simulated` backend chosen once at startup.
//! - **`network`**: framed TCP protocol, device server and client proxy.
//! - **`orchestrator`**: resolve -> snapshot -> capture -> encode, and the
//!   microscope device serving it.
//! - **`registry`**: detector kind -> ready settings-holder proxy.
//! - **`tracing_config`**: tracing subscriber setup.

pub mod config;
pub mod detector;
pub mod encoder;
pub mod error;
pub mod hardware;
pub mod network;
pub mod orchestrator;
pub mod registry;
pub mod tracing_config;

pub use config::TemConfig;
pub use encoder::{AcquisitionMetadata, TransferEncoder, TransferUnit};
pub use error::{TemError, TemResult};
pub use hardware::{BackendMode, HardwareBackend};
pub use orchestrator::{AcquisitionOrchestrator, Microscope};
pub use registry::ProxyRegistry;
