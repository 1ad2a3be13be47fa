//! Hardware backend: real vendor client or simulation.
//!
//! The backend is chosen exactly once, when the orchestrator starts, by
//! [`HardwareBackend::select`]. If the vendor client is missing or cannot be
//! initialised the process stays in simulation for its whole lifetime. The
//! chosen mode is observable through [`HardwareBackend::mode`].
//!
//! Both variants share one capture contract: given a detector profile and a
//! settings snapshot, return an array of shape `(image_height, image_width)`
//! in the detector's native element type.

pub mod image;
pub mod rng;
pub mod simulated;
pub mod vendor;

pub use image::{AcquiredImage, DType, PixelBuffer};
pub use simulated::{FallbackReason, SimulatedBackend};
pub use vendor::{CaptureRequest, RealBackend, VendorClient, VendorConnector};

use crate::detector::{DetectorProfile, DetectorSettings};
use crate::error::TemResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Operating mode of the hardware backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Vendor client connected.
    Real,
    /// Synthesised images.
    Simulated,
}

impl BackendMode {
    /// `real` or `simulated`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BackendMode::Real => "real",
            BackendMode::Simulated => "simulated",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where to find the vendor instrument server.
#[derive(Debug, Clone)]
pub struct VendorEndpoint {
    /// Instrument server host.
    pub host: String,
    /// Instrument server port.
    pub port: u16,
    /// Bound on the startup connection attempt.
    pub connect_timeout: Duration,
}

/// The process-wide hardware backend.
#[derive(Debug)]
pub enum HardwareBackend {
    /// Captures go to the vendor client.
    Real(RealBackend),
    /// Captures are synthesised.
    Simulated(SimulatedBackend),
}

impl HardwareBackend {
    /// Probe the vendor client and pick the backend for this process.
    ///
    /// `connector` is `None` when no vendor client is linked. Initialisation
    /// failures are logged and fall back to simulation; they are never
    /// returned as errors.
    pub async fn select(
        connector: Option<&dyn VendorConnector>,
        endpoint: &VendorEndpoint,
        seed: Option<u64>,
    ) -> Self {
        let Some(connector) = connector else {
            warn!("Vendor client not available, running in simulation mode");
            return Self::simulated(FallbackReason::ClientNotInstalled, seed);
        };

        let attempt = tokio::time::timeout(
            endpoint.connect_timeout,
            connector.connect(&endpoint.host, endpoint.port),
        )
        .await;

        match attempt {
            Ok(Ok(client)) => {
                info!(
                    host = %endpoint.host,
                    port = endpoint.port,
                    client = %client.describe(),
                    "Connected to vendor instrument server"
                );
                HardwareBackend::Real(RealBackend::new(client))
            }
            Ok(Err(e)) => {
                error!(host = %endpoint.host, port = endpoint.port, error = %format!("{e:#}"), "Vendor client connection failed");
                warn!("Falling back to simulation mode for the lifetime of this process");
                Self::simulated(FallbackReason::InitializationFailed(format!("{e:#}")), seed)
            }
            Err(_) => {
                let reason = format!(
                    "no answer from {}:{} within {:?}",
                    endpoint.host, endpoint.port, endpoint.connect_timeout
                );
                error!(%reason, "Vendor client connection timed out");
                warn!("Falling back to simulation mode for the lifetime of this process");
                Self::simulated(FallbackReason::InitializationFailed(reason), seed)
            }
        }
    }

    /// A simulated backend, for tests and offline development.
    #[must_use]
    pub fn simulated(reason: FallbackReason, seed: Option<u64>) -> Self {
        HardwareBackend::Simulated(SimulatedBackend::new(reason, seed))
    }

    /// Mode chosen at startup.
    #[must_use]
    pub fn mode(&self) -> BackendMode {
        match self {
            HardwareBackend::Real(_) => BackendMode::Real,
            HardwareBackend::Simulated(_) => BackendMode::Simulated,
        }
    }

    /// Startup fault, if a vendor client was present but failed to initialise.
    #[must_use]
    pub fn startup_fault(&self) -> Option<&str> {
        match self {
            HardwareBackend::Simulated(sim) => match sim.reason() {
                FallbackReason::InitializationFailed(msg) => Some(msg),
                FallbackReason::ClientNotInstalled => None,
            },
            HardwareBackend::Real(_) => None,
        }
    }

    /// Translate a settings snapshot into a capture and run it.
    pub async fn capture(
        &self,
        profile: &DetectorProfile,
        settings: &DetectorSettings,
    ) -> TemResult<AcquiredImage> {
        let (height, width) = settings.image_shape()?;
        let request = CaptureRequest {
            detector: profile.kind.clone(),
            width,
            height,
            dwell_time: settings.dwell_time()?,
            dtype: profile.native_dtype,
        };

        match self {
            HardwareBackend::Real(real) => real.capture(&request).await,
            HardwareBackend::Simulated(sim) => sim.capture(&request),
        }
    }

    /// Whether the microscope optics are in STEM mode. Always false in simulation.
    pub async fn stem_mode(&self) -> TemResult<bool> {
        match self {
            HardwareBackend::Real(real) => real.stem_mode().await,
            HardwareBackend::Simulated(_) => Ok(false),
        }
    }
}
