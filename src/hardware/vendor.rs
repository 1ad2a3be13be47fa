//! Vendor instrument client boundary and the real hardware backend.
//!
//! The microscope vendor ships its own client library. This module describes
//! the two capabilities the orchestrator needs from it: connecting
//! ([`VendorConnector`]) and acquiring a STEM image ([`VendorClient`]).
//! A deployment links a concrete client by passing a connector to
//! [`crate::hardware::HardwareBackend::select`]; without one the process runs
//! in simulation.

use super::image::{AcquiredImage, DType};
use crate::error::{TemError, TemResult};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use tracing::info;

/// Everything the vendor client needs for one STEM exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    /// Normalised detector kind.
    pub detector: String,
    /// Scan width in pixels.
    pub width: usize,
    /// Scan height in pixels.
    pub height: usize,
    /// Per-pixel dwell time in seconds.
    pub dwell_time: f64,
    /// Element type the detector produces natively.
    pub dtype: DType,
}

impl CaptureRequest {
    /// Expected row-major shape of the returned array.
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        vec![self.height, self.width]
    }

    /// Total beam time for the scan, in seconds.
    #[must_use]
    pub fn frame_time(&self) -> f64 {
        self.dwell_time * (self.width * self.height) as f64
    }
}

/// A connected vendor instrument client.
#[async_trait]
pub trait VendorClient: Send + Sync {
    /// Human-readable client identification for logs.
    fn describe(&self) -> String;

    /// Run one STEM acquisition. Blocks for the physical exposure.
    async fn acquire_stem_image(&self, request: &CaptureRequest) -> Result<AcquiredImage>;

    /// Whether the optics are currently in STEM mode.
    async fn stem_mode(&self) -> Result<bool>;
}

/// Factory that attempts to reach the vendor instrument server.
#[async_trait]
pub trait VendorConnector: Send + Sync {
    /// Connect to the instrument server at `host:port`.
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn VendorClient>>;
}

/// Backend that forwards captures to the vendor client.
pub struct RealBackend {
    client: Box<dyn VendorClient>,
}

impl RealBackend {
    /// Wrap a connected vendor client.
    pub fn new(client: Box<dyn VendorClient>) -> Self {
        Self { client }
    }

    /// Forward the capture and check the array matches the request.
    ///
    /// Any vendor error, or an array whose shape or element type disagrees
    /// with the request, is reported as `AcquisitionFailed`.
    pub async fn capture(&self, request: &CaptureRequest) -> TemResult<AcquiredImage> {
        info!(
            detector = %request.detector,
            width = request.width,
            height = request.height,
            frame_time_s = request.frame_time(),
            "Starting STEM exposure"
        );
        let image = self
            .client
            .acquire_stem_image(request)
            .await
            .map_err(|e| TemError::AcquisitionFailed(format!("{e:#}")))?;

        if image.shape() != request.shape().as_slice() {
            return Err(TemError::AcquisitionFailed(format!(
                "vendor returned shape {:?}, expected {:?}",
                image.shape(),
                request.shape()
            )));
        }
        if image.dtype() != request.dtype {
            return Err(TemError::AcquisitionFailed(format!(
                "vendor returned {} pixels, expected {}",
                image.dtype(),
                request.dtype
            )));
        }
        Ok(image)
    }

    /// Whether the optics report STEM mode.
    pub async fn stem_mode(&self) -> TemResult<bool> {
        self.client
            .stem_mode()
            .await
            .map_err(|e| TemError::AcquisitionFailed(format!("{e:#}")))
    }
}

impl fmt::Debug for RealBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealBackend")
            .field("client", &self.client.describe())
            .finish()
    }
}
