//! Simulated hardware backend.
//!
//! Produces arrays with exactly the shape and element type the vendor client
//! would return for the same request, filled with uniform noise over the
//! element type's range. Used whenever the vendor client is missing or fails
//! to initialise.

use super::image::{AcquiredImage, DType, PixelBuffer};
use super::rng::SimRng;
use super::vendor::CaptureRequest;
use crate::error::{TemError, TemResult};
use tracing::debug;

/// Why the process is running in simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// No vendor client was linked into this build.
    ClientNotInstalled,
    /// A vendor client was present but could not be initialised.
    InitializationFailed(String),
}

/// Backend that fabricates structurally valid images.
#[derive(Debug)]
pub struct SimulatedBackend {
    rng: SimRng,
    reason: FallbackReason,
}

impl SimulatedBackend {
    /// Simulated backend; a fixed `seed` makes frames reproducible.
    pub fn new(reason: FallbackReason, seed: Option<u64>) -> Self {
        Self {
            rng: SimRng::new(seed),
            reason,
        }
    }

    /// Why simulation was selected.
    #[must_use]
    pub fn reason(&self) -> &FallbackReason {
        &self.reason
    }

    /// Synthesize an image for `request`. Returns immediately.
    pub fn capture(&self, request: &CaptureRequest) -> TemResult<AcquiredImage> {
        let len = request.width * request.height;
        debug!(
            detector = %request.detector,
            width = request.width,
            height = request.height,
            dtype = %request.dtype,
            "Simulating STEM acquisition"
        );

        let pixels = match request.dtype {
            DType::Uint8 => PixelBuffer::Uint8(self.rng.fill(len)),
            DType::Uint16 => PixelBuffer::Uint16(self.rng.fill(len)),
            DType::Int32 => PixelBuffer::Int32(self.rng.fill(len)),
            DType::Float32 => PixelBuffer::Float32(self.rng.fill(len)),
        };

        AcquiredImage::new(pixels, request.shape()).map_err(TemError::AcquisitionFailed)
    }
}
