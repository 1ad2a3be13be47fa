//! Transfer encoding: turns one captured image into the atomic
//! (metadata, payload) unit returned to callers.
//!
//! The payload is the pixel buffer's raw row-major bytes in little-endian
//! order. The metadata names the detector, the shape, a portable dtype tag
//! and the settings the capture was taken with, which is everything a client
//! in any language needs to rebuild the array.

use crate::detector::DetectorSettings;
use crate::error::{TemError, TemResult};
use crate::hardware::{AcquiredImage, BackendMode, DType, PixelBuffer};
use crate::network::protocol::EncodedValue;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Byte order of every payload this crate produces.
pub const BYTE_ORDER: &str = "little";

/// Per-acquisition identity, fixed by the orchestrator before encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionStamp {
    /// Unique id of this acquisition.
    pub acquisition_id: Uuid,
    /// When the acquisition completed.
    pub timestamp: DateTime<Utc>,
    /// Backend that produced the image.
    pub backend: BackendMode,
}

impl AcquisitionStamp {
    /// Fresh id and the current time.
    #[must_use]
    pub fn now(backend: BackendMode) -> Self {
        Self {
            acquisition_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            backend,
        }
    }
}

/// Flat metadata record sent alongside every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionMetadata {
    /// Normalised detector kind.
    pub detector: String,
    /// Row-major array shape, `[height, width]` for STEM images.
    pub shape: Vec<usize>,
    /// Portable element type tag.
    pub dtype: DType,
    /// Always `"little"`.
    pub byte_order: String,
    /// Per-pixel dwell time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_time: Option<f64>,
    /// Configured width in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<usize>,
    /// Configured height in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<usize>,
    /// Completion time, RFC 3339 UTC.
    pub timestamp: DateTime<Utc>,
    /// UUID v4 of the acquisition.
    pub acquisition_id: Uuid,
    /// `real` or `simulated`.
    pub backend: BackendMode,
}

impl AcquisitionMetadata {
    /// Number of elements described by `shape`, or `None` on overflow.
    #[must_use]
    pub fn element_count(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1_usize, |acc, &dim| acc.checked_mul(dim))
    }

    /// Payload length in bytes implied by `shape` and `dtype`, or `None` on overflow.
    #[must_use]
    pub fn expected_payload_len(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.dtype.size_of())
    }
}

/// Metadata and payload of one acquisition. Constructed only by
/// [`TransferEncoder::encode`] or by decoding a received unit.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferUnit {
    metadata: AcquisitionMetadata,
    payload: Bytes,
}

impl TransferUnit {
    /// Metadata record.
    #[must_use]
    pub fn metadata(&self) -> &AcquisitionMetadata {
        &self.metadata
    }

    /// Raw little-endian pixel bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Metadata serialised as a flat JSON object.
    pub fn metadata_json(&self) -> TemResult<String> {
        serde_json::to_string(&self.metadata)
            .map_err(|e| TemError::Protocol(format!("failed to serialise metadata: {e}")))
    }

    /// Wire form: metadata JSON as the format part, pixel bytes as data.
    pub fn to_encoded_value(&self) -> TemResult<EncodedValue> {
        Ok(EncodedValue {
            format: self.metadata_json()?,
            data: self.payload.clone(),
        })
    }

    /// Parse a received value and check the payload agrees with the metadata.
    pub fn from_encoded_value(value: &EncodedValue) -> TemResult<Self> {
        let metadata: AcquisitionMetadata = serde_json::from_str(&value.format)
            .map_err(|e| TemError::Protocol(format!("bad acquisition metadata: {e}")))?;

        if metadata.byte_order != BYTE_ORDER {
            return Err(TemError::Protocol(format!(
                "unsupported byte order '{}'",
                metadata.byte_order
            )));
        }
        if metadata.shape.is_empty() || metadata.shape.contains(&0) {
            return Err(TemError::Protocol(format!(
                "invalid shape {:?}",
                metadata.shape
            )));
        }
        let expected = metadata.expected_payload_len().ok_or_else(|| {
            TemError::Protocol(format!(
                "shape {:?} of {} overflows the addressable size",
                metadata.shape, metadata.dtype
            ))
        })?;
        if value.data.len() != expected {
            return Err(TemError::Protocol(format!(
                "payload is {} bytes but shape {:?} of {} needs {expected}",
                value.data.len(),
                metadata.shape,
                metadata.dtype,
            )));
        }

        Ok(Self {
            metadata,
            payload: value.data.clone(),
        })
    }

    /// Rebuild the pixel array from (dtype, shape, bytes).
    pub fn reconstruct(&self) -> TemResult<AcquiredImage> {
        let pixels = PixelBuffer::from_le_bytes(self.metadata.dtype, &self.payload)
            .map_err(TemError::Protocol)?;
        AcquiredImage::new(pixels, self.metadata.shape.clone()).map_err(TemError::Protocol)
    }

    /// Split into metadata and payload.
    #[must_use]
    pub fn into_parts(self) -> (AcquisitionMetadata, Bytes) {
        (self.metadata, self.payload)
    }
}

/// Stateless encoder. Pure: no I/O, and no failure for a well-formed image.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferEncoder;

impl TransferEncoder {
    /// Build the transfer unit for one captured image.
    #[must_use]
    pub fn encode(
        image: AcquiredImage,
        settings: &DetectorSettings,
        kind: &str,
        stamp: AcquisitionStamp,
    ) -> TransferUnit {
        let (pixels, shape) = image.into_parts();
        let metadata = AcquisitionMetadata {
            detector: kind.to_string(),
            shape,
            dtype: pixels.dtype(),
            byte_order: BYTE_ORDER.to_string(),
            dwell_time: settings.dwell_time().ok(),
            image_width: settings.image_width().ok(),
            image_height: settings.image_height().ok(),
            timestamp: stamp.timestamp,
            acquisition_id: stamp.acquisition_id,
            backend: stamp.backend,
        };

        TransferUnit {
            metadata,
            payload: Bytes::from(pixels.to_le_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::settings::{DWELL_TIME, IMAGE_HEIGHT, IMAGE_WIDTH};

    fn settings(width: i64, height: i64) -> DetectorSettings {
        DetectorSettings::new()
            .with(DWELL_TIME, 1e-6)
            .with(IMAGE_WIDTH, width)
            .with(IMAGE_HEIGHT, height)
    }

    fn image(width: usize, height: usize) -> AcquiredImage {
        let pixels = (0..width * height).map(|i| i as u16).collect();
        AcquiredImage::new(PixelBuffer::Uint16(pixels), vec![height, width]).unwrap()
    }

    #[test]
    fn haadf_megapixel_payload_size() {
        let unit = TransferEncoder::encode(
            image(1024, 1024),
            &settings(1024, 1024),
            "haadf",
            AcquisitionStamp::now(BackendMode::Simulated),
        );
        assert_eq!(unit.payload().len(), 1024 * 1024 * 2);

        let json: serde_json::Value = serde_json::from_str(&unit.metadata_json().unwrap()).unwrap();
        assert_eq!(json["detector"], "haadf");
        assert_eq!(json["shape"], serde_json::json!([1024, 1024]));
        assert_eq!(json["dtype"], "uint16");
        assert_eq!(json["byte_order"], "little");
        assert_eq!(json["backend"], "simulated");
        assert_eq!(json["dwell_time"], 1e-6);
    }

    #[test]
    fn encoding_is_deterministic_for_a_fixed_stamp() {
        let stamp = AcquisitionStamp::now(BackendMode::Simulated);
        let a = TransferEncoder::encode(image(8, 4), &settings(8, 4), "haadf", stamp);
        let b = TransferEncoder::encode(image(8, 4), &settings(8, 4), "haadf", stamp);
        assert_eq!(a, b);
    }

    #[test]
    fn shape_comes_from_the_array_not_the_settings() {
        // Settings missing entirely: encoding still succeeds.
        let unit = TransferEncoder::encode(
            image(3, 2),
            &DetectorSettings::new(),
            "bf",
            AcquisitionStamp::now(BackendMode::Real),
        );
        assert_eq!(unit.metadata().shape, vec![2, 3]);
        assert!(unit.metadata().dwell_time.is_none());
        assert!(!unit.metadata_json().unwrap().contains("image_width"));
    }

    #[test]
    fn received_unit_reconstructs_the_array() {
        let original = image(16, 8);
        let unit = TransferEncoder::encode(
            original.clone(),
            &settings(16, 8),
            "haadf",
            AcquisitionStamp::now(BackendMode::Simulated),
        );
        let wire = unit.to_encoded_value().unwrap();

        let received = TransferUnit::from_encoded_value(&wire).unwrap();
        assert_eq!(received.metadata().element_count(), Some(128));
        assert_eq!(received.reconstruct().unwrap(), original);
    }

    #[test]
    fn overflowing_shape_is_a_protocol_error() {
        let unit = TransferEncoder::encode(
            image(2, 2),
            &settings(2, 2),
            "haadf",
            AcquisitionStamp::now(BackendMode::Simulated),
        );
        let mut metadata: serde_json::Value =
            serde_json::from_str(&unit.metadata_json().unwrap()).unwrap();
        metadata["shape"] = serde_json::json!([4_294_967_296_u64, 4_294_967_296_u64, 4]);
        let wire = EncodedValue {
            format: metadata.to_string(),
            data: unit.payload().clone(),
        };

        let err = TransferUnit::from_encoded_value(&wire).unwrap_err();
        assert!(matches!(err, TemError::Protocol(ref m) if m.contains("overflows")));
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let unit = TransferEncoder::encode(
            image(4, 4),
            &settings(4, 4),
            "haadf",
            AcquisitionStamp::now(BackendMode::Simulated),
        );
        let mut wire = unit.to_encoded_value().unwrap();
        wire.data = wire.data.slice(..wire.data.len() - 2);
        assert!(TransferUnit::from_encoded_value(&wire).is_err());
    }
}
