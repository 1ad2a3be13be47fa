//! Per-detector capture profiles.
//!
//! A profile says how a detector kind's settings translate into a capture:
//! the attribute schema its holder exposes and the element type the
//! instrument returns natively. New detector kinds with a non-default
//! derivation get a branch in [`DetectorProfile::for_kind`].

use super::settings::{scanning_detector_schema, AttributeSpec};
use crate::hardware::image::DType;

/// Capture profile for one detector kind.
#[derive(Debug, Clone)]
pub struct DetectorProfile {
    /// Normalised detector kind.
    pub kind: String,
    /// Element type of the arrays the instrument returns for this detector.
    pub native_dtype: DType,
    /// Attributes exposed by this detector's settings holder.
    pub schema: Vec<AttributeSpec>,
}

impl DetectorProfile {
    /// Look up the profile for a (normalised) detector kind.
    ///
    /// Every scanning detector currently shares the HAADF derivation:
    /// 16-bit counts, shape taken from `image_height` x `image_width`.
    #[must_use]
    pub fn for_kind(kind: &str) -> Self {
        Self::scanning(kind)
    }

    fn scanning(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            native_dtype: DType::Uint16,
            schema: scanning_detector_schema(),
        }
    }
}

/// Normalise a caller-supplied detector name (trim, lower-case).
#[must_use]
pub fn normalize_kind(kind: &str) -> String {
    kind.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haadf_is_sixteen_bit() {
        let profile = DetectorProfile::for_kind("haadf");
        assert_eq!(profile.native_dtype, DType::Uint16);
        assert_eq!(profile.schema.len(), 3);
    }

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize_kind("  HAADF "), "haadf");
    }
}
