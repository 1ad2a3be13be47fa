//! Detector settings: typed values, attribute schema and point-in-time snapshots.
//!
//! A settings holder owns one [`DetectorSettings`] map. The acquisition side
//! only ever sees a snapshot copied out under a single lock, so dimensions
//! that must agree (width and height) always come from the same instant.

use crate::error::{TemError, TemResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the per-pixel dwell time attribute, in seconds.
pub const DWELL_TIME: &str = "dwell_time";
/// Name of the image width attribute, in pixels.
pub const IMAGE_WIDTH: &str = "image_width";
/// Name of the image height attribute, in pixels.
pub const IMAGE_HEIGHT: &str = "image_height";

/// Hardware-imposed upper bound on either image dimension.
pub const MAX_IMAGE_DIMENSION: i64 = 4096;

/// A single scalar setting value.
///
/// Serialized untagged so that the JSON form is the bare scalar
/// (`1e-6`, `1024`, `true`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Free text. Never valid for a typed attribute.
    Text(String),
}

impl SettingValue {
    /// Numeric view of the value, if it has one.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Int(v) => Some(*v as f64),
            SettingValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view of the value. Floats are accepted only if integral.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(v) => Some(*v),
            SettingValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            SettingValue::Bool(_) => "bool",
            SettingValue::Int(_) => "int",
            SettingValue::Float(_) => "float",
            SettingValue::Text(_) => "text",
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(v) => write!(f, "{v}"),
            SettingValue::Int(v) => write!(f, "{v}"),
            SettingValue::Float(v) => write!(f, "{v:e}"),
            SettingValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Float(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Int(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    /// Boolean.
    Bool,
    /// Signed integer.
    Int,
    /// Floating point.
    Float,
}

/// Declaration of one read/write attribute on a settings holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSpec {
    /// Attribute name used on the wire.
    pub name: String,
    /// Human-readable label.
    pub label: String,
    /// Declared value type.
    pub kind: AttributeKind,
    /// Physical unit, empty if dimensionless.
    pub unit: String,
    /// Inclusive lower bound for numeric attributes.
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric attributes.
    pub max: Option<f64>,
    /// Value a fresh holder starts with.
    pub default: SettingValue,
    /// One-line description.
    pub doc: String,
}

impl AttributeSpec {
    /// Check `value` against this attribute's type and range.
    ///
    /// Returns the value coerced to the declared kind (an integral float
    /// written to an int attribute becomes `Int`, an int written to a float
    /// attribute becomes `Float`).
    pub fn validate(&self, value: SettingValue) -> TemResult<SettingValue> {
        let coerced = match self.kind {
            AttributeKind::Bool => matches!(value, SettingValue::Bool(_)).then(|| value.clone()),
            AttributeKind::Float => value.as_f64().map(SettingValue::Float),
            AttributeKind::Int => value.as_i64().map(SettingValue::Int),
        }
        .ok_or_else(|| TemError::InvalidValue {
            name: self.name.clone(),
            reason: format!("expected {:?}, got {}", self.kind, value.type_name()),
        })?;

        if let Some(v) = coerced.as_f64() {
            if !v.is_finite() {
                return Err(self.out_of_range(&coerced));
            }
            if self.min.is_some_and(|min| v < min) || self.max.is_some_and(|max| v > max) {
                return Err(self.out_of_range(&coerced));
            }
        }

        Ok(coerced)
    }

    fn out_of_range(&self, value: &SettingValue) -> TemError {
        let bound = |b: Option<f64>| b.map_or_else(|| "-".to_string(), |v| format!("{v:e}"));
        TemError::InvalidValue {
            name: self.name.clone(),
            reason: format!(
                "{value} outside [{}, {}] {}",
                bound(self.min),
                bound(self.max),
                self.unit
            ),
        }
    }
}

/// Attribute schema shared by the scanning detectors (HAADF and friends).
#[must_use]
pub fn scanning_detector_schema() -> Vec<AttributeSpec> {
    vec![
        AttributeSpec {
            name: DWELL_TIME.into(),
            label: "Dwell Time".into(),
            kind: AttributeKind::Float,
            unit: "s".into(),
            min: Some(1e-9),
            max: Some(1e-3),
            default: SettingValue::Float(1e-6),
            doc: "Per-pixel dwell time in seconds (e.g. 1e-6 = 1 us)".into(),
        },
        AttributeSpec {
            name: IMAGE_WIDTH.into(),
            label: "Image Width".into(),
            kind: AttributeKind::Int,
            unit: "px".into(),
            min: Some(1.0),
            max: Some(MAX_IMAGE_DIMENSION as f64),
            default: SettingValue::Int(1024),
            doc: "Acquisition width in pixels".into(),
        },
        AttributeSpec {
            name: IMAGE_HEIGHT.into(),
            label: "Image Height".into(),
            kind: AttributeKind::Int,
            unit: "px".into(),
            min: Some(1.0),
            max: Some(MAX_IMAGE_DIMENSION as f64),
            default: SettingValue::Int(1024),
            doc: "Acquisition height in pixels".into(),
        },
    ]
}

/// A point-in-time copy of one detector's settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectorSettings {
    values: BTreeMap<String, SettingValue>,
}

impl DetectorSettings {
    /// Empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings populated with every attribute's default.
    #[must_use]
    pub fn from_defaults(schema: &[AttributeSpec]) -> Self {
        let values = schema
            .iter()
            .map(|spec| (spec.name.clone(), spec.default.clone()))
            .collect();
        Self { values }
    }

    /// Builder-style insert, mostly for tests and fixtures.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<SettingValue>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    /// Set `name` to `value`.
    pub fn insert(&mut self, name: impl Into<String>, value: SettingValue) {
        self.values.insert(name.into(), value);
    }

    /// Value of `name`, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SettingValue> {
        self.values.get(name)
    }

    /// Settings in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &SettingValue)> {
        self.values.iter()
    }

    /// Number of settings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot holds no settings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Per-pixel dwell time in seconds. Must be positive.
    pub fn dwell_time(&self) -> TemResult<f64> {
        let value = self
            .require(DWELL_TIME)?
            .as_f64()
            .ok_or_else(|| invalid(DWELL_TIME, "not a number"))?;
        if value > 0.0 && value.is_finite() {
            Ok(value)
        } else {
            Err(invalid(DWELL_TIME, "must be > 0 seconds"))
        }
    }

    /// Image width in pixels.
    pub fn image_width(&self) -> TemResult<usize> {
        self.dimension(IMAGE_WIDTH)
    }

    /// Image height in pixels.
    pub fn image_height(&self) -> TemResult<usize> {
        self.dimension(IMAGE_HEIGHT)
    }

    /// Row-major image shape `(rows, cols)` described by these settings.
    pub fn image_shape(&self) -> TemResult<(usize, usize)> {
        Ok((self.image_height()?, self.image_width()?))
    }

    fn dimension(&self, name: &str) -> TemResult<usize> {
        let value = self
            .require(name)?
            .as_i64()
            .ok_or_else(|| invalid(name, "not an integer"))?;
        if (1..=MAX_IMAGE_DIMENSION).contains(&value) {
            Ok(value as usize)
        } else {
            Err(invalid(
                name,
                &format!("{value} outside [1, {MAX_IMAGE_DIMENSION}] px"),
            ))
        }
    }

    fn require(&self, name: &str) -> TemResult<&SettingValue> {
        self.values
            .get(name)
            .ok_or_else(|| invalid(name, "missing from settings snapshot"))
    }
}

fn invalid(name: &str, reason: &str) -> TemError {
    TemError::InvalidValue {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> AttributeSpec {
        scanning_detector_schema()
            .into_iter()
            .find(|s| s.name == name)
            .unwrap()
    }

    #[test]
    fn defaults_match_haadf_device() {
        let settings = DetectorSettings::from_defaults(&scanning_detector_schema());
        assert_eq!(settings.dwell_time().unwrap(), 1e-6);
        assert_eq!(settings.image_shape().unwrap(), (1024, 1024));
    }

    #[test]
    fn validate_coerces_numeric_kinds() {
        let dwell = spec(DWELL_TIME);
        assert_eq!(
            dwell.validate(SettingValue::Float(5e-6)).unwrap(),
            SettingValue::Float(5e-6)
        );

        let width = spec(IMAGE_WIDTH);
        assert_eq!(
            width.validate(SettingValue::Float(512.0)).unwrap(),
            SettingValue::Int(512)
        );
        assert!(width.validate(SettingValue::Float(512.5)).is_err());
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let dwell = spec(DWELL_TIME);
        assert!(dwell.validate(SettingValue::Float(0.0)).is_err());
        assert!(dwell.validate(SettingValue::Float(1.0)).is_err());
        assert!(dwell.validate(SettingValue::Float(f64::NAN)).is_err());

        let width = spec(IMAGE_WIDTH);
        let err = width.validate(SettingValue::Int(8192)).unwrap_err();
        assert!(matches!(err, TemError::InvalidValue { ref name, .. } if name == IMAGE_WIDTH));
    }

    #[test]
    fn validate_rejects_wrong_type() {
        let width = spec(IMAGE_WIDTH);
        assert!(width.validate(SettingValue::Bool(true)).is_err());
        assert!(width.validate(SettingValue::Text("1024".into())).is_err());
    }

    #[test]
    fn snapshot_serializes_as_flat_object() {
        let settings = DetectorSettings::new()
            .with(DWELL_TIME, 1e-6)
            .with(IMAGE_WIDTH, 256_i64)
            .with(IMAGE_HEIGHT, 128_i64);
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["image_width"], 256);
        assert_eq!(json["image_height"], 128);

        let back: DetectorSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back.image_shape().unwrap(), (128, 256));
        assert_eq!(back.get(DWELL_TIME), Some(&SettingValue::Float(1e-6)));
    }

    #[test]
    fn missing_dimension_is_reported_by_name() {
        let settings = DetectorSettings::new().with(IMAGE_WIDTH, 64_i64);
        let err = settings.image_shape().unwrap_err();
        assert!(err.to_string().contains(IMAGE_HEIGHT));
    }
}
