//! Detector settings, their holder device and per-kind capture profiles.

pub mod holder;
pub mod profile;
pub mod settings;

pub use holder::SettingsHolder;
pub use profile::{normalize_kind, DetectorProfile};
pub use settings::{AttributeKind, AttributeSpec, DetectorSettings, SettingValue};
