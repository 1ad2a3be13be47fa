//! Settings holder device.
//!
//! A long-lived device that owns the configurable settings of one detector
//! and serves them to the orchestrator. It never acquires images itself.

use super::profile::DetectorProfile;
use super::settings::{AttributeSpec, DetectorSettings, SettingValue};
use crate::error::{TemError, TemResult};
use crate::network::protocol::{AttributeWrite, DeviceRequest, DeviceState, RequestType};
use crate::network::server::DeviceHandler;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::info;

/// Device owning one detector's settings.
pub struct SettingsHolder {
    kind: String,
    schema: Vec<AttributeSpec>,
    values: RwLock<DetectorSettings>,
}

impl SettingsHolder {
    /// Holder for `kind` with its profile's schema, initialised to defaults.
    #[must_use]
    pub fn new(kind: &str) -> Self {
        let profile = DetectorProfile::for_kind(kind);
        Self::with_schema(&profile.kind, profile.schema)
    }

    /// Holder with an explicit schema, initialised to its defaults.
    #[must_use]
    pub fn with_schema(kind: &str, schema: Vec<AttributeSpec>) -> Self {
        let values = DetectorSettings::from_defaults(&schema);
        info!(detector = %kind, "Settings holder initialised with defaults");
        Self {
            kind: kind.to_string(),
            schema,
            values: RwLock::new(values),
        }
    }

    /// Normalised detector kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Holders are always `ON`.
    #[must_use]
    pub fn state(&self) -> DeviceState {
        DeviceState::On
    }

    /// Attribute schema, in declaration order.
    #[must_use]
    pub fn schema(&self) -> &[AttributeSpec] {
        &self.schema
    }

    /// Current value of `name`.
    pub fn read(&self, name: &str) -> TemResult<SettingValue> {
        self.values
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TemError::UnknownAttribute(name.to_string()))
    }

    /// Validate and store a new value. A rejected write leaves the previous value.
    pub fn write(&self, name: &str, value: SettingValue) -> TemResult<()> {
        let spec = self
            .schema
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| TemError::UnknownAttribute(name.to_string()))?;
        let value = spec.validate(value)?;

        info!(detector = %self.kind, attribute = name, %value, "Setting updated");
        self.values.write().insert(name, value);
        Ok(())
    }

    /// Every setting, copied under one lock.
    #[must_use]
    pub fn snapshot(&self) -> DetectorSettings {
        self.values.read().clone()
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> TemResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| TemError::Protocol(e.to_string()))
}

#[async_trait]
impl DeviceHandler for SettingsHolder {
    fn device_name(&self) -> String {
        format!("detector/{}", self.kind)
    }

    async fn handle(&self, request: &DeviceRequest) -> TemResult<Bytes> {
        match request.request_type {
            RequestType::State => Ok(Bytes::from_static(self.state().as_str().as_bytes())),
            RequestType::ReadAttribute => to_json(&self.read(request.payload_str()?)?),
            RequestType::WriteAttribute => {
                let write: AttributeWrite = serde_json::from_slice(&request.payload)
                    .map_err(|e| TemError::Protocol(format!("bad attribute write: {e}")))?;
                self.write(&write.name, write.value)?;
                Ok(Bytes::new())
            }
            RequestType::ReadSnapshot => to_json(&self.snapshot()),
            RequestType::ListAttributes => to_json(&self.schema),
            other => Err(TemError::Protocol(format!(
                "{other:?} is not supported by a settings holder"
            ))),
        }
    }
}

impl std::fmt::Debug for SettingsHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsHolder")
            .field("kind", &self.kind)
            .field("values", &*self.values.read())
            .finish_non_exhaustive()
    }
}
