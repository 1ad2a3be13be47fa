//! Acquisition orchestrator and the microscope device that serves it.
//!
//! One acquisition walks
//! `Idle -> SettingsResolved -> SettingsSnapshotted -> Captured -> Encoded -> Idle`:
//! the detector kind is validated, its settings holder resolved, a settings
//! snapshot read, the capture run on the process-wide hardware backend and
//! the result encoded. The orchestrator is the only owner of the backend, so
//! every image that leaves the process goes through [`AcquisitionOrchestrator::acquire`].
//!
//! Errors from collaborators pass through with their kind intact. Nothing
//! is retried here; a failed call leaves the orchestrator idle.

use crate::detector::settings::AttributeKind;
use crate::detector::{normalize_kind, AttributeSpec, DetectorProfile, DetectorSettings, SettingValue};
use crate::encoder::{AcquisitionStamp, TransferEncoder, TransferUnit};
use crate::error::{TemError, TemResult};
use crate::hardware::{BackendMode, HardwareBackend};
use crate::network::protocol::{AttributeWrite, DeviceRequest, DeviceState, RequestType};
use crate::network::server::DeviceHandler;
use crate::registry::ProxyRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Read-only microscope attribute reporting STEM optics mode.
pub const STEM_MODE: &str = "stem_mode";

/// Sole owner of the hardware backend; runs acquisitions.
pub struct AcquisitionOrchestrator {
    registry: ProxyRegistry,
    backend: HardwareBackend,
    /// One lock per detector kind: acquisitions of the same kind run one at a time.
    in_flight: BTreeMap<String, Mutex<()>>,
}

impl AcquisitionOrchestrator {
    /// Take ownership of the registry and the already-selected backend.
    #[must_use]
    pub fn new(registry: ProxyRegistry, backend: HardwareBackend) -> Self {
        let in_flight = registry
            .kinds()
            .into_iter()
            .map(|kind| (kind, Mutex::new(())))
            .collect();

        info!(
            mode = %backend.mode(),
            detectors = ?registry.kinds(),
            "Acquisition orchestrator ready"
        );

        Self {
            registry,
            backend,
            in_flight,
        }
    }

    /// Backend mode chosen at startup. Constant for the life of the process.
    #[must_use]
    pub fn mode(&self) -> BackendMode {
        self.backend.mode()
    }

    /// `Fault` if a vendor client was present but failed to initialise.
    #[must_use]
    pub fn state(&self) -> DeviceState {
        if self.backend.startup_fault().is_some() {
            DeviceState::Fault
        } else {
            DeviceState::On
        }
    }

    /// Configured detector kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        self.registry.kinds()
    }

    /// Settings holder registry.
    #[must_use]
    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    /// Whether the optics are in STEM mode.
    pub async fn stem_mode(&self) -> TemResult<bool> {
        self.backend.stem_mode().await
    }

    /// Acquire one image from `kind` and return it with its metadata.
    #[instrument(name = "acquire", skip(self), fields(detector))]
    pub async fn acquire(&self, kind: &str) -> TemResult<TransferUnit> {
        let started = Instant::now();
        let kind = normalize_kind(kind);
        tracing::Span::current().record("detector", kind.as_str());

        // Unknown kinds fail before any remote call.
        self.registry.check_kind(&kind)?;
        let Some(lock) = self.in_flight.get(&kind) else {
            return Err(TemError::UnknownDetectorKind {
                kind,
                available: self.kinds(),
            });
        };

        let proxy = self.registry.resolve(&kind).await?;
        debug!(state = "SettingsResolved", address = %proxy.address());

        let _guard = lock.lock().await;

        let settings = proxy.read_snapshot().await.map_err(|e| match e {
            TemError::Io(_) => TemError::ProxyUnavailable {
                kind: kind.clone(),
                address: proxy.address().to_string(),
                reason: format!("settings snapshot failed: {e}"),
            },
            other => other,
        })?;
        debug!(state = "SettingsSnapshotted", settings = ?settings);

        let profile = DetectorProfile::for_kind(&kind);
        let image = match self.backend.capture(&profile, &settings).await {
            Ok(image) => image,
            Err(e) => {
                warn!(error = %e, "Capture failed");
                return Err(e);
            }
        };
        debug!(state = "Captured", shape = ?image.shape(), dtype = %image.dtype());

        let unit = TransferEncoder::encode(image, &settings, &kind, AcquisitionStamp::now(self.mode()));
        debug!(state = "Encoded", bytes = unit.payload().len());

        info!(
            acquisition_id = %unit.metadata().acquisition_id,
            shape = ?unit.metadata().shape,
            mode = %self.mode(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Acquisition complete"
        );
        Ok(unit)
    }
}

impl std::fmt::Debug for AcquisitionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionOrchestrator")
            .field("registry", &self.registry)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

/// The microscope device: exposes acquisition, mode introspection and
/// `stem_mode` to remote callers.
#[derive(Debug, Clone)]
pub struct Microscope {
    orchestrator: Arc<AcquisitionOrchestrator>,
}

impl Microscope {
    /// Device serving `orchestrator`.
    #[must_use]
    pub fn new(orchestrator: Arc<AcquisitionOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// The orchestrator behind this device.
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<AcquisitionOrchestrator> {
        &self.orchestrator
    }

    fn attributes() -> Vec<AttributeSpec> {
        vec![AttributeSpec {
            name: STEM_MODE.into(),
            label: "STEM Mode".into(),
            kind: AttributeKind::Bool,
            unit: String::new(),
            min: None,
            max: None,
            default: SettingValue::Bool(false),
            doc: "True when the microscope is in STEM mode (read-only)".into(),
        }]
    }

    /// Every microscope attribute is read-only.
    fn write(name: &str) -> TemResult<Bytes> {
        match name {
            STEM_MODE => Err(TemError::InvalidValue {
                name: STEM_MODE.to_string(),
                reason: "attribute is read-only".to_string(),
            }),
            other => Err(TemError::UnknownAttribute(other.to_string())),
        }
    }

    async fn read(&self, name: &str) -> TemResult<SettingValue> {
        match name {
            STEM_MODE => Ok(SettingValue::Bool(self.orchestrator.stem_mode().await?)),
            other => Err(TemError::UnknownAttribute(other.to_string())),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> TemResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| TemError::Protocol(e.to_string()))
}

#[async_trait]
impl DeviceHandler for Microscope {
    fn device_name(&self) -> String {
        "microscope".to_string()
    }

    async fn handle(&self, request: &DeviceRequest) -> TemResult<Bytes> {
        match request.request_type {
            RequestType::Acquire => {
                let unit = self.orchestrator.acquire(request.payload_str()?).await?;
                Ok(Bytes::from(unit.to_encoded_value()?.encode()))
            }
            RequestType::BackendMode => Ok(Bytes::from_static(
                self.orchestrator.mode().as_str().as_bytes(),
            )),
            RequestType::State => Ok(Bytes::from_static(
                self.orchestrator.state().as_str().as_bytes(),
            )),
            RequestType::ReadAttribute => to_json(&self.read(request.payload_str()?).await?),
            RequestType::ReadSnapshot => {
                let mut snapshot = DetectorSettings::new();
                snapshot.insert(STEM_MODE, self.read(STEM_MODE).await?);
                to_json(&snapshot)
            }
            RequestType::ListAttributes => to_json(&Self::attributes()),
            RequestType::WriteAttribute => {
                let write: AttributeWrite = serde_json::from_slice(&request.payload)
                    .map_err(|e| TemError::Protocol(format!("bad attribute write: {e}")))?;
                Self::write(&write.name)
            }
            RequestType::Ping => Ok(Bytes::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::detector::settings::{IMAGE_HEIGHT, IMAGE_WIDTH};
    use crate::detector::SettingsHolder;
    use crate::hardware::{
        AcquiredImage, CaptureRequest, FallbackReason, PixelBuffer, VendorClient, VendorConnector,
        VendorEndpoint,
    };
    use crate::network::{DeviceProxy, DeviceServer};
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn fast() -> ProxyConfig {
        ProxyConfig {
            connect_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
            request_timeout: Duration::from_secs(2),
            acquire_timeout: Duration::from_secs(5),
        }
    }

    struct CountingClient {
        captures: Arc<AtomicUsize>,
        fail: bool,
        exposure: Duration,
    }

    #[async_trait]
    impl VendorClient for CountingClient {
        fn describe(&self) -> String {
            "counting".into()
        }

        async fn acquire_stem_image(&self, request: &CaptureRequest) -> Result<AcquiredImage> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.exposure).await;
            if self.fail {
                return Err(anyhow!("beam blanker fault"));
            }
            let len = request.width * request.height;
            AcquiredImage::new(PixelBuffer::Uint16(vec![1; len]), request.shape())
                .map_err(|e| anyhow!(e))
        }

        async fn stem_mode(&self) -> Result<bool> {
            Ok(true)
        }
    }

    struct CountingConnector {
        captures: Arc<AtomicUsize>,
        fail: bool,
        exposure: Duration,
    }

    #[async_trait]
    impl VendorConnector for CountingConnector {
        async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn VendorClient>> {
            Ok(Box::new(CountingClient {
                captures: self.captures.clone(),
                fail: self.fail,
                exposure: self.exposure,
            }))
        }
    }

    async fn real_backend(fail: bool) -> (HardwareBackend, Arc<AtomicUsize>) {
        exposing_backend(fail, Duration::ZERO).await
    }

    async fn exposing_backend(fail: bool, exposure: Duration) -> (HardwareBackend, Arc<AtomicUsize>) {
        let captures = Arc::new(AtomicUsize::new(0));
        let connector = CountingConnector {
            captures: captures.clone(),
            fail,
            exposure,
        };
        let endpoint = VendorEndpoint {
            host: "localhost".into(),
            port: 9090,
            connect_timeout: Duration::from_secs(1),
        };
        let backend = HardwareBackend::select(Some(&connector), &endpoint, None).await;
        (backend, captures)
    }

    async fn start_holder(kind: &str) -> (crate::network::ServerHandle, Arc<SettingsHolder>) {
        let holder = Arc::new(SettingsHolder::new(kind));
        let server = DeviceServer::bind("127.0.0.1:0", holder.clone()).await.unwrap();
        (server.spawn().unwrap(), holder)
    }

    #[tokio::test]
    async fn unknown_kind_has_no_side_effects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (backend, captures) = real_backend(false).await;
        let registry = ProxyRegistry::new([("haadf", addr)], fast()).unwrap();
        let orchestrator = AcquisitionOrchestrator::new(registry, backend);

        let err = orchestrator.acquire("eds").await.unwrap_err();
        assert_eq!(err.kind(), "unknown_detector_kind");
        assert_eq!(captures.load(Ordering::SeqCst), 0);
        assert!(!orchestrator.registry().is_cached("haadf").await);
        // Nobody dialled the configured holder.
        assert!(tokio::time::timeout(Duration::from_millis(50), listener.accept())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn simulated_shape_follows_holder_settings() {
        let (handle, holder) = start_holder("haadf").await;
        holder.write(IMAGE_WIDTH, SettingValue::Int(64)).unwrap();
        holder.write(IMAGE_HEIGHT, SettingValue::Int(32)).unwrap();

        let registry =
            ProxyRegistry::new([("haadf", handle.local_addr().to_string())], fast()).unwrap();
        let backend = HardwareBackend::simulated(FallbackReason::ClientNotInstalled, Some(1));
        let orchestrator = AcquisitionOrchestrator::new(registry, backend);

        let unit = orchestrator.acquire(" HAADF ").await.unwrap();
        assert_eq!(unit.metadata().detector, "haadf");
        assert_eq!(unit.metadata().shape, vec![32, 64]);
        assert_eq!(unit.payload().len(), 32 * 64 * 2);

        // Settings are re-read on every call.
        holder.write(IMAGE_WIDTH, SettingValue::Int(16)).unwrap();
        let unit = orchestrator.acquire("haadf").await.unwrap();
        assert_eq!(unit.metadata().shape, vec![32, 16]);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn hardware_failure_is_surfaced_not_simulated() {
        let (handle, _holder) = start_holder("haadf").await;
        let registry =
            ProxyRegistry::new([("haadf", handle.local_addr().to_string())], fast()).unwrap();
        let (backend, captures) = real_backend(true).await;
        let orchestrator = AcquisitionOrchestrator::new(registry, backend);

        let err = orchestrator.acquire("haadf").await.unwrap_err();
        assert!(matches!(err, TemError::AcquisitionFailed(ref m) if m.contains("beam blanker")));
        assert_eq!(captures.load(Ordering::SeqCst), 1);

        // Still idle and usable afterwards; no automatic retry happened.
        let err = orchestrator.acquire("haadf").await.unwrap_err();
        assert_eq!(err.kind(), "acquisition_failed");
        assert_eq!(captures.load(Ordering::SeqCst), 2);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn mode_and_state_are_stable() {
        let registry = ProxyRegistry::new(Vec::<(String, String)>::new(), fast()).unwrap();
        let backend = HardwareBackend::simulated(
            FallbackReason::InitializationFailed("refused".into()),
            None,
        );
        let orchestrator = AcquisitionOrchestrator::new(registry, backend);
        for _ in 0..3 {
            assert_eq!(orchestrator.mode(), BackendMode::Simulated);
            assert_eq!(orchestrator.state(), DeviceState::Fault);
        }
        assert!(!orchestrator.stem_mode().await.unwrap());
    }

    #[tokio::test]
    async fn microscope_device_requests() {
        let (backend, _) = real_backend(false).await;
        let registry = ProxyRegistry::new(Vec::<(String, String)>::new(), fast()).unwrap();
        let microscope = Microscope::new(Arc::new(AcquisitionOrchestrator::new(registry, backend)));

        let mode = microscope
            .handle(&DeviceRequest::new(1, RequestType::BackendMode, Bytes::new()))
            .await
            .unwrap();
        assert_eq!(&mode[..], b"real");

        let stem = microscope
            .handle(&DeviceRequest::new(2, RequestType::ReadAttribute, STEM_MODE))
            .await
            .unwrap();
        assert_eq!(&stem[..], b"true");

        let state = microscope
            .handle(&DeviceRequest::new(3, RequestType::State, Bytes::new()))
            .await
            .unwrap();
        assert_eq!(&state[..], b"ON");

        let err = microscope
            .handle(&DeviceRequest::new(4, RequestType::Acquire, "eds"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_detector_kind");

        let err = microscope
            .handle(&DeviceRequest::new(5, RequestType::ReadAttribute, "focus"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_attribute");
    }

    #[tokio::test]
    async fn long_exposure_outlasts_the_request_timeout() {
        let (holder_handle, holder) = start_holder("haadf").await;
        holder.write(IMAGE_WIDTH, SettingValue::Int(8)).unwrap();
        holder.write(IMAGE_HEIGHT, SettingValue::Int(8)).unwrap();
        let registry =
            ProxyRegistry::new([("haadf", holder_handle.local_addr().to_string())], fast()).unwrap();
        let (backend, captures) = exposing_backend(false, Duration::from_millis(400)).await;
        let microscope = Microscope::new(Arc::new(AcquisitionOrchestrator::new(registry, backend)));
        let server = DeviceServer::bind("127.0.0.1:0", Arc::new(microscope)).await.unwrap();
        let handle = server.spawn().unwrap();
        let address = handle.local_addr().to_string();

        // Exposure is four times the request timeout; only the acquire bound applies.
        let client = DeviceProxy::new("microscope", &address)
            .unwrap()
            .with_request_timeout(Duration::from_millis(100))
            .with_acquire_timeout(Duration::from_secs(5));
        let value = client.acquire("haadf").await.unwrap();
        let unit = TransferUnit::from_encoded_value(&value).unwrap();
        assert_eq!(unit.metadata().shape, vec![8, 8]);
        assert!(client.ping().await.is_ok());

        // A bound shorter than the exposure still gives up.
        let impatient = DeviceProxy::new("microscope", &address)
            .unwrap()
            .with_acquire_timeout(Duration::from_millis(100));
        let err = impatient.acquire("haadf").await.unwrap_err();
        assert_eq!(err.kind(), "io");

        // Let the abandoned exposure finish before shutting down.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(captures.load(Ordering::SeqCst), 2);

        handle.shutdown().await.unwrap();
        holder_handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn microscope_writes_name_the_failing_attribute() {
        let registry = ProxyRegistry::new(Vec::<(String, String)>::new(), fast()).unwrap();
        let backend = HardwareBackend::simulated(FallbackReason::ClientNotInstalled, Some(1));
        let microscope = Microscope::new(Arc::new(AcquisitionOrchestrator::new(registry, backend)));

        let write = |name: &str| {
            let body = serde_json::to_vec(&AttributeWrite {
                name: name.to_string(),
                value: SettingValue::Bool(true),
            })
            .unwrap();
            DeviceRequest::new(6, RequestType::WriteAttribute, body)
        };

        let err = microscope.handle(&write("focus")).await.unwrap_err();
        assert!(matches!(err, TemError::UnknownAttribute(ref n) if n == "focus"));

        let err = microscope.handle(&write(STEM_MODE)).await.unwrap_err();
        assert!(matches!(err, TemError::InvalidValue { ref name, .. } if name == STEM_MODE));

        let err = microscope
            .handle(&DeviceRequest::new(7, RequestType::WriteAttribute, "not json"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }
}
