//! Loopback fixtures: settings holders and a simulated microscope on
//! ephemeral ports.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tem_daq::config::ProxyConfig;
use tem_daq::detector::SettingsHolder;
use tem_daq::hardware::FallbackReason;
use tem_daq::network::{DeviceProxy, DeviceServer, ServerHandle};
use tem_daq::{AcquisitionOrchestrator, HardwareBackend, Microscope, ProxyRegistry};
use tokio::net::TcpListener;

pub fn fast_proxy() -> ProxyConfig {
    ProxyConfig {
        connect_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(25),
        request_timeout: Duration::from_secs(5),
        acquire_timeout: Duration::from_secs(10),
    }
}

/// An address nothing listens on.
pub async fn unused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

pub async fn spawn_holder_at(addr: &str, kind: &str) -> (ServerHandle, Arc<SettingsHolder>) {
    let holder = Arc::new(SettingsHolder::new(kind));
    let server = DeviceServer::bind(addr, holder.clone()).await.unwrap();
    (server.spawn().unwrap(), holder)
}

pub async fn spawn_holder(kind: &str) -> (ServerHandle, Arc<SettingsHolder>) {
    spawn_holder_at("127.0.0.1:0", kind).await
}

pub struct MicroscopeFixture {
    pub handle: ServerHandle,
    pub orchestrator: Arc<AcquisitionOrchestrator>,
}

impl MicroscopeFixture {
    pub fn address(&self) -> String {
        self.handle.local_addr().to_string()
    }

    /// A fresh client handle to the microscope device.
    pub fn client(&self) -> DeviceProxy {
        DeviceProxy::new("microscope", &self.address())
            .unwrap()
            .with_request_timeout(Duration::from_secs(10))
            .with_acquire_timeout(Duration::from_secs(10))
    }
}

pub async fn spawn_microscope(table: Vec<(String, String)>, proxy: ProxyConfig) -> MicroscopeFixture {
    let registry = ProxyRegistry::new(table, proxy).unwrap();
    let backend = HardwareBackend::simulated(FallbackReason::ClientNotInstalled, Some(7));
    let orchestrator = Arc::new(AcquisitionOrchestrator::new(registry, backend));
    let server = DeviceServer::bind("127.0.0.1:0", Arc::new(Microscope::new(orchestrator.clone())))
        .await
        .unwrap();
    MicroscopeFixture {
        handle: server.spawn().unwrap(),
        orchestrator,
    }
}

pub fn entry(kind: &str, handle: &ServerHandle) -> (String, String) {
    (kind.to_string(), handle.local_addr().to_string())
}
