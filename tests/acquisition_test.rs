//! End-to-end acquisition through a microscope device and settings holders
//! running on loopback TCP.

mod common;

use common::{entry, fast_proxy, spawn_holder, spawn_microscope, unused_addr};
use std::time::{Duration, Instant};
use tem_daq::config::ProxyConfig;
use tem_daq::detector::settings::{DWELL_TIME, IMAGE_HEIGHT, IMAGE_WIDTH};
use tem_daq::detector::SettingValue;
use tem_daq::hardware::DType;
use tem_daq::network::{DeviceProxy, DeviceState};
use tem_daq::{BackendMode, TemError, TransferUnit};
use tokio::net::TcpListener;

#[tokio::test]
async fn haadf_defaults_give_a_megapixel_uint16_frame() {
    let (holder_handle, _holder) = spawn_holder("haadf").await;
    let scope = spawn_microscope(vec![entry("haadf", &holder_handle)], fast_proxy()).await;

    let value = scope.client().acquire("haadf").await.unwrap();

    let metadata: serde_json::Value = serde_json::from_str(&value.format).unwrap();
    assert_eq!(metadata["detector"], "haadf");
    assert_eq!(metadata["shape"], serde_json::json!([1024, 1024]));
    assert_eq!(metadata["dtype"], "uint16");
    assert_eq!(metadata["dwell_time"], 1e-6);
    assert_eq!(metadata["backend"], "simulated");
    assert_eq!(value.data.len(), 1024 * 1024 * 2);

    let unit = TransferUnit::from_encoded_value(&value).unwrap();
    let image = unit.reconstruct().unwrap();
    assert_eq!(image.dtype(), DType::Uint16);
    assert_eq!(image.pixels().len(), 1024 * 1024);

    scope.handle.shutdown().await.unwrap();
    holder_handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_kind_fails_before_any_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let haadf_addr = listener.local_addr().unwrap().to_string();
    let scope = spawn_microscope(vec![("haadf".into(), haadf_addr)], fast_proxy()).await;

    let err = scope.client().acquire("eds").await.unwrap_err();
    match err {
        TemError::UnknownDetectorKind { kind, available } => {
            assert_eq!(kind, "eds");
            assert_eq!(available, vec!["haadf".to_string()]);
        }
        other => panic!("expected UnknownDetectorKind, got {other:?}"),
    }

    // The configured holder address was never dialled.
    assert!(tokio::time::timeout(Duration::from_millis(100), listener.accept())
        .await
        .is_err());
    assert!(!scope.orchestrator.registry().is_cached("haadf").await);

    scope.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_holder_fails_after_the_bounded_wait() {
    let proxy = ProxyConfig {
        connect_timeout: Duration::from_millis(600),
        ..fast_proxy()
    };
    let scope = spawn_microscope(vec![("haadf".into(), unused_addr().await)], proxy).await;

    let started = Instant::now();
    let err = scope.client().acquire("haadf").await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(
        matches!(err, TemError::ProxyUnavailable { ref kind, .. } if kind == "haadf"),
        "got {err:?}"
    );
    assert!(elapsed >= Duration::from_millis(500), "failed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "took too long: {elapsed:?}");

    scope.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_kinds_do_not_cross_talk() {
    let (haadf_handle, haadf) = spawn_holder("haadf").await;
    let (bf_handle, bf) = spawn_holder("bf").await;
    haadf.write(IMAGE_WIDTH, SettingValue::Int(64)).unwrap();
    haadf.write(IMAGE_HEIGHT, SettingValue::Int(32)).unwrap();
    haadf.write(DWELL_TIME, SettingValue::Float(2e-6)).unwrap();
    bf.write(IMAGE_WIDTH, SettingValue::Int(16)).unwrap();
    bf.write(IMAGE_HEIGHT, SettingValue::Int(48)).unwrap();
    bf.write(DWELL_TIME, SettingValue::Float(5e-7)).unwrap();

    let scope = spawn_microscope(
        vec![entry("haadf", &haadf_handle), entry("bf", &bf_handle)],
        fast_proxy(),
    )
    .await;

    for _ in 0..5 {
        let haadf_client = scope.client();
        let bf_client = scope.client();
        let (a, b) = tokio::join!(haadf_client.acquire("haadf"), bf_client.acquire("bf"));

        let a = TransferUnit::from_encoded_value(&a.unwrap()).unwrap();
        let b = TransferUnit::from_encoded_value(&b.unwrap()).unwrap();

        assert_eq!(a.metadata().detector, "haadf");
        assert_eq!(a.metadata().shape, vec![32, 64]);
        assert_eq!(a.metadata().dwell_time, Some(2e-6));
        assert_eq!(b.metadata().detector, "bf");
        assert_eq!(b.metadata().shape, vec![48, 16]);
        assert_eq!(b.metadata().dwell_time, Some(5e-7));
        assert_ne!(a.metadata().acquisition_id, b.metadata().acquisition_id);
    }

    scope.handle.shutdown().await.unwrap();
    haadf_handle.shutdown().await.unwrap();
    bf_handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn remote_settings_changes_apply_to_the_next_acquisition() {
    let (holder_handle, _holder) = spawn_holder("haadf").await;
    let scope = spawn_microscope(vec![entry("haadf", &holder_handle)], fast_proxy()).await;
    let settings = DeviceProxy::new("haadf", &holder_handle.local_addr().to_string()).unwrap();
    let client = scope.client();

    for (width, height) in [(1_i64, 1_i64), (7, 3), (4096, 2)] {
        settings.write_attribute(IMAGE_WIDTH, SettingValue::Int(width)).await.unwrap();
        settings.write_attribute(IMAGE_HEIGHT, SettingValue::Int(height)).await.unwrap();

        let unit = TransferUnit::from_encoded_value(&client.acquire("haadf").await.unwrap()).unwrap();
        let expected = (width * height) as usize;
        assert_eq!(unit.metadata().shape, vec![height as usize, width as usize]);
        assert_eq!(unit.metadata().element_count(), Some(expected));
        assert_eq!(unit.reconstruct().unwrap().pixels().len(), expected);
    }

    scope.handle.shutdown().await.unwrap();
    holder_handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn backend_mode_is_stable_and_needs_no_acquisition() {
    let scope = spawn_microscope(Vec::new(), fast_proxy()).await;
    let client = scope.client();

    for _ in 0..5 {
        assert_eq!(client.backend_mode().await.unwrap(), BackendMode::Simulated);
    }
    assert_eq!(client.state().await.unwrap(), DeviceState::On);
    assert_eq!(scope.orchestrator.mode(), BackendMode::Simulated);

    scope.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_acquisition_leaves_the_device_usable() {
    let (holder_handle, _holder) = spawn_holder("haadf").await;
    let scope = spawn_microscope(
        vec![entry("haadf", &holder_handle), ("bf".into(), unused_addr().await)],
        fast_proxy(),
    )
    .await;
    let client = scope.client();

    assert_eq!(client.acquire("bf").await.unwrap_err().kind(), "proxy_unavailable");
    assert_eq!(client.acquire("eels").await.unwrap_err().kind(), "unknown_detector_kind");
    assert!(client.acquire("haadf").await.is_ok());

    scope.handle.shutdown().await.unwrap();
    holder_handle.shutdown().await.unwrap();
}
