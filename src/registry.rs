//! Proxy registry: detector kind -> live handle to its settings holder.
//!
//! The address table is fixed at construction. Handles are created lazily
//! on first resolution, made ready with a bounded wait, and cached for the
//! life of the process. A cached handle is pinged before reuse; if the ping
//! fails the handle is evicted and resolved again exactly once.
//!
//! Each kind has its own slot lock, so a slow or unreachable holder never
//! delays resolution of another kind.

use crate::config::ProxyConfig;
use crate::detector::normalize_kind;
use crate::error::{TemError, TemResult};
use crate::network::{normalize_address, DeviceProxy};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct Slot {
    address: String,
    handle: Mutex<Option<Arc<DeviceProxy>>>,
}

/// Detector kind to settings holder proxy, resolved lazily.
pub struct ProxyRegistry {
    slots: BTreeMap<String, Slot>,
    options: ProxyConfig,
}

impl ProxyRegistry {
    /// Build a registry from `(kind, address)` pairs. Performs no I/O.
    ///
    /// Kinds are normalised; addresses are validated. Duplicate kinds after
    /// normalisation are rejected.
    pub fn new<I, K, A>(table: I, options: ProxyConfig) -> TemResult<Self>
    where
        I: IntoIterator<Item = (K, A)>,
        K: AsRef<str>,
        A: AsRef<str>,
    {
        let mut slots = BTreeMap::new();
        for (kind, address) in table {
            let kind = normalize_kind(kind.as_ref());
            let address = normalize_address(address.as_ref())?;
            let slot = Slot {
                address,
                handle: Mutex::new(None),
            };
            if slots.insert(kind.clone(), slot).is_some() {
                return Err(TemError::Configuration(format!(
                    "Duplicate detector kind: {kind}"
                )));
            }
        }
        Ok(Self { slots, options })
    }

    /// Registered detector kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    /// Whether `kind` is registered.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.slots.contains_key(kind)
    }

    /// Configured address of `kind`.
    #[must_use]
    pub fn address(&self, kind: &str) -> Option<&str> {
        self.slots.get(kind).map(|s| s.address.as_str())
    }

    /// Fail with `UnknownDetectorKind` if `kind` is not registered.
    pub fn check_kind(&self, kind: &str) -> TemResult<()> {
        if self.contains(kind) {
            Ok(())
        } else {
            Err(TemError::UnknownDetectorKind {
                kind: kind.to_string(),
                available: self.kinds(),
            })
        }
    }

    /// Whether a handle for `kind` is currently cached.
    pub async fn is_cached(&self, kind: &str) -> bool {
        match self.slots.get(kind) {
            Some(slot) => slot.handle.lock().await.is_some(),
            None => false,
        }
    }

    /// Return a ready handle for `kind`.
    ///
    /// `kind` must already be normalised. Fails with `UnknownDetectorKind`
    /// for an unregistered kind (no I/O) and `ProxyUnavailable` when the
    /// holder does not become ready within the configured wait.
    pub async fn resolve(&self, kind: &str) -> TemResult<Arc<DeviceProxy>> {
        let slot = self
            .slots
            .get(kind)
            .ok_or_else(|| TemError::UnknownDetectorKind {
                kind: kind.to_string(),
                available: self.kinds(),
            })?;

        let mut cached = slot.handle.lock().await;

        if let Some(handle) = cached.as_ref() {
            match handle.ping().await {
                Ok(()) => {
                    debug!(detector = %kind, "Reusing cached settings holder handle");
                    return Ok(handle.clone());
                }
                Err(e) => {
                    info!(
                        detector = %kind,
                        address = %slot.address,
                        error = %e,
                        "Cached settings holder handle is dead, evicting"
                    );
                    cached.take();
                }
            }
        }

        let handle = Arc::new(
            DeviceProxy::new(kind, &slot.address)?
                .with_request_timeout(self.options.request_timeout),
        );

        if let Err(e) = handle
            .wait_ready(self.options.connect_timeout, self.options.poll_interval)
            .await
        {
            warn!(detector = %kind, address = %slot.address, error = %e, "Settings holder unavailable");
            return Err(e);
        }

        info!(detector = %kind, address = %slot.address, "Connected to settings holder");
        *cached = Some(handle.clone());
        Ok(handle)
    }
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table: BTreeMap<&str, &str> = self
            .slots
            .iter()
            .map(|(k, s)| (k.as_str(), s.address.as_str()))
            .collect();
        f.debug_struct("ProxyRegistry")
            .field("table", &table)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn fast() -> ProxyConfig {
        ProxyConfig {
            connect_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
            request_timeout: Duration::from_millis(200),
            acquire_timeout: Duration::from_millis(200),
        }
    }

    async fn dead_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[test]
    fn kinds_are_normalised_and_sorted() {
        let registry = ProxyRegistry::new(
            [(" HAADF ", "127.0.0.1:8888"), ("bf", "tcp://127.0.0.1:8889")],
            ProxyConfig::default(),
        )
        .unwrap();
        assert_eq!(registry.kinds(), vec!["bf", "haadf"]);
        assert_eq!(registry.address("bf"), Some("127.0.0.1:8889"));
    }

    #[test]
    fn duplicate_and_invalid_entries_rejected() {
        assert!(ProxyRegistry::new(
            [("haadf", "127.0.0.1:1"), ("HAADF", "127.0.0.1:2")],
            ProxyConfig::default()
        )
        .is_err());
        assert!(ProxyRegistry::new([("haadf", "nowhere")], ProxyConfig::default()).is_err());
    }

    #[tokio::test]
    async fn unknown_kind_lists_available() {
        let registry =
            ProxyRegistry::new([("haadf", "127.0.0.1:8888")], ProxyConfig::default()).unwrap();
        match registry.resolve("eds").await {
            Err(TemError::UnknownDetectorKind { kind, available }) => {
                assert_eq!(kind, "eds");
                assert_eq!(available, vec!["haadf"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.check_kind("eds").is_err());
        assert!(registry.check_kind("haadf").is_ok());
    }

    #[tokio::test]
    async fn unreachable_holder_is_proxy_unavailable_and_not_cached() {
        let registry = ProxyRegistry::new([("haadf", dead_address().await)], fast()).unwrap();

        let started = std::time::Instant::now();
        let err = registry.resolve("haadf").await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), "proxy_unavailable");
        assert!(elapsed >= Duration::from_millis(150), "gave up after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "hung for {elapsed:?}");
        assert!(!registry.is_cached("haadf").await);
    }
}
