//! Configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/tem_daq.toml` by default)
//! 2. environment variables prefixed with `TEM_DAQ_`, using `__` to separate
//!    nesting levels (`TEM_DAQ_PROXY__CONNECT_TIMEOUT=2s`,
//!    `TEM_DAQ_DETECTORS__HAADF__ADDRESS=127.0.0.1:8888`)
//!
//! Every section has defaults except the detector address table.
//!
//! # Example
//! ```no_run
//! use tem_daq::config::TemConfig;
//!
//! let config = TemConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), tem_daq::error::TemError>(())
//! ```

use crate::detector::normalize_kind;
use crate::error::{TemError, TemResult};
use crate::network::normalize_address;
use crate::tracing_config::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/tem_daq.toml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "TEM_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemConfig {
    /// Process identity and logging.
    pub application: ApplicationConfig,
    /// Microscope device and vendor endpoint.
    pub microscope: MicroscopeConfig,
    /// Settings holder started by `tem-daq holder`.
    pub holder: HolderConfig,
    /// Client-side timeouts for remote devices.
    pub proxy: ProxyConfig,
    /// Device server behaviour.
    pub server: ServerConfig,
    /// Simulated backend options.
    pub simulation: SimulationConfig,
    /// Proxy address table: detector kind -> settings holder.
    pub detectors: BTreeMap<String, DetectorEntry>,
}

/// Application identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Name shown in startup logs.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format.
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "TEM DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// The microscope (orchestrator) process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MicroscopeConfig {
    /// Listen address of the microscope device.
    pub listen: String,
    /// Host of the vendor instrument server.
    pub vendor_host: String,
    /// Vendor instrument server port.
    pub vendor_port: u16,
    /// Bound on the startup connection attempt to the vendor server.
    #[serde(with = "humantime_serde")]
    pub vendor_connect_timeout: Duration,
}

impl Default for MicroscopeConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7000".to_string(),
            vendor_host: "localhost".to_string(),
            vendor_port: 9090,
            vendor_connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A settings-holder process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HolderConfig {
    /// Listen address of the settings holder.
    pub listen: String,
    /// Detector kind the holder serves.
    pub kind: String,
}

impl Default for HolderConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8888".to_string(),
            kind: "haadf".to_string(),
        }
    }
}

/// Settings-holder proxy behaviour on the orchestrator side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bounded wait for a holder to become ready.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Delay between readiness probes during that wait.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bound on each request/response exchange.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Bound on a remote `Acquire`, which lasts as long as the exposure.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(600),
        }
    }
}

/// Device server behaviour shared by every process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Idle connections are closed after this long.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Simulated backend options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Fixed RNG seed for reproducible simulated images.
    pub seed: Option<u64>,
}

/// One entry of the proxy address table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorEntry {
    /// Settings holder address, `host:port` or `tcp://host:port`.
    pub address: String,
}

impl TemConfig {
    /// Load from the default path and environment.
    pub fn load() -> TemResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path. A missing file yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> TemResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> TemResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(TemError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let timeouts = [
            ("proxy.connect_timeout", self.proxy.connect_timeout),
            ("proxy.poll_interval", self.proxy.poll_interval),
            ("proxy.request_timeout", self.proxy.request_timeout),
            ("proxy.acquire_timeout", self.proxy.acquire_timeout),
            ("server.idle_timeout", self.server.idle_timeout),
            ("microscope.vendor_connect_timeout", self.microscope.vendor_connect_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(TemError::Configuration(format!("{name} must be non-zero")));
            }
        }

        if self.proxy.poll_interval > self.proxy.connect_timeout {
            return Err(TemError::Configuration(format!(
                "proxy.poll_interval ({:?}) exceeds proxy.connect_timeout ({:?})",
                self.proxy.poll_interval, self.proxy.connect_timeout
            )));
        }

        if self.holder.kind.trim().is_empty() {
            return Err(TemError::Configuration("holder.kind is empty".into()));
        }

        let mut kinds = HashSet::new();
        for (kind, entry) in &self.detectors {
            let normalized = normalize_kind(kind);
            if normalized.is_empty() {
                return Err(TemError::Configuration("empty detector kind".into()));
            }
            if !kinds.insert(normalized) {
                return Err(TemError::Configuration(format!(
                    "Duplicate detector kind: {kind}"
                )));
            }
            normalize_address(&entry.address)?;
        }

        Ok(())
    }

    /// The proxy address table as (kind, address) pairs.
    #[must_use]
    pub fn detector_table(&self) -> Vec<(String, String)> {
        self.detectors
            .iter()
            .map(|(kind, entry)| (kind.clone(), entry.address.clone()))
            .collect()
    }
}
