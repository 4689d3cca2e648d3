//! Tool configuration.
//!
//! Settings come from an optional YAML file, then `ILUMI_*` environment
//! variables. Device state (keys, counters, enrolled bulbs) lives in the
//! JSON config store named by `config_store`, not here.

use anyhow::{Context, Result};
use mesh_session::{SessionConfig, DEFAULT_MAX_CONNECTIONS};
use mesh_topology::LayoutConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Session timings in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimings {
    pub ack_settle_ms: u64,
    pub chunk_interval_ms: u64,
    pub chunk_settle_ms: u64,
    pub proxy_interval_ms: u64,
    pub color_timeout_ms: u64,
    pub device_info_timeout_ms: u64,
    pub mesh_idle_window_ms: u64,
}

impl Default for SessionTimings {
    fn default() -> Self {
        let d = SessionConfig::default();
        Self {
            ack_settle_ms: d.ack_settle.as_millis() as u64,
            chunk_interval_ms: d.chunk_interval.as_millis() as u64,
            chunk_settle_ms: d.chunk_settle.as_millis() as u64,
            proxy_interval_ms: d.proxy_interval.as_millis() as u64,
            color_timeout_ms: d.color_timeout.as_millis() as u64,
            device_info_timeout_ms: d.device_info_timeout.as_millis() as u64,
            mesh_idle_window_ms: d.mesh_idle_window.as_millis() as u64,
        }
    }
}

impl SessionTimings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            ack_settle: Duration::from_millis(self.ack_settle_ms),
            chunk_interval: Duration::from_millis(self.chunk_interval_ms),
            chunk_settle: Duration::from_millis(self.chunk_settle_ms),
            proxy_interval: Duration::from_millis(self.proxy_interval_ms),
            color_timeout: Duration::from_millis(self.color_timeout_ms),
            device_info_timeout: Duration::from_millis(self.device_info_timeout_ms),
            mesh_idle_window: Duration::from_millis(self.mesh_idle_window_ms),
        }
    }
}

/// Tool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// JSON file holding keys, counters and enrolled bulbs
    pub config_store: PathBuf,
    /// Adapter name filter, first adapter when unset
    pub adapter: Option<String>,
    /// Bulbs worked on at once
    pub max_connections: usize,
    /// How long a scan or device lookup may take
    pub scan_timeout_ms: u64,
    pub session: SessionTimings,
    pub layout: LayoutConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            config_store: PathBuf::from("ilumi_config.json"),
            adapter: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            scan_timeout_ms: 5000,
            session: SessionTimings::default(),
            layout: LayoutConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Load `config_path` if present, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing {}", path.display()))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `ILUMI_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(store) = lookup("ILUMI_CONFIG_STORE") {
            info!("Config store overridden by environment: {}", store);
            self.config_store = PathBuf::from(store);
        }

        if let Some(adapter) = lookup("ILUMI_BT_ADAPTER") {
            info!("Bluetooth adapter overridden by environment: {}", adapter);
            self.adapter = Some(adapter);
        }

        if let Some(value) = lookup("ILUMI_MAX_CONNECTIONS") {
            match value.parse::<usize>() {
                Ok(n) if n > 0 => {
                    info!("Max connections overridden by environment: {}", n);
                    self.max_connections = n;
                }
                _ => warn!("Ignoring invalid ILUMI_MAX_CONNECTIONS value '{}'", value),
            }
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}
