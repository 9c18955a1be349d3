//! Process-wide bridge configuration.
//!
//! Loaded once (from defaults, a JSON file, or `SPIBRIDGE_*` environment
//! variables) and immutable after the [`Bridge`](crate::Bridge) is built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Largest number of virtual endpoints a bridge will create.
pub const MAX_ENDPOINTS: usize = 256;

const DEFAULT_BACKING: &str = "/dev/spidev0.0";
const DEFAULT_DEVICE_NAME: &str = "spi-bridge";
const DEFAULT_TIMEOUT_MS: i64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Number of virtual endpoints to create (1..=256).
    pub endpoint_count: usize,
    /// Backing device paths. Shared mode uses only the first entry.
    pub backing_targets: Vec<PathBuf>,
    /// If true, endpoint `i` opens `backing_targets[i]`.
    pub per_endpoint_backing: bool,
    /// Base name for endpoints; endpoint `i` is `{device_name}{bus}.{i}`.
    pub device_name: String,
    /// Bus number, used only for naming.
    pub bus: u32,
    /// Admission deadline in milliseconds. `<= 0` waits forever.
    pub admission_timeout_ms: i64,
    /// Ownership affinity window in milliseconds. 0 disables affinity.
    pub ownership_hold_ms: u64,
    /// Trace ticket, serving, and ownership transitions.
    pub debug_logging: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint_count: 4,
            backing_targets: vec![PathBuf::from(DEFAULT_BACKING)],
            per_endpoint_backing: false,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            bus: 0,
            admission_timeout_ms: DEFAULT_TIMEOUT_MS,
            ownership_hold_ms: 0,
            debug_logging: false,
        }
    }
}

impl BridgeConfig {
    /// Shared-backing configuration for `endpoint_count` endpoints on `target`.
    pub fn shared(target: impl Into<PathBuf>, endpoint_count: usize) -> Self {
        Self {
            endpoint_count,
            backing_targets: vec![target.into()],
            ..Self::default()
        }
    }

    pub fn with_admission_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.admission_timeout_ms = match timeout {
            Some(t) => i64::try_from(t.as_millis()).unwrap_or(i64::MAX).max(1),
            None => 0,
        };
        self
    }

    pub fn with_ownership_hold(mut self, hold: Duration) -> Self {
        self.ownership_hold_ms = u64::try_from(hold.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }

    /// Admission deadline, or `None` to wait forever.
    pub fn admission_timeout(&self) -> Option<Duration> {
        u64::try_from(self.admission_timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn ownership_hold(&self) -> Duration {
        Duration::from_millis(self.ownership_hold_ms)
    }

    /// Name of endpoint `index`, e.g. `spi-bridge0.2`.
    pub fn endpoint_name(&self, index: usize) -> String {
        format!("{}{}.{}", self.device_name, self.bus, index)
    }

    /// Backing target that endpoint `index` resolves to.
    pub fn backing_target(&self, index: usize) -> Option<&Path> {
        if index >= self.endpoint_count {
            return None;
        }
        let slot = if self.per_endpoint_backing { index } else { 0 };
        self.backing_targets.get(slot).map(PathBuf::as_path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint_count == 0 || self.endpoint_count > MAX_ENDPOINTS {
            return Err(BridgeError::invalid_config(format!(
                "endpoint_count must be 1..={MAX_ENDPOINTS}, got {}",
                self.endpoint_count
            )));
        }
        if self.backing_targets.is_empty() {
            return Err(BridgeError::invalid_config("no backing target configured"));
        }
        if self.per_endpoint_backing && self.backing_targets.len() < self.endpoint_count {
            return Err(BridgeError::invalid_config(format!(
                "per_endpoint_backing needs {} targets, got {}",
                self.endpoint_count,
                self.backing_targets.len()
            )));
        }
        if self.device_name.is_empty() {
            return Err(BridgeError::invalid_config("device_name must not be empty"));
        }
        Ok(())
    }

    /// Load from a JSON document. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::invalid_config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            BridgeError::invalid_config(format!("cannot parse {}: {e}", path.display()))
        })
    }

    /// Defaults overlaid with `SPIBRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values from a key lookup (environment, or a map in tests).
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SPIBRIDGE_BACKING") {
            self.backing_targets = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(v) = lookup("SPIBRIDGE_NDEV") {
            self.endpoint_count = parse_var("SPIBRIDGE_NDEV", &v)?;
        }
        if let Some(v) = lookup("SPIBRIDGE_DEVICE_NAME") {
            self.device_name = v;
        }
        if let Some(v) = lookup("SPIBRIDGE_BUS") {
            self.bus = parse_var("SPIBRIDGE_BUS", &v)?;
        }
        if let Some(v) = lookup("SPIBRIDGE_TIMEOUT_MS") {
            self.admission_timeout_ms = parse_var("SPIBRIDGE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("SPIBRIDGE_HOLD_MS") {
            self.ownership_hold_ms = parse_var("SPIBRIDGE_HOLD_MS", &v)?;
        }
        if let Some(v) = lookup("SPIBRIDGE_PER_ENDPOINT") {
            self.per_endpoint_backing = parse_flag("SPIBRIDGE_PER_ENDPOINT", &v)?;
        }
        if let Some(v) = lookup("SPIBRIDGE_DEBUG") {
            self.debug_logging = parse_flag("SPIBRIDGE_DEBUG", &v)?;
        }
        Ok(self)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BridgeError::invalid_config(format!("{key}={value:?}: {e}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(BridgeError::invalid_config(format!(
            "{key}={other:?}: expected a boolean"
        ))),
    }
}
