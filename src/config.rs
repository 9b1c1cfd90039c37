use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;

use crate::error::FirmwareError;

const EMBEDDED_DEVICES_CONFIG: &str = include_str!("../devices.json");

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_WAKE_INTERVAL_SECS: u64 = 300;

/// One managed device type and the upstream repository its firmware ships from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub owner: String,
    pub repo: String,
    pub asset: String,
}

impl DeviceConfig {
    pub fn repository(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevicesConfig {
    pub devices: Vec<DeviceConfig>,
}

impl DevicesConfig {
    /// Load the device table from `path`, or the copy compiled into the binary.
    pub fn load(path: Option<&Path>) -> Result<Self, FirmwareError> {
        let contents = match path {
            Some(path) => {
                info!("config: loading device table from {}", path.display());
                fs::read_to_string(path).map_err(|e| {
                    FirmwareError::Config(format!("failed to read {}: {e}", path.display()))
                })?
            }
            None => EMBEDDED_DEVICES_CONFIG.to_owned(),
        };
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, FirmwareError> {
        let config: DevicesConfig = serde_json::from_str(contents)
            .map_err(|e| FirmwareError::Config(format!("device table parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), FirmwareError> {
        if self.devices.is_empty() {
            return Err(FirmwareError::Config("no device types configured".into()));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            let name = device.name.trim();
            if name.is_empty() {
                return Err(FirmwareError::Config("device type with empty name".into()));
            }
            if !is_plain_file_name(name) {
                return Err(FirmwareError::Config(format!(
                    "device type name '{name}' is not a valid directory name"
                )));
            }
            if device.asset.trim().is_empty() {
                return Err(FirmwareError::Config(format!(
                    "device type '{name}' has no asset filename"
                )));
            }
            if !is_plain_file_name(&device.asset) {
                return Err(FirmwareError::Config(format!(
                    "asset '{}' of device type '{name}' must be a bare file name",
                    device.asset
                )));
            }
            if !seen.insert(name.to_owned()) {
                return Err(FirmwareError::Config(format!(
                    "device type '{name}' configured twice"
                )));
            }
            if is_placeholder(&device.owner) || is_placeholder(&device.repo) {
                warn!(
                    "config: device type '{}' points at placeholder repository {}; \
                     checks will fail until it is configured",
                    name,
                    device.repository()
                );
            }
        }
        Ok(())
    }
}

/// Settings shared by every manager in the process.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub data_dir: PathBuf,
    pub api_base: String,
    pub check_interval: Duration,
    pub wake_interval: Duration,
}

impl ServiceSettings {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            api_base: DEFAULT_API_BASE.to_owned(),
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            wake_interval: Duration::from_secs(DEFAULT_WAKE_INTERVAL_SECS),
        }
    }
}

/// A single path component that cannot climb out of its parent directory.
fn is_plain_file_name(value: &str) -> bool {
    !value.contains(['/', '\\']) && value != "." && value != ".."
}

/// True when an owner or repo value was left at a template default.
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return true;
    }
    if value.starts_with('<') && value.ends_with('>') {
        return true;
    }
    let lower = value.to_ascii_lowercase();
    lower.starts_with("your-")
        || lower.starts_with("your_")
        || matches!(lower.as_str(), "owner" | "repo" | "changeme")
}
