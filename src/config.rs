//! Start-up configuration, loaded once from TOML.
//!
//! ```toml
//! [scan]
//! period_ms = 50
//! timeout_ms = 20
//! retries = 1
//!
//! [[channel]]
//! name = "IA-01RaCtrl:CO-PSCtrl-SI1"
//! port = "/dev/ttyUSB0"
//! baud_rate = 6000000
//!
//! [[channel.device]]
//! name = "SI-01M1:PS-CH"
//! address = 1
//! model = "fbp"
//! current_limits = { low = -10.0, high = 10.0 }
//! ```

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::catalog::DeviceModel;
use crate::device::Device;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(rename = "channel")]
    pub channels: Vec<ChannelConfig>,
}

/// Timing of every scan loop.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Scan tick.
    pub period_ms: u64,
    /// Receive bound of a single request.
    pub timeout_ms: u64,
    /// Timeout retries per request.
    pub retries: u8,
    /// Consecutive failed scans before a device times out.
    pub max_missed_scans: u32,
    /// Every Nth cycle reads the full monitoring group.
    pub full_scan_every: u32,
    /// Pause between attempts to reopen a faulted channel.
    pub reinit_interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            period_ms: 50,
            timeout_ms: 20,
            retries: 1,
            max_missed_scans: 3,
            full_scan_every: 10,
            reinit_interval_ms: 1000,
        }
    }
}

impl ScanConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reinit_interval(&self) -> Duration {
        Duration::from_millis(self.reinit_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub name: String,
    /// Driver-specific location of the physical channel, e.g. a serial device path.
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(rename = "device", default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_baud_rate() -> u32 {
    115_200
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    pub address: u8,
    pub model: DeviceModel,
    pub current_limits: Option<Limits>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    pub low: f64,
    pub high: f64,
}

impl DeviceConfig {
    pub fn build(&self) -> Device {
        let device = Device::new(&self.name, self.address, self.model);
        match self.current_limits {
            Some(limits) => device.with_limits(limits.low, limits.high),
            None => device,
        }
    }
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));
        let scan = &self.scan;

        if scan.period_ms == 0 || scan.timeout_ms == 0 {
            return invalid("scan period and timeout must be non-zero".to_string());
        }
        let Some(worst_case) = scan.timeout_ms.checked_mul(u64::from(scan.retries) + 1) else {
            return invalid("timeout_ms * (retries + 1) overflows".to_string());
        };
        if worst_case >= scan.period_ms {
            return invalid(format!(
                "timeout_ms * (retries + 1) = {} must be below period_ms = {}",
                worst_case, scan.period_ms
            ));
        }
        if scan.max_missed_scans == 0 {
            return invalid("max_missed_scans must be at least 1".to_string());
        }
        if scan.full_scan_every == 0 {
            return invalid("full_scan_every must be at least 1".to_string());
        }
        if self.channels.is_empty() {
            return invalid("at least one [[channel]] is required".to_string());
        }

        let mut channel_names = HashSet::new();
        let mut device_names = HashSet::new();
        for channel in &self.channels {
            if !channel_names.insert(channel.name.as_str()) {
                return invalid(format!("duplicate channel name '{}'", channel.name));
            }
            let mut addresses = HashSet::new();
            for device in &channel.devices {
                if !device_names.insert(device.name.as_str()) {
                    return invalid(format!("duplicate device name '{}'", device.name));
                }
                if !(1..=254).contains(&device.address) {
                    return invalid(format!(
                        "device '{}': address {} outside 1..=254",
                        device.name, device.address
                    ));
                }
                if !addresses.insert(device.address) {
                    return invalid(format!(
                        "channel '{}': address {} used twice",
                        channel.name, device.address
                    ));
                }
                if let Some(limits) = device.current_limits
                    && limits.low.partial_cmp(&limits.high) != Some(Ordering::Less)
                {
                    return invalid(format!(
                        "device '{}': current limit low must be below high",
                        device.name
                    ));
                }
            }
        }
        Ok(())
    }
}
