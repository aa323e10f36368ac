//! Host configuration management

use anyhow::{Context, Result, anyhow};
use common::usb_types::{DeviceDescriptor, LineCoding};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use threading::ThreadConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub cdc: CdcSettings,
    #[serde(default)]
    pub msc: MscSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub threading: ThreadConfig,
    /// Simulated devices for the `usbh-sim` binary
    #[serde(default)]
    pub sim: SimSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
    /// Activate the host as soon as it is created
    #[serde(default)]
    pub auto_activate: bool,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            auto_activate: false,
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcSettings {
    /// Give up a write after this long without forward progress
    #[serde(default = "CdcSettings::default_write_idle_timeout", with = "duration_serde")]
    pub write_idle_timeout: Duration,
    /// Wait used by `CdcPort::read_timeout` when no timeout is given
    #[serde(default = "CdcSettings::default_read_timeout", with = "duration_serde")]
    pub read_timeout: Duration,
    /// Report write readiness from poll only when the transmit FIFO has room
    #[serde(default)]
    pub poll_checks_tx_space: bool,
    /// Line coding applied to every newly bound interface
    #[serde(default)]
    pub line_coding: LineCoding,
}

impl Default for CdcSettings {
    fn default() -> Self {
        Self {
            write_idle_timeout: Self::default_write_idle_timeout(),
            read_timeout: Self::default_read_timeout(),
            poll_checks_tx_space: false,
            line_coding: LineCoding::default(),
        }
    }
}

impl CdcSettings {
    fn default_write_idle_timeout() -> Duration {
        Duration::from_millis(500)
    }

    fn default_read_timeout() -> Duration {
        Duration::from_millis(100)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MscSettings {
    /// Upper bound on a single block transfer
    #[serde(default = "MscSettings::default_transfer_timeout", with = "duration_serde")]
    pub transfer_timeout: Duration,
}

impl Default for MscSettings {
    fn default() -> Self {
        Self {
            transfer_timeout: Self::default_transfer_timeout(),
        }
    }
}

impl MscSettings {
    fn default_transfer_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Capacity of the deferred-callback queue
    #[serde(default = "SchedulerSettings::default_queue_depth")]
    pub queue_depth: usize,
    /// Longest single sleep inside a blocking wait
    #[serde(default = "SchedulerSettings::default_wait_slice", with = "duration_serde")]
    pub wait_slice: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            queue_depth: Self::default_queue_depth(),
            wait_slice: Self::default_wait_slice(),
        }
    }
}

impl SchedulerSettings {
    fn default_queue_depth() -> usize {
        8
    }

    fn default_wait_slice() -> Duration {
        Duration::from_millis(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SimSettings {
    /// Delay before the configured devices are plugged in
    #[serde(
        default,
        with = "duration_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub plug_delay: Option<Duration>,
    #[serde(default)]
    pub devices: Vec<SimDeviceConfig>,
}

/// A simulated device
///
/// # Example Configuration
/// ```toml
/// [[sim.devices]]
/// address = 1
/// vendor_id = 0x2E8A
/// product_id = 0x000A
/// manufacturer = "Raspberry Pi"
/// product = "Pico"
/// cdc = [{ index = 0, echo = true }]
///
/// [[sim.devices]]
/// address = 2
/// vendor_id = 0x0781
/// product_id = 0x5581
/// msc = [{ lun = 0, block_size = 512, block_count = 1000 }]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimDeviceConfig {
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub class: u8,
    #[serde(default)]
    pub subclass: u8,
    #[serde(default)]
    pub protocol: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default)]
    pub cdc: Vec<SimCdcConfig>,
    #[serde(default)]
    pub msc: Vec<SimMscConfig>,
    #[serde(default)]
    pub hid: Vec<SimHidConfig>,
}

impl SimDeviceConfig {
    /// Device descriptor with string indices assigned to the configured strings
    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            class: self.class,
            subclass: self.subclass,
            protocol: self.protocol,
            manufacturer_index: if self.manufacturer.is_some() { 1 } else { 0 },
            product_index: if self.product.is_some() { 2 } else { 0 },
            serial_index: if self.serial.is_some() { 3 } else { 0 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimCdcConfig {
    pub index: u8,
    /// Loop transmitted bytes back to the receive FIFO
    #[serde(default)]
    pub echo: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimMscConfig {
    #[serde(default)]
    pub lun: u8,
    #[serde(default = "SimMscConfig::default_block_size")]
    pub block_size: u32,
    pub block_count: u32,
    #[serde(default)]
    pub read_only: bool,
}

impl SimMscConfig {
    fn default_block_size() -> u32 {
        512
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimHidConfig {
    pub instance: u8,
    /// Interface protocol: 0 none, 1 keyboard, 2 mouse
    #[serde(default)]
    pub protocol: u8,
    /// Report descriptor bytes; a boot keyboard header when empty
    #[serde(default)]
    pub report_descriptor: Vec<u8>,
}

/// Serde helpers for human-readable durations ("500ms", "5s", "1h30m")
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => format_duration(*d).serialize(serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt: Option<String> = Option::deserialize(deserializer)?;
            opt.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }

    /// Parse a duration string like "250ms", "5s", "1m", "1h30m"
    ///
    /// A bare number is taken as milliseconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total_ms: u64 = 0;
        let mut current_num = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }
            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            let unit_ms = match c {
                'h' => 3_600_000,
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    1
                }
                'm' => 60_000,
                's' => 1_000,
                _ => return Err(format!("Invalid duration unit: {}", c)),
            };
            total_ms = total_ms.saturating_add(num.saturating_mul(unit_ms));
        }

        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total_ms = total_ms.saturating_add(num);
        }

        if total_ms == 0 {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(Duration::from_millis(total_ms))
    }

    pub fn format_duration(d: Duration) -> String {
        let ms = d.as_millis() as u64;
        if ms % 1000 != 0 {
            return format!("{}ms", ms);
        }

        let secs = ms / 1000;
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 || result.is_empty() {
            result.push_str(&format!("{}s", secs));
        }
        result
    }
}

pub use duration_serde::parse_duration;

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/usbh/host.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbh").join("host.toml")
        } else {
            PathBuf::from(".config/usbh/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.scheduler.queue_depth == 0 {
            return Err(anyhow!("scheduler.queue_depth must be at least 1"));
        }

        if !(5..=8).contains(&self.cdc.line_coding.data_bits) && self.cdc.line_coding.data_bits != 16 {
            return Err(anyhow!(
                "Invalid CDC data bits {}, must be 5-8 or 16",
                self.cdc.line_coding.data_bits
            ));
        }

        self.threading
            .validate()
            .map_err(|e| anyhow!("Invalid threading configuration: {}", e))?;

        let mut seen = std::collections::HashSet::new();
        for device in &self.sim.devices {
            if device.address == 0 || device.address > 127 {
                return Err(anyhow!(
                    "Invalid simulated device address {}, must be 1-127",
                    device.address
                ));
            }
            if !seen.insert(device.address) {
                return Err(anyhow!(
                    "Duplicate simulated device address {}",
                    device.address
                ));
            }
            for msc in &device.msc {
                if msc.block_size == 0 {
                    return Err(anyhow!(
                        "Simulated device {} LUN {} has zero block size",
                        device.address,
                        msc.lun
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.host.log_level, "info");
        assert_eq!(config.cdc.write_idle_timeout, Duration::from_millis(500));
        assert_eq!(config.msc.transfer_timeout, Duration::from_secs(5));
        assert_eq!(config.scheduler.queue_depth, 8);
        assert_eq!(config.cdc.line_coding, LineCoding::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1s250ms").unwrap(), Duration::from_millis(1250));
        assert_eq!(parse_duration("20").unwrap(), Duration::from_millis(20));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("ms").is_err());
    }

    #[test]
    fn test_format_duration() {
        use duration_serde::format_duration;
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
    }

    #[test]
    fn test_config_serialization() {
        let config = HostConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: HostConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.host.log_level, parsed.host.log_level);
        assert_eq!(config.cdc.write_idle_timeout, parsed.cdc.write_idle_timeout);
        assert_eq!(config.msc.transfer_timeout, parsed.msc.transfer_timeout);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = HostConfig::default();
        assert!(config.validate().is_ok());

        config.host.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.host.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_sim_devices() {
        let mut config: HostConfig = toml::from_str(
            r#"
            [[sim.devices]]
            address = 1
            vendor_id = 0x1234
            product_id = 0x5678
            msc = [{ block_count = 100 }]
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.sim.devices[0].msc[0].block_size, 512);

        config.sim.devices.push(config.sim.devices[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sim_descriptor_string_indices() {
        let device = SimDeviceConfig {
            address: 1,
            vendor_id: 1,
            product_id: 2,
            class: 0,
            subclass: 0,
            protocol: 0,
            manufacturer: Some("Acme".to_string()),
            product: None,
            serial: Some("42".to_string()),
            cdc: Vec::new(),
            msc: Vec::new(),
            hid: Vec::new(),
        };
        let desc = device.descriptor();
        assert_eq!(desc.manufacturer_index, 1);
        assert_eq!(desc.product_index, 0);
        assert_eq!(desc.serial_index, 3);
    }
}
