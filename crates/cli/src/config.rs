//! CLI configuration management

use anyhow::{Context, Result, anyhow};
use sensor::{BootstrapPlan, LightSource, RegistryOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub sensor: SensorSettings,
    #[serde(default)]
    pub bootstrap: BootstrapSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// USB ids are written as hex strings, e.g. "0x1916"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbSettings {
    pub vendor_id: String,
    pub product_id: String,
    /// Log every transfer with its payload
    pub debug: bool,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: format!("{:#06x}", protocol::VENDOR_ID),
            product_id: format!("{:#06x}", protocol::PRODUCT_ID),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSettings {
    #[serde(default)]
    pub light_source: LightSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSettings {
    #[serde(default = "BootstrapSettings::default_pause_ms")]
    pub retry_pause_ms: u64,
    #[serde(default = "BootstrapSettings::default_pause_ms")]
    pub settle_pause_ms: u64,
    /// First try plus retries
    #[serde(default = "BootstrapSettings::default_attempts")]
    pub attempts: u32,
}

impl BootstrapSettings {
    fn default_pause_ms() -> u64 {
        sensor::bootstrap::DEFAULT_PAUSE.as_millis() as u64
    }

    fn default_attempts() -> u32 {
        sensor::bootstrap::DEFAULT_ATTEMPTS
    }
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            retry_pause_ms: Self::default_pause_ms(),
            settle_pause_ms: Self::default_pause_ms(),
            attempts: Self::default_attempts(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the first standard location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/sp420/config.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if none is usable
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Parse and validate TOML content
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`, creating parent directories
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
            config_dir.join("sp420").join("config.toml")
        } else {
            PathBuf::from(".config/sp420/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        Self::validate_log_level(&self.logging.level)?;
        parse_hex_id(&self.usb.vendor_id, "vendor_id")?;
        parse_hex_id(&self.usb.product_id, "product_id")?;

        if self.bootstrap.attempts == 0 {
            return Err(anyhow!("bootstrap.attempts must be at least 1"));
        }

        Ok(())
    }

    pub fn validate_log_level(level: &str) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&level) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }
        Ok(())
    }

    /// Registry settings described by this configuration
    pub fn registry_options(&self) -> Result<RegistryOptions> {
        Ok(RegistryOptions {
            vendor_id: parse_hex_id(&self.usb.vendor_id, "vendor_id")?,
            product_id: parse_hex_id(&self.usb.product_id, "product_id")?,
            light_source: self.sensor.light_source,
            debug: self.usb.debug,
            bootstrap: BootstrapPlan::standard(
                Duration::from_millis(self.bootstrap.retry_pause_ms),
                Duration::from_millis(self.bootstrap.settle_pause_ms),
                self.bootstrap.attempts,
            ),
        })
    }
}

/// Parse a "0x"-prefixed hex USB id
pub fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("Invalid {} '{}', must start with '0x' (e.g., '0x1916')", name, id))?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', contains non-hex characters", name, id))
}
