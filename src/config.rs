//! Configuration management for the Neovolt driver
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files with support for an environment variable
//! path override.

use crate::error::{NeovoltError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Inverters to drive; the first entry is the leader in a fleet setup
    pub inverters: Vec<InverterConfig>,

    /// Adaptive polling and recovery thresholds
    #[serde(default)]
    pub polling: PollingConfig,

    /// Dispatch power limits and defaults
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Dynamic Export controller tuning
    #[serde(default)]
    pub dynamic_export: DynamicExportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Persistent daily-energy state storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Timezone for the daily-energy midnight reset
    #[serde(default = "defaults::default_timezone")]
    pub timezone: String,
}

/// Device role within a multi-inverter fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InverterRole {
    #[default]
    Leader,
    Follower,
}

/// Modbus TCP connection parameters for one inverter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverterConfig {
    /// Display name, also used in log context and persistence file names
    pub name: String,

    /// Role within the fleet
    #[serde(default)]
    pub role: InverterRole,

    /// IP address or hostname of the inverter gateway
    pub host: String,

    /// TCP port (typically 502)
    #[serde(default = "defaults::default_port")]
    pub port: u16,

    /// Modbus unit/slave identifier
    #[serde(default = "defaults::default_unit_id")]
    pub unit_id: u8,
}

/// Adaptive polling and auto-recovery thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Fastest allowed per-block interval in seconds (hard floor 10)
    pub min_interval_secs: u64,

    /// Slowest allowed per-block interval in seconds
    pub max_interval_secs: u64,

    /// Starting interval for every block in seconds
    pub default_interval_secs: u64,

    /// Cycle-level consecutive failures before recovery triggers
    pub consecutive_failure_threshold: u32,

    /// Minutes without any data change before recovery triggers
    pub staleness_threshold_minutes: u64,

    /// Minimum seconds between recovery attempts
    pub recovery_cooldown_secs: u64,
}

/// Dispatch power limits and defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum battery charge power in kW
    pub max_charge_power_kw: f64,

    /// Maximum battery discharge power in kW
    pub max_discharge_power_kw: f64,

    /// Default dispatch duration in minutes
    pub default_duration_minutes: u32,

    /// Default SOC target when force charging (percent)
    pub charge_soc_target_percent: f64,

    /// Default SOC cutoff when force discharging (percent)
    pub discharge_soc_cutoff_percent: f64,
}

/// Dynamic Export controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicExportConfig {
    /// Target grid export power in kW
    pub target_export_kw: f64,

    /// Seconds between feedback ticks
    pub update_interval_secs: u64,

    /// Minimum commanded-power change (kW) worth re-sending
    pub debounce_threshold_kw: f64,

    /// Seconds after which a command is re-sent even without change
    /// (the inverter dispatch has a hardware timeout)
    pub refresh_ceiling_secs: u64,

    /// Battery SOC floor (percent) written into export dispatch frames
    pub soc_cutoff_percent: f64,

    /// Maximum charge power (kW) the controller may command; 0 makes the
    /// controller discharge-only
    pub max_charge_kw: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (DEBUG, INFO, WARNING, ERROR)
    pub level: String,

    /// Path to log file
    pub file: String,

    /// Whether to log to console
    #[serde(default = "default_true")]
    pub console_output: bool,

    /// Whether to use JSON format
    #[serde(default)]
    pub json_format: bool,
}

/// Persistent daily-energy state storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory for per-inverter state files
    pub state_dir: String,

    /// Minimum seconds between state file writes
    pub save_debounce_secs: u64,
}

impl Config {
    /// Load configuration from the default search path.
    ///
    /// Order: `NEOVOLT_CONFIG` env var, `./neovolt.yaml`,
    /// `/etc/neovolt/config.yaml`. Missing file yields the built-in
    /// defaults (single local inverter).
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("NEOVOLT_CONFIG") {
            return Self::load_from_file(&path);
        }
        for candidate in ["./neovolt.yaml", "/etc/neovolt/config.yaml"] {
            if Path::new(candidate).exists() {
                return Self::load_from_file(candidate);
            }
        }
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            NeovoltError::config(format!("Cannot read config file {}: {}", path, e))
        })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants
    pub fn validate(&self) -> Result<()> {
        if self.inverters.is_empty() {
            return Err(NeovoltError::validation(
                "inverters",
                "at least one inverter must be configured",
            ));
        }
        for inv in &self.inverters {
            if inv.host.is_empty() {
                return Err(NeovoltError::validation("host", "host must not be empty"));
            }
            if inv.port == 0 {
                return Err(NeovoltError::validation("port", "port must be non-zero"));
            }
        }
        if self.polling.min_interval_secs > self.polling.max_interval_secs {
            return Err(NeovoltError::validation(
                "polling",
                "min_interval_secs must not exceed max_interval_secs",
            ));
        }
        if self.polling.consecutive_failure_threshold == 0 {
            return Err(NeovoltError::validation(
                "polling",
                "consecutive_failure_threshold must be at least 1",
            ));
        }
        if self.dispatch.max_discharge_power_kw <= 0.0 {
            return Err(NeovoltError::validation(
                "dispatch",
                "max_discharge_power_kw must be positive",
            ));
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(NeovoltError::validation(
                "timezone",
                "unknown IANA timezone name",
            ));
        }
        Ok(())
    }

    /// Parsed timezone for daily-energy rollover
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .unwrap_or(chrono_tz::UTC)
    }

    /// Save configuration to a YAML file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let contents = serde_yaml::to_string(self)?;
        std::fs::write(path, contents)
            .map_err(|e| NeovoltError::config(format!("Cannot write config file: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.inverters.len(), 1);
        assert_eq!(config.inverters[0].port, 502);
        assert_eq!(config.inverters[0].unit_id, 85);
    }

    #[test]
    fn validation_rejects_bad_intervals() {
        let mut config = Config::default();
        config.polling.min_interval_secs = 600;
        config.polling.max_interval_secs = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_unknown_timezone() {
        let mut config = Config::default();
        config.timezone = "Mars/Olympus_Mons".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_roundtrip_preserves_inverters() {
        let mut config = Config::default();
        config.inverters.push(InverterConfig {
            name: "shed".to_string(),
            role: InverterRole::Follower,
            host: "192.168.1.51".to_string(),
            port: 502,
            unit_id: 86,
        });
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.inverters.len(), 2);
        assert_eq!(parsed.inverters[1].role, InverterRole::Follower);
    }
}
