//! Default configuration values

use super::{
    Config, DispatchConfig, DynamicExportConfig, InverterConfig, InverterRole, LoggingConfig,
    PersistenceConfig, PollingConfig,
};

pub(super) fn default_port() -> u16 {
    502
}

pub(super) fn default_unit_id() -> u8 {
    85
}

pub(super) fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inverters: vec![InverterConfig::default()],
            polling: PollingConfig::default(),
            dispatch: DispatchConfig::default(),
            dynamic_export: DynamicExportConfig::default(),
            logging: LoggingConfig::default(),
            persistence: PersistenceConfig::default(),
            timezone: default_timezone(),
        }
    }
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            name: "inverter".to_string(),
            role: InverterRole::Leader,
            host: "127.0.0.1".to_string(),
            port: default_port(),
            unit_id: default_unit_id(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 10,
            max_interval_secs: 600,
            default_interval_secs: 30,
            consecutive_failure_threshold: 5,
            staleness_threshold_minutes: 10,
            recovery_cooldown_secs: 300,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_charge_power_kw: 10.0,
            max_discharge_power_kw: 10.0,
            default_duration_minutes: 60,
            charge_soc_target_percent: 100.0,
            discharge_soc_cutoff_percent: 10.0,
        }
    }
}

impl Default for DynamicExportConfig {
    fn default() -> Self {
        Self {
            target_export_kw: 0.0,
            update_interval_secs: 10,
            debounce_threshold_kw: 0.1,
            refresh_ceiling_secs: 30,
            soc_cutoff_percent: 10.0,
            max_charge_kw: 0.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/var/log/neovolt/neovolt.log".to_string(),
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: "/var/lib/neovolt".to_string(),
            save_debounce_secs: 300,
        }
    }
}
