//! Durable storage for daily-energy baselines
//!
//! One small JSON file per inverter under the configured state directory.
//! The coordinator owns the 5-minute save debounce; this layer just reads
//! and writes atomically enough for a single-writer process.

use crate::error::{NeovoltError, Result};
use crate::logging::get_logger;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persisted daily-energy tracker state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyEnergyState {
    /// ISO date of the last midnight reset
    pub last_reset_date: Option<String>,
    /// Lifetime counter value at midnight
    pub midnight_baseline_kwh: Option<f64>,
    /// Most recent lifetime counter reading
    pub last_known_total_kwh: Option<f64>,
    /// Last positive daily value, reported through counter outages
    pub preserved_daily_kwh: Option<f64>,
}

/// Manages the per-inverter state file
pub struct PersistenceManager {
    file_path: PathBuf,
}

impl PersistenceManager {
    /// Create a manager for one inverter's state file, creating the state
    /// directory if needed.
    pub fn new<P: AsRef<Path>>(state_dir: P, inverter_name: &str) -> Result<Self> {
        let dir = state_dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| NeovoltError::io(format!("Cannot create state directory: {}", e)))?;
        Ok(Self {
            file_path: dir.join(format!("{}_daily_energy.json", inverter_name)),
        })
    }

    /// Load persisted state. A missing file yields the default state; a
    /// corrupt file is logged and also yields the default rather than
    /// blocking startup.
    pub fn load(&self) -> DailyEnergyState {
        let logger = get_logger("persistence");
        match std::fs::read_to_string(&self.file_path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(state) => state,
                Err(e) => {
                    logger.warn(&format!(
                        "Discarding corrupt state file {}: {}",
                        self.file_path.display(),
                        e
                    ));
                    DailyEnergyState::default()
                }
            },
            Err(_) => DailyEnergyState::default(),
        }
    }

    /// Write state to disk via a temp-file rename
    pub fn save(&self, state: &DailyEnergyState) -> Result<()> {
        let contents = serde_json::to_string_pretty(state)?;
        let tmp_path = self.file_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, contents)
            .map_err(|e| NeovoltError::io(format!("Cannot write state file: {}", e)))?;
        std::fs::rename(&tmp_path, &self.file_path)
            .map_err(|e| NeovoltError::io(format!("Cannot replace state file: {}", e)))?;
        Ok(())
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}
