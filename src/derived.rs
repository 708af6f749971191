//! Derived power values and daily-energy tracking
//!
//! Pure calculations layered on top of the decoded register snapshot:
//! combined PV production, house load with the export split, and the
//! energy-since-midnight counter with its persisted baseline.

use crate::persistence::DailyEnergyState;
use crate::registers::FieldMap;
use chrono::NaiveDate;

/// Which power sources produced a decode this cycle or earlier
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceReads {
    pub grid: bool,
    pub pv: bool,
    pub battery: bool,
}

impl SourceReads {
    pub fn available(&self) -> u8 {
        self.grid as u8 + self.pv as u8 + self.battery as u8
    }
}

/// Round to two decimals, matching the reported sensor precision
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Augment a snapshot with derived power values.
///
/// House load is the signed sum of PV, battery and grid power and needs at
/// least two of the three sources. With fewer than two, the load keys are
/// removed so consumers see "unknown" rather than a stale number. A
/// negative load is reported as-is and mirrored into `excess_grid_export`
/// (multi-inverter sites where another unit covers the local load).
pub fn apply_power_derivations(data: &mut FieldMap, sources: SourceReads) {
    let pv_dc = data.get("pv_dc_power_total").copied().unwrap_or(0.0);
    let pv_ac = data.get("pv_ac_power_total").copied().unwrap_or(0.0);
    data.insert("pv_power_total".to_string(), pv_dc + pv_ac);

    let production = data.get("pv1_power").copied().unwrap_or(0.0)
        + data.get("pv2_power").copied().unwrap_or(0.0)
        + data.get("pv3_power").copied().unwrap_or(0.0);
    data.insert("current_pv_production".to_string(), production);

    if sources.available() >= 2 {
        let pv = data.get("pv_power_total").copied().unwrap_or(0.0);
        let battery = data.get("battery_power").copied().unwrap_or(0.0);
        let grid = data.get("grid_power_total").copied().unwrap_or(0.0);
        let house_load = pv + battery + grid;

        data.insert("total_house_load".to_string(), house_load);
        data.insert(
            "excess_grid_export".to_string(),
            if house_load < 0.0 { house_load.abs() } else { 0.0 },
        );
        data.insert(
            "house_load_estimated".to_string(),
            if sources.available() < 3 { 1.0 } else { 0.0 },
        );
    } else {
        data.remove("total_house_load");
        data.remove("house_load_estimated");
        data.insert("excess_grid_export".to_string(), 0.0);
    }
}

/// Daily energy-since-midnight tracker.
///
/// Holds the lifetime-counter baseline taken at midnight and survives
/// counter rollbacks by reporting the last preserved positive value.
#[derive(Debug, Clone, Default)]
pub struct DailyEnergyTracker {
    last_reset_date: Option<NaiveDate>,
    midnight_baseline_kwh: Option<f64>,
    last_known_total_kwh: Option<f64>,
    preserved_daily_kwh: Option<f64>,
}

impl DailyEnergyTracker {
    /// Restore a tracker from persisted state
    pub fn from_state(state: &DailyEnergyState) -> Self {
        Self {
            last_reset_date: state
                .last_reset_date
                .as_deref()
                .and_then(|s| s.parse().ok()),
            midnight_baseline_kwh: state.midnight_baseline_kwh,
            last_known_total_kwh: state.last_known_total_kwh,
            preserved_daily_kwh: state.preserved_daily_kwh,
        }
    }

    /// Snapshot the tracker for persistence
    pub fn to_state(&self) -> DailyEnergyState {
        DailyEnergyState {
            last_reset_date: self.last_reset_date.map(|d| d.to_string()),
            midnight_baseline_kwh: self.midnight_baseline_kwh,
            last_known_total_kwh: self.last_known_total_kwh,
            preserved_daily_kwh: self.preserved_daily_kwh,
        }
    }

    /// Feed a lifetime-total reading for `today` and get the daily value.
    ///
    /// Returns `(daily_kwh, state_changed)`; the caller persists when the
    /// flag is set. A total below the baseline does not reset anything;
    /// the preserved positive value (if any) is returned instead.
    pub fn update(&mut self, total_kwh: f64, today: NaiveDate) -> (f64, bool) {
        let mut changed = false;

        if self.last_known_total_kwh != Some(total_kwh) {
            self.last_known_total_kwh = Some(total_kwh);
            changed = true;
        }

        let baseline = match (self.last_reset_date, self.midnight_baseline_kwh) {
            (Some(date), Some(baseline)) if date == today => baseline,
            _ => {
                // First observation or date rollover
                self.last_reset_date = Some(today);
                self.midnight_baseline_kwh = Some(total_kwh);
                self.preserved_daily_kwh = None;
                return (0.0, true);
            }
        };

        let daily = round2(total_kwh - baseline);
        if daily < 0.0 {
            // Counter rollback; keep the baseline and fall back on the
            // last good figure
            return match self.preserved_daily_kwh {
                Some(preserved) => (preserved, changed),
                None => {
                    self.midnight_baseline_kwh = Some(total_kwh);
                    (0.0, true)
                }
            };
        }

        if daily > 0.0 && self.preserved_daily_kwh != Some(daily) {
            self.preserved_daily_kwh = Some(daily);
            changed = true;
        }
        (daily, changed)
    }

    pub fn preserved_daily_kwh(&self) -> Option<f64> {
        self.preserved_daily_kwh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, f64)]) -> FieldMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    fn all_sources() -> SourceReads {
        SourceReads {
            grid: true,
            pv: true,
            battery: true,
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn export_with_pv_covering_load() {
        let mut data = map(&[
            ("grid_power_total", -5000.0),
            ("battery_power", 0.0),
            ("pv_dc_power_total", 6000.0),
        ]);
        apply_power_derivations(&mut data, all_sources());
        assert_eq!(data["total_house_load"], 1000.0);
        assert_eq!(data["excess_grid_export"], 0.0);
        assert_eq!(data["house_load_estimated"], 0.0);
    }

    #[test]
    fn import_adds_to_load() {
        let mut data = map(&[
            ("grid_power_total", 2000.0),
            ("battery_power", 0.0),
            ("pv_dc_power_total", 3000.0),
        ]);
        apply_power_derivations(&mut data, all_sources());
        assert_eq!(data["total_house_load"], 5000.0);
    }

    #[test]
    fn negative_load_reported_signed() {
        let mut data = map(&[
            ("grid_power_total", -7000.0),
            ("battery_power", 5000.0),
            ("pv_dc_power_total", 0.0),
        ]);
        apply_power_derivations(&mut data, all_sources());
        assert_eq!(data["total_house_load"], -2000.0);
        assert_eq!(data["excess_grid_export"], 2000.0);
    }

    #[test]
    fn two_sources_flagged_estimated() {
        let mut data = map(&[("grid_power_total", 1000.0), ("battery_power", 500.0)]);
        let sources = SourceReads {
            grid: true,
            battery: true,
            pv: false,
        };
        apply_power_derivations(&mut data, sources);
        assert_eq!(data["total_house_load"], 1500.0);
        assert_eq!(data["house_load_estimated"], 1.0);
    }

    #[test]
    fn single_source_removes_load_keys() {
        let mut data = map(&[("grid_power_total", 1000.0), ("total_house_load", 3000.0)]);
        let sources = SourceReads {
            grid: true,
            ..Default::default()
        };
        apply_power_derivations(&mut data, sources);
        assert!(!data.contains_key("total_house_load"));
        assert!(!data.contains_key("house_load_estimated"));
        assert_eq!(data["excess_grid_export"], 0.0);
    }

    #[test]
    fn pv_totals_combine_dc_and_ac() {
        let mut data = map(&[
            ("pv_dc_power_total", 2000.0),
            ("pv_ac_power_total", 1500.0),
            ("pv1_power", 1200.0),
            ("pv2_power", 800.0),
        ]);
        apply_power_derivations(&mut data, all_sources());
        assert_eq!(data["pv_power_total"], 3500.0);
        assert_eq!(data["current_pv_production"], 2000.0);
    }

    #[test]
    fn first_observation_sets_baseline() {
        let mut tracker = DailyEnergyTracker::default();
        let (daily, changed) = tracker.update(1234.5, date("2026-08-23"));
        assert_eq!(daily, 0.0);
        assert!(changed);
    }

    #[test]
    fn daily_value_is_idempotent() {
        let mut tracker = DailyEnergyTracker::default();
        let today = date("2026-08-23");
        tracker.update(100.0, today);
        let (a, _) = tracker.update(107.5, today);
        let (b, changed) = tracker.update(107.5, today);
        assert_eq!(a, 7.5);
        assert_eq!(b, 7.5);
        assert!(!changed);
    }

    #[test]
    fn date_rollover_resets_baseline() {
        let mut tracker = DailyEnergyTracker::default();
        tracker.update(100.0, date("2026-08-23"));
        tracker.update(110.0, date("2026-08-23"));
        let (daily, changed) = tracker.update(110.0, date("2026-08-24"));
        assert_eq!(daily, 0.0);
        assert!(changed);
        let (next, _) = tracker.update(112.0, date("2026-08-24"));
        assert_eq!(next, 2.0);
    }

    #[test]
    fn rollback_returns_preserved_value() {
        let mut tracker = DailyEnergyTracker::default();
        let today = date("2026-08-23");
        tracker.update(100.0, today);
        tracker.update(108.0, today);
        let (daily, _) = tracker.update(95.0, today);
        assert_eq!(daily, 8.0);
        // Baseline untouched; recovery of the counter resumes normally
        let (after, _) = tracker.update(109.0, today);
        assert_eq!(after, 9.0);
    }

    #[test]
    fn rollback_without_preserve_rebaselines() {
        let mut tracker = DailyEnergyTracker::default();
        let today = date("2026-08-23");
        tracker.update(100.0, today);
        let (daily, changed) = tracker.update(40.0, today);
        assert_eq!(daily, 0.0);
        assert!(changed);
        let (next, _) = tracker.update(41.5, today);
        assert_eq!(next, 1.5);
    }

    #[test]
    fn state_roundtrip() {
        let mut tracker = DailyEnergyTracker::default();
        let today = date("2026-08-23");
        tracker.update(100.0, today);
        tracker.update(105.25, today);
        let mut restored = DailyEnergyTracker::from_state(&tracker.to_state());
        let (daily, changed) = restored.update(105.25, today);
        assert_eq!(daily, 5.25);
        assert!(!changed);
    }
}
