//! Multi-inverter fan-out and aggregation

use crate::coordinator::Coordinator;
use crate::logging::{StructuredLogger, get_logger};
use crate::registers::FieldMap;
use std::sync::Arc;

/// Site-level view combined from all reachable inverters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetAggregate {
    /// Inverters that produced data this cycle
    pub reporting: usize,
    pub grid_power_w: f64,
    pub pv_power_w: f64,
    pub battery_power_w: f64,
    /// Present only when every reporting inverter knows its house load
    pub house_load_w: Option<f64>,
    /// Mean SOC across reporting inverters
    pub average_soc_percent: Option<f64>,
    pub pv_energy_today_kwh: f64,
}

/// Owns the coordinators of a site
pub struct Fleet {
    coordinators: Vec<Coordinator>,
    logger: StructuredLogger,
}

impl Fleet {
    pub fn new(coordinators: Vec<Coordinator>) -> Self {
        Self {
            coordinators,
            logger: get_logger("fleet"),
        }
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }

    pub fn coordinators_mut(&mut self) -> &mut [Coordinator] {
        &mut self.coordinators
    }

    /// Refresh every inverter concurrently. A failing inverter is logged
    /// and skipped; its absence shows up in the aggregate instead of
    /// aborting the cycle.
    pub async fn refresh_all(&mut self) -> Vec<Option<Arc<FieldMap>>> {
        let futures = self
            .coordinators
            .iter_mut()
            .map(|c| async move {
                let name = c.name().to_string();
                (name, c.refresh().await)
            })
            .collect::<Vec<_>>();
        let results = futures::future::join_all(futures).await;

        results
            .into_iter()
            .map(|(name, result)| match result {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    self.logger.warn(&format!("{}: refresh failed: {}", name, e));
                    None
                }
            })
            .collect()
    }

    /// Combine the latest per-inverter snapshots into a site total
    pub fn aggregate(&self, snapshots: &[Option<Arc<FieldMap>>]) -> FleetAggregate {
        let mut agg = FleetAggregate::default();
        let mut soc_sum = 0.0;
        let mut soc_count = 0usize;
        let mut load_sum = 0.0;
        let mut load_known = true;

        for snapshot in snapshots.iter().flatten() {
            agg.reporting += 1;
            agg.grid_power_w += snapshot.get("grid_power_total").copied().unwrap_or(0.0);
            agg.pv_power_w += snapshot.get("pv_power_total").copied().unwrap_or(0.0);
            agg.battery_power_w += snapshot.get("battery_power").copied().unwrap_or(0.0);
            agg.pv_energy_today_kwh += snapshot.get("pv_energy_today").copied().unwrap_or(0.0);
            match snapshot.get("total_house_load") {
                Some(load) => load_sum += load,
                None => load_known = false,
            }
            if let Some(soc) = snapshot.get("battery_soc") {
                soc_sum += soc;
                soc_count += 1;
            }
        }

        if agg.reporting > 0 && load_known {
            agg.house_load_w = Some(load_sum);
        }
        if soc_count > 0 {
            agg.average_soc_percent = Some(soc_sum / soc_count as f64);
        }
        agg
    }

    /// Shut down all coordinators
    pub async fn shutdown(&mut self) {
        for coordinator in &mut self.coordinators {
            coordinator.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, f64)]) -> Option<Arc<FieldMap>> {
        Some(Arc::new(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        ))
    }

    #[test]
    fn aggregate_sums_power_and_averages_soc() {
        let fleet = Fleet::new(Vec::new());
        let snapshots = vec![
            snapshot(&[
                ("grid_power_total", -3000.0),
                ("pv_power_total", 4000.0),
                ("battery_power", 500.0),
                ("battery_soc", 80.0),
                ("total_house_load", 1500.0),
                ("pv_energy_today", 12.5),
            ]),
            snapshot(&[
                ("grid_power_total", 1000.0),
                ("pv_power_total", 2000.0),
                ("battery_power", -500.0),
                ("battery_soc", 60.0),
                ("total_house_load", 2500.0),
                ("pv_energy_today", 7.5),
            ]),
        ];
        let agg = fleet.aggregate(&snapshots);
        assert_eq!(agg.reporting, 2);
        assert_eq!(agg.grid_power_w, -2000.0);
        assert_eq!(agg.pv_power_w, 6000.0);
        assert_eq!(agg.battery_power_w, 0.0);
        assert_eq!(agg.house_load_w, Some(4000.0));
        assert_eq!(agg.average_soc_percent, Some(70.0));
        assert_eq!(agg.pv_energy_today_kwh, 20.0);
    }

    #[test]
    fn failed_inverter_contributes_absent_values() {
        let fleet = Fleet::new(Vec::new());
        let snapshots = vec![
            snapshot(&[
                ("grid_power_total", 500.0),
                ("battery_soc", 40.0),
                ("total_house_load", 500.0),
            ]),
            None,
        ];
        let agg = fleet.aggregate(&snapshots);
        assert_eq!(agg.reporting, 1);
        assert_eq!(agg.grid_power_w, 500.0);
        assert_eq!(agg.average_soc_percent, Some(40.0));
    }

    #[test]
    fn unknown_house_load_propagates() {
        let fleet = Fleet::new(Vec::new());
        let snapshots = vec![
            snapshot(&[("grid_power_total", 500.0), ("total_house_load", 500.0)]),
            snapshot(&[("grid_power_total", 200.0)]),
        ];
        let agg = fleet.aggregate(&snapshots);
        assert_eq!(agg.house_load_w, None);
    }
}
