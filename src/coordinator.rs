//! Data coordinator for one inverter
//!
//! Runs the refresh cycle: recovery evaluation, adaptive per-block reads
//! merged into the sticky snapshot, derived values, daily-energy tracking
//! with debounced persistence. Also the write path for dispatch commands
//! and the lifecycle of the Dynamic Export controller.

use crate::config::{Config, InverterConfig};
use crate::derived::{DailyEnergyTracker, SourceReads, apply_power_derivations, round2};
use crate::dispatch::{DISPATCH_ADDRESS, DispatchCommand};
use crate::error::{NeovoltError, Result};
use crate::export::{DynamicExportController, DynamicExportParams};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::modbus::ModbusLike;
use crate::persistence::PersistenceManager;
use crate::polling::AdaptivePoller;
use crate::recovery::{RecoveryManager, RecoveryReason};
use crate::registers::{ALL_BLOCKS, FieldMap, decode_block};
use crate::snapshot::SharedSnapshot;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot older than this is no longer served
const DATA_STALE_CEILING: Duration = Duration::from_secs(12 * 3600);
/// Deadline on a recovery reconnect
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-block failures before escalating to a cycle-level recovery trigger
const BLOCK_FAILURE_THRESHOLD: u32 = 3;

/// Coordinates polling, decoding, derivation and dispatch for one inverter
pub struct Coordinator {
    name: String,
    transport: Arc<dyn ModbusLike>,
    poller: AdaptivePoller,
    recovery: RecoveryManager,
    tracker: DailyEnergyTracker,
    persistence: PersistenceManager,
    snapshot: SharedSnapshot,
    export_controller: Option<DynamicExportController>,
    tz: chrono_tz::Tz,
    save_debounce: Duration,
    save_pending: bool,
    last_save: Option<Instant>,
    last_successful_update: Option<Instant>,
    export_defaults: DynamicExportParams,
    logger: StructuredLogger,
}

impl Coordinator {
    /// Build a coordinator from configuration with an injected transport
    pub fn new(
        config: &Config,
        inverter: &InverterConfig,
        transport: Arc<dyn ModbusLike>,
    ) -> Result<Self> {
        let polling = &config.polling;
        let poller = AdaptivePoller::new(
            Duration::from_secs(polling.min_interval_secs),
            Duration::from_secs(polling.max_interval_secs),
            Duration::from_secs(polling.default_interval_secs),
        );
        let recovery = RecoveryManager::new(
            polling.consecutive_failure_threshold,
            Duration::from_secs(polling.staleness_threshold_minutes * 60),
            Duration::from_secs(polling.recovery_cooldown_secs),
        );
        let persistence = PersistenceManager::new(&config.persistence.state_dir, &inverter.name)?;
        let tracker = DailyEnergyTracker::from_state(&persistence.load());

        let de = &config.dynamic_export;
        let export_defaults = DynamicExportParams {
            target_export_kw: de.target_export_kw,
            soc_cutoff_percent: de.soc_cutoff_percent,
            duration: Duration::from_secs(3600),
            max_discharge_kw: config.dispatch.max_discharge_power_kw,
            max_charge_kw: de.max_charge_kw,
            update_interval: Duration::from_secs(de.update_interval_secs),
            debounce_threshold_kw: de.debounce_threshold_kw,
            refresh_ceiling: Duration::from_secs(de.refresh_ceiling_secs),
        };

        Ok(Self {
            name: inverter.name.clone(),
            transport,
            poller,
            recovery,
            tracker,
            persistence,
            snapshot: SharedSnapshot::new(),
            export_controller: None,
            tz: config.tz(),
            save_debounce: Duration::from_secs(config.persistence.save_debounce_secs),
            save_pending: false,
            last_save: None,
            last_successful_update: None,
            export_defaults,
            logger: get_logger_with_context(
                LogContext::new("coordinator").with_inverter(&inverter.name),
            ),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read-only handle to the published snapshot
    pub fn snapshot(&self) -> SharedSnapshot {
        self.snapshot.clone()
    }

    /// Run one refresh cycle and return the resulting snapshot.
    ///
    /// On a cycle where every due block fails, the sticky snapshot is
    /// still returned as long as it is younger than the staleness
    /// ceiling.
    pub async fn refresh(&mut self) -> Result<Arc<FieldMap>> {
        let now = Instant::now();

        if let Some(reason) = self.recovery.should_recover(now) {
            self.attempt_recovery(reason, now).await;
        }

        let mut updates = FieldMap::new();
        let mut polled = 0u32;
        let mut succeeded = 0u32;
        let mut data_changed = false;

        for block in ALL_BLOCKS {
            if !self.poller.should_poll(block.name, now) {
                continue;
            }
            polled += 1;
            match self
                .transport
                .read_holding_registers(block.address, block.count)
                .await
            {
                Ok(words) => {
                    let decoded = decode_block(block.name, &words);
                    if decoded.is_empty() {
                        self.record_block_failure(block.name, now, "short read");
                        continue;
                    }
                    succeeded += 1;
                    if self.poller.cached_values(block.name) != Some(&decoded) {
                        data_changed = true;
                    }
                    updates.extend(decoded.clone());
                    self.poller.update_after_poll(block.name, decoded, now);
                }
                Err(e) => {
                    self.record_block_failure(block.name, now, &e.to_string());
                }
            }
        }

        if polled == 0 {
            // Nothing was due this cycle
            return self.current_or_stale(now);
        }

        let cycle_ok = succeeded > 0;
        self.recovery.record_cycle(cycle_ok, data_changed, now);

        if !cycle_ok {
            self.logger
                .warn(&format!("Refresh cycle failed for all {} due blocks", polled));
            return self.current_or_stale(now);
        }

        self.snapshot.merge(updates);
        let mut data = (*self.snapshot.get()).clone();
        let sources = SourceReads {
            grid: data.contains_key("grid_power_total"),
            pv: data.contains_key("pv_ac_power_total") || data.contains_key("pv_dc_power_total"),
            battery: data.contains_key("battery_power"),
        };
        apply_power_derivations(&mut data, sources);
        self.apply_daily_energy(&mut data, now);
        self.snapshot.publish(data);
        self.last_successful_update = Some(now);

        Ok(self.snapshot.get())
    }

    fn record_block_failure(&mut self, block: &'static str, now: Instant, detail: &str) {
        let failures = self.poller.record_failure(block, now);
        self.logger
            .debug(&format!("Block {} failed ({}): {}", block, failures, detail));
        if failures >= BLOCK_FAILURE_THRESHOLD {
            self.recovery.saturate_failures();
        }
    }

    fn current_or_stale(&self, now: Instant) -> Result<Arc<FieldMap>> {
        match self.last_successful_update {
            Some(at) if now.duration_since(at) < DATA_STALE_CEILING && !self.snapshot.is_empty() => {
                Ok(self.snapshot.get())
            }
            Some(at) => Err(NeovoltError::stale(format!(
                "Last good data is {} s old",
                now.duration_since(at).as_secs()
            ))),
            None => {
                if self.snapshot.is_empty() {
                    Err(NeovoltError::stale("No data received yet"))
                } else {
                    Ok(self.snapshot.get())
                }
            }
        }
    }

    async fn attempt_recovery(&mut self, reason: RecoveryReason, now: Instant) {
        self.logger
            .warn(&format!("Attempting connection recovery: {:?}", reason));
        self.recovery.record_recovery_attempt(now);
        match tokio::time::timeout(RECOVERY_TIMEOUT, self.transport.force_reconnect()).await {
            Ok(Ok(())) => self.logger.info("Recovery reconnect succeeded"),
            Ok(Err(e)) => self.logger.warn(&format!("Recovery reconnect failed: {}", e)),
            Err(_) => self.logger.warn("Recovery reconnect timed out"),
        }
    }

    /// Fold the daily PV energy figure into the snapshot and persist the
    /// tracker state, debounced.
    fn apply_daily_energy(&mut self, data: &mut FieldMap, now: Instant) {
        let dc = data.get("total_pv_energy").copied();
        let ac = data.get("pv_inverter_energy").copied();
        let total = match (dc, ac) {
            (None, None) => {
                // Counter unreadable; report the preserved value if any
                if let Some(preserved) = self.tracker.preserved_daily_kwh() {
                    data.insert("pv_energy_today".to_string(), preserved);
                }
                return;
            }
            (dc, ac) => round2(dc.unwrap_or(0.0) + ac.unwrap_or(0.0)),
        };

        let today = Utc::now().with_timezone(&self.tz).date_naive();
        let (daily, changed) = self.tracker.update(total, today);
        data.insert("pv_energy_today".to_string(), daily);

        if changed {
            self.save_pending = true;
        }
        let debounce_elapsed = match self.last_save {
            Some(at) => now.duration_since(at) >= self.save_debounce,
            None => true,
        };
        if self.save_pending && debounce_elapsed {
            match self.persistence.save(&self.tracker.to_state()) {
                Ok(()) => {
                    self.save_pending = false;
                    self.last_save = Some(now);
                }
                Err(e) => self.logger.warn(&format!("State save failed: {}", e)),
            }
        }
    }

    /// Whether the snapshot holds data younger than the staleness ceiling
    pub fn has_valid_data(&self) -> bool {
        match self.last_successful_update {
            Some(at) => at.elapsed() < DATA_STALE_CEILING && !self.snapshot.is_empty(),
            None => false,
        }
    }

    /// Age of the last successful update in seconds
    pub fn data_age_seconds(&self) -> Option<u64> {
        self.last_successful_update.map(|at| at.elapsed().as_secs())
    }

    /// Patch one snapshot value ahead of the next read cycle
    pub fn set_optimistic_value(&self, key: &str, value: f64) {
        self.snapshot.apply_patch(&[(key, Some(value))]);
    }

    /// Encode and write a dispatch command, patching the snapshot
    /// optimistically on success only.
    pub async fn write_dispatch(&self, command: &DispatchCommand) -> Result<()> {
        let frame = command.encode();
        self.transport
            .write_multiple_registers(DISPATCH_ADDRESS, &frame)
            .await?;
        self.snapshot.apply_patch(&[
            ("dispatch_start", Some(if command.start { 1.0 } else { 0.0 })),
            ("dispatch_power", Some(command.power_watts as f64)),
            ("dispatch_mode", Some(command.mode.snapshot_value() as f64)),
            ("dispatch_soc", Some(f64::from(
                crate::dispatch::soc_percent_to_register(command.soc_percent),
            ))),
            ("dispatch_time", Some(command.duration.as_secs().min(65535) as f64)),
        ]);
        Ok(())
    }

    /// Start the Dynamic Export controller, replacing a running one
    pub async fn start_dynamic_export(
        &mut self,
        target_export_kw: f64,
        duration: Duration,
    ) -> Result<()> {
        self.stop_dynamic_export().await;
        let params = DynamicExportParams {
            target_export_kw,
            duration,
            ..self.export_defaults.clone()
        };
        self.export_controller = Some(DynamicExportController::spawn(
            &self.name,
            self.transport.clone(),
            self.snapshot.clone(),
            params,
        ));
        Ok(())
    }

    /// Stop a running Dynamic Export controller, if any
    pub async fn stop_dynamic_export(&mut self) {
        if let Some(controller) = self.export_controller.take() {
            controller.stop().await;
        }
    }

    pub fn dynamic_export_active(&self) -> bool {
        self.export_controller
            .as_ref()
            .is_some_and(|c| c.is_running())
    }

    /// Shut down: stop the controller and close the transport
    pub async fn shutdown(&mut self) {
        self.stop_dynamic_export().await;
        if self.save_pending {
            if let Err(e) = self.persistence.save(&self.tracker.to_state()) {
                self.logger.warn(&format!("Final state save failed: {}", e));
            }
        }
        self.transport.close().await;
    }
}
