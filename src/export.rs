//! Dynamic Export feedback controller
//!
//! A spawned task that tracks a target grid-export power by repeatedly
//! recomputing a battery dispatch command from the live snapshot. The
//! inverter forgets a dispatch after a hardware timeout, so the current
//! command is re-sent periodically even when nothing changed.

use crate::dispatch::DispatchCommand;
use crate::logging::{LogContext, get_logger_with_context};
use crate::modbus::ModbusLike;
use crate::snapshot::SharedSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio::task::JoinHandle;

/// Proportional gain applied to the export error
const GAIN: f64 = 0.5;
/// Commands below this are not worth dispatching
const MIN_DISCHARGE_KW: f64 = 0.5;
/// With a near-zero command and the export error inside this band the
/// dispatch is released entirely
const STOP_BAND_W: f64 = 1000.0;
/// Duration written into each dispatch frame; the refresh ceiling renews
/// it long before expiry
const COMMAND_WINDOW: Duration = Duration::from_secs(600);

/// Controller tuning and limits, injected at construction
#[derive(Debug, Clone)]
pub struct DynamicExportParams {
    pub target_export_kw: f64,
    pub soc_cutoff_percent: f64,
    /// Total controller runtime before it shuts itself down
    pub duration: Duration,
    pub max_discharge_kw: f64,
    /// Zero makes the controller discharge-only
    pub max_charge_kw: f64,
    pub update_interval: Duration,
    pub debounce_threshold_kw: f64,
    pub refresh_ceiling: Duration,
}

/// One feedback step: new commanded power from the last command and the
/// observed grid power. Positive grid power is import; export shows up
/// negative.
pub fn next_command_kw(params: &DynamicExportParams, last_kw: f64, grid_power_w: f64) -> f64 {
    let current_export_w = if grid_power_w < 0.0 {
        -grid_power_w
    } else {
        0.0
    };
    let error_w = params.target_export_kw * 1000.0 - current_export_w;
    let correction_kw = error_w * GAIN / 1000.0;
    (last_kw + correction_kw).clamp(-params.max_charge_kw, params.max_discharge_kw)
}

/// Export error in watts for the stop-band check
pub fn export_error_w(params: &DynamicExportParams, grid_power_w: f64) -> f64 {
    let current_export_w = if grid_power_w < 0.0 {
        -grid_power_w
    } else {
        0.0
    };
    params.target_export_kw * 1000.0 - current_export_w
}

/// Handle to a running Dynamic Export task
pub struct DynamicExportController {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DynamicExportController {
    /// Spawn the feedback loop for one inverter
    pub fn spawn(
        inverter_name: &str,
        transport: Arc<dyn ModbusLike>,
        snapshot: SharedSnapshot,
        params: DynamicExportParams,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let name = inverter_name.to_string();
        let handle = tokio::spawn(run_loop(name, transport, snapshot, params, stop_rx));
        Self { stop_tx, handle }
    }

    /// Stop the loop. The task issues the idle dispatch frame on its way
    /// out, best effort.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

async fn run_loop(
    name: String,
    transport: Arc<dyn ModbusLike>,
    snapshot: SharedSnapshot,
    params: DynamicExportParams,
    mut stop_rx: watch::Receiver<bool>,
) {
    let logger = get_logger_with_context(LogContext::new("export").with_inverter(&name));
    logger.info(&format!(
        "Dynamic export started: target {:.2} kW for {:?}",
        params.target_export_kw, params.duration
    ));

    let started_at = Instant::now();
    let mut ticker = tokio::time::interval(params.update_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_command_kw = 0.0_f64;
    let mut last_send: Option<Instant> = None;
    let mut dispatch_active = false;

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        if started_at.elapsed() >= params.duration {
            logger.info("Dynamic export duration elapsed");
            break;
        }

        let Some(grid_power_w) = snapshot.value("grid_power_total") else {
            // No grid reading yet; nothing to regulate against
            continue;
        };

        let new_kw = next_command_kw(&params, last_command_kw, grid_power_w);
        let error_w = export_error_w(&params, grid_power_w);

        let refresh_due = match last_send {
            Some(at) => at.elapsed() >= params.refresh_ceiling,
            None => true,
        };
        if (new_kw - last_command_kw).abs() < params.debounce_threshold_kw && !refresh_due {
            continue;
        }

        // The command to send this tick. Below the dispatch floor the
        // session either ends (on target, PV alone is sufficient) or holds
        // the minimum so the device-side command window cannot lapse while
        // still off target.
        let command_kw = if new_kw.abs() >= MIN_DISCHARGE_KW {
            new_kw
        } else if error_w.abs() < STOP_BAND_W {
            logger.info(&format!(
                "On target (error {:.0} W), PV alone is sufficient; stopping",
                error_w
            ));
            if send_frame(&*transport, &DispatchCommand::reset(), &logger).await {
                snapshot.apply_patch(&[
                    ("dispatch_start", Some(0.0)),
                    ("dispatch_power", Some(0.0)),
                    ("dispatch_mode", Some(0.0)),
                ]);
            }
            dispatch_active = false;
            break;
        } else {
            MIN_DISCHARGE_KW
        };

        let window = COMMAND_WINDOW.min(params.duration.saturating_sub(started_at.elapsed()));
        let watts = (command_kw * 1000.0).round() as i64;
        let command =
            DispatchCommand::dynamic_export(watts, params.soc_cutoff_percent, window);
        if send_frame(&*transport, &command, &logger).await {
            logger.debug(&format!(
                "Commanded {:.2} kW (grid {:.0} W, error {:.0} W)",
                command_kw, grid_power_w, error_w
            ));
            snapshot.apply_patch(&[
                ("dispatch_start", Some(1.0)),
                ("dispatch_power", Some(watts as f64)),
                (
                    "dispatch_mode",
                    Some(f64::from(crate::dispatch::DISPATCH_MODE_DYNAMIC_EXPORT)),
                ),
            ]);
            dispatch_active = true;
            last_command_kw = command_kw;
            last_send = Some(Instant::now());
        }
    }

    if dispatch_active {
        send_frame(&*transport, &DispatchCommand::reset(), &logger).await;
    }
    logger.info("Dynamic export stopped");
}

async fn send_frame(
    transport: &dyn ModbusLike,
    command: &DispatchCommand,
    logger: &crate::logging::StructuredLogger,
) -> bool {
    let frame = command.encode();
    match transport
        .write_multiple_registers(crate::dispatch::DISPATCH_ADDRESS, &frame)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            logger.warn(&format!("Dispatch write failed: {}", e));
            false
        }
    }
}
