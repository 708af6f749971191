//! Dynamic Export controller behavior against a mock transport

use async_trait::async_trait;
use neovolt::error::Result;
use neovolt::export::{DynamicExportController, DynamicExportParams};
use neovolt::modbus::ModbusLike;
use neovolt::registers::FieldMap;
use neovolt::snapshot::SharedSnapshot;
use std::sync::Arc;
use std::time::Duration;

struct RecordingModbus {
    writes: std::sync::Mutex<Vec<(u16, Vec<u16>)>>,
}

impl RecordingModbus {
    fn new() -> Self {
        Self {
            writes: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn frames(&self) -> Vec<(u16, Vec<u16>)> {
        self.writes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl ModbusLike for RecordingModbus {
    async fn read_holding_registers(&self, _address: u16, count: u16) -> Result<Vec<u16>> {
        Ok(vec![0; count as usize])
    }

    async fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        self.writes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((address, values.to_vec()));
        Ok(())
    }

    async fn test_connection(&self) -> Result<bool> {
        Ok(true)
    }

    async fn force_reconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

fn params() -> DynamicExportParams {
    DynamicExportParams {
        target_export_kw: 5.0,
        soc_cutoff_percent: 10.0,
        duration: Duration::from_secs(3600),
        max_discharge_kw: 8.0,
        max_charge_kw: 0.0,
        update_interval: Duration::from_secs(10),
        debounce_threshold_kw: 0.1,
        refresh_ceiling: Duration::from_secs(30),
    }
}

fn snapshot_with_grid(watts: f64) -> SharedSnapshot {
    let snapshot = SharedSnapshot::new();
    let mut data = FieldMap::new();
    data.insert("grid_power_total".to_string(), watts);
    snapshot.publish(data);
    snapshot
}

fn frame_power_watts(frame: &[u16]) -> i64 {
    (((frame[1] as u32) << 16) | frame[2] as u32) as i64 - 32000
}

#[tokio::test(start_paused = true)]
async fn controller_ramps_toward_target_and_resets_on_stop() {
    let mock = Arc::new(RecordingModbus::new());
    let snapshot = snapshot_with_grid(-1000.0); // exporting 1 kW unaided

    let controller =
        DynamicExportController::spawn("test", mock.clone(), snapshot.clone(), params());
    tokio::time::sleep(Duration::from_secs(35)).await;
    // The snapshot carries the controller-owned marker while the wire
    // frame uses the vendor mode
    assert_eq!(snapshot.value("dispatch_mode"), Some(21.0));
    controller.stop().await;

    let frames = mock.frames();
    assert!(frames.len() >= 3, "expected several dispatch writes");
    for (address, _) in &frames {
        assert_eq!(*address, 0x0880);
    }

    // Commands grow as the loop integrates the export error
    let first = frame_power_watts(&frames[0].1);
    let second = frame_power_watts(&frames[1].1);
    assert_eq!(first, 2000); // (5000 - 1000) * 0.5
    assert!(second > first);
    assert_eq!(frames[0].1[5], 2); // vendor dispatch mode on the wire
    assert_eq!(frames[0].1[6], 26); // 10 % SOC cutoff

    // The final frame is the idle reset
    let last = frames.last().unwrap();
    assert_eq!(last.1[0], 0);
    assert_eq!(frame_power_watts(&last.1), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_grid_reading_sends_nothing() {
    let mock = Arc::new(RecordingModbus::new());
    let snapshot = SharedSnapshot::new();

    let controller =
        DynamicExportController::spawn("test", mock.clone(), snapshot, params());
    tokio::time::sleep(Duration::from_secs(60)).await;
    controller.stop().await;

    assert!(mock.frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn discharge_only_never_commands_charge() {
    let mock = Arc::new(RecordingModbus::new());
    // Massive unaided export, way above target
    let snapshot = snapshot_with_grid(-20000.0);

    let controller =
        DynamicExportController::spawn("test", mock.clone(), snapshot, params());
    tokio::time::sleep(Duration::from_secs(65)).await;
    controller.stop().await;

    for (_, frame) in mock.frames() {
        assert!(frame_power_watts(&frame) >= 0);
    }
}

#[tokio::test(start_paused = true)]
async fn on_target_reset_ends_the_session() {
    let mock = Arc::new(RecordingModbus::new());
    // Exporting 5.5 kW unaided against a 5 kW target: inside the stop band
    let snapshot = snapshot_with_grid(-5500.0);

    let controller =
        DynamicExportController::spawn("test", mock.clone(), snapshot.clone(), params());
    tokio::time::sleep(Duration::from_secs(15)).await;

    let frames = mock.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1[0], 0); // idle frame
    assert!(!controller.is_running());
    assert_eq!(snapshot.value("dispatch_start"), Some(0.0));
    assert_eq!(snapshot.value("dispatch_mode"), Some(0.0));

    // Export dropping again later must not re-engage the dispatch
    snapshot.apply_patch(&[("grid_power_total", Some(-1000.0))]);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(mock.frames().len(), 1);
    controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn minimum_discharge_held_while_off_target() {
    let mock = Arc::new(RecordingModbus::new());
    // Exporting 7 kW against a 5 kW target: the correction pushes the
    // command to zero but the error is still outside the stop band
    let snapshot = snapshot_with_grid(-7000.0);

    let controller =
        DynamicExportController::spawn("test", mock.clone(), snapshot, params());
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(controller.is_running());

    let frames = mock.frames();
    assert!(!frames.is_empty());
    for (_, frame) in &frames {
        assert_eq!(frame[0], 1);
        assert_eq!(frame_power_watts(frame), 500);
    }
    controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn duration_expiry_stops_the_loop() {
    let mock = Arc::new(RecordingModbus::new());
    let snapshot = snapshot_with_grid(-1000.0);
    let mut p = params();
    p.duration = Duration::from_secs(25);

    let controller = DynamicExportController::spawn("test", mock.clone(), snapshot, p);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!controller.is_running());
    controller.stop().await;

    // Writes stop after expiry; the last one is the reset frame
    let frames = mock.frames();
    let last = frames.last().unwrap();
    assert_eq!(last.1[0], 0);
}
