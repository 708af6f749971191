//! Dispatch command frame encoding and decoding
//!
//! The inverter's manual override ("dispatch") is driven by one fixed
//! 11-register write at 0x0880. Power is carried with a 32000 offset
//! (charge below, discharge above), SOC as a 0..255 byte, duration in
//! seconds. The same conventions are read back from the dispatch status
//! block for reconciliation.

use crate::registers::FieldMap;
use std::time::Duration;

/// Base address of the dispatch command frame
pub const DISPATCH_ADDRESS: u16 = 0x0880;

/// Offset applied to the power register; values below mean charge,
/// above mean discharge
pub const POWER_OFFSET: i64 = 32000;

/// Dispatch active flag values
pub const DISPATCH_START: u16 = 1;
pub const DISPATCH_STOP: u16 = 0;

/// Default energy-routing byte
pub const ENERGY_ROUTING_DEFAULT: u16 = 255;

/// Dispatch mode selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Battery power control with an SOC limit
    PowerWithSoc,
    /// Block battery charging; the power register carries a raw zero
    NoBatteryCharge,
    /// Power control issued by the Dynamic Export controller. On the wire
    /// this is vendor mode 2; the distinct value exists only in the local
    /// snapshot so reads can tell controller-owned dispatch from manual
    /// dispatch.
    DynamicExport,
}

/// Snapshot-only marker for controller-owned dispatch; never written to
/// the device
pub const DISPATCH_MODE_DYNAMIC_EXPORT: u16 = 21;

impl DispatchMode {
    /// Mode value written into the command frame. Only vendor-defined
    /// values go on the wire.
    pub fn register_value(self) -> u16 {
        match self {
            DispatchMode::PowerWithSoc | DispatchMode::DynamicExport => 2,
            DispatchMode::NoBatteryCharge => 19,
        }
    }

    /// Mode value recorded in the snapshot
    pub fn snapshot_value(self) -> u16 {
        match self {
            DispatchMode::PowerWithSoc => 2,
            DispatchMode::NoBatteryCharge => 19,
            DispatchMode::DynamicExport => DISPATCH_MODE_DYNAMIC_EXPORT,
        }
    }

    pub fn from_register(value: u16) -> Option<Self> {
        match value {
            2 => Some(DispatchMode::PowerWithSoc),
            19 => Some(DispatchMode::NoBatteryCharge),
            DISPATCH_MODE_DYNAMIC_EXPORT => Some(DispatchMode::DynamicExport),
            _ => None,
        }
    }
}

/// Convert an SOC percentage to the dispatch register byte.
///
/// Scaled as 255/100 rather than a 2.55 literal so half points like
/// 50 % land exactly on .5 before rounding.
pub fn soc_percent_to_register(percent: f64) -> u16 {
    let raw = (percent * 255.0 / 100.0).round();
    raw.clamp(0.0, 255.0) as u16
}

/// A semantic dispatch intent, encodable as the 11-register frame
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchCommand {
    pub start: bool,
    pub mode: DispatchMode,
    /// Signed power in watts; positive discharges the battery, negative
    /// charges it
    pub power_watts: i64,
    pub soc_percent: f64,
    pub duration: Duration,
    /// Energy-routing byte, 255 by default
    pub energy_routing: u16,
    /// PV switch byte (0, 1 or 2)
    pub pv_switch: u16,
}

impl DispatchCommand {
    /// Force-charge at `watts` until the battery reaches `soc_target`
    pub fn charge(watts: i64, soc_target: f64, duration: Duration) -> Self {
        Self {
            start: true,
            mode: DispatchMode::PowerWithSoc,
            power_watts: -watts.abs(),
            soc_percent: soc_target,
            duration,
            energy_routing: ENERGY_ROUTING_DEFAULT,
            pv_switch: 0,
        }
    }

    /// Force-discharge at `watts` until the battery drops to `soc_cutoff`
    pub fn discharge(watts: i64, soc_cutoff: f64, duration: Duration) -> Self {
        Self {
            start: true,
            mode: DispatchMode::PowerWithSoc,
            power_watts: watts.abs(),
            soc_percent: soc_cutoff,
            duration,
            energy_routing: ENERGY_ROUTING_DEFAULT,
            pv_switch: 0,
        }
    }

    /// Hold the battery out of charging
    pub fn no_battery_charge(duration: Duration) -> Self {
        Self {
            start: true,
            mode: DispatchMode::NoBatteryCharge,
            power_watts: 0,
            soc_percent: 0.0,
            duration,
            energy_routing: ENERGY_ROUTING_DEFAULT,
            pv_switch: 0,
        }
    }

    /// Controller-owned export dispatch
    pub fn dynamic_export(watts: i64, soc_cutoff: f64, duration: Duration) -> Self {
        Self {
            start: true,
            mode: DispatchMode::DynamicExport,
            power_watts: watts,
            soc_percent: soc_cutoff,
            duration,
            energy_routing: ENERGY_ROUTING_DEFAULT,
            pv_switch: 0,
        }
    }

    /// The constant idle frame that cancels any active dispatch
    pub fn reset() -> Self {
        Self {
            start: false,
            mode: DispatchMode::PowerWithSoc,
            power_watts: 0,
            soc_percent: 0.0,
            duration: Duration::from_secs(90),
            energy_routing: ENERGY_ROUTING_DEFAULT,
            pv_switch: 0,
        }
    }

    /// Encode as the 11-register frame written at `DISPATCH_ADDRESS`
    pub fn encode(&self) -> [u16; 11] {
        // Mode 19 carries a raw zero in the power slot, every other mode
        // uses the offset convention
        let power_value: u32 = match self.mode {
            DispatchMode::NoBatteryCharge => 0,
            _ => (POWER_OFFSET + self.power_watts).clamp(0, u32::MAX as i64) as u32,
        };
        let duration_secs = self.duration.as_secs().min(65535) as u16;

        [
            if self.start { DISPATCH_START } else { DISPATCH_STOP },
            (power_value >> 16) as u16,
            (power_value & 0xFFFF) as u16,
            0,
            0,
            self.mode.register_value(),
            soc_percent_to_register(self.soc_percent),
            0,
            duration_secs,
            self.energy_routing,
            self.pv_switch,
        ]
    }
}

/// Dispatch state recovered from the status block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchState {
    pub active: bool,
    pub mode: Option<DispatchMode>,
    /// Signed power in watts, offset already removed
    pub power_watts: i64,
}

/// Decode the dispatch view from a coordinator snapshot. Returns `None`
/// when the dispatch block has never been read.
pub fn decode_dispatch_state(data: &FieldMap) -> Option<DispatchState> {
    let start = data.get("dispatch_start")?;
    let power = data.get("dispatch_power").copied().unwrap_or(0.0);
    let mode = data
        .get("dispatch_mode")
        .and_then(|m| DispatchMode::from_register(*m as u16));
    Some(DispatchState {
        active: *start != 0.0,
        mode,
        power_watts: power as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soc_register_bounds() {
        assert_eq!(soc_percent_to_register(0.0), 0);
        assert_eq!(soc_percent_to_register(100.0), 255);
        // 50 % is exactly 127.5 and must round up
        assert_eq!(soc_percent_to_register(50.0), 128);
        assert_eq!(soc_percent_to_register(-5.0), 0);
        assert_eq!(soc_percent_to_register(150.0), 255);
    }

    #[test]
    fn dynamic_export_uses_vendor_mode_on_the_wire() {
        let cmd = DispatchCommand::dynamic_export(2000, 10.0, Duration::from_secs(600));
        let frame = cmd.encode();
        assert_eq!(frame[5], 2);
        assert_eq!(cmd.mode.snapshot_value(), DISPATCH_MODE_DYNAMIC_EXPORT);
        assert_eq!(
            DispatchMode::from_register(DISPATCH_MODE_DYNAMIC_EXPORT),
            Some(DispatchMode::DynamicExport)
        );
    }

    #[test]
    fn charge_encodes_below_offset() {
        let cmd = DispatchCommand::charge(1500, 100.0, Duration::from_secs(3600));
        let frame = cmd.encode();
        assert_eq!(frame[0], DISPATCH_START);
        assert_eq!(((frame[1] as u32) << 16) | frame[2] as u32, 30500);
        assert_eq!(frame[5], 2);
        assert_eq!(frame[6], 255);
        assert_eq!(frame[8], 3600);
        assert_eq!(frame[9], ENERGY_ROUTING_DEFAULT);
    }

    #[test]
    fn discharge_encodes_above_offset() {
        let cmd = DispatchCommand::discharge(2000, 10.0, Duration::from_secs(600));
        let frame = cmd.encode();
        assert_eq!(((frame[1] as u32) << 16) | frame[2] as u32, 34000);
        assert_eq!(frame[6], 26); // round(10 * 2.55)
    }

    #[test]
    fn zero_power_is_exact_offset() {
        let cmd = DispatchCommand::dynamic_export(0, 10.0, Duration::from_secs(60));
        let frame = cmd.encode();
        assert_eq!(((frame[1] as u32) << 16) | frame[2] as u32, 32000);
    }

    #[test]
    fn no_battery_charge_uses_raw_zero() {
        let cmd = DispatchCommand::no_battery_charge(Duration::from_secs(1800));
        let frame = cmd.encode();
        assert_eq!(frame[1], 0);
        assert_eq!(frame[2], 0);
        assert_eq!(frame[5], 19);
    }

    #[test]
    fn duration_caps_at_register_width() {
        let cmd = DispatchCommand::discharge(1000, 10.0, Duration::from_secs(100_000));
        assert_eq!(cmd.encode()[8], 65535);
    }

    #[test]
    fn reset_frame_is_idle() {
        let frame = DispatchCommand::reset().encode();
        assert_eq!(frame[0], DISPATCH_STOP);
        assert_eq!(((frame[1] as u32) << 16) | frame[2] as u32, 32000);
        assert_eq!(frame[6], 0);
        assert_eq!(frame[8], 90);
    }

    #[test]
    fn round_trip_recovers_sign() {
        for watts in [-8000i64, -1, 0, 1, 9999] {
            let cmd = DispatchCommand {
                start: true,
                mode: DispatchMode::PowerWithSoc,
                power_watts: watts,
                soc_percent: 50.0,
                duration: Duration::from_secs(60),
                energy_routing: ENERGY_ROUTING_DEFAULT,
                pv_switch: 0,
            };
            let frame = cmd.encode();
            let mut snapshot = FieldMap::new();
            snapshot.insert("dispatch_start".to_string(), frame[0] as f64);
            snapshot.insert(
                "dispatch_power".to_string(),
                (((frame[1] as u32) << 16) | frame[2] as u32) as f64 - 32000.0,
            );
            snapshot.insert("dispatch_mode".to_string(), frame[5] as f64);
            let state = decode_dispatch_state(&snapshot).unwrap();
            assert!(state.active);
            assert_eq!(state.power_watts, watts);
            assert_eq!(state.mode, Some(DispatchMode::PowerWithSoc));
        }
    }

    #[test]
    fn decode_absent_block_is_none() {
        assert!(decode_dispatch_state(&FieldMap::new()).is_none());
    }
}
