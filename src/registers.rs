//! Register block catalog and raw-word decoding
//!
//! The inverter exposes its data as seven holding-register blocks. Each
//! block has a decode function that turns the raw words into named values
//! in physical units. A read that comes back shorter than the block is
//! decoded to an empty map so the caller's sticky cache is left untouched.

use std::collections::HashMap;

/// Decoded field set for one register block
pub type FieldMap = HashMap<String, f64>;

/// One contiguous holding-register block on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    pub name: &'static str,
    pub address: u16,
    pub count: u16,
}

/// Grid meter block
pub const GRID_BLOCK: RegisterBlock = RegisterBlock {
    name: "grid",
    address: 0x0010,
    count: 39,
};

/// PV meter block
pub const PV_BLOCK: RegisterBlock = RegisterBlock {
    name: "pv",
    address: 0x0090,
    count: 19,
};

/// Battery block
pub const BATTERY_BLOCK: RegisterBlock = RegisterBlock {
    name: "battery",
    address: 0x0100,
    count: 39,
};

/// Inverter block
pub const INVERTER_BLOCK: RegisterBlock = RegisterBlock {
    name: "inverter",
    address: 0x0500,
    count: 93,
};

/// PV inverter lifetime-energy block
pub const PV_INVERTER_ENERGY_BLOCK: RegisterBlock = RegisterBlock {
    name: "pv_inverter_energy",
    address: 0x08D0,
    count: 2,
};

/// Settings block
pub const SETTINGS_BLOCK: RegisterBlock = RegisterBlock {
    name: "settings",
    address: 0x0800,
    count: 86,
};

/// Dispatch state block
pub const DISPATCH_BLOCK: RegisterBlock = RegisterBlock {
    name: "dispatch",
    address: 0x0880,
    count: 9,
};

/// All pollable blocks, in poll order
pub const ALL_BLOCKS: [RegisterBlock; 7] = [
    GRID_BLOCK,
    PV_BLOCK,
    BATTERY_BLOCK,
    INVERTER_BLOCK,
    PV_INVERTER_ENERGY_BLOCK,
    SETTINGS_BLOCK,
    DISPATCH_BLOCK,
];

/// Interpret a single register as a signed 16-bit value
pub fn to_signed_16(value: u16) -> i16 {
    value as i16
}

/// Combine two registers into a signed 32-bit value (high word first)
pub fn to_signed_32(hi: u16, lo: u16) -> i32 {
    (((hi as u32) << 16) | lo as u32) as i32
}

/// Combine two registers into an unsigned 32-bit value (high word first)
pub fn to_unsigned_32(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

fn insert(map: &mut FieldMap, key: &str, value: f64) {
    map.insert(key.to_string(), value);
}

/// Decode a block read by name
pub fn decode_block(name: &str, regs: &[u16]) -> FieldMap {
    match name {
        "grid" => decode_grid(regs),
        "pv" => decode_pv(regs),
        "battery" => decode_battery(regs),
        "inverter" => decode_inverter(regs),
        "pv_inverter_energy" => decode_pv_inverter_energy(regs),
        "settings" => decode_settings(regs),
        "dispatch" => decode_dispatch(regs),
        _ => FieldMap::new(),
    }
}

/// Grid meter registers at 0x0010
pub fn decode_grid(regs: &[u16]) -> FieldMap {
    let mut map = FieldMap::new();
    if regs.len() < GRID_BLOCK.count as usize {
        return map;
    }
    insert(
        &mut map,
        "grid_energy_feed",
        to_unsigned_32(regs[0], regs[1]) as f64 * 0.01,
    );
    insert(
        &mut map,
        "grid_energy_consume",
        to_unsigned_32(regs[2], regs[3]) as f64 * 0.01,
    );
    insert(&mut map, "grid_voltage_a", regs[4] as f64);
    insert(&mut map, "grid_voltage_b", regs[5] as f64);
    insert(&mut map, "grid_voltage_c", regs[6] as f64);
    insert(&mut map, "grid_current_a", to_signed_16(regs[7]) as f64 * 0.1);
    insert(&mut map, "grid_current_b", to_signed_16(regs[8]) as f64 * 0.1);
    insert(&mut map, "grid_current_c", to_signed_16(regs[9]) as f64 * 0.1);
    insert(&mut map, "grid_frequency", regs[10] as f64 * 0.01);
    insert(
        &mut map,
        "grid_power_a",
        to_signed_32(regs[11], regs[12]) as f64,
    );
    insert(
        &mut map,
        "grid_power_b",
        to_signed_32(regs[13], regs[14]) as f64,
    );
    insert(
        &mut map,
        "grid_power_c",
        to_signed_32(regs[15], regs[16]) as f64,
    );
    insert(
        &mut map,
        "grid_power_total",
        to_signed_32(regs[17], regs[18]) as f64,
    );
    insert(
        &mut map,
        "grid_power_factor",
        to_signed_16(regs[38]) as f64 * 0.01,
    );
    map
}

/// PV meter registers at 0x0090
pub fn decode_pv(regs: &[u16]) -> FieldMap {
    let mut map = FieldMap::new();
    if regs.len() < PV_BLOCK.count as usize {
        return map;
    }
    insert(
        &mut map,
        "pv_energy_feed",
        to_unsigned_32(regs[0], regs[1]) as f64 * 0.01,
    );
    insert(&mut map, "pv_voltage_a", regs[4] as f64);
    insert(
        &mut map,
        "pv_ac_power_total",
        to_signed_32(regs[17], regs[18]) as f64,
    );
    map
}

/// Battery registers at 0x0100
pub fn decode_battery(regs: &[u16]) -> FieldMap {
    let mut map = FieldMap::new();
    if regs.len() < BATTERY_BLOCK.count as usize {
        return map;
    }
    insert(&mut map, "battery_voltage", regs[0] as f64 * 0.1);
    insert(
        &mut map,
        "battery_current",
        to_signed_16(regs[1]) as f64 * 0.1,
    );
    insert(&mut map, "battery_soc", regs[2] as f64 * 0.1);
    insert(&mut map, "battery_min_cell_voltage", regs[7] as f64 * 0.001);
    insert(&mut map, "battery_max_cell_voltage", regs[10] as f64 * 0.001);
    insert(
        &mut map,
        "battery_min_cell_temp",
        to_signed_16(regs[13]) as f64 * 0.1,
    );
    insert(
        &mut map,
        "battery_max_cell_temp",
        to_signed_16(regs[16]) as f64 * 0.1,
    );
    insert(&mut map, "battery_capacity", regs[25] as f64 * 0.1);
    insert(&mut map, "battery_soh", regs[27] as f64 * 0.1);
    insert(
        &mut map,
        "battery_charge_energy",
        to_unsigned_32(regs[32], regs[33]) as f64 * 0.1,
    );
    insert(
        &mut map,
        "battery_discharge_energy",
        to_unsigned_32(regs[34], regs[35]) as f64 * 0.1,
    );
    insert(&mut map, "battery_power", to_signed_16(regs[38]) as f64);
    map
}

/// Inverter registers at 0x0500
pub fn decode_inverter(regs: &[u16]) -> FieldMap {
    let mut map = FieldMap::new();
    if regs.len() < INVERTER_BLOCK.count as usize {
        return map;
    }
    insert(
        &mut map,
        "inv_energy_output",
        to_unsigned_32(regs[2], regs[3]) as f64 * 0.1,
    );
    insert(
        &mut map,
        "inv_energy_input",
        to_unsigned_32(regs[4], regs[5]) as f64 * 0.1,
    );
    insert(
        &mut map,
        "total_pv_energy",
        to_unsigned_32(regs[10], regs[11]) as f64 * 0.1,
    );
    insert(
        &mut map,
        "inv_temp_ambient",
        to_signed_16(regs[16]) as f64 * 0.1,
    );
    insert(
        &mut map,
        "inv_temp_boost",
        to_signed_16(regs[17]) as f64 * 0.1,
    );
    insert(
        &mut map,
        "inv_temp_inverter",
        to_signed_16(regs[18]) as f64 * 0.1,
    );
    insert(&mut map, "bus_voltage", regs[32] as f64 * 0.1);
    insert(&mut map, "pv1_voltage", regs[36] as f64 * 0.1);
    insert(&mut map, "pv2_voltage", regs[37] as f64 * 0.1);
    insert(&mut map, "pv3_voltage", regs[38] as f64 * 0.1);
    insert(&mut map, "pv1_current", regs[39] as f64 * 0.01);
    insert(&mut map, "pv2_current", regs[40] as f64 * 0.01);
    insert(&mut map, "pv3_current", regs[41] as f64 * 0.01);
    insert(&mut map, "pv1_power", regs[42] as f64);
    insert(&mut map, "pv2_power", regs[43] as f64);
    insert(&mut map, "pv3_power", regs[44] as f64);
    insert(&mut map, "pv_dc_power_total", regs[45] as f64);
    insert(
        &mut map,
        "inv_power_active",
        to_signed_32(regs[69], regs[70]) as f64,
    );
    insert(
        &mut map,
        "backup_power",
        to_signed_32(regs[91], regs[92]) as f64,
    );
    map
}

/// PV inverter lifetime-energy registers at 0x08D0
pub fn decode_pv_inverter_energy(regs: &[u16]) -> FieldMap {
    let mut map = FieldMap::new();
    if regs.len() < PV_INVERTER_ENERGY_BLOCK.count as usize {
        return map;
    }
    insert(
        &mut map,
        "pv_inverter_energy",
        to_unsigned_32(regs[0], regs[1]) as f64 * 0.01,
    );
    map
}

/// Settings registers at 0x0800
pub fn decode_settings(regs: &[u16]) -> FieldMap {
    let mut map = FieldMap::new();
    if regs.len() < SETTINGS_BLOCK.count as usize {
        return map;
    }
    insert(&mut map, "max_feed_to_grid", regs[0] as f64);
    insert(
        &mut map,
        "pv_capacity",
        to_unsigned_32(regs[1], regs[2]) as f64,
    );
    insert(&mut map, "time_period_control_flag", regs[79] as f64);
    insert(&mut map, "discharging_cutoff_soc", regs[80] as f64 * 0.1);
    insert(&mut map, "charging_cutoff_soc", regs[85] as f64 * 0.1);
    map
}

/// Dispatch state registers at 0x0880
pub fn decode_dispatch(regs: &[u16]) -> FieldMap {
    let mut map = FieldMap::new();
    if regs.len() < DISPATCH_BLOCK.count as usize {
        return map;
    }
    insert(&mut map, "dispatch_start", regs[0] as f64);
    insert(
        &mut map,
        "dispatch_power",
        to_unsigned_32(regs[1], regs[2]) as f64 - 32000.0,
    );
    insert(&mut map, "dispatch_mode", regs[5] as f64);
    insert(&mut map, "dispatch_soc", regs[6] as f64);
    insert(&mut map, "dispatch_time", regs[8] as f64);
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_conversions() {
        assert_eq!(to_signed_16(0xFFFF), -1);
        assert_eq!(to_signed_16(0x7FFF), 32767);
        assert_eq!(to_signed_32(0xFFFF, 0xFFFE), -2);
        assert_eq!(to_signed_32(0x0001, 0x0000), 65536);
        assert_eq!(to_unsigned_32(0x0001, 0x0001), 65537);
    }

    #[test]
    fn short_read_yields_empty_map() {
        assert!(decode_grid(&[0; 10]).is_empty());
        assert!(decode_battery(&[]).is_empty());
        assert!(decode_inverter(&[0; 92]).is_empty());
    }

    #[test]
    fn grid_block_decodes_power_and_energy() {
        let mut regs = vec![0u16; 39];
        regs[0] = 0x0001;
        regs[1] = 0x86A0; // 100000 -> 1000.00 kWh
        regs[10] = 5002; // 50.02 Hz
        regs[17] = 0xFFFF;
        regs[18] = 0xF448; // -3000 W (import convention negative export)
        let map = decode_grid(&regs);
        assert_eq!(map["grid_energy_feed"], 1000.0);
        assert_eq!(map["grid_frequency"], 50.02);
        assert_eq!(map["grid_power_total"], -3000.0);
    }

    #[test]
    fn battery_block_scales_soc_and_temps() {
        let mut regs = vec![0u16; 39];
        regs[2] = 875; // 87.5 %
        regs[13] = (-52i16) as u16; // -5.2 C
        regs[38] = (-1500i16) as u16;
        let map = decode_battery(&regs);
        assert_eq!(map["battery_soc"], 87.5);
        assert!((map["battery_min_cell_temp"] + 5.2).abs() < 1e-9);
        assert_eq!(map["battery_power"], -1500.0);
    }

    #[test]
    fn dispatch_block_removes_power_offset() {
        let mut regs = vec![0u16; 9];
        regs[0] = 1;
        regs[1] = 0;
        regs[2] = 30500; // 32000 - 1500 -> charging 1500 W
        regs[5] = 2;
        let map = decode_dispatch(&regs);
        assert_eq!(map["dispatch_start"], 1.0);
        assert_eq!(map["dispatch_power"], -1500.0);
        assert_eq!(map["dispatch_mode"], 2.0);
    }

    #[test]
    fn inverter_block_pv_strings() {
        let mut regs = vec![0u16; 93];
        regs[42] = 1200;
        regs[43] = 800;
        regs[44] = 0;
        regs[45] = 2000;
        let map = decode_inverter(&regs);
        assert_eq!(map["pv1_power"], 1200.0);
        assert_eq!(map["pv2_power"], 800.0);
        assert_eq!(map["pv_dc_power_total"], 2000.0);
    }
}
