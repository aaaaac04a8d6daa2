//! CAN channel catalogue and pure frame encoders.
//!
//! Encoder function shape and the per-command decode style are inverted
//! from `TheerasakPing-bms-monitor/src/bms_parser.rs`'s `parse_*` family
//! (there: wire bytes -> typed value; here: typed state -> wire bytes). CAN
//! identifiers follow the public, widely implemented Victron/
//! `dbus-serialbattery` battery-CAN numbering, since
//! `original_source/components/can_publisher/conversion_table.cpp` itself
//! was retrieved with its PGN encoder bodies stripped (see DESIGN.md).

use crate::cvl::CvlResult;
use crate::energy::EnergyState;
use crate::telemetry::LiveData;
use crate::transport::CanFrame;

/// Everything an encoder might need for one tick. Broader than a plain
/// `encode(live_data)` signature because the CVL/energy frames
/// need state that lives outside `LiveData`; every encoder still reads it
/// and nothing else, and still returns `Option<CanFrame>`.
pub struct FrameContext<'a> {
    pub live: &'a LiveData,
    pub cvl: &'a CvlResult,
    pub energy: &'a EnergyState,
    pub identity: &'a Identity,
}

/// ASCII identity fields, padded/truncated to 8 bytes.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub manufacturer: String,
    pub battery_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmBit {
    Overvoltage = 0,
    Undervoltage = 1,
    Overcurrent = 2,
    Overtemperature = 3,
    Undertemperature = 4,
    InternalFault = 5,
    CellImbalance = 6,
    Offline = 7,
}

pub struct CanChannel {
    pub id: u32,
    pub extended: bool,
    pub dlc: u8,
    /// 0 means "inherit the publisher's global default period".
    pub period_ms: u64,
    pub tag: &'static str,
    pub encode: fn(&FrameContext) -> Option<CanFrame>,
}

pub const CHANNEL_CATALOGUE: &[CanChannel] = &[
    CanChannel {
        id: 0x356,
        extended: false,
        dlc: 8,
        period_ms: 1000,
        tag: "pack_electrical",
        encode: encode_pack_electrical,
    },
    CanChannel {
        id: 0x351,
        extended: false,
        dlc: 8,
        period_ms: 1000,
        tag: "charge_discharge_limits",
        encode: encode_limits,
    },
    CanChannel {
        id: 0x35A,
        extended: false,
        dlc: 4,
        period_ms: 1000,
        tag: "alarms_warnings",
        encode: encode_alarms,
    },
    CanChannel {
        id: 0x35E,
        extended: false,
        dlc: 8,
        period_ms: 10_000,
        tag: "manufacturer_name",
        encode: encode_manufacturer_name,
    },
    CanChannel {
        id: 0x370,
        extended: false,
        dlc: 8,
        period_ms: 10_000,
        tag: "battery_name",
        encode: encode_battery_name,
    },
    CanChannel {
        id: 0x373,
        extended: false,
        dlc: 5,
        period_ms: 1000,
        tag: "cell_extremes",
        encode: encode_cell_extremes,
    },
    CanChannel {
        id: 0x378,
        extended: false,
        dlc: 8,
        period_ms: 5000,
        tag: "energy_counters",
        encode: encode_energy_counters,
    },
];

/// Rounds half-to-even (banker's rounding), matching the fixed-point
/// convention the target CAN PGNs expect.
fn round_half_to_even(x: f64) -> i64 {
    let floor = x.floor();
    let diff = x - floor;
    let floor_i = floor as i64;
    if diff < 0.5 {
        floor_i
    } else if diff > 0.5 {
        floor_i + 1
    } else if floor_i % 2 == 0 {
        floor_i
    } else {
        floor_i + 1
    }
}

fn scaled_i16(value: f64, scale: f64) -> i16 {
    round_half_to_even(value * scale).clamp(i16::MIN as i64, i16::MAX as i64) as i16
}

fn scaled_u16(value: f64, scale: f64) -> u16 {
    round_half_to_even(value * scale).clamp(0, u16::MAX as i64) as u16
}

fn ascii_field(text: &str) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (slot, byte) in out.iter_mut().zip(text.as_bytes().iter().take(8)) {
        *slot = *byte;
    }
    out
}

fn encode_pack_electrical(ctx: &FrameContext) -> Option<CanFrame> {
    let v = ctx.live.pack_voltage_v?;
    let i = ctx.live.pack_current_a?;
    let soc = ctx.live.soc_percent?;
    let temp = ctx.live.temperature_avg_c.unwrap_or(0.0);

    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&scaled_i16(v, 100.0).to_le_bytes());
    data.extend_from_slice(&scaled_i16(i, 10.0).to_le_bytes());
    data.extend_from_slice(&scaled_i16(soc, 10.0).to_le_bytes());
    data.extend_from_slice(&scaled_i16(temp, 10.0).to_le_bytes());
    Some(CanFrame::new(0x356, data))
}

fn encode_limits(ctx: &FrameContext) -> Option<CanFrame> {
    let mut flags: u16 = 0;
    if ctx.cvl.imbalance_hold_active {
        flags |= 1 << 0;
    }
    if ctx.cvl.cell_protection_active {
        flags |= 1 << 1;
    }

    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&scaled_u16(ctx.cvl.cvl_v, 10.0).to_le_bytes());
    data.extend_from_slice(&scaled_u16(ctx.cvl.ccl_a, 10.0).to_le_bytes());
    data.extend_from_slice(&scaled_u16(ctx.cvl.dcl_a, 10.0).to_le_bytes());
    data.extend_from_slice(&flags.to_le_bytes());
    Some(CanFrame::new(0x351, data))
}

fn encode_alarms(ctx: &FrameContext) -> Option<CanFrame> {
    let mut bits: u32 = 0;
    let live = ctx.live;

    if let (Some(v), Some(cutoff)) = (live.pack_voltage_v, live.overvoltage_cutoff_mv) {
        if v * 1000.0 >= cutoff as f64 {
            bits |= 1 << AlarmBit::Overvoltage as u32;
        }
    }
    if let (Some(v), Some(cutoff)) = (live.pack_voltage_v, live.undervoltage_cutoff_mv) {
        if v * 1000.0 <= cutoff as f64 {
            bits |= 1 << AlarmBit::Undervoltage as u32;
        }
    }
    if let (Some(i), Some(limit)) = (live.pack_current_a, live.charge_overcurrent_a) {
        if limit > 0.0 && i.abs() >= limit {
            bits |= 1 << AlarmBit::Overcurrent as u32;
        }
    }
    if let Some(t) = live.temperature_max_c {
        if t >= 60.0 {
            bits |= 1 << AlarmBit::Overtemperature as u32;
        }
    }
    if let Some(t) = live.temperature_min_c {
        if t <= -20.0 {
            bits |= 1 << AlarmBit::Undertemperature as u32;
        }
    }
    if ctx.cvl.cell_protection_active {
        bits |= 1 << AlarmBit::InternalFault as u32;
    }
    if ctx.cvl.imbalance_hold_active {
        bits |= 1 << AlarmBit::CellImbalance as u32;
    }
    if live.online == Some(false) {
        bits |= 1 << AlarmBit::Offline as u32;
    }

    Some(CanFrame::new(0x35A, bits.to_le_bytes().to_vec()))
}

fn encode_manufacturer_name(ctx: &FrameContext) -> Option<CanFrame> {
    if ctx.identity.manufacturer.is_empty() {
        return None;
    }
    Some(CanFrame::new(0x35E, ascii_field(&ctx.identity.manufacturer).to_vec()))
}

fn encode_battery_name(ctx: &FrameContext) -> Option<CanFrame> {
    if ctx.identity.battery_name.is_empty() {
        return None;
    }
    Some(CanFrame::new(0x370, ascii_field(&ctx.identity.battery_name).to_vec()))
}

fn encode_cell_extremes(ctx: &FrameContext) -> Option<CanFrame> {
    let min_mv = ctx.live.cell_voltage_min_mv?;
    let max_mv = ctx.live.cell_voltage_max_mv?;
    let count = ctx.live.series_cell_count.unwrap_or(0).min(u8::MAX as u16) as u8;

    let mut data = Vec::with_capacity(5);
    data.extend_from_slice(&min_mv.to_le_bytes());
    data.extend_from_slice(&max_mv.to_le_bytes());
    data.push(count);
    Some(CanFrame::new(0x373, data))
}

fn encode_energy_counters(ctx: &FrameContext) -> Option<CanFrame> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&(ctx.energy.charged_wh.max(0.0) as u32).to_le_bytes());
    data.extend_from_slice(&(ctx.energy.discharged_wh.max(0.0) as u32).to_le_bytes());
    Some(CanFrame::new(0x378, data))
}
