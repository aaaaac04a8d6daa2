//! Per-register unit table, locking down which scale factor each register
//! uses so the rest of the crate never applies an ad hoc one of its own.
//!
//! Every raw register value read off the wire passes through exactly one
//! of these scale conversions; nothing in the rest of the crate applies an
//! ad hoc `* 0.001`/`* 0.0001` factor of its own.

/// Fixed-point scale applied to a raw register value to obtain its
/// documented engineering unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterScale {
    /// Value is already in its target unit (e.g. cell millivolts).
    Raw,
    /// Divide by 10 (0.1 units per LSB) — temperatures, overcurrent limits.
    Tenths,
    /// Divide by 100 (0.01 units per LSB) — voltages, SOC/SOH, capacity.
    Hundredths,
}

impl RegisterScale {
    pub fn apply_u16(self, raw: u16) -> f64 {
        match self {
            RegisterScale::Raw => raw as f64,
            RegisterScale::Tenths => raw as f64 / 10.0,
            RegisterScale::Hundredths => raw as f64 / 100.0,
        }
    }

    pub fn apply_i16(self, raw: i16) -> f64 {
        match self {
            RegisterScale::Raw => raw as f64,
            RegisterScale::Tenths => raw as f64 / 10.0,
            RegisterScale::Hundredths => raw as f64 / 100.0,
        }
    }
}

/// Documents, in one place, the scale locked for each status query's
/// numeric fields. See SPEC_FULL.md §3.1 for the resolved table.
pub const REGISTER_SCALE_NOTES: &[(&str, RegisterScale)] = &[
    ("pack_voltage_v", RegisterScale::Hundredths),
    ("pack_current_a", RegisterScale::Hundredths),
    ("cell_voltage_mv", RegisterScale::Raw),
    ("soc_percent", RegisterScale::Hundredths),
    ("soh_percent", RegisterScale::Hundredths),
    ("temperature_c", RegisterScale::Tenths),
    ("capacity_ah", RegisterScale::Hundredths),
    ("overvoltage_cutoff_mv", RegisterScale::Raw),
    ("undervoltage_cutoff_mv", RegisterScale::Raw),
    ("charge_overcurrent_a", RegisterScale::Tenths),
    ("discharge_overcurrent_a", RegisterScale::Tenths),
];
