//! Telemetry cache: the single source of truth for the gateway's current
//! view of the pack, refreshed by the serial engine's poll loop and read
//! by the CVL controller and CAN publisher.
//!
//! Grounded on `TheerasakPing-bms-monitor/src/bms_types.rs`'s aggregate
//! `BmsData` struct, generalized to the gateway's full telemetry field set
//! and wrapped in the `update(patch)`/`snapshot()` pattern instead of a
//! Tauri-managed `AppState`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Current view of the pack. All fields are `Option` until the first
/// successful poll of that quantity populates them; a missing field means
/// "not yet known", never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveData {
    pub pack_voltage_v: Option<f64>,
    pub pack_current_a: Option<f64>,
    pub soc_percent: Option<f64>,
    pub soh_percent: Option<f64>,
    pub cell_voltage_min_mv: Option<u16>,
    pub cell_voltage_max_mv: Option<u16>,
    pub cell_voltages_mv: Option<Vec<u16>>,
    pub temperature_avg_c: Option<f64>,
    pub temperature_mosfet_c: Option<f64>,
    pub temperature_aux_c: Option<f64>,
    pub temperature_min_c: Option<f64>,
    pub temperature_max_c: Option<f64>,
    pub online: Option<bool>,
    pub lifetime_cycle_count: Option<u32>,
    pub series_cell_count: Option<u16>,
    pub overvoltage_cutoff_mv: Option<u16>,
    pub undervoltage_cutoff_mv: Option<u16>,
    pub charge_overcurrent_a: Option<f64>,
    pub discharge_overcurrent_a: Option<f64>,
    pub capacity_ah: Option<f64>,
    pub firmware_version: Option<String>,
    /// Set once a full poll cycle has completed at least once.
    pub last_poll_ok_ms: Option<u64>,
}

impl LiveData {
    /// True once the fields the CVL controller needs are all populated.
    pub fn has_cvl_inputs(&self) -> bool {
        self.pack_voltage_v.is_some()
            && self.soc_percent.is_some()
            && self.cell_voltage_min_mv.is_some()
            && self.cell_voltage_max_mv.is_some()
    }
}

/// A partial update applied to the cache; any `None` field leaves the
/// existing cached value untouched.
#[derive(Debug, Clone, Default)]
pub struct LiveDataPatch {
    pub pack_voltage_v: Option<f64>,
    pub pack_current_a: Option<f64>,
    pub soc_percent: Option<f64>,
    pub soh_percent: Option<f64>,
    pub cell_voltage_min_mv: Option<u16>,
    pub cell_voltage_max_mv: Option<u16>,
    pub cell_voltages_mv: Option<Vec<u16>>,
    pub temperature_avg_c: Option<f64>,
    pub temperature_mosfet_c: Option<f64>,
    pub temperature_aux_c: Option<f64>,
    pub temperature_min_c: Option<f64>,
    pub temperature_max_c: Option<f64>,
    pub online: Option<bool>,
    pub lifetime_cycle_count: Option<u32>,
    pub series_cell_count: Option<u16>,
    pub overvoltage_cutoff_mv: Option<u16>,
    pub undervoltage_cutoff_mv: Option<u16>,
    pub charge_overcurrent_a: Option<f64>,
    pub discharge_overcurrent_a: Option<f64>,
    pub capacity_ah: Option<f64>,
    pub firmware_version: Option<String>,
    pub last_poll_ok_ms: Option<u64>,
}

macro_rules! apply_patch_field {
    ($target:expr, $patch:expr, $field:ident) => {
        if let Some(value) = $patch.$field {
            $target.$field = Some(value);
        }
    };
}

/// Single-lock cache of the latest `LiveData`.
#[derive(Default)]
pub struct TelemetryCache {
    data: Mutex<LiveData>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        TelemetryCache::default()
    }

    /// Merges `patch` into the cached snapshot, leaving untouched any field
    /// `patch` left as `None`.
    pub fn update(&self, patch: LiveDataPatch) {
        let mut data = self.data.lock();
        apply_patch_field!(data, patch, pack_voltage_v);
        apply_patch_field!(data, patch, pack_current_a);
        apply_patch_field!(data, patch, soc_percent);
        apply_patch_field!(data, patch, soh_percent);
        apply_patch_field!(data, patch, cell_voltage_min_mv);
        apply_patch_field!(data, patch, cell_voltage_max_mv);
        apply_patch_field!(data, patch, cell_voltages_mv);
        apply_patch_field!(data, patch, temperature_avg_c);
        apply_patch_field!(data, patch, temperature_mosfet_c);
        apply_patch_field!(data, patch, temperature_aux_c);
        apply_patch_field!(data, patch, temperature_min_c);
        apply_patch_field!(data, patch, temperature_max_c);
        apply_patch_field!(data, patch, online);
        apply_patch_field!(data, patch, lifetime_cycle_count);
        apply_patch_field!(data, patch, series_cell_count);
        apply_patch_field!(data, patch, overvoltage_cutoff_mv);
        apply_patch_field!(data, patch, undervoltage_cutoff_mv);
        apply_patch_field!(data, patch, charge_overcurrent_a);
        apply_patch_field!(data, patch, discharge_overcurrent_a);
        apply_patch_field!(data, patch, capacity_ah);
        apply_patch_field!(data, patch, firmware_version);
        apply_patch_field!(data, patch, last_poll_ok_ms);
    }

    pub fn snapshot(&self) -> LiveData {
        self.data.lock().clone()
    }
}
