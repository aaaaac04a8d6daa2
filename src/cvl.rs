//! CVL/CCL/DCL controller: a deterministic, side-effect-free state machine
//! converting pack telemetry into a charge voltage limit and charge/
//! discharge current limits, with cell-level overshoot protection and
//! recovery ramping.
//!
//! Ported field-for-field from
//! `original_source/components/can_publisher/cvl_logic.c`'s
//! `cvl_compute_limits` (the `cvl_inputs_t`/`cvl_config_snapshot_t`/
//! `cvl_computation_result_t`/`cvl_runtime_state_t` structs there map
//! directly onto `CvlInputs`/`CvlConfig`/`CvlResult`/`CvlRuntime` here).

use serde::{Deserialize, Serialize};

use crate::telemetry::LiveData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CvlState {
    Bulk,
    Transition,
    FloatApproach,
    Float,
    ImbalanceHold,
    Sustain,
}

/// Immutable configuration snapshot consulted by the controller on every
/// tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CvlConfig {
    pub enabled: bool,
    pub series_cell_count: u16,
    pub bulk_target_voltage_v: f64,

    pub bulk_soc_percent: f64,
    pub transition_soc_percent: f64,
    pub float_soc_percent: f64,
    pub float_exit_soc_percent: f64,

    pub approach_offset_mv: f64,
    pub float_offset_mv: f64,

    pub imbalance_engage_mv: f64,
    pub imbalance_release_mv: f64,
    pub imbalance_drop_per_mv_v: f64,
    pub imbalance_drop_max_v: f64,

    pub cell_safety_threshold_v: f64,
    pub cell_safety_release_v: f64,
    pub nominal_cell_max_v: f64,
    pub cell_min_float_voltage_v: f64,

    pub cell_protection_kp: f64,
    pub nominal_current_a: f64,
    pub max_recovery_step_v: f64,

    pub sustain_soc_entry_percent: f64,
    pub sustain_soc_exit_percent: f64,
    pub sustain_cell_voltage_v: f64,
    pub sustain_ccl_cap_a: f64,
    pub sustain_dcl_cap_a: f64,

    pub minimum_ccl_in_float_a: f64,
}

impl CvlConfig {
    /// `sustain_exit > sustain_entry` decides whether the sustain region is
    /// configured at all; an absent sustain region (e.g. both left at 0)
    /// makes this false.
    pub fn sustain_supported(&self) -> bool {
        self.sustain_soc_exit_percent > self.sustain_soc_entry_percent
    }

    fn abs_max_voltage(&self) -> f64 {
        self.nominal_cell_max_v * self.series_cell_count as f64
    }

    fn min_float_voltage(&self) -> f64 {
        self.cell_min_float_voltage_v * self.series_cell_count as f64
    }

    fn sustain_voltage(&self) -> f64 {
        self.sustain_cell_voltage_v * self.series_cell_count as f64
    }
}

impl Default for CvlConfig {
    /// A representative 16s LiFePO4 configuration; deployments override
    /// every field from their own settings file (see `config.rs`).
    fn default() -> Self {
        CvlConfig {
            enabled: true,
            series_cell_count: 16,
            bulk_target_voltage_v: 58.4,
            bulk_soc_percent: 60.0,
            transition_soc_percent: 80.0,
            float_soc_percent: 98.0,
            float_exit_soc_percent: 95.0,
            approach_offset_mv: 50.0,
            float_offset_mv: 400.0,
            imbalance_engage_mv: 100.0,
            imbalance_release_mv: 50.0,
            imbalance_drop_per_mv_v: 0.001,
            imbalance_drop_max_v: 0.5,
            cell_safety_threshold_v: 3.8,
            cell_safety_release_v: 3.7,
            nominal_cell_max_v: 3.65,
            cell_min_float_voltage_v: 3.0,
            cell_protection_kp: 1.0,
            nominal_current_a: 100.0,
            max_recovery_step_v: 0.05,
            sustain_soc_entry_percent: 5.0,
            sustain_soc_exit_percent: 10.0,
            sustain_cell_voltage_v: 3.2,
            sustain_ccl_cap_a: 5.0,
            sustain_dcl_cap_a: 20.0,
            minimum_ccl_in_float_a: 20.0,
        }
    }
}

/// Persists between controller ticks: the hysteresis memory the state
/// machine needs to avoid flapping at threshold boundaries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CvlRuntime {
    pub state: CvlState,
    pub cvl_v: f64,
    pub cell_protection_latched: bool,
    pub imbalance_hold_active: bool,
    pub sustain_active: bool,
}

impl Default for CvlRuntime {
    fn default() -> Self {
        CvlRuntime {
            state: CvlState::Bulk,
            cvl_v: 0.0,
            cell_protection_latched: false,
            imbalance_hold_active: false,
            sustain_active: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CvlResult {
    pub state: CvlState,
    pub cvl_v: f64,
    pub ccl_a: f64,
    pub dcl_a: f64,
    pub imbalance_hold_active: bool,
    pub cell_protection_active: bool,
}

/// Inputs extracted from `LiveData` for one controller tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CvlInputs {
    pub soc_percent: f64,
    pub cell_imbalance_mv: f64,
    pub pack_current_a: f64,
    pub max_cell_voltage_v: f64,
    pub base_ccl_limit_a: f64,
    pub base_dcl_limit_a: f64,
}

impl CvlInputs {
    /// Pulls the controller's inputs out of a telemetry snapshot. Missing
    /// fields degrade gracefully (imbalance 0, voltages 0) rather than
    /// failing, matching the controller's "never fails" contract.
    pub fn from_live_data(live: &LiveData) -> CvlInputs {
        let min_mv = live.cell_voltage_min_mv.unwrap_or(0);
        let max_mv = live.cell_voltage_max_mv.unwrap_or(0);
        let cell_imbalance_mv = if live.cell_voltage_min_mv.is_some() && live.cell_voltage_max_mv.is_some() {
            (max_mv as f64 - min_mv as f64).max(0.0)
        } else {
            0.0
        };

        let charge_oc = live.charge_overcurrent_a.unwrap_or(0.0);
        let discharge_oc = live.discharge_overcurrent_a.unwrap_or(0.0);
        let base_ccl_limit_a = if charge_oc > 0.0 { charge_oc } else { discharge_oc };
        let base_dcl_limit_a = if discharge_oc > 0.0 { discharge_oc } else { charge_oc };

        CvlInputs {
            soc_percent: live.soc_percent.unwrap_or(0.0).max(0.0),
            cell_imbalance_mv,
            pack_current_a: live.pack_current_a.unwrap_or(0.0),
            max_cell_voltage_v: max_mv as f64 / 1000.0,
            base_ccl_limit_a,
            base_dcl_limit_a,
        }
    }
}

fn sanitize(x: f64) -> f64 {
    if x.is_finite() {
        x.max(0.0)
    } else {
        0.0
    }
}

fn classify_soc_state(soc: f64, config: &CvlConfig, previous: CvlState) -> CvlState {
    let natural = if soc >= config.float_soc_percent {
        CvlState::Float
    } else if soc >= config.transition_soc_percent {
        CvlState::FloatApproach
    } else if soc >= config.bulk_soc_percent {
        CvlState::Transition
    } else {
        CvlState::Bulk
    };

    if previous == CvlState::Float && soc >= config.float_exit_soc_percent {
        return CvlState::Float;
    }
    if previous == CvlState::FloatApproach && natural == CvlState::Transition {
        return if soc + 0.25 < config.transition_soc_percent {
            CvlState::Transition
        } else {
            CvlState::FloatApproach
        };
    }
    natural
}

/// Computes one controller tick. Deterministic and side-effect-free except
/// for the hysteresis memory carried in `runtime`, which this function
/// updates in place.
pub fn compute_limits(inputs: &CvlInputs, config: &CvlConfig, runtime: &mut CvlRuntime) -> CvlResult {
    if !config.enabled {
        *runtime = CvlRuntime {
            state: CvlState::Bulk,
            cvl_v: config.bulk_target_voltage_v,
            cell_protection_latched: false,
            imbalance_hold_active: false,
            sustain_active: false,
        };
        return CvlResult {
            state: CvlState::Bulk,
            cvl_v: sanitize(config.bulk_target_voltage_v),
            ccl_a: sanitize(inputs.base_ccl_limit_a),
            dcl_a: sanitize(inputs.base_dcl_limit_a),
            imbalance_hold_active: false,
            cell_protection_active: false,
        };
    }

    let soc = inputs.soc_percent.max(0.0);

    if config.sustain_supported() {
        if runtime.sustain_active {
            if soc >= config.sustain_soc_exit_percent {
                runtime.sustain_active = false;
            }
        } else if soc <= config.sustain_soc_entry_percent {
            runtime.sustain_active = true;
        }
    } else {
        runtime.sustain_active = false;
    }

    // While sustain is active the imbalance-hold flag is frozen: neither
    // released nor re-armed. It resumes tracking fresh once sustain exits.
    if !runtime.sustain_active {
        if runtime.imbalance_hold_active {
            if inputs.cell_imbalance_mv <= config.imbalance_release_mv {
                runtime.imbalance_hold_active = false;
            }
        } else if inputs.cell_imbalance_mv > config.imbalance_engage_mv {
            runtime.imbalance_hold_active = true;
        }
    }

    let state = if runtime.sustain_active {
        CvlState::Sustain
    } else if runtime.imbalance_hold_active {
        CvlState::ImbalanceHold
    } else {
        classify_soc_state(soc, config, runtime.state)
    };

    let min_float_voltage = config.min_float_voltage();
    let float_ccl_cap = inputs.base_ccl_limit_a.min(config.minimum_ccl_in_float_a);

    let (state_cvl, ccl_state_cap, dcl_state_cap) = match state {
        CvlState::Bulk | CvlState::Transition => {
            (config.bulk_target_voltage_v, inputs.base_ccl_limit_a, inputs.base_dcl_limit_a)
        }
        CvlState::FloatApproach => {
            let target = (config.bulk_target_voltage_v - config.approach_offset_mv / 1000.0)
                .clamp(0.0, config.bulk_target_voltage_v);
            (target, inputs.base_ccl_limit_a, inputs.base_dcl_limit_a)
        }
        CvlState::Float => {
            let target = config.bulk_target_voltage_v - config.float_offset_mv / 1000.0;
            (target, float_ccl_cap, inputs.base_dcl_limit_a)
        }
        CvlState::ImbalanceHold => {
            let drop = config
                .imbalance_drop_max_v
                .min((inputs.cell_imbalance_mv - config.imbalance_engage_mv) * config.imbalance_drop_per_mv_v);
            let target = (config.bulk_target_voltage_v - drop).max(min_float_voltage);
            (target, float_ccl_cap, inputs.base_dcl_limit_a)
        }
        CvlState::Sustain => {
            let target = config.sustain_voltage().max(min_float_voltage);
            (target, config.sustain_ccl_cap_a, config.sustain_dcl_cap_a)
        }
    };

    let protection_was_latched = runtime.cell_protection_latched;
    if inputs.max_cell_voltage_v >= config.cell_safety_threshold_v {
        runtime.cell_protection_latched = true;
    } else if inputs.max_cell_voltage_v <= config.cell_safety_release_v {
        runtime.cell_protection_latched = false;
    }

    let mut cell_limit = f64::INFINITY;
    if runtime.cell_protection_latched {
        let overshoot = (inputs.max_cell_voltage_v - config.cell_safety_threshold_v).max(0.0);
        let current_term = 1.0 + inputs.pack_current_a.max(0.0) / config.nominal_current_a;
        cell_limit = (config.abs_max_voltage() - config.cell_protection_kp * current_term * overshoot).max(min_float_voltage);
    }
    if runtime.cell_protection_latched || protection_was_latched {
        cell_limit = cell_limit.min(runtime.cvl_v + config.max_recovery_step_v);
    }

    let final_cvl = state_cvl.min(cell_limit);
    let ratio = if state_cvl <= 0.0 { 1.0 } else { (final_cvl / state_cvl).clamp(0.0, 1.0) };

    let ccl_out = sanitize(ccl_state_cap.min(ccl_state_cap * ratio));
    let dcl_out = sanitize(dcl_state_cap.min(dcl_state_cap * ratio));
    let cvl_out = sanitize(final_cvl);

    runtime.state = state;
    runtime.cvl_v = cvl_out;

    CvlResult {
        state,
        cvl_v: cvl_out,
        ccl_a: ccl_out,
        dcl_a: dcl_out,
        imbalance_hold_active: runtime.imbalance_hold_active,
        cell_protection_active: runtime.cell_protection_latched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(soc: f64, pack_current_a: f64, max_cell_mv: u16, min_cell_mv: u16) -> CvlInputs {
        CvlInputs {
            soc_percent: soc,
            cell_imbalance_mv: (max_cell_mv as f64 - min_cell_mv as f64).max(0.0),
            pack_current_a,
            max_cell_voltage_v: max_cell_mv as f64 / 1000.0,
            base_ccl_limit_a: 100.0,
            base_dcl_limit_a: 100.0,
        }
    }

    #[test]
    fn scenario_1_mid_soc_is_bulk() {
        let config = CvlConfig::default();
        let mut runtime = CvlRuntime::default();
        let result = compute_limits(&inputs(55.0, 10.0, 3300, 3280), &config, &mut runtime);

        assert_eq!(result.state, CvlState::Bulk);
        assert!((result.cvl_v - 58.4).abs() < 1e-9);
        assert!((result.ccl_a - 100.0).abs() < 1e-9);
        assert!(!result.imbalance_hold_active);
        assert!(!result.cell_protection_active);
    }

    #[test]
    fn scenario_2_high_soc_is_float_approach() {
        let config = CvlConfig::default();
        let mut runtime = CvlRuntime::default();
        let result = compute_limits(&inputs(96.0, 10.0, 3300, 3280), &config, &mut runtime);

        assert_eq!(result.state, CvlState::FloatApproach);
        assert!((result.cvl_v - 58.35).abs() < 1e-9);
    }

    #[test]
    fn scenario_3_large_imbalance_enters_imbalance_hold() {
        let config = CvlConfig::default();
        let mut runtime = CvlRuntime::default();
        let result = compute_limits(&inputs(55.0, 10.0, 3710, 3200), &config, &mut runtime);

        assert_eq!(result.state, CvlState::ImbalanceHold);
        assert!(result.imbalance_hold_active);
        // drop = min(0.5, (510 - 100) * 0.001) = 0.41
        assert!((result.cvl_v - (58.4 - 0.41)).abs() < 1e-9);
        assert!((result.ccl_a - 20.0).abs() < 1e-9, "ccl capped to minimum_ccl_in_float_a");
    }

    #[test]
    fn imbalance_hysteresis_cycle() {
        let config = CvlConfig::default();
        let mut runtime = CvlRuntime::default();

        let r1 = compute_limits(&inputs(55.0, 0.0, 3300, 3300), &config, &mut runtime);
        assert!(!r1.imbalance_hold_active); // imbalance 0

        let r2 = compute_limits(&inputs(55.0, 0.0, 3420, 3300), &config, &mut runtime);
        assert!(r2.imbalance_hold_active); // 120 > 100 engage

        let r3 = compute_limits(&inputs(55.0, 0.0, 3380, 3300), &config, &mut runtime);
        assert!(r3.imbalance_hold_active); // 80, between release(50) and engage(100): stays held

        let r4 = compute_limits(&inputs(55.0, 0.0, 3340, 3300), &config, &mut runtime);
        assert!(!r4.imbalance_hold_active); // 40 <= release(50): released

        let r5 = compute_limits(&inputs(55.0, 0.0, 3380, 3300), &config, &mut runtime);
        assert!(!r5.imbalance_hold_active); // 80 > release but not > engage: stays normal
    }

    #[test]
    fn sustain_freezes_imbalance_hold_until_sustain_exits() {
        let config = CvlConfig::default();
        let mut runtime = CvlRuntime::default();

        // soc 4% enters sustain (entry 5%).
        let r1 = compute_limits(&inputs(4.0, 0.0, 3300, 3300), &config, &mut runtime);
        assert_eq!(r1.state, CvlState::Sustain);

        // Imbalance spikes well past the engage threshold (210mv > 100mv)
        // while sustain is active: the hold flag must stay frozen at false.
        let r2 = compute_limits(&inputs(4.0, 0.0, 3410, 3200), &config, &mut runtime);
        assert_eq!(r2.state, CvlState::Sustain);
        assert!(!runtime.imbalance_hold_active);

        // soc climbs to 12% (exit 10%): sustain exits. Imbalance is now
        // 80mv, between release(50) and engage(100) -- a fresh evaluation
        // keeps the pack out of imbalance-hold rather than carrying over a
        // stale `true` from while sustain was active.
        let r3 = compute_limits(&inputs(12.0, 0.0, 3380, 3300), &config, &mut runtime);
        assert!(!runtime.sustain_active);
        assert!(!r3.imbalance_hold_active);
        assert_ne!(r3.state, CvlState::ImbalanceHold);
    }

    #[test]
    fn monotone_soc_ramp_has_no_backward_jumps() {
        let config = CvlConfig::default();
        let mut runtime = CvlRuntime::default();
        let mut seen_states = Vec::new();
        let mut soc = 50.0;
        while soc <= 99.0 {
            let result = compute_limits(&inputs(soc, 0.0, 3300, 3300), &config, &mut runtime);
            if seen_states.last() != Some(&result.state) {
                seen_states.push(result.state);
            }
            soc += 1.0;
        }
        assert_eq!(
            seen_states,
            vec![CvlState::Transition, CvlState::FloatApproach, CvlState::Float]
        );
    }

    #[test]
    fn disabled_controller_short_circuits_to_bulk() {
        let mut config = CvlConfig::default();
        config.enabled = false;
        let mut runtime = CvlRuntime::default();
        let result = compute_limits(&inputs(96.0, 10.0, 3710, 3200), &config, &mut runtime);

        assert_eq!(result.state, CvlState::Bulk);
        assert!((result.cvl_v - config.bulk_target_voltage_v).abs() < 1e-9);
        assert_eq!(result.ccl_a, 100.0);
    }

    #[test]
    fn cell_protection_engages_and_recovers_with_a_ramp() {
        let mut config = CvlConfig::default();
        config.cell_safety_threshold_v = 3.60;
        config.cell_safety_release_v = 3.50;
        config.max_recovery_step_v = 0.02;
        let mut runtime = CvlRuntime::default();

        let engaged = compute_limits(&inputs(55.0, 0.0, 3650, 3280), &config, &mut runtime);
        assert!(engaged.cell_protection_active);
        assert!(engaged.cvl_v < config.bulk_target_voltage_v);

        let still_recovering = compute_limits(&inputs(55.0, 0.0, 3550, 3280), &config, &mut runtime);
        assert!(!still_recovering.cell_protection_active || still_recovering.cvl_v <= engaged.cvl_v + 0.02 + 1e-9);
        assert!(still_recovering.cvl_v <= engaged.cvl_v + config.max_recovery_step_v + 1e-9);
    }

    #[test]
    fn nan_inputs_are_sanitized_to_zero_not_propagated() {
        let config = CvlConfig::default();
        let mut runtime = CvlRuntime::default();
        let result = compute_limits(
            &CvlInputs {
                soc_percent: f64::NAN,
                cell_imbalance_mv: 0.0,
                pack_current_a: 0.0,
                max_cell_voltage_v: 3.3,
                base_ccl_limit_a: f64::NAN,
                base_dcl_limit_a: 100.0,
            },
            &config,
            &mut runtime,
        );
        assert!(result.cvl_v.is_finite());
        assert!(result.ccl_a.is_finite());
        assert!(result.ccl_a >= 0.0);
    }
}
