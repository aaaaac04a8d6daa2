//! Energy integrator, grounded on
//! `original_source/.../storage/nvs_energy.c`'s accumulate/sanitize/
//! persist-contract shape, ported from the ESP NVS blob to a generic
//! `PersistenceStore` trait.

use thiserror::Error;

const MAX_INTEGRATION_GAP_S: f64 = 10.0;

/// Charged/discharged energy counters. Always non-negative and finite.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnergyState {
    pub charged_wh: f64,
    pub discharged_wh: f64,
}

impl EnergyState {
    fn sanitized(self) -> EnergyState {
        EnergyState {
            charged_wh: sanitize_energy_value(self.charged_wh),
            discharged_wh: sanitize_energy_value(self.discharged_wh),
        }
    }
}

fn sanitize_energy_value(x: f64) -> f64 {
    if x.is_finite() && x >= 0.0 {
        x
    } else {
        0.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("persisted state not found")]
    NotFound,
    #[error("persistence I/O error: {0}")]
    Io(String),
}

/// Durable store for `EnergyState`, implemented by whatever platform
/// key-value storage is available.
pub trait PersistenceStore: Send {
    fn init(&mut self) -> Result<(), PersistenceError>;
    fn load(&mut self) -> Result<EnergyState, PersistenceError>;
    fn store(&mut self, state: EnergyState) -> Result<(), PersistenceError>;
    fn erase(&mut self) -> Result<(), PersistenceError>;
}

/// In-memory `PersistenceStore` used by tests and by deployments that have
/// not wired up real storage yet; `load` before any `store` reports
/// `NotFound`, matching a freshly erased real store.
#[derive(Debug, Default)]
pub struct InMemoryPersistenceStore {
    state: Option<EnergyState>,
}

impl PersistenceStore for InMemoryPersistenceStore {
    fn init(&mut self) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn load(&mut self) -> Result<EnergyState, PersistenceError> {
        self.state.map(EnergyState::sanitized).ok_or(PersistenceError::NotFound)
    }

    fn store(&mut self, state: EnergyState) -> Result<(), PersistenceError> {
        self.state = Some(state.sanitized());
        Ok(())
    }

    fn erase(&mut self) -> Result<(), PersistenceError> {
        self.state = None;
        Ok(())
    }
}

/// Accumulates charged/discharged Wh from successive `(timestamp_ms,
/// voltage, current)` samples.
#[derive(Debug, Clone, Copy)]
pub struct EnergyIntegrator {
    state: EnergyState,
    last_sample_ms: Option<u64>,
}

impl EnergyIntegrator {
    pub fn new(initial: EnergyState) -> Self {
        EnergyIntegrator {
            state: initial.sanitized(),
            last_sample_ms: None,
        }
    }

    pub fn state(&self) -> EnergyState {
        self.state
    }

    /// Restores from a persistence load, replacing any in-memory history
    /// (the gap guard re-arms on the next sample since `last_sample_ms` is
    /// reset).
    pub fn restore(&mut self, state: EnergyState) {
        self.state = state.sanitized();
        self.last_sample_ms = None;
    }

    /// Folds in one new telemetry sample. `now_ms` must come from a
    /// monotonic clock (`MonotonicClock::now_ms`).
    pub fn integrate(&mut self, now_ms: u64, pack_voltage_v: f64, pack_current_a: f64) {
        let Some(prev_ms) = self.last_sample_ms else {
            self.last_sample_ms = Some(now_ms);
            return;
        };
        self.last_sample_ms = Some(now_ms);

        let dt_s = now_ms.saturating_sub(prev_ms) as f64 / 1000.0;
        if dt_s <= 0.0 || dt_s > MAX_INTEGRATION_GAP_S {
            return;
        }

        let power_w = pack_voltage_v * pack_current_a;
        if !power_w.is_finite() {
            return;
        }
        let wh = power_w * dt_s / 3600.0;

        if power_w > 0.0 {
            self.state.charged_wh += wh;
        } else if power_w < 0.0 {
            self.state.discharged_wh += -wh;
        }
        self.state = self.state.sanitized();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_only_seeds_the_clock() {
        let mut integrator = EnergyIntegrator::new(EnergyState::default());
        integrator.integrate(1_000, 52.0, 10.0);
        assert_eq!(integrator.state(), EnergyState::default());
    }

    #[test]
    fn charging_accumulates_charged_wh() {
        let mut integrator = EnergyIntegrator::new(EnergyState::default());
        integrator.integrate(0, 50.0, 10.0);
        integrator.integrate(3_600_000, 50.0, 10.0); // 1 hour later
        // p = 500W, dt capped by the 10s gap guard -> this sample is dropped
        assert_eq!(integrator.state(), EnergyState::default());
    }

    #[test]
    fn charging_within_the_gap_window_accumulates() {
        let mut integrator = EnergyIntegrator::new(EnergyState::default());
        integrator.integrate(0, 50.0, 10.0);
        integrator.integrate(1_000, 50.0, 10.0); // 1s later, p=500W
        assert!((integrator.state().charged_wh - (500.0 / 3600.0)).abs() < 1e-9);
        assert_eq!(integrator.state().discharged_wh, 0.0);
    }

    #[test]
    fn discharging_accumulates_discharged_wh() {
        let mut integrator = EnergyIntegrator::new(EnergyState::default());
        integrator.integrate(0, 50.0, -10.0);
        integrator.integrate(1_000, 50.0, -10.0);
        assert!((integrator.state().discharged_wh - (500.0 / 3600.0)).abs() < 1e-9);
    }

    #[test]
    fn gap_over_ten_seconds_is_discarded() {
        let mut integrator = EnergyIntegrator::new(EnergyState::default());
        integrator.integrate(0, 50.0, 10.0);
        integrator.integrate(10_001, 50.0, 10.0);
        assert_eq!(integrator.state(), EnergyState::default());
    }

    #[test]
    fn clock_jump_backwards_is_discarded() {
        let mut integrator = EnergyIntegrator::new(EnergyState::default());
        integrator.integrate(5_000, 50.0, 10.0);
        integrator.integrate(1_000, 50.0, 10.0);
        assert_eq!(integrator.state(), EnergyState::default());
    }

    #[test]
    fn in_memory_store_reports_not_found_before_any_store() {
        let mut store = InMemoryPersistenceStore::default();
        store.init().unwrap();
        assert_eq!(store.load(), Err(PersistenceError::NotFound));

        store.store(EnergyState { charged_wh: 12.5, discharged_wh: 3.0 }).unwrap();
        assert_eq!(store.load(), Ok(EnergyState { charged_wh: 12.5, discharged_wh: 3.0 }));

        store.erase().unwrap();
        assert_eq!(store.load(), Err(PersistenceError::NotFound));
    }

    #[test]
    fn negative_or_non_finite_values_are_sanitized_on_store_and_load() {
        let mut store = InMemoryPersistenceStore::default();
        store.store(EnergyState { charged_wh: -5.0, discharged_wh: f64::NAN }).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, EnergyState::default());
    }
}
