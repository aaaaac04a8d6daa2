//! Orchestrator: wires the serial engine,
//! telemetry cache, CVL controller, energy integrator and CAN publisher
//! together, and owns startup/shutdown sequencing.
//!
//! Grounded on `TheerasakPing-bms-monitor/src/can_handler.rs`'s
//! `CanManager` as the "owns the whole flow" object, adapted from a
//! request/response API surface to an event-reactive pipeline: telemetry
//! updates flow through the event bus instead of being called out to
//! directly, breaking the publisher/energy/live-data dependency cycle the
//! original firmware's design notes call out.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::can::{CanPublisher, PublisherMode};
use crate::clock::MonotonicClock;
use crate::config::GatewaySettings;
use crate::cvl::{compute_limits, CvlInputs, CvlRuntime};
use crate::energy::{EnergyIntegrator, PersistenceStore};
use crate::event_bus::{Event, EventBus};
use crate::protocol::commands::StatusQueryKind;
use crate::serial::{self, RequestKind, ResponseKind, SerialEngineHandle};
use crate::telemetry::{LiveDataPatch, TelemetryCache};
use crate::transport::{BmsTransport, CanTransport};

const POLL_PERIOD: Duration = Duration::from_millis(1000);
const ENERGY_PERSIST_EVERY: u32 = 60;

/// Owns every long-running task; dropping this after `shutdown()` releases
/// all resources.
pub struct Orchestrator {
    pub event_bus: Arc<EventBus>,
    pub telemetry: Arc<TelemetryCache>,
    pub serial: SerialEngineHandle,
    pub publisher: Arc<CanPublisher>,
    publisher_mode: PublisherMode,
    shutdown: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Starts every long-running task: serial engine, CAN publisher
    /// (periodic task if configured), the telemetry poll loop, and the
    /// telemetry-update reactor that drives CVL + energy + publisher
    /// refresh.
    pub fn start(
        settings: GatewaySettings,
        bms_transport: Box<dyn BmsTransport>,
        can_transport: Box<dyn CanTransport>,
        mut persistence: Box<dyn PersistenceStore>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Arc<Orchestrator> {
        let event_bus = Arc::new(EventBus::new());
        let telemetry = Arc::new(TelemetryCache::new());

        let energy_state = match persistence.init() {
            Ok(()) => persistence.load().unwrap_or_else(|e| {
                warn!("energy persistence unavailable at startup ({e}); starting from zero");
                Default::default()
            }),
            Err(e) => {
                warn!("energy persistence failed to initialize ({e}); starting from zero");
                Default::default()
            }
        };
        let energy = Arc::new(Mutex::new(EnergyIntegrator::new(energy_state)));
        let persistence = Arc::new(Mutex::new(persistence));

        let (serial, serial_join) = serial::spawn(
            bms_transport,
            settings.serial.retry_policy(),
            event_bus.clone(),
            settings.serial.request_queue_capacity,
        );

        let publisher_mode: PublisherMode = settings.publisher.mode.into();
        let publisher = CanPublisher::new(
            can_transport,
            event_bus.clone(),
            publisher_mode,
            settings.publisher.default_period_ms,
            settings.identity.clone().into(),
            Duration::from_millis(settings.keepalive.timeout_ms),
        );

        let cvl_runtime = Arc::new(Mutex::new(CvlRuntime::default()));
        let cvl_config = settings.cvl.clone();

        let shutdown = Arc::new(Notify::new());
        let mut tasks = vec![serial_join];

        if publisher_mode == PublisherMode::Periodic {
            tasks.push(publisher.clone().spawn_periodic_task());
        }

        tasks.push(spawn_poll_loop(serial.clone(), telemetry.clone(), event_bus.clone(), clock.clone(), shutdown.clone()));
        tasks.push(spawn_reactor_task(
            telemetry.clone(),
            event_bus.clone(),
            cvl_config,
            cvl_runtime,
            energy,
            persistence,
            publisher.clone(),
            clock,
            shutdown.clone(),
        ));

        info!("orchestrator started");
        Arc::new(Orchestrator {
            event_bus,
            telemetry,
            serial,
            publisher,
            publisher_mode,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Orderly shutdown: signals every loop body's `task_should_exit`
    /// check, waits briefly for graceful exit, then aborts stragglers.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        if self.publisher_mode == PublisherMode::Periodic {
            self.publisher.publish_stopped().await;
        }
        info!("orchestrator shut down");
    }
}

fn spawn_poll_loop(
    serial: SerialEngineHandle,
    telemetry: Arc<TelemetryCache>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn MonotonicClock>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = tokio::time::sleep(POLL_PERIOD) => {}
            }

            let mut patch = LiveDataPatch::default();
            let mut any_ok = false;

            if let Ok(ResponseKind::StatusQuery(payload)) =
                serial.submit(RequestKind::StatusQuery { kind: StatusQueryKind::PackVoltage }).await
            {
                any_ok = true;
                if let crate::protocol::commands::StatusPayload::PackVoltage(v) = payload {
                    patch.pack_voltage_v = Some(v);
                }
            }
            if let Ok(ResponseKind::StatusQuery(payload)) =
                serial.submit(RequestKind::StatusQuery { kind: StatusQueryKind::PackCurrent }).await
            {
                any_ok = true;
                if let crate::protocol::commands::StatusPayload::PackCurrent(i) = payload {
                    patch.pack_current_a = Some(i);
                }
            }
            if let Ok(ResponseKind::StatusQuery(payload)) =
                serial.submit(RequestKind::StatusQuery { kind: StatusQueryKind::Soc }).await
            {
                any_ok = true;
                if let crate::protocol::commands::StatusPayload::Soc(soc) = payload {
                    patch.soc_percent = Some(soc);
                }
            }
            if let Ok(ResponseKind::StatusQuery(payload)) =
                serial.submit(RequestKind::StatusQuery { kind: StatusQueryKind::CellVoltageMinMax }).await
            {
                any_ok = true;
                if let crate::protocol::commands::StatusPayload::CellVoltageMinMax { min_mv, max_mv } = payload {
                    patch.cell_voltage_min_mv = Some(min_mv);
                    patch.cell_voltage_max_mv = Some(max_mv);
                }
            }
            if let Ok(ResponseKind::StatusQuery(payload)) =
                serial.submit(RequestKind::StatusQuery { kind: StatusQueryKind::OnlineStatus }).await
            {
                any_ok = true;
                if let crate::protocol::commands::StatusPayload::OnlineStatus(online) = payload {
                    patch.online = Some(online);
                }
            }

            // The BMS is unreachable this tick: leave `LiveData.timestamp_ms`
            // (and every other field) exactly as it was rather than
            // advancing it on an empty patch.
            if !any_ok {
                continue;
            }

            patch.last_poll_ok_ms = Some(clock.now_ms());
            telemetry.update(patch);
            event_bus.publish(Event::TelemetryUpdate).await;
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_reactor_task(
    telemetry: Arc<TelemetryCache>,
    event_bus: Arc<EventBus>,
    cvl_config: crate::cvl::CvlConfig,
    cvl_runtime: Arc<Mutex<CvlRuntime>>,
    energy: Arc<Mutex<EnergyIntegrator>>,
    persistence: Arc<Mutex<Box<dyn PersistenceStore>>>,
    publisher: Arc<CanPublisher>,
    clock: Arc<dyn MonotonicClock>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = event_bus.subscribe("orchestrator-reactor");
        let mut updates_since_persist: u32 = 0;

        loop {
            let event = tokio::select! {
                _ = shutdown.notified() => break,
                event = events.recv() => match event {
                    Some(e) => e,
                    None => break,
                },
            };

            if event.id() != crate::event_bus::EventId::TelemetryUpdate {
                continue;
            }

            let live = telemetry.snapshot();
            let inputs = CvlInputs::from_live_data(&live);
            let result = {
                let mut runtime = cvl_runtime.lock();
                compute_limits(&inputs, &cvl_config, &mut runtime)
            };

            let now_ms = clock.now_ms();
            let energy_snapshot = {
                let mut integrator = energy.lock();
                if let (Some(v), Some(i)) = (live.pack_voltage_v, live.pack_current_a) {
                    integrator.integrate(now_ms, v, i);
                }
                integrator.state()
            };

            publisher.on_telemetry_update(&live, &result, &energy_snapshot).await;

            updates_since_persist += 1;
            if updates_since_persist >= ENERGY_PERSIST_EVERY {
                updates_since_persist = 0;
                let store_result = {
                    let mut store = persistence.lock();
                    store.store(energy_snapshot)
                };
                if let Err(e) = store_result {
                    warn!("failed to persist energy state: {e}");
                } else {
                    event_bus.publish(Event::EnergyPersisted).await;
                }
            }
        }
    })
}
