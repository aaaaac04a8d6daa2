//! CAN publisher scheduler.
//!
//! Ported tick-for-tick from
//! `original_source/.../can_publisher/can_publisher.c`'s
//! `can_publisher_publish_buffer` (drift-free absolute-deadline scheduling,
//! resync-without-burst-catchup) and `can_publisher_task` (loop-sleep-
//! until-nearest-deadline), translated from FreeRTOS ticks to
//! `tokio::time::Instant`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, warn};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::can::frames::{FrameContext, Identity, CHANNEL_CATALOGUE};
use crate::cvl::CvlResult;
use crate::energy::EnergyState;
use crate::event_bus::{Event, EventBus};
use crate::telemetry::LiveData;
use crate::transport::{CanFrame, CanTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherMode {
    /// No periodic task running (disabled, or failed to start): every
    /// freshly encoded frame is sent the moment it is encoded.
    Immediate,
    /// A single scheduler task dispatches each channel at its own period.
    Periodic,
}

struct ChannelSlot {
    latest: Option<CanFrame>,
    valid: bool,
    deadline: Instant,
}

/// Owns the per-channel buffer and (in periodic mode) the dispatch loop.
pub struct CanPublisher {
    transport: AsyncMutex<Box<dyn CanTransport>>,
    slots: AsyncMutex<Vec<ChannelSlot>>,
    event_bus: Arc<EventBus>,
    mode: PublisherMode,
    default_period_ms: u64,
    identity: Identity,
    send_errors: AtomicU64,
    /// Time of the last successful frame dispatch, consulted by the
    /// keepalive watchdog.
    last_send: SyncMutex<Instant>,
    keepalive_timeout: Duration,
    /// Edge-triggers `Event::CanKeepaliveTimeout` so it fires once per
    /// outage rather than on every periodic tick while still stalled.
    keepalive_timed_out: AtomicBool,
}

impl CanPublisher {
    pub fn new(
        transport: Box<dyn CanTransport>,
        event_bus: Arc<EventBus>,
        mode: PublisherMode,
        default_period_ms: u64,
        identity: Identity,
        keepalive_timeout: Duration,
    ) -> Arc<Self> {
        let now = Instant::now();
        let slots = CHANNEL_CATALOGUE
            .iter()
            .map(|channel| {
                let period = effective_period(channel.period_ms, default_period_ms);
                ChannelSlot {
                    latest: None,
                    valid: false,
                    deadline: now + Duration::from_millis(period),
                }
            })
            .collect();

        Arc::new(CanPublisher {
            transport: AsyncMutex::new(transport),
            slots: AsyncMutex::new(slots),
            event_bus,
            mode,
            default_period_ms,
            identity,
            send_errors: AtomicU64::new(0),
            last_send: SyncMutex::new(now),
            keepalive_timeout,
            keepalive_timed_out: AtomicBool::new(false),
        })
    }

    pub fn send_error_count(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    /// Re-encodes every channel from the current state and, in immediate
    /// mode, dispatches any newly-valid frame right away.
    pub async fn on_telemetry_update(self: &Arc<Self>, live: &LiveData, cvl: &CvlResult, energy: &EnergyState) {
        let ctx = FrameContext {
            live,
            cvl,
            energy,
            identity: &self.identity,
        };

        let mut slots = self.slots.lock().await;
        for (slot, channel) in slots.iter_mut().zip(CHANNEL_CATALOGUE.iter()) {
            match (channel.encode)(&ctx) {
                Some(frame) => {
                    slot.latest = Some(frame);
                    slot.valid = true;
                }
                None => {
                    slot.valid = false;
                }
            }
        }
        drop(slots);

        if self.mode == PublisherMode::Immediate {
            self.dispatch_all_valid().await;
        }
    }

    async fn dispatch_all_valid(self: &Arc<Self>) {
        let mut slots = self.slots.lock().await;
        for (slot, channel) in slots.iter_mut().zip(CHANNEL_CATALOGUE.iter()) {
            if slot.valid {
                if let Some(frame) = slot.latest.clone() {
                    self.send_one(channel.tag, &frame).await;
                }
            }
        }
    }

    async fn send_one(&self, tag: &'static str, frame: &CanFrame) {
        let mut transport = self.transport.lock().await;
        match transport.send(frame).await {
            Ok(()) => {
                drop(transport);
                *self.last_send.lock() = Instant::now();
                self.keepalive_timed_out.store(false, Ordering::Relaxed);
                self.event_bus.publish(Event::CanFrameReady { channel: tag }).await;
            }
            Err(e) => {
                drop(transport);
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                self.event_bus.publish(Event::CanError { channel: tag }).await;
                warn!("CAN send failed on channel '{tag}': {e}");
            }
        }
    }

    /// Spawns the periodic dispatch task. Only meaningful in
    /// `PublisherMode::Periodic`; the orchestrator does not call this in
    /// immediate mode.
    pub fn spawn_periodic_task(self: Arc<Self>) -> JoinHandle<()> {
        *self.last_send.lock() = Instant::now();
        tokio::spawn(async move {
            self.event_bus.publish(Event::CanStarted).await;
            self.periodic_loop().await
        })
    }

    /// Publishes `Event::CanStopped` if the periodic task was ever started;
    /// called once by the orchestrator on shutdown to close the pair with
    /// `Event::CanStarted`.
    pub async fn publish_stopped(&self) {
        self.event_bus.publish(Event::CanStopped).await;
    }

    /// Checks elapsed time since the last successful dispatch against
    /// `keepalive_timeout`, publishing `Event::CanKeepaliveTimeout` once per
    /// outage (edge-triggered, cleared again by the next successful send).
    async fn check_keepalive(&self) {
        let elapsed = self.last_send.lock().elapsed();
        if elapsed >= self.keepalive_timeout && !self.keepalive_timed_out.swap(true, Ordering::Relaxed) {
            self.event_bus.publish(Event::CanKeepaliveTimeout).await;
        }
    }

    async fn periodic_loop(self: Arc<Self>) {
        loop {
            let now = Instant::now();
            let mut due_tags: Vec<(&'static str, CanFrame)> = Vec::new();
            let mut next_deadline = now + Duration::from_millis(self.default_period_ms);

            {
                let mut slots = self.slots.lock().await;
                for (slot, channel) in slots.iter_mut().zip(CHANNEL_CATALOGUE.iter()) {
                    if !slot.valid {
                        continue;
                    }
                    if slot.deadline <= now {
                        if let Some(frame) = slot.latest.clone() {
                            due_tags.push((channel.tag, frame));
                        }
                        let period = effective_period(channel.period_ms, self.default_period_ms);
                        let period = Duration::from_millis(period);
                        // Resync instead of burst-catchup if we're badly
                        // behind (e.g. the process was paused/suspended).
                        if now.saturating_duration_since(slot.deadline) > period {
                            slot.deadline = now + period;
                        } else {
                            slot.deadline += period;
                        }
                    }
                    if slot.deadline < next_deadline {
                        next_deadline = slot.deadline;
                    }
                }
            }

            self.check_keepalive().await;

            for (tag, frame) in due_tags {
                self.send_one(tag, &frame).await;
            }

            let sleep_until = next_deadline.max(Instant::now() + Duration::from_millis(1));
            tokio::time::sleep_until(sleep_until).await;
        }
    }
}

fn effective_period(channel_period_ms: u64, default_period_ms: u64) -> u64 {
    if channel_period_ms == 0 {
        default_period_ms
    } else {
        channel_period_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvl::CvlState;
    use crate::transport::RecordingCanTransport;

    fn sample_live() -> LiveData {
        LiveData {
            pack_voltage_v: Some(52.0),
            pack_current_a: Some(5.0),
            soc_percent: Some(70.0),
            ..Default::default()
        }
    }

    fn sample_cvl() -> CvlResult {
        CvlResult {
            state: CvlState::Bulk,
            cvl_v: 58.4,
            ccl_a: 100.0,
            dcl_a: 100.0,
            imbalance_hold_active: false,
            cell_protection_active: false,
        }
    }

    #[tokio::test]
    async fn immediate_mode_dispatches_on_every_update() {
        let bus = Arc::new(EventBus::new());
        let publisher = CanPublisher::new(
            Box::new(RecordingCanTransport::new()),
            bus,
            PublisherMode::Immediate,
            1000,
            Identity::default(),
            Duration::from_millis(5000),
        );

        publisher.on_telemetry_update(&sample_live(), &sample_cvl(), &EnergyState::default()).await;

        let transport = publisher.transport.lock().await;
        // dispatch_all_valid only sends through the shared transport, so we
        // can't downcast here; assert indirectly via the error counter
        // staying at zero (RecordingCanTransport::send never fails).
        drop(transport);
        assert_eq!(publisher.send_error_count(), 0);
    }

    #[tokio::test]
    async fn periodic_mode_does_not_dispatch_before_on_telemetry_update_runs() {
        let bus = Arc::new(EventBus::new());
        let publisher = CanPublisher::new(
            Box::new(RecordingCanTransport::new()),
            bus,
            PublisherMode::Periodic,
            1000,
            Identity::default(),
            Duration::from_millis(5000),
        );
        let slots = publisher.slots.lock().await;
        assert!(slots.iter().all(|s| !s.valid));
    }

    #[test]
    fn effective_period_falls_back_to_default_when_zero() {
        assert_eq!(effective_period(0, 1000), 1000);
        assert_eq!(effective_period(500, 1000), 500);
    }

    #[tokio::test]
    async fn frame_ready_fires_on_dispatch_not_on_encode() {
        let bus = Arc::new(EventBus::new());
        let mut events = bus.subscribe("test");
        let publisher = CanPublisher::new(
            Box::new(RecordingCanTransport::new()),
            bus,
            PublisherMode::Immediate,
            1000,
            Identity::default(),
            Duration::from_millis(5000),
        );

        publisher.on_telemetry_update(&sample_live(), &sample_cvl(), &EnergyState::default()).await;

        // Immediate mode dispatches every valid channel in the same call,
        // so every event observed here must be CanFrameReady (never a
        // bare encode with no matching dispatch).
        let mut saw_frame_ready = false;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::CanFrameReady { .. } => saw_frame_ready = true,
                other => panic!("unexpected event before any dispatch: {other:?}"),
            }
        }
        assert!(saw_frame_ready);
    }

    #[tokio::test]
    async fn keepalive_timeout_fires_once_per_outage() {
        let bus = Arc::new(EventBus::new());
        let mut events = bus.subscribe("test");
        let publisher = CanPublisher::new(
            Box::new(RecordingCanTransport::new()),
            bus,
            PublisherMode::Periodic,
            1000,
            Identity::default(),
            Duration::from_millis(0),
        );

        publisher.check_keepalive().await;
        assert_eq!(events.recv().await, Some(Event::CanKeepaliveTimeout));

        // Edge-triggered: a second check with no intervening send must not
        // republish.
        publisher.check_keepalive().await;
        assert!(events.try_recv().is_err());

        // A successful send clears the flag and re-arms the watchdog.
        publisher.send_one("test-channel", &CanFrame::new(0x351, vec![0, 1])).await;
        let _ = events.try_recv(); // drain the CanFrameReady from the send above
        publisher.check_keepalive().await;
        assert_eq!(events.recv().await, Some(Event::CanKeepaliveTimeout));
    }
}
