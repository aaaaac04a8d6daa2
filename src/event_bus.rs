//! Internal event bus.
//!
//! Grounded almost 1:1 on `original_source/.../event_bus/event_bus.c`: a
//! single lock guards only the subscriber list and is held only for the
//! enqueue loop, each subscriber gets its own bounded FIFO, and a publish
//! blocks for up to `PUBLISH_TIMEOUT` waiting for room in a full
//! subscriber's queue before dropping the event for it — the same
//! `xQueueSend(subscriber->queue, event, timeout)` semantics
//! `event_bus.c:214` uses, with the 50ms timeout taken from
//! `can_publisher.c`'s `CAN_PUBLISHER_EVENT_TIMEOUT_MS` (drop-count logging
//! at power-of-two thresholds, escalating to `error!` once a subscriber has
//! dropped 256 or more).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::serial::SerialStatsSnapshot;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;
const HISTORY_CAPACITY: usize = 64;
const DROP_LOG_ESCALATION_THRESHOLD: u64 = 256;
const PUBLISH_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventId {
    TelemetryUpdate,
    StatsUpdated,
    SerialTimeout,
    SerialCrcMismatch,
    SerialNack,
    CvlStateChanged,
    EnergyPersisted,
    PublisherSendError,
    CanFrameReady,
    CanStarted,
    CanStopped,
    CanError,
    CanKeepaliveTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The telemetry cache accepted a new patch; downstream consumers
    /// (CVL controller, CAN publisher) should re-derive their outputs.
    TelemetryUpdate,
    StatsUpdated(SerialStatsSnapshot),
    SerialTimeout,
    SerialCrcMismatch,
    SerialNack(u8),
    CvlStateChanged(&'static str),
    EnergyPersisted,
    PublisherSendError { channel: &'static str },
    CanFrameReady { channel: &'static str },
    CanStarted,
    CanStopped,
    CanError { channel: &'static str },
    CanKeepaliveTimeout,
}

impl Event {
    pub fn id(&self) -> EventId {
        match self {
            Event::TelemetryUpdate => EventId::TelemetryUpdate,
            Event::StatsUpdated(_) => EventId::StatsUpdated,
            Event::SerialTimeout => EventId::SerialTimeout,
            Event::SerialCrcMismatch => EventId::SerialCrcMismatch,
            Event::SerialNack(_) => EventId::SerialNack,
            Event::CvlStateChanged(_) => EventId::CvlStateChanged,
            Event::EnergyPersisted => EventId::EnergyPersisted,
            Event::PublisherSendError { .. } => EventId::PublisherSendError,
            Event::CanFrameReady { .. } => EventId::CanFrameReady,
            Event::CanStarted => EventId::CanStarted,
            Event::CanStopped => EventId::CanStopped,
            Event::CanError { .. } => EventId::CanError,
            Event::CanKeepaliveTimeout => EventId::CanKeepaliveTimeout,
        }
    }
}

struct Subscriber {
    name: String,
    sender: mpsc::Sender<Event>,
    drop_count: AtomicU64,
}

struct Inner {
    subscribers: Vec<Arc<Subscriber>>,
}

/// Multi-producer, multi-consumer fan-out for internal events.
pub struct EventBus {
    inner: Mutex<Inner>,
    history: Mutex<VecDeque<Event>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Mutex::new(Inner { subscribers: Vec::new() }),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// Registers a new named subscriber with the default bounded capacity.
    pub fn subscribe(&self, name: impl Into<String>) -> mpsc::Receiver<Event> {
        self.subscribe_with_capacity(name, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, name: impl Into<String>, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut inner = self.inner.lock();
        inner.subscribers.push(Arc::new(Subscriber {
            name: name.into(),
            sender: tx,
            drop_count: AtomicU64::new(0),
        }));
        rx
    }

    /// Publishes `event` to every subscriber. The bus lock is held only long
    /// enough to snapshot the subscriber list; each subscriber then gets up
    /// to `PUBLISH_TIMEOUT` to make room in its queue before the event is
    /// dropped for it, never blocking the others.
    pub async fn publish(&self, event: Event) {
        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let subscribers: Vec<Arc<Subscriber>> = self.inner.lock().subscribers.clone();
        for sub in &subscribers {
            if sub.sender.send_timeout(event.clone(), PUBLISH_TIMEOUT).await.is_err() {
                let drop_count = sub.drop_count.fetch_add(1, Ordering::Relaxed) + 1;
                log_drop(&sub.name, drop_count);
            }
        }
    }

    /// Returns the most recently published events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

fn log_drop(subscriber: &str, drop_count: u64) {
    if drop_count >= DROP_LOG_ESCALATION_THRESHOLD {
        if drop_count.is_power_of_two() || drop_count % DROP_LOG_ESCALATION_THRESHOLD == 0 {
            error!("event bus subscriber '{subscriber}' has dropped {drop_count} events");
        }
    } else if drop_count.is_power_of_two() {
        warn!("event bus subscriber '{subscriber}' dropped an event (total dropped: {drop_count})");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_each_get_their_own_copy() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("a");
        let mut b = bus.subscribe("b");

        bus.publish(Event::TelemetryUpdate).await;

        assert_eq!(a.recv().await, Some(Event::TelemetryUpdate));
        assert_eq!(b.recv().await, Some(Event::TelemetryUpdate));
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_without_blocking_others() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe_with_capacity("slow", 1);
        let mut fast = bus.subscribe_with_capacity("fast", 8);

        bus.publish(Event::TelemetryUpdate).await;
        // slow's single slot is now full; this publish waits out the full
        // PUBLISH_TIMEOUT then drops for slow, but still lands for fast.
        bus.publish(Event::SerialTimeout).await;

        assert_eq!(slow.recv().await, Some(Event::TelemetryUpdate));
        assert_eq!(fast.recv().await, Some(Event::TelemetryUpdate));
        assert_eq!(fast.recv().await, Some(Event::SerialTimeout));
    }

    #[tokio::test]
    async fn history_is_bounded_and_oldest_first() {
        let bus = EventBus::new();
        for _ in 0..(HISTORY_CAPACITY + 5) {
            bus.publish(Event::EnergyPersisted).await;
        }
        assert_eq!(bus.history().len(), HISTORY_CAPACITY);
    }

    #[test]
    fn event_id_matches_variant() {
        assert_eq!(Event::SerialNack(3).id(), EventId::SerialNack);
        assert_eq!(Event::TelemetryUpdate.id(), EventId::TelemetryUpdate);
    }
}
