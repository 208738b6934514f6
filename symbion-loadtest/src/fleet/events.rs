//! Fleet event stream
//!
//! A single bounded queue shared by every producer of the simulator.
//! Publishing never blocks: when the queue is full the event is dropped
//! and counted. Consumers must not assume delivery.
//!
//! Per-send events (`metrics_sent`, `heartbeat_sent`) are off unless the
//! fleet asks for them: at scale they would crowd out lifecycle events.

use crate::device::{DeviceObserver, DeviceProfile};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DeviceStarted,
    DeviceStopped,
    DeviceError,
    DeviceRegistered,
    MetricsSent,
    HeartbeatSent,
    FleetStarted,
    FleetStopped,
    BatchStarted,
    BatchCompleted,
    PartitionStarted,
    PartitionEnded,
    FleetScaled,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Event {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            device_id: None,
            message: message.into(),
            timestamp: Utc::now(),
            data: Value::Null,
        }
    }

    pub fn for_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Lecture d'un champ entier du payload (ex: `batch_number`).
    pub fn data_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }
}

pub struct EventBus {
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non bloquant : en cas de file pleine (ou fermée) l'événement est compté comme perdu.
    pub fn publish(&self, event: Event) {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(event_type = ?event.event_type, dropped, "event channel full, dropping event");
                } else {
                    debug!(event_type = ?event.event_type, "event channel full, dropping event");
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Le récepteur unique ; `None` s'il a déjà été pris.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.receiver.lock().take()
    }

    /// Ferme le flux : le consommateur lit le reste puis reçoit `None`.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Relaie l'activité des devices vers le flux de la flotte.
pub struct DeviceEvents {
    bus: Arc<EventBus>,
    traffic: bool,
}

impl DeviceEvents {
    pub fn new(bus: Arc<EventBus>, traffic: bool) -> Self {
        Self { bus, traffic }
    }
}

impl DeviceObserver for DeviceEvents {
    fn registered(&self, device_id: &str, profile: DeviceProfile) {
        self.bus.publish(
            Event::new(EventType::DeviceRegistered, "device registered")
                .for_device(device_id)
                .with_data(json!({ "profile": profile })),
        );
    }

    fn metrics_sent(&self, device_id: &str) {
        if self.traffic {
            self.bus.publish(Event::new(EventType::MetricsSent, "metrics sent").for_device(device_id));
        }
    }

    fn heartbeat_sent(&self, device_id: &str) {
        if self.traffic {
            self.bus.publish(Event::new(EventType::HeartbeatSent, "heartbeat sent").for_device(device_id));
        }
    }
}
