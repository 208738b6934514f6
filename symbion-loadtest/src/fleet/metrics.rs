//! Fleet-wide aggregates
//!
//! Device-derived counters are a pure function of the device states
//! (`FleetMetrics::aggregate`). Start-request counters belong to the
//! simulator and are merged in with `with_requests`.

use crate::device::{DeviceState, DeviceStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetMetrics {
    pub total_devices: usize,
    pub online: usize,
    pub offline: usize,
    pub error: usize,
    pub updating: usize,
    pub maintenance: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_metrics_sent: u64,
    pub total_messages_sent: u64,
    pub total_errors: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub dropped_events: u64,
}

impl FleetMetrics {
    pub fn aggregate<'a>(states: impl IntoIterator<Item = &'a DeviceState>) -> Self {
        let mut m = FleetMetrics::default();
        for state in states {
            m.total_devices += 1;
            match state.status {
                DeviceStatus::Online => m.online += 1,
                DeviceStatus::Offline => m.offline += 1,
                DeviceStatus::Error => m.error += 1,
                DeviceStatus::Updating => m.updating += 1,
                DeviceStatus::Maintenance => m.maintenance += 1,
            }
            m.total_metrics_sent += state.metrics_sent;
            m.total_messages_sent += state.messages_sent;
            m.total_errors += state.error_count;
        }
        m
    }

    pub fn with_requests(mut self, requests: &RequestCounters) -> Self {
        let (total, ok, failed) = requests.snapshot();
        self.total_requests = total;
        self.successful_requests = ok;
        self.failed_requests = failed;
        self
    }

    /// Devices actively connected (online or mid-update).
    pub fn active(&self) -> usize {
        self.online + self.updating
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }
}

/// Compteurs de démarrage tenus par le simulateur (un par tentative de start)
#[derive(Debug, Default)]
pub struct RequestCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
}

impl RequestCounters {
    pub fn record(&self, success: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.successful.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}
