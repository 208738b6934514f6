//! Simulated device telemetry
//!
//! Produces resource readings with a realistic shape:
//! - CPU follows a profile-scaled sinusoidal baseline keyed to wall-clock time
//! - Bounded noise plus a rare spike on every tick
//! - Memory / disk usage drawn inside profile bounds
//! - Network counters accumulate across ticks
//! - Profile-specific custom fields (GPU, battery, sensor...)

use super::{DeviceConfig, DeviceProfile};
use crate::random::RandomSource;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Latest telemetry snapshot of one device
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceMetrics {
    pub cpu: CpuMetrics,
    pub memory: UsageMetrics,
    pub disk: UsageMetrics,
    pub network: NetworkMetrics,
    pub system: SystemInfo,
    pub custom: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuMetrics {
    pub usage_percent: f64,
    pub load_avg: [f64; 3], // [1min, 5min, 15min]
    pub cores: u32,
}

/// Memory or disk usage
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageMetrics {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkMetrics {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub platform: String,
    pub arch: String,
    pub uptime_seconds: u64,
    pub process_count: u32,
    pub temperature: Option<f64>,
}

const MIB: u64 = 1024 * 1024;
const SPIKE_PROBABILITY: f64 = 0.05;
const NETWORK_ERROR_PROBABILITY: f64 = 0.001;

/// Generator bound to one device; keeps the cumulative network counters.
#[derive(Debug)]
pub struct MetricsGenerator {
    profile: DeviceProfile,
    current: DeviceMetrics,
}

impl MetricsGenerator {
    pub fn new(config: &DeviceConfig) -> Self {
        let defaults = config.profile.defaults();
        let current = DeviceMetrics {
            cpu: CpuMetrics { cores: defaults.cores, ..Default::default() },
            memory: UsageMetrics { total: defaults.memory_bytes, available: defaults.memory_bytes, ..Default::default() },
            disk: UsageMetrics { total: defaults.disk_bytes, available: defaults.disk_bytes, ..Default::default() },
            network: NetworkMetrics::default(),
            system: SystemInfo {
                hostname: config.hostname(),
                os: "linux".to_string(),
                platform: "ubuntu".to_string(),
                arch: std::env::consts::ARCH.to_string(),
                uptime_seconds: 0,
                process_count: 50,
                temperature: None,
            },
            custom: BTreeMap::new(),
        };
        Self { profile: config.profile, current }
    }

    pub fn snapshot(&self) -> DeviceMetrics {
        self.current.clone()
    }

    /// Regenerates every reading and returns the new snapshot.
    pub fn generate(&mut self, rng: &dyn RandomSource, uptime: Duration) -> DeviceMetrics {
        let unix_secs = Utc::now().timestamp();
        let base = base_load(self.profile, unix_secs as f64);
        let m = &mut self.current;

        m.cpu.usage_percent = cpu_usage(base, rng);
        let load1 = m.cpu.usage_percent / 100.0 * f64::from(m.cpu.cores);
        let load5 = load1 * rng.between(0.8, 1.2);
        let load15 = load5 * rng.between(0.7, 1.3);
        m.cpu.load_avg = [load1, load5, load15];

        fill_usage(&mut m.memory, rng.between(0.3, 0.8));
        fill_usage(&mut m.disk, rng.between(0.2, 0.8));

        let base_transfer = MIB
            * match self.profile {
                DeviceProfile::Full => 10,
                DeviceProfile::Constrained => 5,
                DeviceProfile::Minimal => 2,
            };
        let transfer = (base_transfer as f64 * rng.between(0.5, 1.5)) as u64;
        m.network.bytes_sent += transfer / 4;
        m.network.bytes_recv += transfer;
        m.network.packets_sent += transfer / 1500;
        m.network.packets_recv += transfer / 1500;
        if rng.chance(NETWORK_ERROR_PROBABILITY) {
            m.network.errors_in += 1;
        }
        if rng.chance(NETWORK_ERROR_PROBABILITY) {
            m.network.errors_out += 1;
        }

        m.system.uptime_seconds = uptime.as_secs();
        m.system.temperature = match self.profile {
            DeviceProfile::Minimal => None,
            _ => Some(35.0 + 25.0 * m.cpu.usage_percent / 100.0 + 10.0 * rng.next_f64()),
        };

        m.custom.clear();
        match self.profile {
            DeviceProfile::Full => {
                m.custom.insert("gpu_usage".into(), rng.between(20.0, 80.0));
                m.custom.insert("power_consumption".into(), rng.between(50.0, 150.0));
                m.custom.insert("fan_speed".into(), rng.between(1000.0, 3000.0));
            }
            DeviceProfile::Constrained => {
                m.custom.insert("battery_level".into(), rng.between(20.0, 100.0));
                m.custom.insert("signal_strength".into(), -60.0 - 30.0 * rng.next_f64());
            }
            DeviceProfile::Minimal => {
                m.custom.insert("sensor_reading".into(), rng.between(100.0, 1000.0));
            }
        }
        m.custom.insert("device_uptime".into(), uptime.as_secs_f64());
        m.custom.insert("timestamp".into(), unix_secs as f64);

        m.clone()
    }
}

/// Charge de base du profil (cycle horaire / 30 min / 15 min)
pub fn base_load(profile: DeviceProfile, unix_secs: f64) -> f64 {
    match profile {
        DeviceProfile::Full => 0.2 + 0.3 * (unix_secs / 3600.0).sin(),
        DeviceProfile::Constrained => 0.3 + 0.4 * (unix_secs / 1800.0).sin(),
        DeviceProfile::Minimal => 0.5 + 0.3 * (unix_secs / 900.0).sin(),
    }
}

fn cpu_usage(base: f64, rng: &dyn RandomSource) -> f64 {
    let mut usage = base * 100.0;
    if rng.chance(SPIKE_PROBABILITY) {
        usage += rng.between(30.0, 70.0);
    }
    usage += (rng.next_f64() - 0.5) * 20.0;
    usage.clamp(0.0, 100.0)
}

fn fill_usage(usage: &mut UsageMetrics, fraction: f64) {
    usage.used = (usage.total as f64 * fraction) as u64;
    usage.available = usage.total - usage.used.min(usage.total);
    usage.used_percent = if usage.total == 0 {
        0.0
    } else {
        (usage.used as f64 / usage.total as f64 * 100.0).clamp(0.0, 100.0)
    };
}
