/**
 * DEVICE MODEL - Profils, configuration et état des devices simulés
 *
 * RÔLE : Décrit un device virtuel : son profil (full / constrained / minimal),
 * sa configuration figée à la création et son état runtime observable.
 *
 * FONCTIONNEMENT : Le profil fixe les intervalles, le taux d'erreur, le jitter
 * et le plafond de requêtes. Les transitions de statut passent toutes par
 * `DeviceStatus::can_transition_to`.
 *
 * UTILITÉ : Base commune du VirtualDevice, du FleetSimulator et des scénarios.
 */

pub mod limiter;
pub mod metrics;
pub mod virtual_device;

pub use limiter::RateLimiter;
pub use metrics::{DeviceMetrics, MetricsGenerator};
pub use virtual_device::{DeviceObserver, VirtualDevice};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceProfile {
    Full,
    Constrained,
    Minimal,
}

impl DeviceProfile {
    pub const ALL: [DeviceProfile; 3] = [DeviceProfile::Full, DeviceProfile::Constrained, DeviceProfile::Minimal];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceProfile::Full => "full",
            DeviceProfile::Constrained => "constrained",
            DeviceProfile::Minimal => "minimal",
        }
    }

    pub fn defaults(&self) -> ProfileDefaults {
        match self {
            DeviceProfile::Full => ProfileDefaults {
                metrics_interval: Duration::from_secs(30),
                heartbeat_interval: Duration::from_secs(60),
                error_rate: 0.01,
                jitter_percent: 0.1,
                requests_per_second: 100,
                cores: 8,
                memory_bytes: 16 * GIB,
                disk_bytes: 1024 * GIB,
            },
            DeviceProfile::Constrained => ProfileDefaults {
                metrics_interval: Duration::from_secs(60),
                heartbeat_interval: Duration::from_secs(120),
                error_rate: 0.05,
                jitter_percent: 0.2,
                requests_per_second: 50,
                cores: 4,
                memory_bytes: 4 * GIB,
                disk_bytes: 256 * GIB,
            },
            DeviceProfile::Minimal => ProfileDefaults {
                metrics_interval: Duration::from_secs(300),
                heartbeat_interval: Duration::from_secs(600),
                error_rate: 0.1,
                jitter_percent: 0.3,
                requests_per_second: 10,
                cores: 2,
                memory_bytes: GIB,
                disk_bytes: 32 * GIB,
            },
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const GIB: u64 = 1024 * 1024 * 1024;

/// Valeurs par défaut dérivées du profil
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileDefaults {
    pub metrics_interval: Duration,
    pub heartbeat_interval: Duration,
    pub error_rate: f64,
    pub jitter_percent: f64,
    pub requests_per_second: u32,
    pub cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Offline,
    Online,
    Updating,
    Maintenance,
    Error,
}

impl DeviceStatus {
    /// Table des transitions autorisées. `Offline` est toujours atteignable (stop).
    pub fn can_transition_to(self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        matches!(
            (self, next),
            (_, Offline)
                | (Offline, Online)
                | (Online, Updating)
                | (Online, Maintenance)
                | (Online, Error)
                | (Updating, Online)
                | (Maintenance, Online)
                | (Error, Online)
        )
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Offline => "offline",
            DeviceStatus::Online => "online",
            DeviceStatus::Updating => "updating",
            DeviceStatus::Maintenance => "maintenance",
            DeviceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub profile: DeviceProfile,
    pub device_id: String,
    pub name: String,
    pub device_type: String,
    pub server_url: String,
    pub tls_enabled: bool,
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_reconnect_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub state_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub fault_check_interval: Duration,
    pub jitter_percent: f64,
    pub error_rate: f64,
    pub requests_per_second: u32,
    /// Chance par contrôle d'état de basculer Online <-> Updating/Maintenance
    pub transition_probability: f64,
    /// Chance par contrôle de panne de passer en Error
    pub fault_probability: f64,
}

impl DeviceConfig {
    pub fn for_profile(profile: DeviceProfile, device_id: impl Into<String>) -> Self {
        let d = profile.defaults();
        Self {
            profile,
            device_id: device_id.into(),
            name: format!("device-{}", profile),
            device_type: profile.as_str().to_string(),
            server_url: "http://localhost:8080".to_string(),
            tls_enabled: false,
            auth_token: None,
            metrics_interval: d.metrics_interval,
            heartbeat_interval: d.heartbeat_interval,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(5 * 60),
            state_check_interval: Duration::from_secs(10),
            fault_check_interval: Duration::from_secs(60),
            jitter_percent: d.jitter_percent,
            error_rate: d.error_rate,
            requests_per_second: d.requests_per_second,
            transition_probability: 0.001,
            fault_probability: 0.01,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_server(mut self, url: impl Into<String>, tls_enabled: bool, auth_token: Option<String>) -> Self {
        self.server_url = url.into();
        self.tls_enabled = tls_enabled;
        self.auth_token = auth_token;
        self
    }

    pub fn with_intervals(mut self, metrics: Duration, heartbeat: Duration) -> Self {
        self.metrics_interval = metrics;
        self.heartbeat_interval = heartbeat;
        self
    }

    pub fn with_check_intervals(mut self, state_check: Duration, fault_check: Duration) -> Self {
        self.state_check_interval = state_check;
        self.fault_check_interval = fault_check;
        self
    }

    pub fn with_error_rate(mut self, error_rate: f64) -> Self {
        self.error_rate = error_rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_jitter(mut self, jitter_percent: f64) -> Self {
        self.jitter_percent = jitter_percent.clamp(0.0, 1.0);
        self
    }

    pub fn with_fault_model(mut self, transition_probability: f64, fault_probability: f64) -> Self {
        self.transition_probability = transition_probability.clamp(0.0, 1.0);
        self.fault_probability = fault_probability.clamp(0.0, 1.0);
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: u32) -> Self {
        self.requests_per_second = requests_per_second.max(1);
        self
    }

    /// Nom d'hôte simulé : `device-` + 8 premiers caractères de l'id
    pub fn hostname(&self) -> String {
        let short: String = self.device_id.chars().take(8).collect();
        format!("device-{short}")
    }
}

/// Snapshot de l'état runtime d'un device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub registered: bool,
    pub updating: bool,
    pub error_count: u64,
    pub messages_sent: u64,
    pub metrics_sent: u64,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            status: DeviceStatus::Offline,
            last_seen: None,
            registered: false,
            updating: false,
            error_count: 0,
            messages_sent: 0,
            metrics_sent: 0,
            started_at: None,
            uptime: Duration::ZERO,
        }
    }
}
