//! Symbion load-testing engine
//!
//! Simulates fleets of devices against the Symbion backend and drives
//! them through scripted scenarios:
//! - `device`: profiles, per-device state machine and telemetry generator
//! - `fleet`: batched start/stop, aggregation and the event stream
//! - `scenarios`: onboarding storm, steady state, update campaign, network resilience
//! - `config`: YAML run configuration used by the `symbion-loadtest` binary
//!
//! Network and backend calls are simulated with timers and probabilities.

pub mod config;
pub mod device;
pub mod error;
pub mod fleet;
pub mod random;
pub mod scenarios;
pub mod timing;

pub use config::{load_config, LoadTestConfig};
pub use device::{DeviceConfig, DeviceProfile, DeviceState, DeviceStatus, VirtualDevice};
pub use error::{ConfigError, DeviceError, FleetError, ScenarioError};
pub use fleet::{DeviceTiming, Event, EventType, FleetConfig, FleetMetrics, FleetSimulator};
pub use random::{FixedRandom, RandomSource, SequenceRandom, SharedRandom, ThreadRandom};
pub use scenarios::{Scenario, ScenarioReport};
