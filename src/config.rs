//! Application configuration for the `flowstate` binary.
//!
//! Every section has a `Default`, and every field can be left out of the JSON
//! file:
//!
//! ```json
//! {
//!   "session": { "duration_minutes": 10, "target_frequency_hz": 5.5 },
//!   "aggregator": { "max_full_resolution_points": 600 },
//!   "status_mode": { "poll": { "interval": 2000 } },
//!   "metrics_interval_ms": 1000
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::ble::BleConfig;
use crate::closed_loop::ClosedLoopConfig;
use crate::handlers::StatusMode;
use crate::session::SessionConfig;
use crate::simulator::SimulatorConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ble: BleConfig,
    pub simulator: SimulatorConfig,
    pub session: SessionConfig,
    pub aggregator: AggregatorConfig,
    pub closed_loop: ClosedLoopConfig,
    pub status_mode: StatusMode,
    /// How often a derived-metrics point is fed to the aggregator.
    pub metrics_interval_ms: u64,
    /// Wall-clock length of one session "second"; below 1000 compresses the
    /// session for demos.
    pub tick_period_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ble: BleConfig::default(),
            simulator: SimulatorConfig::default(),
            session: SessionConfig::default(),
            aggregator: AggregatorConfig::default(),
            closed_loop: ClosedLoopConfig::default(),
            status_mode: StatusMode::default(),
            metrics_interval_ms: 1000,
            tick_period_ms: 1000,
        }
    }
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid config JSON")?;
        config
            .session
            .validate()
            .context("invalid \"session\" section")?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("loading {}", path.display()))
    }
}
