//! # flowstate-rs
//!
//! Real-time session core for FlowState EEG neurofeedback headsets over
//! Bluetooth Low Energy: the wire codec, per-characteristic stream handlers,
//! the session state machine with its one-second clock, and a bounded
//! aggregator for the derived metrics a session produces.
//!
//! ## Pipeline
//!
//! ```text
//!  BLE link ──▶ TelemetryHandler ──▶ (signal processing) ──▶ BoundedAggregator
//!           ──▶ StatusHandler                                       │
//!           ◀── ControlHandler ◀── EntrainmentController            │
//!                                                                   ▼
//!  UI events ──▶ SessionStateMachine ── completion ──▶ summary / persistence
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use flowstate_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = SimulatedDevice::default();
//!     let link: Arc<dyn Transport> = Arc::new(device.clone());
//!
//!     let mut telemetry = TelemetryHandler::new(Arc::clone(&link), TELEMETRY_CHARACTERISTIC)
//!         .on_data(|p| println!("seq {} with {} samples", p.sequence_number, p.samples.len()));
//!     telemetry.start().await?;
//!     device.start_streaming();
//!
//!     let session = SessionStateMachine::new();
//!     session.set_config(SessionConfig { duration_minutes: Some(1.0), ..Default::default() })?;
//!     session.add_completion_listener(|done| println!("finished after {} s", done.elapsed_seconds));
//!     session.start()?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(61)).await;
//!     telemetry.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`protocol`] | GATT UUIDs, wire-format constants, and encoders |
//! | [`parse`] | Decoders for telemetry frames, status records, and control records |
//! | [`cursor`] | Bounds-checked little-endian reader used by the decoders |
//! | [`types`] | Telemetry, status, and control data types |
//! | [`transport`] | The [`transport::Transport`] seam and a loopback implementation |
//! | [`handlers`] | Telemetry, status, and control stream handlers |
//! | [`session`] | Session lifecycle state machine and clock |
//! | [`aggregator`] | Bounded full-resolution window plus downsampled history |
//! | [`closed_loop`] | Theta classification and entrainment on/off decisions |
//! | [`simulator`] | Simulated headset and metrics generator |
//! | [`ble`] | `btleplug`-backed transport |
//! | [`registry`] | Listener sets with handle-based unsubscribe |
//! | [`config`] | JSON-loadable application config |
//! | [`error`] | Error types |

pub mod aggregator;
pub mod ble;
pub mod closed_loop;
pub mod config;
pub mod cursor;
pub mod error;
pub mod handlers;
pub mod parse;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod simulator;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Transport and handlers ────────────────────────────────────────────────
    pub use crate::ble::{BleConfig, BleTransport, FlowStateDevice};
    pub use crate::handlers::{
        ControlHandler, StatusHandler, StatusMode, StreamHandler, TelemetryHandler, TelemetryStats,
    };
    pub use crate::simulator::{MetricsSimulator, SimulatedDevice, SimulatorConfig};
    pub use crate::transport::{LoopbackTransport, Subscription, Transport};

    // ── Session ───────────────────────────────────────────────────────────────
    pub use crate::registry::ListenerHandle;
    pub use crate::session::{
        SessionCompletion, SessionConfig, SessionEvent, SessionState, SessionStateMachine,
        SessionType, StateChange, TimerState,
    };

    // ── Metrics ───────────────────────────────────────────────────────────────
    pub use crate::aggregator::{
        AggregatorConfig, BoundedAggregator, DataPoint, DownsampledBucket, SessionSummary,
    };
    pub use crate::closed_loop::{ClosedLoopConfig, EntrainmentController, ThetaState};

    // ── Data types and errors ─────────────────────────────────────────────────
    pub use crate::error::{
        ConfigError, ControlError, DecodeError, SessionError, StreamError, TransportError,
        ValidationError,
    };
    pub use crate::types::{ControlCommand, ControlResult, DeviceStatus, TelemetryPacket};

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{
        CONTROL_CHARACTERISTIC, EEG_FREQUENCY, FLOWSTATE_SERVICE_UUID, STATUS_CHARACTERISTIC,
        TELEMETRY_CHARACTERISTIC,
    };
}
