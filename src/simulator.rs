//! In-process stand-ins for the headset and for upstream signal processing.
//!
//! * [`SimulatedDevice`] is a [`Transport`] that behaves like a FlowState
//!   headset: it pushes telemetry frames and status records on the real
//!   characteristic UUIDs and applies control writes to its own state.
//! * [`MetricsSimulator`] produces the derived metrics (theta power, z-score,
//!   signal quality) that upstream processing would compute from the raw
//!   samples, with slow natural drift or a forced theta state.
//!
//! Both use a deterministic noise source, so runs are repeatable.

use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::aggregator::DataPoint;
use crate::closed_loop::ThetaState;
use crate::error::TransportError;
use crate::parse::decode_command;
use crate::protocol::{
    encode_status, encode_telemetry, signal_quality_from_rssi, CONTROL_CHARACTERISTIC,
    EEG_FREQUENCY, MAX_SAMPLES_PER_PACKET, STATUS_CHARACTERISTIC, TELEMETRY_CHARACTERISTIC,
};
use crate::transport::{LoopbackTransport, Subscription, Transport};
use crate::types::{ControlCommand, DeviceStatus, TelemetryPacket};

// ── Noise ─────────────────────────────────────────────────────────────────────

/// Deterministic pseudo-random value in `[-0.5, 0.5)` for input `x`.
fn hash_noise(x: f64) -> f64 {
    (x.sin() * 9973.1).fract().abs() - 0.5
}

/// Scale for [`hash_noise`] giving a standard deviation of 1.
const UNIT_STD: f64 = 3.464_101_615; // √12

/// One synthetic EEG sample at time `t` (seconds).
///
/// | Component | Frequency | Amplitude |
/// |---|---|---|
/// | Alpha | 10 Hz | ±20 µV |
/// | Beta | 22 Hz | ±6 µV |
/// | Theta | 6 Hz | ±10 µV × `theta_gain` |
/// | Noise | — | ±4 µV |
fn sim_sample(t: f64, theta_gain: f64) -> f64 {
    let alpha = 20.0 * (2.0 * PI * 10.0 * t).sin();
    let beta = 6.0 * (2.0 * PI * 22.0 * t + 1.3).sin();
    let theta = 10.0 * theta_gain * (2.0 * PI * 6.0 * t + 0.7).sin();
    let noise = hash_noise(t * 1000.7) * 8.0;
    alpha + beta + theta + noise
}

fn theta_gain(state: Option<ThetaState>, entrainment: bool) -> f64 {
    let base = match state {
        Some(ThetaState::Low) => 0.5,
        Some(ThetaState::High) => 1.5,
        Some(ThetaState::Normal) | None => 1.0,
    };
    if entrainment {
        base * 1.3
    } else {
        base
    }
}

// ── SimulatedDevice ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Samples per telemetry frame; capped at the protocol maximum.
    pub samples_per_packet: usize,
    /// Period of status notifications.
    pub status_interval_ms: u64,
    /// Reported RSSI in dBm.
    pub rssi_dbm: i8,
    pub initial_battery: f32,
    /// Battery percent lost per status interval.
    pub battery_drain_per_status: f32,
    /// Skip every n-th telemetry frame to exercise gap detection.
    pub drop_every: Option<u64>,
    pub firmware_version: (u8, u8, u8),
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            samples_per_packet: 25,
            status_interval_ms: 1000,
            rssi_dbm: -55,
            initial_battery: 85.0,
            battery_drain_per_status: 0.01,
            drop_every: None,
            firmware_version: (1, 4, 2),
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    battery: f32,
    streaming: bool,
    entrainment: bool,
    frequency_hz: f32,
    volume: f32,
    forced: Option<ThetaState>,
    error_code: Option<u8>,
}

struct Inner {
    link: LoopbackTransport,
    config: SimulatorConfig,
    state: Mutex<DeviceState>,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> DeviceStatus {
        let s = self.state();
        let (major, minor, patch) = self.config.firmware_version;
        DeviceStatus {
            battery_level: s.battery.round().clamp(0.0, 100.0) as u8,
            charging: false,
            streaming: s.streaming,
            entrainment_active: s.entrainment,
            error: s.error_code.is_some(),
            error_code: s.error_code.unwrap_or(0),
            firmware_version: format!("{major}.{minor}.{patch}"),
            signal_strength: self.config.rssi_dbm,
            signal_quality: signal_quality_from_rssi(self.config.rssi_dbm),
        }
    }
}

/// A simulated FlowState headset.  Clones share the same device.
///
/// Call [`start_streaming`](Self::start_streaming) to begin pushing telemetry
/// and status notifications; until then subscriptions open but stay silent.
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<Inner>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl SimulatedDevice {
    pub fn new(mut config: SimulatorConfig) -> Self {
        config.samples_per_packet = config.samples_per_packet.clamp(1, MAX_SAMPLES_PER_PACKET);
        let battery = config.initial_battery.clamp(0.0, 100.0);
        Self {
            inner: Arc::new(Inner {
                link: LoopbackTransport::new(),
                config,
                state: Mutex::new(DeviceState {
                    battery,
                    streaming: false,
                    entrainment: false,
                    frequency_hz: 6.0,
                    volume: 0.5,
                    forced: None,
                    error_code: None,
                }),
                generator: Mutex::new(None),
            }),
        }
    }

    /// Current device state as a status record would report it.
    pub fn status(&self) -> DeviceStatus {
        self.inner.status()
    }

    /// Entrainment frequency and volume last set over the control channel.
    pub fn entrainment_settings(&self) -> (f32, f32) {
        let s = self.inner.state();
        (s.frequency_hz, s.volume)
    }

    /// Force the theta amplitude of generated samples.  `None` returns to
    /// normal activity.
    pub fn set_theta_state(&self, state: Option<ThetaState>) {
        self.inner.state().forced = state;
    }

    /// Raise (`Some`) or clear (`None`) the device error flag.
    pub fn set_error(&self, code: Option<u8>) {
        self.inner.state().error_code = code;
    }

    /// Simulate the radio link dropping or coming back.
    pub fn set_connected(&self, connected: bool) {
        self.inner.link.set_connected(connected);
    }

    pub fn start_streaming(&self) {
        let mut generator = self.inner.generator.lock().unwrap_or_else(|e| e.into_inner());
        if generator.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.inner.state().streaming = true;
        let weak = Arc::downgrade(&self.inner);
        *generator = Some(tokio::spawn(generate(weak)));
        info!("simulator: streaming started");
    }

    pub fn stop_streaming(&self) {
        let task = self
            .inner
            .generator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            self.inner.state().streaming = false;
            info!("simulator: streaming stopped");
        }
    }

    fn apply(&self, command: &ControlCommand) {
        let mut s = self.inner.state();
        match command {
            ControlCommand::StartEntrainment => s.entrainment = true,
            ControlCommand::StopEntrainment => s.entrainment = false,
            ControlCommand::SetFrequency(hz) => s.frequency_hz = *hz,
            ControlCommand::SetVolume(v) => s.volume = *v,
            ControlCommand::Raw { opcode, payload } => {
                debug!("simulator: ignoring raw opcode 0x{opcode:02x} ({} bytes)", payload.len());
            }
        }
    }
}

async fn generate(weak: Weak<Inner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let spp = inner.config.samples_per_packet;
    let period = Duration::from_secs_f64(spp as f64 / EEG_FREQUENCY);
    let status_every =
        ((inner.config.status_interval_ms as f64 / 1000.0) / period.as_secs_f64()).round().max(1.0)
            as u64;
    let drop_every = inner.config.drop_every.filter(|&k| k > 0);
    drop(inner);

    let dt = 1.0 / EEG_FREQUENCY;
    let started = Instant::now();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut t = 0.0_f64;
    let mut seq: u16 = 0;
    let mut frames: u64 = 0;

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let gain = {
            let s = inner.state();
            theta_gain(s.forced, s.entrainment)
        };
        let packet = TelemetryPacket {
            timestamp: started.elapsed().as_millis() as u32,
            sequence_number: seq,
            samples: (0..spp)
                .map(|i| sim_sample(t + i as f64 * dt, gain) as f32)
                .collect(),
        };
        t += spp as f64 * dt;
        seq = seq.wrapping_add(1);
        frames += 1;

        if drop_every.is_some_and(|k| frames % k == 0) {
            debug!("simulator: dropping frame seq={}", packet.sequence_number);
        } else {
            match encode_telemetry(&packet) {
                Ok(bytes) => {
                    inner.link.notify(TELEMETRY_CHARACTERISTIC, &bytes);
                }
                Err(e) => warn!("simulator: {e}"),
            }
        }

        if frames % status_every == 0 {
            {
                let mut s = inner.state();
                s.battery = (s.battery - inner.config.battery_drain_per_status).max(0.0);
            }
            inner
                .link
                .notify(STATUS_CHARACTERISTIC, &encode_status(&inner.status()));
        }
    }
}

fn known(characteristic: Uuid) -> Result<(), TransportError> {
    if [TELEMETRY_CHARACTERISTIC, STATUS_CHARACTERISTIC, CONTROL_CHARACTERISTIC]
        .contains(&characteristic)
    {
        Ok(())
    } else {
        Err(TransportError::CharacteristicNotFound(characteristic))
    }
}

#[async_trait]
impl Transport for SimulatedDevice {
    async fn subscribe(&self, characteristic: Uuid) -> Result<Subscription, TransportError> {
        known(characteristic)?;
        self.inner.link.subscribe(characteristic).await
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        if characteristic != CONTROL_CHARACTERISTIC {
            known(characteristic)?;
            return Err(TransportError::Ble(format!(
                "characteristic {characteristic} is not writable"
            )));
        }
        self.inner.link.write(characteristic, payload).await?;
        let command = decode_command(payload)
            .map_err(|e| TransportError::Ble(format!("device rejected command: {e}")))?;
        info!("simulator: applying {command:?}");
        self.apply(&command);
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        if characteristic != STATUS_CHARACTERISTIC {
            known(characteristic)?;
            return Err(TransportError::Ble(format!(
                "characteristic {characteristic} is not readable"
            )));
        }
        if !self.inner.link.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(encode_status(&self.inner.status()).to_vec())
    }
}

// ── MetricsSimulator ──────────────────────────────────────────────────────────

/// Baseline theta power in µV².
pub const BASELINE_THETA_MEAN: f64 = 10.0;
pub const BASELINE_THETA_STD: f64 = 2.0;
const SIGNAL_QUALITY_MEAN: f64 = 85.0;
const SIGNAL_QUALITY_STD: f64 = 5.0;
/// Probability of a blink-like artifact per sample.
const ARTIFACT_RATE: f64 = 0.02;

/// Generates derived metrics with slow drift around a fixed baseline.
///
/// | Mode | Theta power |
/// |---|---|
/// | natural | mean + 3·sin(phase) + noise, phase advancing 0.02 per sample |
/// | forced low | mean − 2·std |
/// | forced normal | mean |
/// | forced high | mean + 2·std |
#[derive(Debug, Clone)]
pub struct MetricsSimulator {
    forced: Option<ThetaState>,
    drift_phase: f64,
    counter: u64,
    seed: f64,
}

impl MetricsSimulator {
    pub fn new(seed: u64) -> Self {
        let seed = seed as f64;
        Self {
            forced: None,
            drift_phase: (hash_noise(seed * 0.618) + 0.5) * 2.0 * PI,
            counter: 0,
            seed,
        }
    }

    pub fn set_state(&mut self, state: Option<ThetaState>) {
        self.forced = state;
    }

    pub fn forced_state(&self) -> Option<ThetaState> {
        self.forced
    }

    /// Noise with zero mean and standard deviation `std`.
    fn noise(&mut self, std: f64) -> f64 {
        self.counter += 1;
        hash_noise(self.counter as f64 * 12.9898 + self.seed * 78.233) * UNIT_STD * std
    }

    pub fn next_point(&mut self, timestamp_ms: u64) -> DataPoint {
        let theta_power = match self.forced {
            Some(ThetaState::Low) => {
                (BASELINE_THETA_MEAN - 2.0 * BASELINE_THETA_STD + self.noise(BASELINE_THETA_STD * 0.1))
                    .max(0.1)
            }
            Some(ThetaState::High) => {
                BASELINE_THETA_MEAN + 2.0 * BASELINE_THETA_STD + self.noise(BASELINE_THETA_STD * 0.1)
            }
            Some(ThetaState::Normal) => BASELINE_THETA_MEAN + self.noise(BASELINE_THETA_STD * 0.1),
            None => {
                self.drift_phase += 0.02;
                let drift = 3.0 * self.drift_phase.sin();
                (BASELINE_THETA_MEAN + drift + self.noise(BASELINE_THETA_STD * 0.3)).max(0.1)
            }
        };
        let z_score = (theta_power - BASELINE_THETA_MEAN) / BASELINE_THETA_STD;
        let is_artifact = self.noise(1.0) / UNIT_STD + 0.5 < ARTIFACT_RATE;
        let mut signal_quality =
            (SIGNAL_QUALITY_MEAN + self.noise(SIGNAL_QUALITY_STD)).clamp(0.0, 100.0);
        if is_artifact {
            signal_quality = (signal_quality - 40.0).max(0.0);
        }
        DataPoint {
            timestamp_ms,
            theta_power,
            z_score,
            signal_quality,
            is_artifact,
        }
    }
}
