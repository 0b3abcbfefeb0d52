use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One decoded telemetry notification.
///
/// Produced by [`crate::parse::decode_telemetry`] for every frame the headset
/// pushes on [`crate::protocol::TELEMETRY_CHARACTERISTIC`].  The packet is
/// handed to the data callback of a [`crate::handlers::TelemetryHandler`] and
/// is not retained by the core afterwards.
///
/// Invariant: `samples.len() <= MAX_SAMPLES_PER_PACKET`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPacket {
    /// Device clock in milliseconds at the first sample of this frame.
    /// Wraps at `u32::MAX` (≈ 49.7 days of uptime).
    pub timestamp: u32,
    /// Frame counter emitted by the headset (wraps at 0xFFFF).
    ///
    /// Consecutive frames differ by exactly one modulo 2¹⁶; anything else is a
    /// sequence gap and is counted by the telemetry handler.
    pub sequence_number: u16,
    /// Raw EEG samples in µV, oldest first.
    pub samples: Vec<f32>,
}

/// The headset's housekeeping record.
///
/// Every status notification (or poll) produces a complete snapshot; a new
/// snapshot replaces the previous one outright.  Fields are never merged.
///
/// | Field | Source |
/// |---|---|
/// | `battery_level` | byte 1, percent |
/// | `charging` … `error` | flag bits in byte 2 |
/// | `error_code` | byte 3, meaningful only when `error` is set |
/// | `firmware_version` | bytes 4–6 as `major.minor.patch` |
/// | `signal_strength` | byte 7, RSSI in dBm |
/// | `signal_quality` | derived from `signal_strength`, 0–100 |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub battery_level: u8,
    pub charging: bool,
    pub streaming: bool,
    pub entrainment_active: bool,
    pub error: bool,
    pub error_code: u8,
    pub firmware_version: String,
    pub signal_strength: i8,
    pub signal_quality: u8,
}

/// A request written to the control characteristic.
///
/// Values are validated by [`crate::protocol::encode_command`] before any
/// bytes are produced:
///
/// | Variant | Constraint |
/// |---|---|
/// | `SetFrequency` | finite, within [`crate::protocol::ENTRAINMENT_FREQUENCY_RANGE`] |
/// | `SetVolume` | finite, within `[0.0, 1.0]` |
/// | `Raw` | payload at most [`crate::protocol::MAX_COMMAND_PAYLOAD`] bytes |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlCommand {
    StartEntrainment,
    StopEntrainment,
    /// Entrainment pulse frequency in Hz.
    SetFrequency(f32),
    /// Tone volume as a ratio of full scale.
    SetVolume(f32),
    /// Any opcode with an opaque payload, for firmware commands this crate
    /// does not model.
    Raw { opcode: u8, payload: Vec<u8> },
}

/// Outcome of a successful [`crate::handlers::ControlHandler::send`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResult {
    pub success: bool,
    pub command: ControlCommand,
    /// Wall-clock time of the acknowledged write, ms since Unix epoch.
    pub timestamp_ms: u64,
}

/// Wall-clock milliseconds since the Unix epoch; 0 if the clock is before it.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
