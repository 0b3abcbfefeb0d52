//! GATT UUIDs, wire-format constants, and encoders for FlowState headsets.
//!
//! All UUIDs belong to the FlowState vendor namespace
//! `f10eXXXX-b5a3-f393-e0a9-e50e24dcca9e`.
//!
//! Decoders for the same records live in [`crate::parse`].

use std::ops::RangeInclusive;

use uuid::Uuid;

use crate::error::ValidationError;
use crate::types::{ControlCommand, DeviceStatus, TelemetryPacket};

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service advertised by FlowState headsets.
///
/// Used as the scan filter in [`crate::ble::BleTransport::scan_all`].
pub const FLOWSTATE_SERVICE_UUID: Uuid = Uuid::from_u128(0xf10e0000_b5a3_f393_e0a9_e50e24dcca9e);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Telemetry characteristic (notify).  One frame per notification, see
/// [`crate::parse::decode_telemetry`].
pub const TELEMETRY_CHARACTERISTIC: Uuid = Uuid::from_u128(0xf10e0001_b5a3_f393_e0a9_e50e24dcca9e);

/// Status characteristic (notify + read).  One fixed-size
/// [`DeviceStatus`] record per notification or read.
pub const STATUS_CHARACTERISTIC: Uuid = Uuid::from_u128(0xf10e0002_b5a3_f393_e0a9_e50e24dcca9e);

/// Control characteristic (write with response).  Carries one encoded
/// [`ControlCommand`] per write.
pub const CONTROL_CHARACTERISTIC: Uuid = Uuid::from_u128(0xf10e0003_b5a3_f393_e0a9_e50e24dcca9e);

// ── Telemetry frame ───────────────────────────────────────────────────────────

/// `timestamp:u32 + sequence:u16 + sample_count:u16`, little-endian.
pub const TELEMETRY_HEADER_LEN: usize = 8;

/// Upper bound on samples in one frame.
///
/// 64 × 4 bytes + 8 header bytes = 264 bytes, which fits a single notification
/// at the 512-byte ATT MTU the headset negotiates.
pub const MAX_SAMPLES_PER_PACKET: usize = 64;

/// EEG sample rate of the headset in Hz.
pub const EEG_FREQUENCY: f64 = 250.0;

// ── Status record ─────────────────────────────────────────────────────────────

/// Status schema version understood by this crate.
pub const STATUS_SCHEMA_VERSION: u8 = 1;

/// Status records are exactly this long.
pub const STATUS_RECORD_LEN: usize = 8;

/// Flag bits in status byte 2.
pub mod status_flags {
    pub const CHARGING: u8 = 0b0000_0001;
    pub const STREAMING: u8 = 0b0000_0010;
    pub const ENTRAINMENT: u8 = 0b0000_0100;
    pub const ERROR: u8 = 0b0000_1000;
    pub const RESERVED: u8 = 0b1111_0000;
}

/// RSSI at or below which signal quality is 0.
pub const RSSI_FLOOR_DBM: i8 = -100;
/// RSSI at or above which signal quality is 100.
pub const RSSI_CEILING_DBM: i8 = -40;

/// Map an RSSI reading onto a 0–100 quality score.
///
/// Linear between [`RSSI_FLOOR_DBM`] and [`RSSI_CEILING_DBM`], clamped at both
/// ends.
pub fn signal_quality_from_rssi(rssi: i8) -> u8 {
    let span = (RSSI_CEILING_DBM as i32 - RSSI_FLOOR_DBM as i32) as f32;
    let pos = (rssi as i32 - RSSI_FLOOR_DBM as i32) as f32;
    (pos / span * 100.0).round().clamp(0.0, 100.0) as u8
}

// ── Control record ────────────────────────────────────────────────────────────

/// Control opcodes (byte 0 of every control write).
pub mod opcode {
    pub const START_ENTRAINMENT: u8 = 0x01;
    pub const STOP_ENTRAINMENT: u8 = 0x02;
    pub const SET_FREQUENCY: u8 = 0x03;
    pub const SET_VOLUME: u8 = 0x04;
}

/// Largest payload a control write may carry.
pub const MAX_COMMAND_PAYLOAD: usize = 16;

/// Entrainment frequencies the headset accepts (theta band), in Hz.
pub const ENTRAINMENT_FREQUENCY_RANGE: RangeInclusive<f32> = 4.0..=8.0;

/// Volume ratios the headset accepts.
pub const VOLUME_RANGE: RangeInclusive<f32> = 0.0..=1.0;

/// Check a command against the device's parameter ranges.
///
/// `NaN` and infinities are rejected because `RangeInclusive::contains` is
/// false for them.
pub fn validate_command(cmd: &ControlCommand) -> Result<(), ValidationError> {
    match cmd {
        ControlCommand::SetFrequency(hz) if !ENTRAINMENT_FREQUENCY_RANGE.contains(hz) => {
            Err(ValidationError::Frequency {
                hz: *hz,
                min: *ENTRAINMENT_FREQUENCY_RANGE.start(),
                max: *ENTRAINMENT_FREQUENCY_RANGE.end(),
            })
        }
        ControlCommand::SetVolume(v) if !VOLUME_RANGE.contains(v) => {
            Err(ValidationError::Volume(*v))
        }
        ControlCommand::Raw { payload, .. } if payload.len() > MAX_COMMAND_PAYLOAD => {
            Err(ValidationError::PayloadTooLong {
                len: payload.len(),
                max: MAX_COMMAND_PAYLOAD,
            })
        }
        _ => Ok(()),
    }
}

/// Encode a command for the control characteristic.
///
/// ```text
/// byte 0     : opcode
/// byte 1     : payload length N
/// bytes 2..  : N payload bytes (f32 LE for frequency / volume)
/// ```
///
/// Nothing is produced for an invalid command.
///
/// # Example
///
/// ```
/// # use flowstate_rs::protocol::encode_command;
/// # use flowstate_rs::types::ControlCommand;
/// assert_eq!(encode_command(&ControlCommand::StartEntrainment).unwrap(), &[0x01, 0x00]);
/// assert!(encode_command(&ControlCommand::SetFrequency(12.0)).is_err());
/// ```
pub fn encode_command(cmd: &ControlCommand) -> Result<Vec<u8>, ValidationError> {
    validate_command(cmd)?;
    let (op, payload): (u8, Vec<u8>) = match cmd {
        ControlCommand::StartEntrainment => (opcode::START_ENTRAINMENT, vec![]),
        ControlCommand::StopEntrainment => (opcode::STOP_ENTRAINMENT, vec![]),
        ControlCommand::SetFrequency(hz) => (opcode::SET_FREQUENCY, hz.to_le_bytes().to_vec()),
        ControlCommand::SetVolume(v) => (opcode::SET_VOLUME, v.to_le_bytes().to_vec()),
        ControlCommand::Raw { opcode, payload } => (*opcode, payload.clone()),
    };
    let mut bytes = Vec::with_capacity(2 + payload.len());
    bytes.push(op);
    // validate_command bounds the payload to MAX_COMMAND_PAYLOAD
    bytes.push(payload.len() as u8);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

// ── Device-side encoders ──────────────────────────────────────────────────────
//
// The headset firmware produces these records; the crate needs them for the
// built-in simulator and for tests.

/// Encode a telemetry frame exactly as the headset sends it.
pub fn encode_telemetry(packet: &TelemetryPacket) -> Result<Vec<u8>, ValidationError> {
    if packet.samples.len() > MAX_SAMPLES_PER_PACKET {
        return Err(ValidationError::TooManySamples {
            count: packet.samples.len(),
            max: MAX_SAMPLES_PER_PACKET,
        });
    }
    let mut bytes = Vec::with_capacity(TELEMETRY_HEADER_LEN + packet.samples.len() * 4);
    bytes.extend_from_slice(&packet.timestamp.to_le_bytes());
    bytes.extend_from_slice(&packet.sequence_number.to_le_bytes());
    bytes.extend_from_slice(&(packet.samples.len() as u16).to_le_bytes());
    for s in &packet.samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    Ok(bytes)
}

/// Encode a status record.  `signal_quality` is derived on decode and is not
/// transmitted; unparseable firmware components are sent as zero.
pub fn encode_status(status: &DeviceStatus) -> [u8; STATUS_RECORD_LEN] {
    let mut flags = 0u8;
    if status.charging {
        flags |= status_flags::CHARGING;
    }
    if status.streaming {
        flags |= status_flags::STREAMING;
    }
    if status.entrainment_active {
        flags |= status_flags::ENTRAINMENT;
    }
    if status.error {
        flags |= status_flags::ERROR;
    }
    let mut fw = [0u8; 3];
    for (slot, part) in fw.iter_mut().zip(status.firmware_version.split('.')) {
        *slot = part.parse().unwrap_or(0);
    }
    let [rssi] = status.signal_strength.to_le_bytes();
    [
        STATUS_SCHEMA_VERSION,
        status.battery_level.min(100),
        flags,
        status.error_code,
        fw[0],
        fw[1],
        fw[2],
        rssi,
    ]
}
