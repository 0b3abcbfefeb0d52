//! Binary decoders for FlowState BLE payloads.
//!
//! All public functions in this module are pure (no I/O, no allocation beyond
//! the returned values) and are safe to call from any async or sync context.
//! A malformed buffer is reported as a [`DecodeError`] value; nothing here
//! panics, whatever the input.
//!
//! | Function | Characteristic | Format |
//! |---|---|---|
//! | [`decode_telemetry`] | telemetry | `u32` ts, `u16` seq, `u16` N, N × `f32`, all LE |
//! | [`decode_status`] | status | 8-byte versioned record |
//! | [`decode_command`] | control (echo) | opcode, length, payload |

use crate::cursor::ByteCursor;
use crate::error::DecodeError;
use crate::protocol::{
    opcode, signal_quality_from_rssi, status_flags, validate_command, MAX_SAMPLES_PER_PACKET,
    STATUS_RECORD_LEN, STATUS_SCHEMA_VERSION,
};
use crate::types::{ControlCommand, DeviceStatus, TelemetryPacket};

// ── Telemetry ─────────────────────────────────────────────────────────────────

/// Decode one telemetry notification.
///
/// ```text
/// [0..4]   timestamp      u32 LE
/// [4..6]   sequence       u16 LE
/// [6..8]   sample count N u16 LE
/// [8..]    N × f32 LE samples
/// ```
///
/// The buffer must be exactly `8 + 4·N` bytes long and `N` must not exceed
/// [`MAX_SAMPLES_PER_PACKET`].
pub fn decode_telemetry(data: &[u8]) -> Result<TelemetryPacket, DecodeError> {
    let mut c = ByteCursor::new("telemetry frame", data);
    let timestamp = c.read_u32()?;
    let sequence_number = c.read_u16()?;
    let count = c.read_u16()? as usize;
    if count > MAX_SAMPLES_PER_PACKET {
        return Err(DecodeError::TooManySamples {
            count,
            max: MAX_SAMPLES_PER_PACKET,
        });
    }
    // Check the full declared length up front so the error reports it.
    c.require(count * 4)?;
    let samples = (0..count)
        .map(|_| c.read_f32())
        .collect::<Result<Vec<_>, _>>()?;
    c.finish()?;
    Ok(TelemetryPacket {
        timestamp,
        sequence_number,
        samples,
    })
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Decode a status record (schema version 1).
///
/// | Byte | Field |
/// |---|---|
/// | 0 | schema version, must be [`STATUS_SCHEMA_VERSION`] |
/// | 1 | battery percent (0–100) |
/// | 2 | flags, see [`status_flags`]; reserved bits must be clear |
/// | 3 | error code |
/// | 4–6 | firmware major / minor / patch |
/// | 7 | RSSI, `i8` dBm |
pub fn decode_status(data: &[u8]) -> Result<DeviceStatus, DecodeError> {
    let mut c = ByteCursor::new("status record", data);
    let version = c.read_u8()?;
    if version != STATUS_SCHEMA_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    c.require(STATUS_RECORD_LEN - 1)?;

    let battery_level = c.read_u8()?;
    if battery_level > 100 {
        return Err(DecodeError::OutOfRange {
            field: "battery_level",
            value: battery_level as i64,
        });
    }
    let flags = c.read_u8()?;
    if flags & status_flags::RESERVED != 0 {
        return Err(DecodeError::ReservedBits(flags & status_flags::RESERVED));
    }
    let error_code = c.read_u8()?;
    let fw = c.read_bytes(3)?;
    let firmware_version = format!("{}.{}.{}", fw[0], fw[1], fw[2]);
    let signal_strength = c.read_i8()?;
    c.finish()?;

    Ok(DeviceStatus {
        battery_level,
        charging: flags & status_flags::CHARGING != 0,
        streaming: flags & status_flags::STREAMING != 0,
        entrainment_active: flags & status_flags::ENTRAINMENT != 0,
        error: flags & status_flags::ERROR != 0,
        error_code,
        firmware_version,
        signal_strength,
        signal_quality: signal_quality_from_rssi(signal_strength),
    })
}

// ── Control echo ──────────────────────────────────────────────────────────────

/// Decode a control record back into a [`ControlCommand`].
///
/// The headset echoes accepted commands on some firmware; the simulator uses
/// this to apply writes.  Known opcodes decode to their typed variant and are
/// re-validated, so an echoed out-of-band frequency is an error rather than a
/// command.  Any other opcode becomes [`ControlCommand::Raw`].
pub fn decode_command(data: &[u8]) -> Result<ControlCommand, DecodeError> {
    let mut c = ByteCursor::new("control record", data);
    let op = c.read_u8()?;
    let len = c.read_u8()? as usize;
    let payload = c.read_bytes(len)?;
    c.finish()?;

    let mut p = ByteCursor::new("control payload", payload);
    let cmd = match op {
        opcode::START_ENTRAINMENT if len == 0 => ControlCommand::StartEntrainment,
        opcode::STOP_ENTRAINMENT if len == 0 => ControlCommand::StopEntrainment,
        opcode::SET_FREQUENCY if len == 4 => ControlCommand::SetFrequency(p.read_f32()?),
        opcode::SET_VOLUME if len == 4 => ControlCommand::SetVolume(p.read_f32()?),
        opcode::START_ENTRAINMENT
        | opcode::STOP_ENTRAINMENT
        | opcode::SET_FREQUENCY
        | opcode::SET_VOLUME => {
            return Err(DecodeError::OutOfRange {
                field: "control payload length",
                value: len as i64,
            })
        }
        _ => ControlCommand::Raw {
            opcode: op,
            payload: payload.to_vec(),
        },
    };
    validate_command(&cmd)?;
    Ok(cmd)
}
