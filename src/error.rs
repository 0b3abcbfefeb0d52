//! Error taxonomy for the session core.
//!
//! Every expected failure is returned as a typed value or delivered to an
//! error callback; none of these are raised as panics.

use thiserror::Error;

use crate::session::{SessionEvent, SessionState};

/// A telemetry, status, or command buffer that does not match its wire schema.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Fewer bytes than the header (or the declared payload) requires.
    #[error("truncated {what}: need {needed} bytes, got {got}")]
    Truncated {
        /// Record being decoded.
        what: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        got: usize,
    },

    /// Bytes left over after the declared record length.
    #[error("{what} has {extra} trailing byte(s) after the declared length")]
    TrailingBytes {
        /// Record being decoded.
        what: &'static str,
        /// Number of unread bytes.
        extra: usize,
    },

    /// Declared sample count exceeds the protocol maximum.
    #[error("telemetry frame declares {count} samples, maximum is {max}")]
    TooManySamples {
        /// Declared count.
        count: usize,
        /// Protocol maximum.
        max: usize,
    },

    /// Status record schema version this decoder does not understand.
    #[error("unsupported status schema version {0}")]
    UnsupportedVersion(u8),

    /// A field holds a value outside its documented range.
    #[error("{field} out of range: {value}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Offending raw value.
        value: i64,
    },

    /// Reserved bits were set in a flags byte.
    #[error("reserved status flag bits set: 0x{0:02x}")]
    ReservedBits(u8),

    /// A decoded command failed validation.
    #[error("decoded command is invalid: {0}")]
    InvalidCommand(#[from] ValidationError),
}

/// A control command or outgoing frame with out-of-range parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Entrainment frequency outside the device band.
    #[error("frequency {hz} Hz outside [{min}, {max}] Hz")]
    Frequency {
        /// Requested frequency.
        hz: f32,
        /// Band lower bound.
        min: f32,
        /// Band upper bound.
        max: f32,
    },

    /// Volume ratio outside `[0, 1]`.
    #[error("volume {0} outside [0, 1]")]
    Volume(f32),

    /// Raw command payload longer than the control record allows.
    #[error("command payload is {len} bytes, maximum is {max}")]
    PayloadTooLong {
        /// Payload length.
        len: usize,
        /// Maximum length.
        max: usize,
    },

    /// Outgoing telemetry frame with too many samples.
    #[error("telemetry frame has {count} samples, maximum is {max}")]
    TooManySamples {
        /// Sample count.
        count: usize,
        /// Protocol maximum.
        max: usize,
    },
}

/// A failure of the wireless link while subscribing, reading, or writing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel is closed, not yet opened, or reconnecting.
    #[error("transport not connected")]
    NotConnected,

    /// The requested characteristic is not exposed by the peripheral.
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    /// The operation did not complete within the transport's timeout.
    #[error("{op} timed out after {millis} ms")]
    Timeout {
        /// Operation name.
        op: &'static str,
        /// Timeout in milliseconds.
        millis: u64,
    },

    /// Error reported by the underlying BLE stack.
    #[error("BLE error: {0}")]
    Ble(String),
}

/// A session configuration problem.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `set_config` outside the idle state.
    #[error("session config can only be set while idle (state is {0:?})")]
    NotIdle(SessionState),

    /// `start` without a config attached.
    #[error("session config missing")]
    Missing,

    /// A config value is out of range.
    #[error("invalid session config: {0}")]
    Invalid(String),
}

/// A rejected session event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The event is not legal in the current state; state is unchanged.
    #[error("invalid transition: {event:?} in state {from:?}")]
    InvalidTransition {
        /// State at the time of the event.
        from: SessionState,
        /// Rejected event.
        event: SessionEvent,
    },

    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The session clock needs a tokio runtime and none is running.
    #[error("session clock needs a running tokio runtime")]
    NoRuntime,
}

/// Why a control command was not delivered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// Rejected before any bytes were written.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The write itself failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// An aggregator checkpoint that cannot be restored.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The checkpoint JSON is malformed.
    #[error("malformed aggregator checkpoint: {0}")]
    Json(#[from] serde_json::Error),

    /// The checkpoint's counters disagree with its contents.
    #[error("inconsistent aggregator checkpoint: {0}")]
    Inconsistent(String),
}

/// A problem reported to a stream handler's error callback.  The stream keeps
/// running after either kind.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    /// A notification or read did not decode.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The link reported an error for this characteristic.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
