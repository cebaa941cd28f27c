// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Telegate
//!
//! Errors are split by the stage that raises them. Decode and clock errors
//! are recovered inside a sensor pipeline; a schema mismatch at encode time
//! stops only the sensor that produced it.

use thiserror::Error;

/// Result type alias for Telegate operations
pub type Result<T> = std::result::Result<T, TelegateError>;

/// Main error type for Telegate operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelegateError {
    /// Frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Device clock could not be used
    #[error("Clock error: {0}")]
    Clock(#[from] ClockError),

    /// Record could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Publish failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Canonical record or header could not be read back
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Pipeline was stopped by an earlier fatal error
    #[error("Sensor {sensorid} is faulted: {reason}")]
    Faulted { sensorid: String, reason: String },
}

/// Recoverable decode failures. Each one drops exactly one frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Wrong token or field count, unparsable field
    #[error("Malformed frame: {reason}")]
    Malformed { reason: String },

    /// Value outside the channel's sane bounds
    #[error("Value out of range for {channel}: {value}")]
    OutOfRange { channel: String, value: f64 },

    /// Frame checksum did not verify
    #[error("Checksum failed: expected {expected:04x}, got {actual:04x}")]
    ChecksumFailed { expected: u32, actual: u32 },

    /// Polled instrument did not answer within its window
    #[error("No response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl DecodeError {
    /// Shorthand for a malformed-frame error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Error kind without payload, used to suppress repeated warnings
    pub fn kind(&self) -> DecodeErrorKind {
        match self {
            Self::Malformed { .. } => DecodeErrorKind::Malformed,
            Self::OutOfRange { .. } => DecodeErrorKind::OutOfRange,
            Self::ChecksumFailed { .. } => DecodeErrorKind::ChecksumFailed,
            Self::Timeout { .. } => DecodeErrorKind::Timeout,
        }
    }
}

/// Payload-free discriminant of [`DecodeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    Malformed,
    OutOfRange,
    ChecksumFailed,
    Timeout,
}

/// Device clock problems. Never fatal: the host clock is used instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClockError {
    /// Device timestamp text could not be parsed
    #[error("Unparsable device timestamp: {raw:?}")]
    UnparsableTimestamp { raw: String },
}

/// Errors while scaling a sample into a canonical record
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    /// Sample channels do not match the schema layout
    #[error("Schema mismatch for {sensorid}: {reason}")]
    SchemaMismatch { sensorid: String, reason: String },

    /// Scaled value does not fit the channel field width
    #[error("Scaled value {scaled} for {channel} does not fit field '{code}'")]
    Overflow {
        channel: String,
        scaled: f64,
        code: char,
    },

    /// NaN or infinite physical value
    #[error("Non-finite value for {channel}")]
    NonFinite { channel: String },
}

impl EncodeError {
    /// Whether the error indicates a configuration fault for the whole sensor
    /// rather than a problem with one record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SchemaMismatch { .. })
    }
}

/// Errors surfaced by the publish capability
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The transport refused or failed the publish
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
}

/// Configuration problems, raised at load time
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// No decoder registered under this protocol name
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// A channel definition is unusable
    #[error("Invalid channel {key:?}: {reason}")]
    InvalidChannel { key: String, reason: String },

    /// A sensor setting is missing or unusable
    #[error("Invalid setting {field} for {sensorid}: {reason}")]
    InvalidSetting {
        sensorid: String,
        field: &'static str,
        reason: String,
    },

    /// Two sensors share an id
    #[error("Duplicate sensor id: {0}")]
    DuplicateSensor(String),
}

/// Errors reading back headers, records and buffer files
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    /// Header line does not follow the expected shape
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Layout code could not be parsed
    #[error("Invalid layout code {code:?}: {reason}")]
    InvalidLayout { code: String, reason: String },

    /// Binary record is shorter than the header declares
    #[error("Buffer too short: need {needed} bytes, got {available}")]
    BufferTooShort { needed: usize, available: usize },

    /// Text record does not match the header
    #[error("Invalid text record: {0}")]
    InvalidText(String),

    /// Timestamp fields do not form a valid date/time
    #[error("Invalid timestamp fields: {0:?}")]
    InvalidTimestamp([i64; 7]),

    /// Buffer file I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RecordError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
