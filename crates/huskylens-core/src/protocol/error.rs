//! Protocol errors

use thiserror::Error;

use super::Opcode;

/// Errors produced while validating an incoming frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Frame header does not match the device profile")]
    BadHeader,

    #[error("{0} unexpected bytes after the frame")]
    TrailingBytes(usize),
}

/// Errors raised by a physical transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("I2C bus error: {0}")]
    Bus(String),

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Bridge link error: {0}")]
    Link(String),

    #[error("Receive buffer overrun, {0} chunks lost")]
    Overrun(u64),

    #[error("Transport disconnected")]
    Disconnected,
}

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Transport disconnected")]
    TransportDisconnected,

    #[error("Busy channel did not complete the write before the recovery timeout")]
    ChannelBusyTimeout,

    #[error("No response from HuskyLens")]
    Timeout,

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Unsupported algorithm code: {0}")]
    UnsupportedAlgorithm(u8),

    #[error("Payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    #[error("Unexpected response: expected {expected:?}, got {actual:?}")]
    UnexpectedResponse { expected: Opcode, actual: Opcode },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Whether the failure came from the link rather than the data on it
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::TransportDisconnected
                | ProtocolError::ChannelBusyTimeout
                | ProtocolError::Transport(_)
        )
    }
}
