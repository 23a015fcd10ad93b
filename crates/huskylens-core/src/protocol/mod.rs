//! HuskyLens Wire Protocol
//!
//! Implements the HuskyLens binary protocol: length-prefixed frames with an
//! additive checksum, carrying commands from the host and detection results
//! from the sensor.

pub mod commands;
mod error;
pub mod frame;
mod stream;

pub use commands::{Algorithm, Command, Opcode};
pub use error::{DecodeError, ProtocolError, TransportError};
pub use frame::{checksum, Frame, FrameCodec, PayloadBuilder, HEADER_LEN, MAX_FRAME_LEN};
