//! # HuskyLens Core Library
//!
//! Host-side protocol core for the DFRobot HuskyLens vision sensor.
//!
//! This library provides:
//! - Frame encoding and decoding for the HuskyLens binary protocol
//! - Typed detection results (blocks and arrows) with derived queries
//! - Transports over direct I2C, UART, or a shared BLE bridge
//! - A single-writer command queue guarding shared channels
//! - The protocol engine tying them together
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use huskylens_core::prelude::*;
//!
//! let config = HuskyLensConfig::default();
//! let transport = Arc::new(SerialTransport::open(&config.serial)?);
//! let lens = HuskylensProtocol::new(transport, &config);
//!
//! lens.begin().await;
//! lens.init_mode(Algorithm::FaceRecognition).await;
//! if lens.request().await && lens.is_appear(ResultKind::Block) {
//!     println!("Face at x={}", lens.read_box(BoxField::XCenter));
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod engine;
pub mod profile;
pub mod protocol;
pub mod queue;
pub mod result;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{HuskyLensConfig, QueueConfig, RelayConfig, SerialConfig};
    pub use crate::engine::{HuskylensProtocol, SessionState};
    pub use crate::profile::DeviceProfile;
    pub use crate::protocol::{Algorithm, Command, FrameCodec, Opcode, ProtocolError};
    pub use crate::result::{Arrow, ArrowField, Block, BoxField, ResultKind, ResultSet};
    pub use crate::transport::{
        BridgeLink, ChannelId, DirectTransport, RelayedTransport, SerialTransport, Transport,
    };
}

/// HuskyLens UART speed
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default time to wait for a device response
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 1000;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
