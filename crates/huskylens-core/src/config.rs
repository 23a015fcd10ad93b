//! Runtime configuration
//!
//! Everything tunable lives in one [`HuskyLensConfig`] that round-trips
//! through JSON. Missing fields take their defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::profile::DeviceProfile;
use crate::protocol::ProtocolError;
use crate::{DEFAULT_BAUD_RATE, DEFAULT_RESPONSE_TIMEOUT_MS};

/// GATT service exposed by the BLE bridge
pub const BRIDGE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0b50f3e4_607f_4151_9091_7d008d6ffc5c);

/// Write characteristic of the BLE bridge
pub const BRIDGE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0b500100_607f_4151_9091_7d008d6ffc5c);

/// Bridge command id routed to the sensor port
pub const DEFAULT_BRIDGE_CHANNEL: u8 = 0x01;

/// Command queue timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delay between attempts while the channel is busy
    pub retry_delay_ms: u64,

    /// Time a dispatched write may hold the busy flag before it is
    /// force-cleared
    pub recovery_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1,
            recovery_timeout_ms: 1000,
        }
    }
}

impl QueueConfig {
    /// Pause between write attempts while the channel is busy
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Longest a single write may hold the channel
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3"). `None` picks the first
    /// port found.
    pub port: Option<String>,

    /// Baud rate
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// BLE bridge addressing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// GATT service of the bridge
    pub service: Uuid,

    /// Characteristic the bridge forwards writes from and notifies on
    pub characteristic: Uuid,

    /// Bridge command id prefixed to every frame
    pub channel_id: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            service: BRIDGE_SERVICE_UUID,
            characteristic: BRIDGE_CHARACTERISTIC_UUID,
            channel_id: DEFAULT_BRIDGE_CHANNEL,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HuskyLensConfig {
    /// How long to wait for the device to answer a command
    pub response_timeout_ms: u64,

    /// Command queue timing
    pub queue: QueueConfig,

    /// UART settings
    pub serial: SerialConfig,

    /// BLE bridge settings
    pub relay: RelayConfig,

    /// Opcode table and device constants
    pub profile: DeviceProfile,
}

impl Default for HuskyLensConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            queue: QueueConfig::default(),
            serial: SerialConfig::default(),
            relay: RelayConfig::default(),
            profile: DeviceProfile::default(),
        }
    }
}

impl HuskyLensConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self, ProtocolError> {
        let mut config: HuskyLensConfig = serde_json::from_str(json)?;
        config.profile.fill_missing_opcodes();
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Write the configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProtocolError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check timings and the device profile
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.response_timeout_ms == 0 {
            return Err(ProtocolError::Config(
                "response_timeout_ms must be non-zero".into(),
            ));
        }
        if self.queue.retry_delay_ms == 0 {
            return Err(ProtocolError::Config("retry_delay_ms must be non-zero".into()));
        }
        if self.queue.recovery_timeout_ms < self.queue.retry_delay_ms {
            return Err(ProtocolError::Config(
                "recovery_timeout_ms must not be shorter than retry_delay_ms".into(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(ProtocolError::Config("baud_rate must be non-zero".into()));
        }
        self.profile.validate()
    }

    /// Response timeout as a `Duration`
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}
