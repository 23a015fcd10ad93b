//! Device description table
//!
//! Opcode values, frame header bytes and screen geometry are device-defined
//! constants. They are kept in a [`DeviceProfile`] so that firmware variants
//! can be described in JSON instead of patching the codec.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::protocol::{Opcode, ProtocolError};

/// Default 7-bit I2C address of the HuskyLens
pub const DEFAULT_I2C_ADDRESS: u8 = 0x32;

/// HuskyLens screen width in pixels
pub const SCREEN_WIDTH: u16 = 320;

/// HuskyLens screen height in pixels
pub const SCREEN_HEIGHT: u16 = 240;

/// Frame layout and opcode table for one device family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    /// Human readable profile name
    pub name: String,
    /// Two magic bytes opening every frame
    pub header: [u8; 2],
    /// Protocol address byte following the magic
    pub address: u8,
    /// 7-bit I2C address used by the direct transport
    pub i2c_address: u8,
    /// Screen width in pixels
    pub screen_width: u16,
    /// Screen height in pixels
    pub screen_height: u16,
    /// Opcode byte values keyed by opcode name
    pub opcodes: BTreeMap<Opcode, u8>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::huskylens()
    }
}

impl DeviceProfile {
    /// Built-in table for HuskyLens firmware 0.5.x
    pub fn huskylens() -> Self {
        let opcodes = BTreeMap::from([
            (Opcode::Request, 0x20),
            (Opcode::RequestBlocks, 0x21),
            (Opcode::RequestArrows, 0x22),
            (Opcode::RequestLearned, 0x23),
            (Opcode::RequestById, 0x26),
            (Opcode::ReturnInfo, 0x29),
            (Opcode::ReturnBlock, 0x2A),
            (Opcode::ReturnArrow, 0x2B),
            (Opcode::Knock, 0x2C),
            (Opcode::SelectAlgorithm, 0x2D),
            (Opcode::ReturnOk, 0x2E),
            (Opcode::SetCustomName, 0x2F),
            (Opcode::Photo, 0x30),
            (Opcode::SaveModel, 0x32),
            (Opcode::LoadModel, 0x33),
            (Opcode::CustomText, 0x34),
            (Opcode::ClearText, 0x35),
            (Opcode::Learn, 0x36),
            (Opcode::Forget, 0x37),
            (Opcode::Screenshot, 0x39),
            (Opcode::ReturnBusy, 0x3D),
        ]);

        Self {
            name: "HuskyLens".to_string(),
            header: [0x55, 0xAA],
            address: 0x11,
            i2c_address: DEFAULT_I2C_ADDRESS,
            screen_width: SCREEN_WIDTH,
            screen_height: SCREEN_HEIGHT,
            opcodes,
        }
    }

    /// Parse a profile from JSON. Opcodes missing from the JSON keep their
    /// built-in values.
    pub fn from_json_str(json: &str) -> Result<Self, ProtocolError> {
        let mut profile: DeviceProfile = serde_json::from_str(json)?;
        profile.fill_missing_opcodes();
        profile.validate()?;
        Ok(profile)
    }

    pub(crate) fn fill_missing_opcodes(&mut self) {
        for (opcode, value) in Self::huskylens().opcodes {
            self.opcodes.entry(opcode).or_insert(value);
        }
    }

    /// Load a profile from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Reject tables where two opcodes share a byte, since decoding would
    /// become ambiguous
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let mut seen: BTreeMap<u8, Opcode> = BTreeMap::new();
        for (&opcode, &value) in &self.opcodes {
            if let Some(previous) = seen.insert(value, opcode) {
                return Err(ProtocolError::Config(format!(
                    "opcode {:#04x} assigned to both {:?} and {:?}",
                    value, previous, opcode
                )));
            }
        }
        if self.screen_width == 0 || self.screen_height == 0 {
            return Err(ProtocolError::Config("screen size must be non-zero".into()));
        }
        Ok(())
    }

    /// Byte value for an opcode
    pub fn opcode_byte(&self, opcode: Opcode) -> Result<u8, ProtocolError> {
        self.opcodes
            .get(&opcode)
            .copied()
            .ok_or_else(|| ProtocolError::Config(format!("no byte value for {:?}", opcode)))
    }

    /// Reverse lookup of a received command byte
    pub fn opcode_for(&self, byte: u8) -> Option<Opcode> {
        self.opcodes
            .iter()
            .find(|(_, &value)| value == byte)
            .map(|(&opcode, _)| opcode)
    }

    /// Screen center in pixels
    pub fn screen_center(&self) -> (f64, f64) {
        (
            self.screen_width as f64 / 2.0,
            self.screen_height as f64 / 2.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_table_is_valid() {
        let profile = DeviceProfile::huskylens();
        profile.validate().unwrap();
        assert_eq!(profile.opcode_byte(Opcode::Request).unwrap(), 0x20);
        assert_eq!(profile.opcode_for(0x2A), Some(Opcode::ReturnBlock));
        assert_eq!(profile.opcode_for(0x99), None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let profile =
            DeviceProfile::from_json_str(r#"{ "name": "patched", "opcodes": { "knock": 76 } }"#)
                .unwrap();
        assert_eq!(profile.name, "patched");
        assert_eq!(profile.opcode_byte(Opcode::Knock).unwrap(), 76);
        assert_eq!(profile.opcode_byte(Opcode::ReturnInfo).unwrap(), 0x29);
        assert_eq!(profile.header, [0x55, 0xAA]);
    }

    #[test]
    fn test_duplicate_opcode_rejected() {
        let err = DeviceProfile::from_json_str(r#"{ "opcodes": { "knock": 32 } }"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "screen_width": 640, "screen_height": 480 }}"#).unwrap();

        let profile = DeviceProfile::from_file(file.path()).unwrap();
        assert_eq!(profile.screen_center(), (320.0, 240.0));
    }
}
