//! Protocol commands
//!
//! Defines the opcodes, algorithms and command set spoken by the HuskyLens.
//! Opcode byte values are not hard-coded here; they come from the
//! [`DeviceProfile`](crate::profile::DeviceProfile) table.

use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Symbolic frame kinds, looked up in the device profile by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    /// Poll blocks and arrows once
    Request,
    /// Poll blocks only
    RequestBlocks,
    /// Poll arrows only
    RequestArrows,
    /// Poll learned results (also reports the learned-ID count)
    RequestLearned,
    /// Poll results of a single ID
    RequestById,
    /// Result header: object count, learned-ID count, frame number
    ReturnInfo,
    /// Block record
    ReturnBlock,
    /// Arrow record
    ReturnArrow,
    /// Liveness check
    Knock,
    /// Switch algorithm
    SelectAlgorithm,
    /// Generic acknowledgement
    ReturnOk,
    /// Assign a custom name to an ID
    SetCustomName,
    /// Save a photo to the SD card
    Photo,
    /// Save current algorithm data as a model on the SD card
    SaveModel,
    /// Load a model from the SD card
    LoadModel,
    /// Draw custom text on the screen
    CustomText,
    /// Remove all custom texts
    ClearText,
    /// Learn the object in view as an ID
    Learn,
    /// Forget all IDs of the current algorithm
    Forget,
    /// Save a screenshot to the SD card
    Screenshot,
    /// Device is busy and dropped the request
    ReturnBusy,
}

/// Detection modes of the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Code 0
    FaceRecognition,
    /// Code 1
    ObjectTracking,
    /// Code 2
    ObjectRecognition,
    /// Code 3, reports arrows
    LineTracking,
    /// Code 4
    ColorRecognition,
    /// Code 5
    TagRecognition,
    /// Code 6
    ObjectClassification,
    /// Code 7
    QrRecognition,
    /// Code 8
    BarcodeRecognition,
}

impl Algorithm {
    /// All algorithms in device-code order
    pub const ALL: [Algorithm; 9] = [
        Algorithm::FaceRecognition,
        Algorithm::ObjectTracking,
        Algorithm::ObjectRecognition,
        Algorithm::LineTracking,
        Algorithm::ColorRecognition,
        Algorithm::TagRecognition,
        Algorithm::ObjectClassification,
        Algorithm::QrRecognition,
        Algorithm::BarcodeRecognition,
    ];

    /// Device code sent in the select-algorithm payload
    pub fn code(&self) -> u8 {
        match self {
            Algorithm::FaceRecognition => 0,
            Algorithm::ObjectTracking => 1,
            Algorithm::ObjectRecognition => 2,
            Algorithm::LineTracking => 3,
            Algorithm::ColorRecognition => 4,
            Algorithm::TagRecognition => 5,
            Algorithm::ObjectClassification => 6,
            Algorithm::QrRecognition => 7,
            Algorithm::BarcodeRecognition => 8,
        }
    }

    /// Whether the algorithm reports arrows instead of blocks
    pub fn reports_arrows(&self) -> bool {
        matches!(self, Algorithm::LineTracking)
    }
}

impl TryFrom<u8> for Algorithm {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Algorithm::ALL
            .get(code as usize)
            .copied()
            .ok_or(ProtocolError::UnsupportedAlgorithm(code))
    }
}

/// Commands the host sends to the sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Switch the active algorithm
    SelectAlgorithm(Algorithm),
    /// Request all blocks and arrows once
    Request,
    /// Request blocks only
    RequestBlocks,
    /// Request arrows only
    RequestArrows,
    /// Request learned results, used for the learned-ID count
    RequestLearned,
    /// Request results for one ID
    RequestById(u16),
    /// Check that the device answers
    Knock,
    /// Learn the current object as `id`
    Learn(u16),
    /// Forget everything learned by the current algorithm
    Forget,
    /// Name an ID on screen
    SetCustomName {
        /// Learned ID
        id: u8,
        /// Display name, sent as raw bytes
        name: String,
    },
    /// Draw text at a screen position
    CustomText {
        /// Text, sent as raw bytes
        text: String,
        /// Left edge, 0..=510
        x: u16,
        /// Top edge
        y: u8,
    },
    /// Clear custom texts
    ClearText,
    /// Save a photo to SD
    Photo,
    /// Save a screenshot to SD
    Screenshot,
    /// Save learned data as model number `n`
    SaveModel(u16),
    /// Load learned data from model number `n`
    LoadModel(u16),
}

impl Command {
    /// The opcode this command is framed with
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::SelectAlgorithm(_) => Opcode::SelectAlgorithm,
            Command::Request => Opcode::Request,
            Command::RequestBlocks => Opcode::RequestBlocks,
            Command::RequestArrows => Opcode::RequestArrows,
            Command::RequestLearned => Opcode::RequestLearned,
            Command::RequestById(_) => Opcode::RequestById,
            Command::Knock => Opcode::Knock,
            Command::Learn(_) => Opcode::Learn,
            Command::Forget => Opcode::Forget,
            Command::SetCustomName { .. } => Opcode::SetCustomName,
            Command::CustomText { .. } => Opcode::CustomText,
            Command::ClearText => Opcode::ClearText,
            Command::Photo => Opcode::Photo,
            Command::Screenshot => Opcode::Screenshot,
            Command::SaveModel(_) => Opcode::SaveModel,
            Command::LoadModel(_) => Opcode::LoadModel,
        }
    }

    /// Whether the device answers with an info frame followed by records
    pub fn expects_results(&self) -> bool {
        matches!(
            self,
            Command::Request
                | Command::RequestBlocks
                | Command::RequestArrows
                | Command::RequestLearned
                | Command::RequestById(_)
        )
    }
}
