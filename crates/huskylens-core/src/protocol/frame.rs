//! Frame encoding/decoding
//!
//! Frame format (HuskyLens):
//! - 2 bytes: magic (`0x55 0xAA`)
//! - 1 byte: protocol address (`0x11`)
//! - 1 byte: payload length
//! - 1 byte: command
//! - N bytes: payload, little-endian 16-bit fields
//! - 1 byte: checksum, the sum mod 256 of every preceding byte

use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

use super::{Algorithm, Command, DecodeError, Opcode, ProtocolError};
use crate::profile::DeviceProfile;

/// Magic, address, length and command bytes
pub const HEADER_LEN: usize = 5;

/// Largest payload the one-byte length field can describe
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Largest possible encoded frame
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN + 1;

/// A validated protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command byte resolved through the device profile
    pub kind: Opcode,
    /// Frame payload
    pub payload: Vec<u8>,
    /// Checksum byte as received
    pub checksum: u8,
}

impl Frame {
    /// Declared payload length
    pub fn data_length(&self) -> u16 {
        self.payload.len() as u16
    }

    /// Read the `index`-th little-endian 16-bit field of the payload
    pub fn field(&self, index: usize) -> Option<u16> {
        let start = index * 2;
        self.payload
            .get(start..start + 2)
            .map(LittleEndian::read_u16)
    }

    /// Like [`Frame::field`], reporting a short payload as truncation
    pub fn require_field(&self, index: usize) -> Result<u16, DecodeError> {
        self.field(index).ok_or(DecodeError::Truncated {
            expected: (index + 1) * 2,
            actual: self.payload.len(),
        })
    }
}

/// Sum of all bytes, mod 256
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Builder for command payloads
pub struct PayloadBuilder {
    payload: Vec<u8>,
}

impl PayloadBuilder {
    /// Create an empty payload
    pub fn new() -> Self {
        Self {
            payload: Vec::new(),
        }
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (little-endian)
    pub fn u16_le(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Finish the payload
    pub fn build(self) -> Vec<u8> {
        self.payload
    }
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes commands and validates frames against a [`DeviceProfile`]
#[derive(Debug, Clone)]
pub struct FrameCodec {
    profile: Arc<DeviceProfile>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DeviceProfile::huskylens())
    }
}

impl FrameCodec {
    /// Create a codec for the given device profile
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile: Arc::new(profile),
        }
    }

    /// The device profile this codec speaks
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Encode a command into a complete frame
    pub fn encode(&self, command: &Command) -> Result<Vec<u8>, ProtocolError> {
        let payload = match command {
            Command::SelectAlgorithm(algorithm) => {
                PayloadBuilder::new().u16_le(algorithm.code() as u16).build()
            }
            Command::RequestById(id)
            | Command::Learn(id)
            | Command::SaveModel(id)
            | Command::LoadModel(id) => PayloadBuilder::new().u16_le(*id).build(),
            Command::SetCustomName { id, name } => {
                // Length counts the trailing NUL
                let len = u8::try_from(name.len() + 1)
                    .map_err(|_| ProtocolError::PayloadTooLarge(name.len() + 3))?;
                PayloadBuilder::new()
                    .byte(*id)
                    .byte(len)
                    .bytes(name.as_bytes())
                    .byte(0)
                    .build()
            }
            Command::CustomText { text, x, y } => {
                let len = u8::try_from(text.len())
                    .map_err(|_| ProtocolError::PayloadTooLarge(text.len() + 4))?;
                let (x_high, x_low) = match *x {
                    0..=255 => (0x00, *x as u8),
                    256..=510 => (0xFF, (*x - 255) as u8),
                    _ => {
                        return Err(ProtocolError::Config(format!(
                            "text x position {} is off screen",
                            x
                        )))
                    }
                };
                PayloadBuilder::new()
                    .byte(len)
                    .byte(x_high)
                    .byte(x_low)
                    .byte(*y)
                    .bytes(text.as_bytes())
                    .build()
            }
            Command::Request
            | Command::RequestBlocks
            | Command::RequestArrows
            | Command::RequestLearned
            | Command::Knock
            | Command::Forget
            | Command::ClearText
            | Command::Photo
            | Command::Screenshot => Vec::new(),
        };

        self.encode_frame(command.opcode(), &payload)
    }

    /// Wrap a raw payload in header and checksum
    pub fn encode_frame(&self, kind: Opcode, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        let command = self.profile.opcode_byte(kind)?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
        bytes.extend_from_slice(&self.profile.header);
        bytes.push(self.profile.address);
        bytes.push(payload.len() as u8);
        bytes.push(command);
        bytes.extend_from_slice(payload);
        bytes.push(checksum(&bytes));
        Ok(bytes)
    }

    /// Total frame length announced by a header, or `None` if fewer than
    /// [`HEADER_LEN`] bytes are available
    pub fn frame_len(&self, header: &[u8]) -> Result<Option<usize>, DecodeError> {
        if header.len() < HEADER_LEN {
            return Ok(None);
        }
        if header[..2] != self.profile.header || header[2] != self.profile.address {
            return Err(DecodeError::BadHeader);
        }
        Ok(Some(HEADER_LEN + header[3] as usize + 1))
    }

    /// Decode exactly one frame
    ///
    /// Never panics on malformed input: short input is `Truncated`, extra
    /// input is `TrailingBytes`, and the checksum is verified before the
    /// command byte is interpreted.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, DecodeError> {
        let total = match self.frame_len(bytes)? {
            Some(total) => total,
            None => {
                return Err(DecodeError::Truncated {
                    expected: HEADER_LEN,
                    actual: bytes.len(),
                })
            }
        };

        if bytes.len() < total {
            return Err(DecodeError::Truncated {
                expected: total,
                actual: bytes.len(),
            });
        }
        if bytes.len() > total {
            return Err(DecodeError::TrailingBytes(bytes.len() - total));
        }

        let received = bytes[total - 1];
        let expected = checksum(&bytes[..total - 1]);
        if received != expected {
            return Err(DecodeError::ChecksumMismatch {
                expected,
                actual: received,
            });
        }

        let kind = self
            .profile
            .opcode_for(bytes[4])
            .ok_or(DecodeError::UnknownKind(bytes[4]))?;

        Ok(Frame {
            kind,
            payload: bytes[HEADER_LEN..total - 1].to_vec(),
            checksum: received,
        })
    }

    /// Recover the command a frame carries, inverting [`FrameCodec::encode`]
    pub fn decode_command(&self, frame: &Frame) -> Result<Command, ProtocolError> {
        let p = &frame.payload;
        let command = match frame.kind {
            Opcode::SelectAlgorithm => {
                let code = frame.require_field(0)?;
                let code = u8::try_from(code).map_err(|_| ProtocolError::UnsupportedAlgorithm(u8::MAX))?;
                Command::SelectAlgorithm(Algorithm::try_from(code)?)
            }
            Opcode::Request => Command::Request,
            Opcode::RequestBlocks => Command::RequestBlocks,
            Opcode::RequestArrows => Command::RequestArrows,
            Opcode::RequestLearned => Command::RequestLearned,
            Opcode::RequestById => Command::RequestById(frame.require_field(0)?),
            Opcode::Knock => Command::Knock,
            Opcode::Learn => Command::Learn(frame.require_field(0)?),
            Opcode::Forget => Command::Forget,
            Opcode::ClearText => Command::ClearText,
            Opcode::Photo => Command::Photo,
            Opcode::Screenshot => Command::Screenshot,
            Opcode::SaveModel => Command::SaveModel(frame.require_field(0)?),
            Opcode::LoadModel => Command::LoadModel(frame.require_field(0)?),
            Opcode::SetCustomName => {
                let len = *p.get(1).ok_or(DecodeError::Truncated {
                    expected: 2,
                    actual: p.len(),
                })? as usize;
                let name = p.get(2..2 + len.saturating_sub(1)).ok_or(DecodeError::Truncated {
                    expected: 2 + len,
                    actual: p.len(),
                })?;
                Command::SetCustomName {
                    id: p[0],
                    name: String::from_utf8_lossy(name).into_owned(),
                }
            }
            Opcode::CustomText => {
                if p.len() < 4 {
                    return Err(DecodeError::Truncated {
                        expected: 4,
                        actual: p.len(),
                    }
                    .into());
                }
                let len = p[0] as usize;
                let text = p.get(4..4 + len).ok_or(DecodeError::Truncated {
                    expected: 4 + len,
                    actual: p.len(),
                })?;
                let x = if p[1] == 0xFF {
                    255 + p[2] as u16
                } else {
                    p[2] as u16
                };
                Command::CustomText {
                    text: String::from_utf8_lossy(text).into_owned(),
                    x,
                    y: p[3],
                }
            }
            Opcode::ReturnInfo
            | Opcode::ReturnBlock
            | Opcode::ReturnArrow
            | Opcode::ReturnOk
            | Opcode::ReturnBusy => {
                let byte = self.profile.opcode_byte(frame.kind)?;
                return Err(DecodeError::UnknownKind(byte).into());
            }
        };
        Ok(command)
    }
}
