//! Detection results
//!
//! Typed blocks and arrows, and the [`ResultSet`] the engine keeps from the
//! most recent successful poll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{Algorithm, DecodeError, Frame, Opcode, ProtocolError};

/// A rectangular detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Learned ID, or 0 when the object is not learned
    pub id: i32,
    /// Center X in screen pixels
    pub x_center: u16,
    /// Center Y in screen pixels
    pub y_center: u16,
    /// Width in pixels
    pub width: u16,
    /// Height in pixels
    pub height: u16,
}

impl Block {
    fn from_frame(frame: &Frame) -> Result<Self, DecodeError> {
        Ok(Self {
            x_center: frame.require_field(0)?,
            y_center: frame.require_field(1)?,
            width: frame.require_field(2)?,
            height: frame.require_field(3)?,
            id: frame.require_field(4)? as i32,
        })
    }

    /// Scalar value of one field
    pub fn get(&self, field: BoxField) -> i32 {
        match field {
            BoxField::Id => self.id,
            BoxField::XCenter => self.x_center as i32,
            BoxField::YCenter => self.y_center as i32,
            BoxField::Width => self.width as i32,
            BoxField::Height => self.height as i32,
        }
    }
}

/// A directional detection, origin to target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arrow {
    /// Learned ID, or 0 when the line is not learned
    pub id: i32,
    /// Tail X
    pub x_origin: u16,
    /// Tail Y
    pub y_origin: u16,
    /// Head X
    pub x_target: u16,
    /// Head Y
    pub y_target: u16,
}

impl Arrow {
    fn from_frame(frame: &Frame) -> Result<Self, DecodeError> {
        Ok(Self {
            x_origin: frame.require_field(0)?,
            y_origin: frame.require_field(1)?,
            x_target: frame.require_field(2)?,
            y_target: frame.require_field(3)?,
            id: frame.require_field(4)? as i32,
        })
    }

    /// Scalar value of one field
    pub fn get(&self, field: ArrowField) -> i32 {
        match field {
            ArrowField::Id => self.id,
            ArrowField::XOrigin => self.x_origin as i32,
            ArrowField::YOrigin => self.y_origin as i32,
            ArrowField::XTarget => self.x_target as i32,
            ArrowField::YTarget => self.y_target as i32,
        }
    }

    fn midpoint(&self) -> (f64, f64) {
        (
            (self.x_origin as f64 + self.x_target as f64) / 2.0,
            (self.y_origin as f64 + self.y_target as f64) / 2.0,
        )
    }
}

/// Selectable block fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxField {
    /// [`Block::id`]
    Id,
    /// [`Block::x_center`]
    XCenter,
    /// [`Block::y_center`]
    YCenter,
    /// [`Block::width`]
    Width,
    /// [`Block::height`]
    Height,
}

/// Selectable arrow fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrowField {
    /// [`Arrow::id`]
    Id,
    /// [`Arrow::x_origin`]
    XOrigin,
    /// [`Arrow::y_origin`]
    YOrigin,
    /// [`Arrow::x_target`]
    XTarget,
    /// [`Arrow::y_target`]
    YTarget,
}

/// Kinds of detection records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// `RETURN_BLOCK` records
    Block,
    /// `RETURN_ARROW` records
    Arrow,
}

/// One detection record, in device order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Detection {
    /// Rectangle
    Block(Block),
    /// Direction
    Arrow(Arrow),
}

impl Detection {
    /// Record kind
    pub fn kind(&self) -> ResultKind {
        match self {
            Detection::Block(_) => ResultKind::Block,
            Detection::Arrow(_) => ResultKind::Arrow,
        }
    }

    /// Learned ID of the record
    pub fn id(&self) -> i32 {
        match self {
            Detection::Block(block) => block.id,
            Detection::Arrow(arrow) => arrow.id,
        }
    }
}

/// Summary carried by the `RETURN_INFO` header frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResultInfo {
    /// Number of record frames that follow
    pub count: u16,
    /// IDs learned by the active algorithm
    pub learned_ids: u16,
    /// Device frame counter
    pub frame_number: u16,
}

impl ResultInfo {
    /// Parse an info frame
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        if frame.kind != Opcode::ReturnInfo {
            return Err(ProtocolError::UnexpectedResponse {
                expected: Opcode::ReturnInfo,
                actual: frame.kind,
            });
        }
        Ok(Self {
            count: frame.require_field(0)?,
            learned_ids: frame.require_field(1)?,
            frame_number: frame.require_field(2)?,
        })
    }
}

/// The latest decoded detections for one algorithm
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Algorithm active when the results were decoded, if known
    pub algorithm: Option<Algorithm>,
    /// Header summary
    pub info: ResultInfo,
    /// Records in the order the device sent them
    pub detections: Vec<Detection>,
    /// When the poll completed
    pub received_at: Option<DateTime<Utc>>,
}

impl ResultSet {
    /// Build a result set from an info frame followed by record frames
    ///
    /// Record frames of a kind other than block or arrow are skipped.
    pub fn from_frames(
        algorithm: Option<Algorithm>,
        frames: &[Frame],
    ) -> Result<Self, ProtocolError> {
        let (head, records) = frames.split_first().ok_or(DecodeError::Truncated {
            expected: 1,
            actual: 0,
        })?;
        let info = ResultInfo::from_frame(head)?;

        let mut detections = Vec::with_capacity(records.len());
        for frame in records {
            match frame.kind {
                Opcode::ReturnBlock => detections.push(Detection::Block(Block::from_frame(frame)?)),
                Opcode::ReturnArrow => detections.push(Detection::Arrow(Arrow::from_frame(frame)?)),
                _ => {}
            }
        }

        Ok(Self {
            algorithm,
            info,
            detections,
            received_at: Some(Utc::now()),
        })
    }

    /// Learned-ID count reported with the results
    pub fn learned_id_count(&self) -> u16 {
        self.info.learned_ids
    }

    /// Whether the last poll saw nothing
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Blocks in device order
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.detections.iter().filter_map(|d| match d {
            Detection::Block(block) => Some(block),
            Detection::Arrow(_) => None,
        })
    }

    /// Arrows in device order
    pub fn arrows(&self) -> impl Iterator<Item = &Arrow> {
        self.detections.iter().filter_map(|d| match d {
            Detection::Arrow(arrow) => Some(arrow),
            Detection::Block(_) => None,
        })
    }

    /// Whether at least one record of `kind` is present
    pub fn contains_type(&self, kind: ResultKind) -> bool {
        self.detections.iter().any(|d| d.kind() == kind)
    }

    /// Whether a record of `kind` with the given ID is present
    pub fn contains_id(&self, id: i32, kind: ResultKind) -> bool {
        self.detections
            .iter()
            .any(|d| d.kind() == kind && d.id() == id)
    }

    /// Number of records of `kind`
    pub fn count(&self, kind: ResultKind) -> usize {
        self.detections.iter().filter(|d| d.kind() == kind).count()
    }

    /// Number of records of `kind` carrying `id`
    pub fn count_by_id(&self, id: i32, kind: ResultKind) -> usize {
        self.detections
            .iter()
            .filter(|d| d.kind() == kind && d.id() == id)
            .count()
    }

    /// Whether `id` is among the IDs learned by the algorithm
    pub fn is_learned(&self, id: i32) -> bool {
        id > 0 && id <= self.info.learned_ids as i32
    }

    /// The block whose center is closest to the screen center
    ///
    /// Ties go to the block received first.
    pub fn nearest_to_center(&self, screen_width: u16, screen_height: u16) -> Option<&Block> {
        let cx = screen_width as f64 / 2.0;
        let cy = screen_height as f64 / 2.0;
        nearest(self.blocks(), |b| {
            distance_sq(b.x_center as f64, b.y_center as f64, cx, cy)
        })
    }

    /// The arrow whose midpoint is closest to the screen center
    pub fn nearest_arrow_to_center(&self, screen_width: u16, screen_height: u16) -> Option<&Arrow> {
        let cx = screen_width as f64 / 2.0;
        let cy = screen_height as f64 / 2.0;
        nearest(self.arrows(), |a| {
            let (x, y) = a.midpoint();
            distance_sq(x, y, cx, cy)
        })
    }

    /// First block carrying `id`
    pub fn first_block_by_id(&self, id: i32) -> Option<&Block> {
        self.blocks().find(|b| b.id == id)
    }

    /// First arrow carrying `id`
    pub fn first_arrow_by_id(&self, id: i32) -> Option<&Arrow> {
        self.arrows().find(|a| a.id == id)
    }

    /// Zero-based `index`-th block
    pub fn nth_block(&self, index: usize) -> Option<&Block> {
        self.blocks().nth(index)
    }

    /// Zero-based `index`-th arrow
    pub fn nth_arrow(&self, index: usize) -> Option<&Arrow> {
        self.arrows().nth(index)
    }

    /// Zero-based `index`-th block among those carrying `id`
    pub fn nth_block_by_id(&self, id: i32, index: usize) -> Option<&Block> {
        self.blocks().filter(|b| b.id == id).nth(index)
    }

    /// Zero-based `index`-th arrow among those carrying `id`
    pub fn nth_arrow_by_id(&self, id: i32, index: usize) -> Option<&Arrow> {
        self.arrows().filter(|a| a.id == id).nth(index)
    }
}

fn distance_sq(x: f64, y: f64, cx: f64, cy: f64) -> f64 {
    (x - cx).powi(2) + (y - cy).powi(2)
}

/// First item with the strictly smallest key
fn nearest<'a, T, I, F>(items: I, key: F) -> Option<&'a T>
where
    I: Iterator<Item = &'a T>,
    F: Fn(&T) -> f64,
{
    let mut best: Option<(&'a T, f64)> = None;
    for item in items {
        let d = key(item);
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((item, d)),
        }
    }
    best.map(|(item, _)| item)
}
