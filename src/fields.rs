//! Per-sample recording fields: identifiers, widths, decoders and CSV headers.
//!
//! A file-data unit carries a 4-byte data count followed by the selected fields
//! packed back to back in selection order. All multi-byte values are little
//! endian.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::xbus;

/// Width of the sequence number that prefixes every sample.
pub const DATA_COUNT_LEN: usize = 4;

/// First column of every export.
pub const PACKET_COUNTER_HEADER: &str = "PacketCounter,";

/// Calibrated magnetometer values are Q12 fixed point.
const MAG_SCALE: f64 = 4096.0;

/// Recording field identifiers understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum FieldId {
    Timestamp = 0x00,
    Orientation = 0x01,
    Iq = 0x02,
    Iv = 0x03,
    EulerAngles = 0x04,
    DeltaQuaternion = 0x05,
    DeltaVelocity = 0x06,
    CalibratedAcc = 0x07,
    CalibratedGyr = 0x08,
    CalibratedMag = 0x09,
    Status = 0x0A,
    ClipCountAcc = 0x0B,
    ClipCountGyr = 0x0C,
}

impl FieldId {
    pub const ALL: [FieldId; 13] = [
        FieldId::Timestamp,
        FieldId::Orientation,
        FieldId::Iq,
        FieldId::Iv,
        FieldId::EulerAngles,
        FieldId::DeltaQuaternion,
        FieldId::DeltaVelocity,
        FieldId::CalibratedAcc,
        FieldId::CalibratedGyr,
        FieldId::CalibratedMag,
        FieldId::Status,
        FieldId::ClipCountAcc,
        FieldId::ClipCountGyr,
    ];

    /// Selection used when the control surface sends an empty list.
    pub const DEFAULT_SELECTION: [FieldId; 4] = [
        FieldId::Timestamp,
        FieldId::EulerAngles,
        FieldId::CalibratedAcc,
        FieldId::CalibratedGyr,
    ];

    /// Bytes occupied by this field inside a sample.
    pub fn width(self) -> usize {
        match self {
            FieldId::Timestamp => 4,
            FieldId::Orientation => 16,
            FieldId::Iq => 9,
            FieldId::Iv => 12,
            FieldId::EulerAngles => 12,
            FieldId::DeltaQuaternion => 16,
            FieldId::DeltaVelocity => 12,
            FieldId::CalibratedAcc => 12,
            FieldId::CalibratedGyr => 12,
            FieldId::CalibratedMag => 6,
            FieldId::Status => 2,
            FieldId::ClipCountAcc => 1,
            FieldId::ClipCountGyr => 1,
        }
    }

    /// CSV header fragment, comma-terminated.
    pub fn header(self) -> &'static str {
        match self {
            FieldId::Timestamp => "SampleTimeFine,",
            FieldId::Orientation => "Quat_W,Quat_X,Quat_Y,Quat_Z,",
            FieldId::Iq => "iq_X,iq_Y,iq_Z,",
            FieldId::Iv => "iv_X,iv_Y,iv_Z,",
            FieldId::EulerAngles => "Euler_X,Euler_Y,Euler_Z,",
            FieldId::DeltaQuaternion => "dq_W,dq_X,dq_Y,dq_Z,",
            FieldId::DeltaVelocity => "dv[1],dv[2],dv[3],",
            FieldId::CalibratedAcc => "Acc_X,Acc_Y,Acc_Z,",
            FieldId::CalibratedGyr => "Gyr_X,Gyr_Y,Gyr_Z,",
            FieldId::CalibratedMag => "Mag_X,Mag_Y,Mag_Z,",
            FieldId::Status => "Status,",
            FieldId::ClipCountAcc => "ClipCountAcc,",
            FieldId::ClipCountGyr => "ClipCountGyr,",
        }
    }

    /// Decode this field from `data[offset..offset + width]`.
    pub fn decode(self, data: &[u8], offset: usize) -> Result<FieldValue> {
        let bytes = field_bytes(data, offset, self.width())?;
        let value = match self {
            FieldId::Timestamp => FieldValue::Unsigned(u32_at(bytes, 0)),
            FieldId::Orientation | FieldId::DeltaQuaternion => {
                FieldValue::Quat([f32_at(bytes, 0), f32_at(bytes, 4), f32_at(bytes, 8), f32_at(bytes, 12)])
            }
            FieldId::EulerAngles
            | FieldId::DeltaVelocity
            | FieldId::CalibratedAcc
            | FieldId::CalibratedGyr => {
                FieldValue::Vec3([f32_at(bytes, 0), f32_at(bytes, 4), f32_at(bytes, 8)])
            }
            FieldId::Iq => FieldValue::IntVec3([i24_at(bytes, 0), i24_at(bytes, 3), i24_at(bytes, 6)]),
            FieldId::Iv => FieldValue::IntVec3([i32_at(bytes, 0), i32_at(bytes, 4), i32_at(bytes, 8)]),
            FieldId::CalibratedMag => FieldValue::Fixed3([
                i16_at(bytes, 0) as f64 / MAG_SCALE,
                i16_at(bytes, 2) as f64 / MAG_SCALE,
                i16_at(bytes, 4) as f64 / MAG_SCALE,
            ]),
            FieldId::Status => {
                let raw = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
                FieldValue::Unsigned((raw & 0x1FF) << 8)
            }
            FieldId::ClipCountAcc | FieldId::ClipCountGyr => FieldValue::Unsigned(bytes[0] as u32),
        };
        Ok(value)
    }
}

impl TryFrom<u8> for FieldId {
    type Error = DriverError;

    fn try_from(value: u8) -> Result<Self> {
        FieldId::ALL
            .iter()
            .copied()
            .find(|id| *id as u8 == value)
            .ok_or_else(|| DriverError::Protocol(format!("unknown recording field id {value:#04x}")))
    }
}

impl From<FieldId> for u8 {
    fn from(id: FieldId) -> Self {
        id as u8
    }
}

/// Header row for a selection: packet counter then each field's columns.
pub fn header_row(fields: &[FieldId]) -> String {
    fields
        .iter()
        .fold(PACKET_COUNTER_HEADER.to_string(), |mut row, id| {
            row.push_str(id.header());
            row
        })
}

/// Bytes a sample occupies for a selection, data count included.
pub fn sample_len(fields: &[FieldId]) -> usize {
    DATA_COUNT_LEN + fields.iter().map(|f| f.width()).sum::<usize>()
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Unsigned(u32),
    Quat([f32; 4]),
    Vec3([f32; 3]),
    IntVec3([i32; 3]),
    Fixed3([f64; 3]),
}

impl FieldValue {
    /// Append the value's comma-terminated CSV cells.
    pub fn write_csv(&self, out: &mut String) {
        // Writing into a String cannot fail.
        let _ = match self {
            FieldValue::Unsigned(v) => write!(out, "{v},"),
            FieldValue::Quat([w, x, y, z]) => write!(out, "{w},{x},{y},{z},"),
            FieldValue::Vec3([x, y, z]) => write!(out, "{x},{y},{z},"),
            FieldValue::IntVec3([x, y, z]) => write!(out, "{x},{y},{z},"),
            FieldValue::Fixed3([x, y, z]) => write!(out, "{x},{y},{z},"),
        };
    }
}

/// One decoded record of a file-data stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub data_count: u32,
    pub values: Vec<FieldValue>,
}

impl Sample {
    /// Decode a complete file-data frame for the given selection.
    ///
    /// Reads stay inside the frame's XBLE data region; a short frame is
    /// reported as insufficient data instead of being partially decoded.
    pub fn decode(frame: &[u8], fields: &[FieldId]) -> Result<Self> {
        let data = frame_data(frame)?;
        let data_count = u32_at(field_bytes(data, 0, DATA_COUNT_LEN)?, 0);
        let mut offset = DATA_COUNT_LEN;
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            values.push(field.decode(data, offset)?);
            offset += field.width();
        }
        Ok(Sample { data_count, values })
    }

    /// CSV row: data count then every value, each cell comma-terminated.
    pub fn csv_row(&self) -> String {
        let mut row = format!("{},", self.data_count);
        for value in &self.values {
            value.write_csv(&mut row);
        }
        row
    }
}

/// Sequence number of a file-data frame.
pub fn data_count(frame: &[u8]) -> Result<u32> {
    let data = frame_data(frame)?;
    Ok(u32_at(field_bytes(data, 0, DATA_COUNT_LEN)?, 0))
}

/// XBLE data region of a frame: after the XBLE MID, before both checksums.
fn frame_data(frame: &[u8]) -> Result<&[u8]> {
    let min = xbus::XBLE_DATA_OFFSET + 2;
    if frame.len() < min {
        return Err(DriverError::short(min, frame.len()));
    }
    Ok(&frame[xbus::XBLE_DATA_OFFSET..frame.len() - 2])
}

fn field_bytes(data: &[u8], offset: usize, width: usize) -> Result<&[u8]> {
    data.get(offset..offset + width)
        .ok_or_else(|| DriverError::short(offset + width, data.len()))
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn i32_at(b: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn i16_at(b: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([b[at], b[at + 1]])
}

fn i24_at(b: &[u8], at: usize) -> i32 {
    // Sign-extend through the top byte.
    i32::from_le_bytes([0, b[at], b[at + 1], b[at + 2]]) >> 8
}

fn f32_at(b: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}
