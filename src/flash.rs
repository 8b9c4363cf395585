//! Onboard flash layout and recording file metadata.
//!
//! A flash-info response is the request acknowledgement followed by a run of
//! `0x51` data frames and the end-of-export notification. The first data frame
//! carries the storage capacity; every later one carries a marker map of the
//! flash: `0xEE` opens a recording (one header block) and each following `0xCC`
//! is one data extent of that recording.

use chrono::{DateTime, Local, TimeZone, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::xbus;

/// Flash reserved for each recording's header.
pub const RECORDING_HEADER_SIZE: u64 = 4096;
/// One `0xCC` data extent.
pub const RECORDING_EXTENT_SIZE: u64 = 55 * 4096;

const MARKER_FILE_START: u8 = 0xEE;
const MARKER_EXTENT: u8 = 0xCC;

/// Capacity (u32 LE) offset inside the first data frame.
const CAPACITY_OFFSET: usize = 21;
const CAPACITY_LEN: usize = 4;

/// Creation time (u32 LE, seconds) offset inside an accumulated file-info response.
const FILE_INFO_TIMESTAMP_OFFSET: usize = 29;

/// One recording stored on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFile {
    /// 1-based index assigned by the device.
    pub index: u8,
    /// `YYYYMMDD_HHMMSS` of the recording's creation time; empty until file info arrives.
    pub file_name: String,
    /// Bytes of recorded data.
    pub size: u64,
}

impl RecordingFile {
    fn started(index: u8) -> Self {
        Self {
            index,
            file_name: String::new(),
            size: 0,
        }
    }
}

/// Storage summary decoded from a flash-info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashLayout {
    pub capacity: u64,
    pub used: u64,
    pub files: Vec<RecordingFile>,
}

impl FlashLayout {
    /// Capacity minus used space. Negative when the device reports more
    /// recordings than its capacity can hold.
    pub fn available(&self) -> i64 {
        self.capacity as i64 - self.used as i64
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Decode a complete flash-info response, terminator included.
    pub fn parse(response: &[u8]) -> Result<Self> {
        let mut data_frames = xbus::frames(response)
            .filter(|f| xbus::recording_mid(f) == Some(xbus::NOTIFY_FLASH_INFO_DATA));

        let first = data_frames
            .next()
            .ok_or_else(|| DriverError::Protocol("flash info carried no data frames".into()))?;
        let capacity = first
            .get(CAPACITY_OFFSET..CAPACITY_OFFSET + CAPACITY_LEN)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64)
            .ok_or_else(|| DriverError::short(CAPACITY_OFFSET + CAPACITY_LEN, first.len()))?;

        let mut layout = FlashLayout {
            capacity,
            used: 0,
            files: Vec::new(),
        };
        for frame in data_frames {
            if !layout.scan_markers(marker_region(frame)) {
                break;
            }
        }
        Ok(layout)
    }

    /// Returns false once no further recording can be indexed.
    fn scan_markers(&mut self, region: &[u8]) -> bool {
        for &marker in region {
            match marker {
                MARKER_FILE_START => {
                    let Ok(index) = u8::try_from(self.files.len() + 1) else {
                        warn!("more than {} recordings on flash, ignoring the rest", u8::MAX);
                        return false;
                    };
                    self.used += RECORDING_HEADER_SIZE;
                    self.files.push(RecordingFile::started(index));
                }
                MARKER_EXTENT => {
                    self.used += RECORDING_EXTENT_SIZE;
                    if let Some(file) = self.files.last_mut() {
                        file.size += RECORDING_EXTENT_SIZE;
                    }
                }
                _ => break,
            }
        }
        true
    }
}

/// XBLE data bytes of a frame, excluding both trailing checksums.
fn marker_region(frame: &[u8]) -> &[u8] {
    let end = frame.len().saturating_sub(2);
    frame.get(xbus::XBLE_DATA_OFFSET..end).unwrap_or(&[])
}

/// Creation timestamp (UNIX seconds) from an accumulated file-info response.
pub fn file_info_timestamp(response: &[u8]) -> Result<u32> {
    response
        .get(FILE_INFO_TIMESTAMP_OFFSET..FILE_INFO_TIMESTAMP_OFFSET + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| DriverError::short(FILE_INFO_TIMESTAMP_OFFSET + 4, response.len()))
}

/// `YYYYMMDD_HHMMSS` in local time for a UNIX timestamp in seconds.
pub fn recording_file_name(unix_secs: i64) -> String {
    match Local.timestamp_opt(unix_secs, 0).earliest() {
        Some(t) => format_stamp(&t),
        None => format_stamp(&DateTime::<Utc>::from_timestamp(unix_secs, 0).unwrap_or_default()),
    }
}

/// Directory name for an export batch started now.
pub fn batch_dir_name() -> String {
    format_stamp(&Local::now())
}

fn format_stamp<Tz: TimeZone>(t: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    t.format("%Y%m%d_%H%M%S").to_string()
}
