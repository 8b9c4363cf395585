//! XBus/XBLE frame codec.
//!
//! Every message on the wire is an XBus frame:
//!
//! ```text
//! 0xFA 0xFF MID LEN payload[LEN] CSUM
//! ```
//!
//! Data-recording and configuration traffic nests an XBLE message inside the
//! payload:
//!
//! ```text
//! GROUP XBLE_LEN XBLE_MID fields... XCSUM      (XBLE_LEN = 1 + fields.len())
//! ```
//!
//! Both layers share one checksum rule: the checksum byte is chosen so that all
//! covered bytes, checksum included, sum to 0 mod 256. For the outer frame the
//! preamble is excluded; for the nested message the group byte is the first
//! covered byte. Device acknowledgements are themselves well-formed frames, so
//! the known signatures below are built with the same functions.

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

pub const PREAMBLE: u8 = 0xFA;
pub const BROADCAST_ID: u8 = 0xFF;

/// Host-to-device messages and most device notifications.
pub const MID_COMMAND: u8 = 0x78;
/// Device acknowledgements.
pub const MID_RESPONSE: u8 = 0x79;

/// Preamble, broadcast id, message id, length.
pub const HEADER_LEN: usize = 4;
/// Header plus trailing checksum.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + 1;

// XBLE groups
pub const GROUP_DATA_RECORDING: u8 = 0x01;
pub const GROUP_CONFIGURATION: u8 = 0x03;

// Offsets inside an XBus frame carrying an XBLE message
pub const GROUP_OFFSET: usize = 4;
pub const XBLE_LEN_OFFSET: usize = 5;
pub const XBLE_MID_OFFSET: usize = 6;
pub const XBLE_DATA_OFFSET: usize = 7;

// Data-recording commands
pub const CMD_CLEAR_STORAGE: u8 = 0x30;
pub const CMD_REQUEST_FLASH_INFO: u8 = 0x50;
pub const CMD_REQUEST_FILE_INFO: u8 = 0x60;
pub const CMD_REQUEST_FILE_DATA: u8 = 0x70;
pub const CMD_STOP_FILE_DATA: u8 = 0x73;
pub const CMD_SELECT_EXPORTED_DATA: u8 = 0x74;
pub const CMD_RETRANSMIT: u8 = 0x75;

// Configuration commands
pub const CMD_REQUEST_MAC: u8 = 0x01;
pub const CMD_REQUEST_TAG: u8 = 0x02;

// Data-recording notifications sent by the device
pub const NOTIFY_ACK: u8 = 0x01;
pub const NOTIFY_STORAGE_CLEARED: u8 = 0x33;
pub const NOTIFY_FLASH_INFO_DATA: u8 = 0x51;
pub const NOTIFY_FLASH_INFO_DONE: u8 = 0x52;
pub const NOTIFY_FILE_INFO_DATA: u8 = 0x61;
pub const NOTIFY_FILE_INFO_DONE: u8 = 0x62;
pub const NOTIFY_FILE_DATA: u8 = 0x71;
pub const NOTIFY_FILE_DATA_DONE: u8 = 0x72;

// ============================================================================
// Checksum and framing
// ============================================================================

/// Checksum over `bytes[1..]`: `(0 - sum) & 0xFF`.
///
/// Appending the result makes `bytes[1..]` plus the checksum sum to 0 mod 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes
        .iter()
        .skip(1)
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    0u8.wrapping_sub(sum)
}

/// Build an outer XBus frame around `payload`.
///
/// Fails when the payload does not fit the one-byte length field.
pub fn encode(mid: u8, payload: &[u8]) -> Result<Vec<u8>> {
    Ok(frame(mid, length_byte(payload.len())?, payload))
}

/// Build a nested XBLE message: `[group, 1 + fields.len(), mid, fields..., xcsum]`.
pub fn xble(group: u8, mid: u8, fields: &[u8]) -> Result<Vec<u8>> {
    Ok(nested(group, length_byte(fields.len() + 1)?, mid, fields))
}

fn length_byte(len: usize) -> Result<u8> {
    u8::try_from(len)
        .map_err(|_| DriverError::Protocol(format!("{} bytes exceed the one-byte frame length", len)))
}

fn frame(mid: u8, len: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&[PREAMBLE, BROADCAST_ID, mid, len]);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame
}

fn nested(group: u8, len: u8, mid: u8, fields: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(fields.len() + 4);
    msg.extend_from_slice(&[group, len, mid]);
    msg.extend_from_slice(fields);
    // Unlike the outer frame, the group byte is covered.
    let sum = msg.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    msg.push(0u8.wrapping_sub(sum));
    msg
}

/// Fixed-size command: at most 4 field bytes, so both lengths fit.
fn short_command<const N: usize>(group: u8, mid: u8, fields: [u8; N]) -> Vec<u8> {
    let msg = nested(group, N as u8 + 1, mid, &fields);
    frame(MID_COMMAND, msg.len() as u8, &msg)
}

/// Outer frame on MID 0x78 carrying one XBLE message.
pub fn command(group: u8, mid: u8, fields: &[u8]) -> Result<Vec<u8>> {
    encode(MID_COMMAND, &xble(group, mid, fields)?)
}

/// True when `frame` satisfies the outer checksum invariant.
pub fn is_valid(frame: &[u8]) -> bool {
    frame.len() >= FRAME_OVERHEAD
        && frame[0] == PREAMBLE
        && frame.len() == FRAME_OVERHEAD + frame[3] as usize
        && frame[1..].iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
}

/// Exact byte comparison against a known signature.
pub fn matches(buffer: &[u8], known: &[u8]) -> bool {
    buffer == known
}

/// Total length of the frame starting at `buf[0]`, if the header is present.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    Some(FRAME_OVERHEAD + buf[3] as usize)
}

/// True when `buf` begins with a preamble, broadcast id and a known MID.
pub fn has_frame_header(buf: &[u8]) -> bool {
    buf.len() >= 3
        && buf[0] == PREAMBLE
        && buf[1] == BROADCAST_ID
        && (buf[2] == MID_COMMAND || buf[2] == MID_RESPONSE)
}

/// Walk consecutive complete frames laid out back to back in `buf`.
///
/// Stops at the first position that is not a frame header or whose declared
/// length runs past the end of the buffer.
pub fn frames(buf: &[u8]) -> Frames<'_> {
    Frames { buf, pos: 0 }
}

pub struct Frames<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Frames<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buf[self.pos..];
        if !has_frame_header(rest) {
            return None;
        }
        let len = frame_len(rest)?;
        if len > rest.len() {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }
}

/// XBLE message id of a data-recording frame, if `frame` carries one.
pub fn recording_mid(frame: &[u8]) -> Option<u8> {
    if frame.len() > XBLE_MID_OFFSET && frame[GROUP_OFFSET] == GROUP_DATA_RECORDING {
        Some(frame[XBLE_MID_OFFSET])
    } else {
        None
    }
}

// Configuration responses: FA FF 78 LEN 03 N data[N] ...
const CONFIG_LEN_OFFSET: usize = 5;
const CONFIG_DATA_OFFSET: usize = 6;
pub const MAC_ADDRESS_LEN: usize = 6;

/// Locate the first configuration-group response in `buf`.
///
/// Returns the offset just past its data and the data itself once all `N`
/// bytes are buffered. A response whose data is still arriving yields `None`.
pub fn find_config_response(buf: &[u8]) -> Option<(usize, &[u8])> {
    for start in 0..buf.len() {
        let rest = &buf[start..];
        if rest.len() <= CONFIG_LEN_OFFSET {
            return None;
        }
        if rest[..3] != [PREAMBLE, BROADCAST_ID, MID_COMMAND] || rest[GROUP_OFFSET] != GROUP_CONFIGURATION {
            continue;
        }
        let end = CONFIG_DATA_OFFSET + rest[CONFIG_LEN_OFFSET] as usize;
        return rest
            .get(CONFIG_DATA_OFFSET..end)
            .map(|data| (start + end, data));
    }
    None
}

/// Colon-separated upper-case hex, last transmitted byte first.
pub fn format_mac_address(data: &[u8]) -> String {
    data.iter()
        .rev()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

// ============================================================================
// Commands
// ============================================================================

/// Erase all recordings. The device stamps the erase with `unix_secs`.
pub fn clear_storage(unix_secs: u32) -> Vec<u8> {
    short_command(GROUP_DATA_RECORDING, CMD_CLEAR_STORAGE, unix_secs.to_le_bytes())
}

pub fn request_mac_address() -> Vec<u8> {
    short_command(GROUP_CONFIGURATION, CMD_REQUEST_MAC, [])
}

pub fn request_tag() -> Vec<u8> {
    short_command(GROUP_CONFIGURATION, CMD_REQUEST_TAG, [])
}

pub fn request_flash_info() -> Vec<u8> {
    short_command(GROUP_DATA_RECORDING, CMD_REQUEST_FLASH_INFO, [])
}

pub fn request_file_info(file_index: u8) -> Vec<u8> {
    short_command(GROUP_DATA_RECORDING, CMD_REQUEST_FILE_INFO, [file_index])
}

pub fn request_file_data(file_index: u8) -> Vec<u8> {
    short_command(GROUP_DATA_RECORDING, CMD_REQUEST_FILE_DATA, [file_index])
}

pub fn stop_file_data() -> Vec<u8> {
    short_command(GROUP_DATA_RECORDING, CMD_STOP_FILE_DATA, [])
}

/// Select which per-sample fields the device streams, in order.
pub fn select_exported_data(field_ids: &[u8]) -> Result<Vec<u8>> {
    command(GROUP_DATA_RECORDING, CMD_SELECT_EXPORTED_DATA, field_ids)
}

/// Ask the device to resend file data starting at `data_count`.
pub fn retransmit(data_count: u32) -> Vec<u8> {
    short_command(GROUP_DATA_RECORDING, CMD_RETRANSMIT, data_count.to_le_bytes())
}

// ============================================================================
// Known device signatures
// ============================================================================

fn notification(mid: u8) -> Vec<u8> {
    short_command(GROUP_DATA_RECORDING, mid, [])
}

/// `FA FF 78 04 01 01 33 CB 85`
pub fn storage_cleared_ack() -> Vec<u8> {
    notification(NOTIFY_STORAGE_CLEARED)
}

/// `FA FF 78 04 01 01 52 AC 85`
pub fn flash_info_done() -> Vec<u8> {
    notification(NOTIFY_FLASH_INFO_DONE)
}

/// `FA FF 78 04 01 01 62 9C 85`
pub fn file_info_done() -> Vec<u8> {
    notification(NOTIFY_FILE_INFO_DONE)
}

/// `FA FF 78 04 01 01 72 8C 85`
pub fn file_data_done() -> Vec<u8> {
    notification(NOTIFY_FILE_DATA_DONE)
}

/// Acknowledgement of `acked_mid` on MID 0x79, e.g. `FA FF 79 06 01 03 01 00 50 AB 82`.
pub fn ack(acked_mid: u8, extra: &[u8]) -> Result<Vec<u8>> {
    let mut fields = vec![0x00, acked_mid];
    fields.extend_from_slice(extra);
    encode(MID_RESPONSE, &xble(GROUP_DATA_RECORDING, NOTIFY_ACK, &fields)?)
}

/// Length of the flash-info request acknowledgement that opens the response.
pub const FLASH_INFO_ACK_LEN: usize = 11;
