//! Wire format of the boot ROM command protocol.
//!
//! Outbound frames:
//!
//! ```text
//! +--------+----------+--------+--------+-------------------+
//! | opcode | reserved | len_lo | len_hi | payload[0..len]   |
//! +--------+----------+--------+--------+-------------------+
//! ```
//!
//! Inbound responses start with a 2-byte status, `OK` followed by the payload
//! or `FL` followed by an error code and category.

use crate::Error;
use byteorder::{LittleEndian, WriteBytesExt};
use deku::prelude::*;
use std::io::{Cursor, Write};

pub const LOAD_BOOT_HEADER_LEN: usize = 176;
pub const LOAD_SEGMENT_HEADER_LEN: usize = 16;
/// The ROM echoes the segment header behind a 2-byte length.
pub const LOAD_SEGMENT_HEADER_RESP_LEN: usize = 18;
pub const LOAD_SEGMENT_DATA_MAX: usize = 2048;
pub const BOOT_INFO_LEN: usize = 26;
pub const CHIP_ID_LEN: usize = 8;
pub const FRAME_HEADER_LEN: usize = 4;

pub const STATUS_OK: [u8; 2] = *b"OK";
pub const STATUS_FAIL: [u8; 2] = *b"FL";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Handshake = 0x55,
    GetBootInfo = 0x10,
    LoadBootHeader = 0x11,
    LoadSegmentHeader = 0x17,
    LoadSegmentData = 0x18,
    CheckImage = 0x19,
    RunImage = 0x1a,
    MemWrite = 0x50,
    ReadJedecId = 0x36,
    FlashErase = 0x30,
    FlashWrite = 0x31,
    FlashWriteCheck = 0x3a,
    XipReadStart = 0x60,
    FlashXipReadSha = 0x3e,
    XipReadFinish = 0x61,
    EfuseReadMacAddr = 0x42,
}

/// Builds `[opcode][0x00][len:2 LE][payload]`.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::FrameTooLarge(payload.len()));
    }
    let mut writer = Cursor::new(Vec::with_capacity(FRAME_HEADER_LEN + payload.len()));

    writer.write_u8(opcode as u8)?;
    writer.write_u8(0)?;
    writer.write_u16::<LittleEndian>(payload.len() as u16)?;
    writer.write_all(payload)?;

    Ok(writer.into_inner())
}

#[derive(Debug, PartialEq, Eq)]
pub enum Status<'a> {
    /// Payload after the `OK` marker.
    Ok(&'a [u8]),
    /// The whole response, to be handed to [`Error::from_response`].
    Fail(&'a [u8]),
}

/// Splits a response on its status marker.
///
/// The payload length is not checked, callers know what each command returns.
pub fn decode_status(resp: &[u8]) -> Status<'_> {
    match resp.strip_prefix(&STATUS_OK) {
        Some(payload) => Status::Ok(payload),
        None => Status::Fail(resp),
    }
}

#[derive(Debug, DekuRead, Default, Clone)]
#[deku(endian = "little")]
pub struct BootInfo {
    pub len: u16,
    pub bootrom_version: u32,
    pub otp_info: [u8; 16],
    #[deku(skip)]
    pub chip_id: Vec<u8>,
}

impl BootInfo {
    pub fn from_payload(input: &[u8]) -> Result<Self, Error> {
        let (_, info) = BootInfo::from_bytes((input, 0))?;
        Ok(info)
    }
}

/// Trailing chip identifier of a boot info payload.
pub fn chip_id(boot_info: &[u8]) -> Option<&[u8]> {
    boot_info
        .len()
        .checked_sub(CHIP_ID_LEN)
        .map(|start| &boot_info[start..])
}
