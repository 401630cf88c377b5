//! Wire format encoding and decoding.
//!
//! Implements the Unified NPI frame layout:
//! ```text
//! ┌──────┬────────┬──────────────┬────────┬───────────┬────────┐
//! │ SOF  │ LEN    │ TYPE │ SUBSYS│ CMD    │ PAYLOAD   │ FCS    │
//! │ 0xFE │ 1 byte │ 3 bit│ 5 bit │ 1 byte │ LEN bytes │ 1 byte │
//! └──────┴────────┴──────────────┴────────┴───────────┴────────┘
//! ```
//!
//! `LEN` counts payload bytes only. `FCS` is the XOR of every byte from
//! `LEN` through the end of the payload.

use std::fmt;

use crate::error::{Result, UnpiError};

/// Start-of-frame marker.
pub const SOF: u8 = 0xFE;

/// Header size in bytes: SOF, LEN, TYPE/SUBSYS, CMD.
pub const HEADER_SIZE: usize = 4;

/// Header plus the trailing FCS byte.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + 1;

/// Largest payload a one-byte length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Subsystem bits of the TYPE/SUBSYS byte.
pub const SUBSYSTEM_MASK: u8 = 0x1F;

/// Shift of the command type within the TYPE/SUBSYS byte.
pub const TYPE_SHIFT: u8 = 5;

/// Command kind carried in the top three bits of the TYPE/SUBSYS byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CmdType {
    Poll = 0,
    /// Synchronous request.
    Sreq = 1,
    /// Asynchronous request or notification.
    Areq = 2,
    /// Synchronous response.
    Srsp = 3,
    /// Reserved; used by the device for generic error replies.
    Res0 = 4,
    Res1 = 5,
    Res2 = 6,
    Res3 = 7,
}

impl CmdType {
    /// Decode the three type bits. Higher bits are ignored.
    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => CmdType::Poll,
            1 => CmdType::Sreq,
            2 => CmdType::Areq,
            3 => CmdType::Srsp,
            4 => CmdType::Res0,
            5 => CmdType::Res1,
            6 => CmdType::Res2,
            _ => CmdType::Res3,
        }
    }

    /// Parse the symbolic name used in command definitions.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "POLL" => CmdType::Poll,
            "SREQ" => CmdType::Sreq,
            "AREQ" => CmdType::Areq,
            "SRSP" => CmdType::Srsp,
            "RES0" => CmdType::Res0,
            "RES1" => CmdType::Res1,
            "RES2" => CmdType::Res2,
            "RES3" => CmdType::Res3,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            CmdType::Poll => "POLL",
            CmdType::Sreq => "SREQ",
            CmdType::Areq => "AREQ",
            CmdType::Srsp => "SRSP",
            CmdType::Res0 => "RES0",
            CmdType::Res1 => "RES1",
            CmdType::Res2 => "RES2",
            CmdType::Res3 => "RES3",
        }
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CmdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pack a command type and subsystem id into the TYPE/SUBSYS byte.
#[inline]
pub fn pack_type_subsys(cmd_type: CmdType, subsystem: u8) -> u8 {
    (cmd_type.bits() << TYPE_SHIFT) | (subsystem & SUBSYSTEM_MASK)
}

/// Split a TYPE/SUBSYS byte into its command type and subsystem id.
#[inline]
pub fn unpack_type_subsys(byte: u8) -> (CmdType, u8) {
    (CmdType::from_bits(byte >> TYPE_SHIFT), byte & SUBSYSTEM_MASK)
}

/// XOR of all bytes.
#[inline]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes.
    pub length: u8,
    pub cmd_type: CmdType,
    /// Subsystem id (5 bits).
    pub subsystem: u8,
    pub command: u8,
}

impl Header {
    /// Create a new header.
    ///
    /// Fails if `length` exceeds what the wire can carry.
    pub fn new(cmd_type: CmdType, subsystem: u8, command: u8, length: usize) -> Result<Self> {
        if length > MAX_PAYLOAD_SIZE {
            return Err(UnpiError::Serialization(format!(
                "payload of {} bytes exceeds maximum {}",
                length, MAX_PAYLOAD_SIZE
            )));
        }
        Ok(Self {
            length: length as u8,
            cmd_type,
            subsystem: subsystem & SUBSYSTEM_MASK,
            command,
        })
    }

    /// Encode header to bytes, SOF included.
    #[inline]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        [
            SOF,
            self.length,
            pack_type_subsys(self.cmd_type, self.subsystem),
            self.command,
        ]
    }

    /// Decode header from bytes starting at a SOF marker.
    ///
    /// Returns `None` if fewer than 4 bytes are given or the first byte is
    /// not SOF.
    #[inline]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE || buf[0] != SOF {
            return None;
        }
        let (cmd_type, subsystem) = unpack_type_subsys(buf[2]);
        Some(Self {
            length: buf[1],
            cmd_type,
            subsystem,
            command: buf[3],
        })
    }

    /// The TYPE/SUBSYS byte.
    #[inline]
    pub fn type_subsys(&self) -> u8 {
        pack_type_subsys(self.cmd_type, self.subsystem)
    }

    /// Checksum seed covering LEN, TYPE/SUBSYS and CMD.
    #[inline]
    pub fn partial_checksum(&self) -> u8 {
        self.length ^ self.type_subsys() ^ self.command
    }

    /// Total frame size including SOF and FCS.
    #[inline]
    pub fn frame_size(&self) -> usize {
        FRAME_OVERHEAD + self.length as usize
    }
}
