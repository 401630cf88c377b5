//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header, payload and checksum
//! verdict. Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use unpi_client::protocol::{build_frame, CmdType};
//!
//! let bytes = build_frame(CmdType::Sreq, 1, 2, &[0x01, 0x02]).unwrap();
//! assert_eq!(&bytes[..], &[0xFE, 0x02, 0x21, 0x02, 0x01, 0x02, 0x22]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{checksum, CmdType, Header};
use crate::error::Result;

/// A complete protocol frame.
///
/// Frames with a checksum mismatch are still produced; callers check
/// [`Frame::is_valid`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
    /// FCS byte as transmitted.
    pub fcs: u8,
    /// FCS computed over the received bytes.
    pub csum: u8,
}

impl Frame {
    /// Create a frame from a header and payload, computing a matching FCS.
    pub fn new(header: Header, payload: Bytes) -> Self {
        let csum = header.partial_checksum() ^ checksum(&payload);
        Self {
            header,
            payload,
            fcs: csum,
            csum,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn cmd_type(&self) -> CmdType {
        self.header.cmd_type
    }

    #[inline]
    pub fn subsystem(&self) -> u8 {
        self.header.subsystem
    }

    #[inline]
    pub fn command(&self) -> u8 {
        self.header.command
    }

    /// True when the transmitted FCS matches the computed one.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.fcs == self.csum
    }

    /// Serialize back to wire bytes, keeping the transmitted FCS.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.frame_size());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.put_u8(self.fcs);
        buf.freeze()
    }
}

/// Encode a complete frame for transmission.
///
/// Fails if the payload does not fit in a one-byte length field; no bytes
/// are produced in that case.
pub fn build_frame(cmd_type: CmdType, subsystem: u8, command: u8, payload: &[u8]) -> Result<Bytes> {
    let header = Header::new(cmd_type, subsystem, command, payload.len())?;
    let fcs = header.partial_checksum() ^ checksum(payload);

    let mut buf = BytesMut::with_capacity(header.frame_size());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    buf.put_u8(fcs);
    Ok(buf.freeze())
}
