//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: scanning for SOF, then need 4 header bytes
//! - `WaitingForPayload`: header parsed, need LEN payload bytes plus FCS
//!
//! Bytes preceding a SOF marker are discarded, so a stream that starts
//! mid-frame resynchronizes on the next real frame.
//!
//! # Example
//!
//! ```
//! use unpi_client::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // data arrives in arbitrary chunks from the serial port
//! assert!(buffer.push(&[0x00, 0xFE, 0x01, 0x61]).is_empty());
//! let frames = buffer.push(&[0x00, 0x07, 0x67]);
//!
//! assert_eq!(frames.len(), 1);
//! assert!(frames[0].is_valid());
//! ```

use bytes::BytesMut;

use super::wire_format::{checksum, Header, HEADER_SIZE, SOF};
use super::Frame;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Looking for SOF and a complete header.
    WaitingForHeader,
    /// Header consumed, waiting for payload and FCS.
    WaitingForPayload { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Never fails: garbage is skipped and checksum mismatches are reported on
/// the emitted [`Frame`].
pub struct FrameBuffer {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Bytes dropped while hunting for SOF.
    discarded: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new frame buffer with a custom initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
            discarded: 0,
        }
    }

    /// Append data and lazily yield every complete frame now available.
    ///
    /// An incomplete tail stays buffered for the next call. Frames not pulled
    /// from the iterator remain buffered as well.
    pub fn feed(&mut self, data: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(data);
        Frames { buffer: self }
    }

    /// Push data into the buffer and extract all complete frames.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.feed(data).collect()
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Option<Frame> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    match self.buffer.iter().position(|&b| b == SOF) {
                        Some(0) => {}
                        Some(pos) => {
                            let _ = self.buffer.split_to(pos);
                            self.discarded += pos as u64;
                        }
                        None => {
                            self.discarded += self.buffer.len() as u64;
                            self.buffer.clear();
                            return None;
                        }
                    }

                    if self.buffer.len() < HEADER_SIZE {
                        return None;
                    }

                    let header = Header::decode(&self.buffer[..HEADER_SIZE])?;
                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForPayload { header };
                }
                State::WaitingForPayload { header } => {
                    let needed = header.length as usize + 1;
                    if self.buffer.len() < needed {
                        return None;
                    }

                    let header = *header;
                    let payload = self.buffer.split_to(header.length as usize).freeze();
                    let fcs = self.buffer.split_to(1)[0];
                    let csum = header.partial_checksum() ^ checksum(&payload);
                    self.state = State::WaitingForHeader;

                    return Some(Frame {
                        header,
                        payload,
                        fcs,
                        csum,
                    });
                }
            }
        }
    }

    /// Number of buffered bytes not yet part of an emitted frame.
    ///
    /// A consumed header is not counted.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::WaitingForHeader)
    }

    /// Total bytes skipped while searching for SOF.
    #[inline]
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Drop buffered data and reset the state machine.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy iterator over frames completed by a [`FrameBuffer::feed`] call.
pub struct Frames<'a> {
    buffer: &'a mut FrameBuffer,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.buffer.try_extract_one()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, CmdType};

    fn frame_bytes(cmd_type: CmdType, subsys: u8, cmd: u8, payload: &[u8]) -> Vec<u8> {
        build_frame(cmd_type, subsys, cmd, payload).unwrap().to_vec()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let data = frame_bytes(CmdType::Srsp, 1, 2, &[1, 2, 3]);

        let frames = buffer.push(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cmd_type(), CmdType::Srsp);
        assert_eq!(frames[0].subsystem(), 1);
        assert_eq!(frames[0].command(), 2);
        assert_eq!(frames[0].payload(), &[1, 2, 3]);
        assert!(frames[0].is_valid());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let data = frame_bytes(CmdType::Areq, 4, 0x80, &[0, 8, 30]);

        assert!(buffer.push(&data[..2]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        let frames = buffer.push(&data[2..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0, 8, 30]);
    }

    #[test]
    fn test_fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let data = frame_bytes(CmdType::Srsp, 1, 2, b"hello world");

        assert!(buffer.push(&data[..6]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        let frames = buffer.push(&data[6..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"hello world");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let data = frame_bytes(CmdType::Srsp, 10, 0, &[0xDE, 0xAD, 0xBE, 0xEF]);

        let mut frames = Vec::new();
        for byte in &data {
            frames.extend(buffer.push(&[*byte]));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut buffer = FrameBuffer::new();
        let mut data = frame_bytes(CmdType::Srsp, 1, 1, &[1]);
        data.extend(frame_bytes(CmdType::Areq, 1, 0x80, &[]));
        data.extend(frame_bytes(CmdType::Srsp, 1, 2, &[2, 2]));

        let frames = buffer.push(&data);
        let commands: Vec<u8> = frames.iter().map(|f| f.command()).collect();
        assert_eq!(commands, vec![1, 0x80, 2]);
    }

    #[test]
    fn test_garbage_before_sof_is_discarded() {
        let mut buffer = FrameBuffer::new();
        let mut data = vec![0x00, 0x13, 0x37];
        data.extend(frame_bytes(CmdType::Srsp, 1, 2, &[9]));

        let frames = buffer.push(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(buffer.discarded(), 3);
    }

    #[test]
    fn test_all_garbage_is_dropped() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&[1, 2, 3, 4, 5]).is_empty());
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.discarded(), 5);
    }

    #[test]
    fn test_checksum_mismatch_is_flagged() {
        let mut buffer = FrameBuffer::new();
        let mut data = frame_bytes(CmdType::Srsp, 1, 2, &[1, 2]);
        let last = data.len() - 1;
        data[last] ^= 0xFF;

        let frames = buffer.push(&data);
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].is_valid());
        assert_eq!(frames[0].payload(), &[1, 2]);
    }

    #[test]
    fn test_feed_is_lazy() {
        let mut buffer = FrameBuffer::new();
        let mut data = frame_bytes(CmdType::Srsp, 1, 1, &[1]);
        data.extend(frame_bytes(CmdType::Srsp, 1, 2, &[2]));

        let first = buffer.feed(&data).next().unwrap();
        assert_eq!(first.command(), 1);

        // the second frame is still buffered
        let rest = buffer.push(&[]);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].command(), 2);
    }

    #[test]
    fn test_clear() {
        let mut buffer = FrameBuffer::new();
        let data = frame_bytes(CmdType::Srsp, 1, 2, &[1, 2, 3]);
        buffer.push(&data[..5]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");
    }
}
