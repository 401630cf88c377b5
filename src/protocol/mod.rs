//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the Unified NPI frame codec:
//! - 4-byte header encoding/decoding and the XOR frame check sequence
//! - Frame buffer that reassembles frames from arbitrary chunk boundaries
//! - Frame struct with typed accessors and checksum verdict

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::{FrameBuffer, Frames};
pub use wire_format::{
    checksum, pack_type_subsys, unpack_type_subsys, CmdType, Header, FRAME_OVERHEAD, HEADER_SIZE,
    MAX_PAYLOAD_SIZE, SOF, SUBSYSTEM_MASK, TYPE_SHIFT,
};
