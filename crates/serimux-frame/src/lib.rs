//! Serial-link framing for serimux.
//!
//! Every unit on the link is a six-byte ASCII header followed by raw payload:
//! - 2 lowercase hex digits: channel number (0-255)
//! - 4 lowercase hex digits: payload length (0-65535)
//!
//! Channel 0 carries the control protocol in [`control`]. The streaming
//! [`FrameDecoder`] is what the multiplexer uses on its non-blocking link;
//! [`FrameReader`] and [`FrameWriter`] serve blocking remote-side tools.

pub mod channel;
pub mod codec;
pub mod control;
pub mod decoder;
pub mod error;
pub mod reader;
pub mod writer;

pub use channel::{is_control, CONTROL, FIRST_CLIENT_CHANNEL, MAX_CHANNEL};
pub use codec::{
    channel_hex, decode_frame, decode_header, encode_frame, encode_header, Frame, Header,
    HEADER_SIZE, MAX_PAYLOAD,
};
pub use control::ControlMessage;
pub use decoder::{FrameDecoder, Segment};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
