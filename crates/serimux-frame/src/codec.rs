use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: channel (2 hex digits) + length (4 hex digits) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Offset and width of the channel field.
pub const CHANNEL_OFFSET: usize = 0;
pub const CHANNEL_DIGITS: usize = 2;

/// Offset and width of the payload length field.
pub const LENGTH_OFFSET: usize = 2;
pub const LENGTH_DIGITS: usize = 4;

/// Largest payload the four-digit length field can describe.
pub const MAX_PAYLOAD: usize = 0xffff;

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub channel: u8,
    pub len: u16,
}

/// A framed message with channel routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The channel this message belongs to.
    pub channel: u8,
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(channel: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Value of one hexadecimal digit, either case.
pub fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Parse a fixed-width big-endian hex number.
///
/// Returns `None` if any byte is not a hex digit.
pub fn parse_hex(digits: &[u8]) -> Option<u32> {
    digits.iter().try_fold(0u32, |acc, &c| {
        hex_value(c).map(|d| (acc << 4) | u32::from(d))
    })
}

/// Write `value` as zero-padded lowercase hex filling all of `dst`.
pub fn write_hex(value: u32, dst: &mut [u8]) {
    let width = dst.len();
    for (nn, slot) in dst.iter_mut().enumerate() {
        let shift = (width - 1 - nn) * 4;
        *slot = HEX_CHARS[((value >> shift) & 0xf) as usize];
    }
}

/// Two lowercase hex digits for a channel number, as used inside control messages.
pub fn channel_hex(channel: u8) -> [u8; 2] {
    let mut out = [0u8; 2];
    write_hex(u32::from(channel), &mut out);
    out
}

/// Encode the six-byte header for a payload of `len` bytes on `channel`.
///
/// ```text
/// ┌──────────────┬────────────────┬──────────────────┐
/// │ Channel (2B) │ Length (4B)    │ Payload          │
/// │ hex, MSN 1st │ hex, MSN first │ (Length bytes)   │
/// └──────────────┴────────────────┴──────────────────┘
/// ```
pub fn encode_header(channel: u8, len: usize) -> Result<[u8; HEADER_SIZE]> {
    if len > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD,
        });
    }
    let mut header = [0u8; HEADER_SIZE];
    write_hex(
        u32::from(channel),
        &mut header[CHANNEL_OFFSET..CHANNEL_OFFSET + CHANNEL_DIGITS],
    );
    write_hex(
        len as u32,
        &mut header[LENGTH_OFFSET..LENGTH_OFFSET + LENGTH_DIGITS],
    );
    Ok(header)
}

/// Decode a six-byte header.
pub fn decode_header(raw: &[u8; HEADER_SIZE]) -> Result<Header> {
    let channel = parse_hex(&raw[CHANNEL_OFFSET..CHANNEL_OFFSET + CHANNEL_DIGITS]);
    let len = parse_hex(&raw[LENGTH_OFFSET..LENGTH_OFFSET + LENGTH_DIGITS]);
    match (channel, len) {
        (Some(channel), Some(len)) => Ok(Header {
            channel: channel as u8,
            len: len as u16,
        }),
        _ => Err(FrameError::InvalidHeader(*raw)),
    }
}

/// Encode a frame into the wire format.
pub fn encode_frame(channel: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let header = encode_header(channel, payload.len())?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&header);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. Zero-length frames
/// are returned as-is; dropping them is a policy of the streaming decoder.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&src[..HEADER_SIZE]);
    let header = decode_header(&raw)?;

    let total = HEADER_SIZE + usize::from(header.len);
    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(usize::from(header.len)).freeze();

    Ok(Some(Frame {
        channel: header.channel,
        payload,
    }))
}
