use tracing::{debug, warn};

use crate::codec::{decode_header, Header, HEADER_SIZE};

/// A run of payload bytes belonging to one frame.
///
/// A frame's payload may arrive split across several `push` calls, so a
/// single frame can produce several segments. `offset` is the position of
/// `data` inside the frame's payload; the last segment has `end == true`.
#[derive(Debug, PartialEq, Eq)]
pub struct Segment<'a> {
    pub channel: u8,
    pub frame_len: u16,
    pub offset: u16,
    pub data: &'a [u8],
    pub end: bool,
}

impl Segment<'_> {
    /// True for the segment that starts a frame.
    pub fn is_start(&self) -> bool {
        self.offset == 0
    }
}

/// Streaming decoder for the serial byte stream.
///
/// Collects six header bytes, then hands out payload bytes as [`Segment`]s.
///
/// Resynchronization: when the collected header is not valid hex, the first
/// byte of the candidate header is discarded and the scan resumes at the
/// next byte, so the decoder realigns on the first plausible header. A valid
/// header announcing a zero-length payload is consumed whole and produces
/// no segment.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: [u8; HEADER_SIZE],
    header_len: usize,
    current: Option<Current>,
    discarded: u64,
}

#[derive(Debug, Clone, Copy)]
struct Current {
    header: Header,
    received: u16,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw transport bytes, invoking `on_segment` for every payload run.
    pub fn push<F>(&mut self, mut input: &[u8], mut on_segment: F)
    where
        F: FnMut(Segment<'_>),
    {
        while !input.is_empty() {
            match self.current {
                None => {
                    let wanted = HEADER_SIZE - self.header_len;
                    let take = wanted.min(input.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&input[..take]);
                    self.header_len += take;
                    input = &input[take..];

                    if self.header_len == HEADER_SIZE {
                        self.finish_header();
                    }
                }
                Some(mut current) => {
                    let remaining = usize::from(current.header.len - current.received);
                    let take = remaining.min(input.len());
                    let offset = current.received;
                    current.received += take as u16;
                    let end = current.received == current.header.len;

                    on_segment(Segment {
                        channel: current.header.channel,
                        frame_len: current.header.len,
                        offset,
                        data: &input[..take],
                        end,
                    });
                    input = &input[take..];

                    self.current = if end { None } else { Some(current) };
                }
            }
        }
    }

    /// True when the decoder sits on a frame boundary.
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.header_len == 0
    }

    /// Number of bytes skipped while hunting for a valid header.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn finish_header(&mut self) {
        match decode_header(&self.header) {
            Ok(header) if header.len == 0 => {
                debug!(channel = header.channel, "ignoring empty packet from serial port");
                self.header_len = 0;
            }
            Ok(header) => {
                self.header_len = 0;
                self.current = Some(Current {
                    header,
                    received: 0,
                });
            }
            Err(err) => {
                warn!(error = %err, "malformed header from serial port; resynchronizing");
                self.header.copy_within(1.., 0);
                self.header_len = HEADER_SIZE - 1;
                self.discarded += 1;
            }
        }
    }
}
