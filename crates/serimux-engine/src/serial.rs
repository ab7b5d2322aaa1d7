//! Framing adapter over the serial transport.

use std::io;
use std::os::fd::OwnedFd;

use serimux_frame::{encode_header, is_control, ControlMessage, FrameDecoder, CONTROL};
use tracing::{trace, warn, Level};

use crate::handler::{AsyncHandler, Receiver};
use crate::pool::{Packet, PacketPool, PACKET_CAPACITY};
use crate::reactor::{Events, Reactor, Token};

/// Turns the serial byte stream into channel-tagged packets and wraps
/// outbound packets in frame headers.
///
/// Data frames longer than one packet are delivered as consecutive full
/// packets for the same channel followed by the remainder. Control frames
/// must fit in one packet; longer ones are dropped.
#[derive(Debug)]
pub struct SerialFramer {
    handler: AsyncHandler,
    deframer: Deframer,
}

#[derive(Debug, Default)]
struct Deframer {
    decoder: FrameDecoder,
    inbound: Option<Packet>,
    frames: Vec<Packet>,
    closed: bool,
}

impl Receiver for Deframer {
    fn post(&mut self, pool: &mut PacketPool, raw: Packet) {
        if tracing::enabled!(Level::TRACE) {
            trace!(len = raw.len(), data = %quote(raw.as_slice()), "serial in");
        }

        let Self {
            decoder,
            inbound,
            frames,
            ..
        } = self;
        decoder.push(raw.as_slice(), |segment| {
            if is_control(segment.channel) && usize::from(segment.frame_len) > PACKET_CAPACITY {
                if segment.is_start() {
                    warn!(
                        len = segment.frame_len,
                        max = PACKET_CAPACITY,
                        "dropping oversized control message"
                    );
                }
                return;
            }

            let mut data = segment.data;
            while !data.is_empty() {
                let packet = inbound.get_or_insert_with(|| {
                    let mut packet = pool.acquire();
                    packet.set_channel(segment.channel);
                    packet
                });
                let copied = packet.append(data);
                data = &data[copied..];
                if packet.is_full() {
                    frames.extend(inbound.take());
                }
            }
            if segment.end {
                frames.extend(inbound.take());
            }
        });
        pool.release(raw);
    }

    fn closed(&mut self) {
        self.closed = true;
    }
}

/// What one readiness event on the transport produced.
#[derive(Debug, Default)]
pub struct SerialEvents {
    /// Complete packets, each tagged with its channel.
    pub packets: Vec<Packet>,
    /// The transport hung up or failed.
    pub closed: bool,
}

impl SerialFramer {
    pub fn new(fd: impl Into<OwnedFd>, reactor: &mut Reactor) -> io::Result<Self> {
        Ok(Self {
            handler: AsyncHandler::new(fd, reactor)?,
            deframer: Deframer::default(),
        })
    }

    pub fn token(&self) -> Token {
        self.handler.token()
    }

    pub fn is_closed(&self) -> bool {
        self.handler.is_closed()
    }

    /// Bytes skipped on the inbound stream while resynchronizing.
    pub fn discarded(&self) -> u64 {
        self.deframer.decoder.discarded()
    }

    /// Queue `packet` for transmission on `channel`.
    pub fn send(&mut self, reactor: &mut Reactor, pool: &mut PacketPool, channel: u8, packet: Packet) {
        let header = match encode_header(channel, packet.len()) {
            Ok(header) => header,
            Err(err) => {
                warn!(channel, error = %err, "cannot frame packet");
                pool.release(packet);
                return;
            }
        };
        if tracing::enabled!(Level::TRACE) {
            trace!(
                channel,
                len = packet.len(),
                data = %quote(packet.as_slice()),
                "serial out"
            );
        }

        let mut head = pool.acquire();
        head.append(&header);
        self.handler.enqueue(reactor, pool, head);
        self.handler.enqueue(reactor, pool, packet);
    }

    /// Queue a control message. Returns `false` if it does not fit in a
    /// packet; nothing is sent in that case.
    pub fn send_control(
        &mut self,
        reactor: &mut Reactor,
        pool: &mut PacketPool,
        message: &ControlMessage,
    ) -> bool {
        if message.encoded_len() > PACKET_CAPACITY {
            return false;
        }
        let mut packet = pool.acquire();
        packet.append(&message.encode());
        self.send(reactor, pool, CONTROL, packet);
        true
    }

    pub fn on_ready(&mut self, reactor: &mut Reactor, pool: &mut PacketPool, events: Events) -> SerialEvents {
        self.handler
            .on_ready(reactor, pool, events, &mut self.deframer);
        SerialEvents {
            packets: std::mem::take(&mut self.deframer.frames),
            closed: std::mem::take(&mut self.deframer.closed),
        }
    }

    /// Close the transport and return partial input to the pool.
    pub fn close(&mut self, reactor: &mut Reactor, pool: &mut PacketPool) {
        self.handler.close(reactor, pool);
        if let Some(packet) = self.deframer.inbound.take() {
            pool.release(packet);
        }
        for packet in self.deframer.frames.drain(..) {
            pool.release(packet);
        }
    }
}

/// Printable rendering of traffic for trace logs: backslash is doubled,
/// tab, newline and carriage return are spelled out and other
/// non-printable bytes become `\xNN`.
pub fn quote(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &byte in data {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\t' => out.push_str("<TAB>"),
            b'\n' => out.push_str("<LN>"),
            b'\r' => out.push_str("<CR>"),
            0x20..=0x7e => out.push(char::from(byte)),
            _ => out.push_str(&format!("\\x{byte:02x}")),
        }
    }
    out
}
