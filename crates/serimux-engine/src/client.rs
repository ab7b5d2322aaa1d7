use std::io;
use std::os::unix::net::UnixStream;

use crate::handler::{AsyncHandler, HandlerState, Inbox};
use crate::pool::{Packet, PacketPool};
use crate::reactor::{Events, Reactor, Token};

/// Reply written to a client whose service was accepted.
pub const REPLY_OK: &[u8] = b"OK";

/// Reply written to a client whose service was refused.
pub const REPLY_KO: &[u8] = b"KO";

/// Where a client stands in the registration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Connected; the next message names a service.
    Unregistered,
    /// A connect request for this channel is awaiting the remote reply.
    Pending(u8),
    /// Data flows on this channel.
    Registered(u8),
}

impl Registration {
    pub fn channel(self) -> Option<u8> {
        match self {
            Self::Unregistered => None,
            Self::Pending(channel) | Self::Registered(channel) => Some(channel),
        }
    }
}

/// What one readiness event on a client socket produced.
#[derive(Debug, Default)]
pub struct ClientEvents {
    pub packets: Vec<Packet>,
    /// The client went away.
    pub closed: bool,
}

/// One local client connection.
#[derive(Debug)]
pub struct Client {
    handler: AsyncHandler,
    registration: Registration,
    inbox: Inbox,
}

impl Client {
    pub fn new(stream: UnixStream, reactor: &mut Reactor) -> io::Result<Self> {
        Ok(Self {
            handler: AsyncHandler::new(stream, reactor)?,
            registration: Registration::Unregistered,
            inbox: Inbox::new(),
        })
    }

    pub fn token(&self) -> Token {
        self.handler.token()
    }

    pub fn registration(&self) -> Registration {
        self.registration
    }

    pub fn channel(&self) -> Option<u8> {
        self.registration.channel()
    }

    pub fn on_ready(&mut self, reactor: &mut Reactor, pool: &mut PacketPool, events: Events) -> ClientEvents {
        self.handler.on_ready(reactor, pool, events, &mut self.inbox);
        ClientEvents {
            packets: self.inbox.take_packets(),
            closed: self.inbox.is_closed(),
        }
    }

    /// Record that a connect request went out for `channel`.
    pub fn begin_registration(&mut self, channel: u8) {
        debug_assert_eq!(self.registration, Registration::Unregistered);
        self.registration = Registration::Pending(channel);
    }

    /// The remote side accepted: reply `OK` and start forwarding.
    pub fn accept(&mut self, reactor: &mut Reactor, pool: &mut PacketPool) {
        if let Registration::Pending(channel) = self.registration {
            self.registration = Registration::Registered(channel);
            self.reply(reactor, pool, REPLY_OK);
        }
    }

    /// The remote side refused: reply `KO` and return to the unregistered
    /// state. Returns the channel that was being registered.
    pub fn refuse(&mut self, reactor: &mut Reactor, pool: &mut PacketPool) -> Option<u8> {
        let Registration::Pending(channel) = self.registration else {
            return None;
        };
        self.registration = Registration::Unregistered;
        self.reply(reactor, pool, REPLY_KO);
        Some(channel)
    }

    /// Queue bytes for the client socket.
    pub fn send(&mut self, reactor: &mut Reactor, pool: &mut PacketPool, packet: Packet) {
        self.handler.enqueue(reactor, pool, packet);
    }

    /// Begin a graceful close and hand back the handler if output is
    /// still draining.
    pub fn shutdown(mut self, reactor: &mut Reactor, pool: &mut PacketPool) -> Option<AsyncHandler> {
        self.inbox.clear(pool);
        self.handler.shutdown(reactor, pool);
        match self.handler.state() {
            HandlerState::Closing => Some(self.handler),
            _ => None,
        }
    }

    fn reply(&mut self, reactor: &mut Reactor, pool: &mut PacketPool, text: &[u8]) {
        let mut packet = pool.acquire();
        packet.append(text);
        self.handler.enqueue(reactor, pool, packet);
    }
}
