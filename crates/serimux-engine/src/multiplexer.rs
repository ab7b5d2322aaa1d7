//! Routes traffic between local clients and channels on the serial link.

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serimux_frame::{is_control, ControlMessage};
use serimux_transport::{open_transport, UnixDomainSocket};
use tracing::{debug, error, info, warn};

use crate::channels::ChannelTable;
use crate::client::{Client, Registration};
use crate::config::{ListenEndpoint, MuxConfig};
use crate::error::{MuxError, Result};
use crate::handler::{AsyncHandler, Inbox};
use crate::pool::{Packet, PacketPool};
use crate::reactor::{Dispatch, Events, Reactor, Token};
use crate::serial::{quote, SerialFramer};

/// Why a client is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// The client closed its socket.
    Hangup,
    /// The client broke the registration protocol or could not be served.
    Rejected,
    /// The remote side sent `disconnect`.
    Remote,
}

/// The serial multiplexer.
///
/// Owns the reactor, the serial transport, the client listener and every
/// live client. Drive it with [`Multiplexer::turn`] or [`Multiplexer::run`].
#[derive(Debug)]
pub struct Multiplexer {
    reactor: Reactor,
    core: MuxCore,
}

#[derive(Debug)]
struct MuxCore {
    pool: PacketPool,
    serial: SerialFramer,
    listener: UnixDomainSocket,
    listener_token: Token,
    listener_open: bool,
    clients: HashMap<Token, Client>,
    channels: ChannelTable,
    draining: HashMap<Token, AsyncHandler>,
    fatal: Option<MuxError>,
}

impl Multiplexer {
    /// Open the transport and client endpoint named by `config`.
    pub fn open(config: &MuxConfig) -> Result<Self> {
        let transport = open_transport(&config.transport)?;
        let listener = match &config.listen {
            ListenEndpoint::Path(path) => UnixDomainSocket::bind_with_mode(path, config.socket_mode)?,
            ListenEndpoint::Inherited(name) => UnixDomainSocket::from_inherited(name)?,
        };
        info!(
            transport = %config.transport.display(),
            socket = %listener.path().display(),
            "multiplexer ready"
        );
        Self::from_parts(transport, listener)
    }

    /// Build a multiplexer over an already opened transport and listener.
    pub fn from_parts(transport: impl Into<OwnedFd>, listener: UnixDomainSocket) -> Result<Self> {
        let mut reactor = Reactor::new().map_err(MuxError::Reactor)?;
        let serial = SerialFramer::new(transport, &mut reactor).map_err(MuxError::Register)?;
        let listener_token = reactor
            .register(listener.as_fd())
            .map_err(MuxError::Register)?;
        reactor
            .enable(listener_token, Events::READABLE)
            .map_err(MuxError::Register)?;

        Ok(Self {
            reactor,
            core: MuxCore {
                pool: PacketPool::new(),
                serial,
                listener,
                listener_token,
                listener_open: true,
                clients: HashMap::new(),
                channels: ChannelTable::new(),
                draining: HashMap::new(),
                fatal: None,
            },
        })
    }

    /// One reactor pass. Fails if the transport or listener went away.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<()> {
        if let Some(err) = self.core.fatal.take() {
            return Err(err);
        }
        self.reactor
            .turn(timeout, &mut self.core)
            .map_err(MuxError::Wait)?;
        match self.core.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run until the transport or listener fails.
    pub fn run(&mut self) -> Result<()> {
        self.reactor
            .run(&mut self.core)
            .map_err(MuxError::Wait)?;
        match self.core.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run passes of at most `interval` while `running` stays set.
    pub fn run_while(&mut self, running: &AtomicBool, interval: Duration) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            self.turn(Some(interval))?;
        }
        Ok(())
    }

    /// Where clients connect.
    pub fn socket_path(&self) -> &Path {
        self.core.listener.path()
    }

    /// Live clients, in any registration state.
    pub fn client_count(&self) -> usize {
        self.core.clients.len()
    }

    /// Client channels currently held.
    pub fn channels_in_use(&self) -> usize {
        self.core.channels.in_use()
    }

    /// Destroyed clients whose sockets are still flushing output.
    pub fn draining_count(&self) -> usize {
        self.core.draining.len()
    }

    /// Registration state of the client holding `channel`.
    pub fn registration(&self, channel: u8) -> Option<Registration> {
        let token = self.core.channels.owner(channel)?;
        self.core.clients.get(&token).map(Client::registration)
    }

    pub fn pool(&self) -> &PacketPool {
        &self.core.pool
    }

    /// Bytes skipped on the serial stream while resynchronizing.
    pub fn discarded(&self) -> u64 {
        self.core.serial.discarded()
    }
}

impl Dispatch for MuxCore {
    fn dispatch(&mut self, reactor: &mut Reactor, token: Token, events: Events) {
        if token == self.serial.token() && !self.serial.is_closed() {
            self.serial_ready(reactor, events);
        } else if token == self.listener_token && self.listener_open {
            self.listener_ready(reactor, events);
        } else if self.clients.contains_key(&token) {
            self.client_ready(reactor, token, events);
        } else if let Some(handler) = self.draining.get_mut(&token) {
            let mut sink = Inbox::new();
            handler.on_ready(reactor, &mut self.pool, events, &mut sink);
            sink.clear(&mut self.pool);
            if handler.is_closed() {
                self.draining.remove(&token);
            }
        }
    }

    fn is_done(&self) -> bool {
        self.fatal.is_some()
    }
}

impl MuxCore {
    fn serial_ready(&mut self, reactor: &mut Reactor, events: Events) {
        let out = self.serial.on_ready(reactor, &mut self.pool, events);
        for packet in out.packets {
            self.route_from_serial(reactor, packet);
        }
        if out.closed {
            error!("serial transport closed");
            self.serial.close(reactor, &mut self.pool);
            self.fatal.get_or_insert(MuxError::TransportClosed);
        }
    }

    fn listener_ready(&mut self, reactor: &mut Reactor, events: Events) {
        if events.is_closed() {
            error!(socket = %self.listener.path().display(), "client listener closed");
            reactor.unregister(self.listener_token);
            self.listener_open = false;
            self.fatal.get_or_insert(MuxError::ListenerClosed);
            return;
        }
        if !events.is_readable() {
            return;
        }
        loop {
            match self.listener.try_accept() {
                Ok(Some(stream)) => match Client::new(stream, reactor) {
                    Ok(client) => {
                        debug!(client = %client.token(), "client connected");
                        self.clients.insert(client.token(), client);
                    }
                    Err(err) => warn!(error = %err, "cannot watch accepted client"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    fn client_ready(&mut self, reactor: &mut Reactor, token: Token, events: Events) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        let out = client.on_ready(reactor, &mut self.pool, events);

        let mut packets = out.packets.into_iter();
        for packet in packets.by_ref() {
            if !self.client_packet(reactor, token, packet) {
                break;
            }
        }
        for leftover in packets {
            self.pool.release(leftover);
        }

        if out.closed {
            debug!(client = %token, "client hung up");
            self.destroy_client(reactor, token, Teardown::Hangup);
        }
    }

    /// Handle bytes read from a client socket. Returns `false` once the
    /// client has been destroyed.
    fn client_packet(&mut self, reactor: &mut Reactor, token: Token, packet: Packet) -> bool {
        let Some(client) = self.clients.get(&token) else {
            self.pool.release(packet);
            return false;
        };
        match client.registration() {
            Registration::Registered(channel) => {
                self.serial.send(reactor, &mut self.pool, channel, packet);
                true
            }
            Registration::Pending(channel) => {
                warn!(
                    client = %token,
                    channel,
                    len = packet.len(),
                    "client sent data before registration completed; closing"
                );
                self.pool.release(packet);
                self.destroy_client(reactor, token, Teardown::Rejected);
                false
            }
            Registration::Unregistered => self.request_service(reactor, token, packet),
        }
    }

    /// Treat `packet` as a service name and ask the remote side for it.
    fn request_service(&mut self, reactor: &mut Reactor, token: Token, packet: Packet) -> bool {
        let name = Bytes::copy_from_slice(packet.as_slice());
        self.pool.release(packet);

        let Some(channel) = self.channels.allocate(token) else {
            warn!(client = %token, "no free channel; closing client");
            self.destroy_client(reactor, token, Teardown::Rejected);
            return false;
        };

        let request = ControlMessage::Connect {
            name: name.clone(),
            channel,
        };
        if !self.serial.send_control(reactor, &mut self.pool, &request) {
            warn!(
                client = %token,
                len = name.len(),
                "service name too long for a control message; closing client"
            );
            self.channels.release(channel);
            self.destroy_client(reactor, token, Teardown::Rejected);
            return false;
        }

        if let Some(client) = self.clients.get_mut(&token) {
            client.begin_registration(channel);
        }
        info!(client = %token, channel, service = %quote(&name), "requesting service");
        true
    }

    fn route_from_serial(&mut self, reactor: &mut Reactor, packet: Packet) {
        let Some(channel) = packet.channel() else {
            self.pool.release(packet);
            return;
        };
        if is_control(channel) {
            let message = ControlMessage::parse(packet.as_slice());
            self.pool.release(packet);
            self.handle_control(reactor, message);
            return;
        }

        let client = self
            .channels
            .owner(channel)
            .and_then(|token| self.clients.get_mut(&token));
        match client {
            Some(client) if client.registration() == Registration::Registered(channel) => {
                client.send(reactor, &mut self.pool, packet);
            }
            Some(_) => {
                warn!(channel, len = packet.len(), "data for unregistered channel; dropping");
                self.pool.release(packet);
            }
            None => {
                warn!(channel, len = packet.len(), "data for unknown channel; dropping");
                self.pool.release(packet);
            }
        }
    }

    fn handle_control(&mut self, reactor: &mut Reactor, message: ControlMessage) {
        match message {
            ControlMessage::Connected { channel } => {
                match pending_client(&mut self.clients, &self.channels, channel) {
                    Some(client) => {
                        client.accept(reactor, &mut self.pool);
                        info!(channel, "service connected");
                    }
                    None => warn!(channel, "connect confirmation for no pending client"),
                }
            }
            ControlMessage::Refused { channel, reason } => {
                match pending_client(&mut self.clients, &self.channels, channel) {
                    Some(client) => {
                        client.refuse(reactor, &mut self.pool);
                        self.channels.release(channel);
                        info!(channel, reason = %quote(&reason), "service refused");
                    }
                    None => warn!(channel, "connect refusal for no pending client"),
                }
            }
            ControlMessage::Disconnect { channel } => match self.channels.owner(channel) {
                Some(token) => {
                    info!(channel, "remote side disconnected");
                    self.destroy_client(reactor, token, Teardown::Remote);
                }
                None => debug!(channel, "disconnect for unknown channel"),
            },
            ControlMessage::VersionProbe => debug!("ignoring version probe"),
            ControlMessage::Connect { .. } | ControlMessage::Unknown(_) => {
                warn!(message = %quote(&message.encode()), "unrecognized control message");
            }
        }
    }

    /// Remove a client, release its channel and close its socket once
    /// queued output is written.
    fn destroy_client(&mut self, reactor: &mut Reactor, token: Token, teardown: Teardown) {
        let Some(client) = self.clients.remove(&token) else {
            return;
        };
        if let Some(channel) = client.channel() {
            self.channels.release(channel);
            let registered = matches!(client.registration(), Registration::Registered(_));
            if registered && teardown != Teardown::Remote {
                self.serial.send_control(
                    reactor,
                    &mut self.pool,
                    &ControlMessage::Disconnect { channel },
                );
            }
        }
        debug!(client = %token, ?teardown, "client destroyed");
        if let Some(handler) = client.shutdown(reactor, &mut self.pool) {
            self.draining.insert(handler.token(), handler);
        }
    }
}

fn pending_client<'a>(
    clients: &'a mut HashMap<Token, Client>,
    channels: &ChannelTable,
    channel: u8,
) -> Option<&'a mut Client> {
    let token = channels.owner(channel)?;
    clients
        .get_mut(&token)
        .filter(|client| client.registration() == Registration::Pending(channel))
}
