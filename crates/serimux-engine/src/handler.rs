//! Buffered, readiness-driven I/O over one descriptor.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};

use tracing::{debug, trace, warn};

use crate::pool::{Packet, PacketPool};
use crate::reactor::{Events, Reactor, Token};

/// Consumer of what an [`AsyncHandler`] reads.
pub trait Receiver {
    /// Take ownership of one inbound packet.
    fn post(&mut self, pool: &mut PacketPool, packet: Packet);

    /// The peer hung up or the descriptor failed.
    fn closed(&mut self);
}

/// A [`Receiver`] that keeps packets until the owner collects them.
#[derive(Debug, Default)]
pub struct Inbox {
    packets: Vec<Packet>,
    closed: bool,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected packets, in arrival order.
    pub fn take_packets(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.packets)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Return anything still held to the pool.
    pub fn clear(&mut self, pool: &mut PacketPool) {
        for packet in self.packets.drain(..) {
            pool.release(packet);
        }
    }
}

impl Receiver for Inbox {
    fn post(&mut self, _pool: &mut PacketPool, packet: Packet) {
        self.packets.push(packet);
    }

    fn closed(&mut self) {
        self.closed = true;
    }
}

/// Lifecycle of an [`AsyncHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Open,
    /// Shut down by its owner; draining queued output, no longer reading.
    Closing,
    Closed,
}

/// Owns a non-blocking descriptor and a FIFO of outbound packets.
///
/// Reads one packet's worth per readable event and posts it to the
/// receiver. Writes from the head of the queue as the descriptor allows;
/// a partially written packet stays at the head until the rest goes out.
/// Write interest is held exactly while the queue is non-empty.
#[derive(Debug)]
pub struct AsyncHandler {
    file: Option<File>,
    token: Token,
    queue: VecDeque<Packet>,
    cursor: usize,
    state: HandlerState,
}

impl AsyncHandler {
    /// Take ownership of `fd`, register it and start reading.
    pub fn new(fd: impl Into<OwnedFd>, reactor: &mut Reactor) -> io::Result<Self> {
        let fd: OwnedFd = fd.into();
        let token = reactor.register(fd.as_fd())?;
        if let Err(err) = reactor.enable(token, Events::READABLE) {
            reactor.unregister(token);
            return Err(err);
        }
        Ok(Self {
            file: Some(File::from(fd)),
            token,
            queue: VecDeque::new(),
            cursor: 0,
            state: HandlerState::Open,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == HandlerState::Closed
    }

    /// Packets waiting to be written, including a partially written head.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Append a packet to the outbound queue.
    pub fn enqueue(&mut self, reactor: &mut Reactor, pool: &mut PacketPool, packet: Packet) {
        if self.state == HandlerState::Closed {
            debug!(token = %self.token, len = packet.len(), "dropping packet for closed descriptor");
            pool.release(packet);
            return;
        }
        if self.queue.is_empty() {
            self.cursor = 0;
            if let Err(err) = reactor.enable(self.token, Events::WRITABLE) {
                warn!(token = %self.token, error = %err, "cannot arm write interest");
            }
        }
        self.queue.push_back(packet);
    }

    /// React to readiness reported for this handler's token.
    ///
    /// Readable data is posted before a hang-up is acted on, so the last
    /// bytes sent by a departing peer are not lost.
    pub fn on_ready(
        &mut self,
        reactor: &mut Reactor,
        pool: &mut PacketPool,
        events: Events,
        receiver: &mut dyn Receiver,
    ) {
        if self.state == HandlerState::Closed {
            return;
        }

        if events.is_readable() && self.state == HandlerState::Open {
            self.read_once(pool, receiver);
        }

        if events.is_closed() {
            debug!(token = %self.token, ?events, "descriptor hung up");
            let notify = self.state == HandlerState::Open;
            self.close(reactor, pool);
            if notify {
                receiver.closed();
            }
            return;
        }

        if events.is_writable() {
            self.flush(reactor, pool);
        }
    }

    /// Graceful close requested by the owner. The receiver is not
    /// notified. Queued output is still delivered: with an empty queue the
    /// handler closes at once, otherwise it stops reading and closes after
    /// the last queued byte is written.
    pub fn shutdown(&mut self, reactor: &mut Reactor, pool: &mut PacketPool) {
        if self.state != HandlerState::Open {
            return;
        }
        if self.queue.is_empty() {
            self.close(reactor, pool);
            return;
        }
        self.state = HandlerState::Closing;
        if let Err(err) = reactor.disable(self.token, Events::READABLE) {
            warn!(token = %self.token, error = %err, "cannot drop read interest; closing now");
            self.close(reactor, pool);
        }
    }

    /// Close immediately, discarding queued output. The receiver is not
    /// notified.
    pub fn close(&mut self, reactor: &mut Reactor, pool: &mut PacketPool) {
        if self.state == HandlerState::Closed {
            return;
        }
        self.state = HandlerState::Closed;
        reactor.unregister(self.token);
        self.file = None;
        for packet in self.queue.drain(..) {
            pool.release(packet);
        }
        self.cursor = 0;
        trace!(token = %self.token, "descriptor closed");
    }

    fn read_once(&mut self, pool: &mut PacketPool, receiver: &mut dyn Receiver) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let mut packet = pool.acquire();
        let result = loop {
            match file.read(packet.spare_mut()) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match result {
            Ok(0) => pool.release(packet),
            Ok(n) => {
                packet.set_len(n);
                receiver.post(pool, packet);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => pool.release(packet),
            Err(err) => {
                debug!(token = %self.token, error = %err, "read failed");
                pool.release(packet);
            }
        }
    }

    fn flush(&mut self, reactor: &mut Reactor, pool: &mut PacketPool) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        while let Some(head) = self.queue.front() {
            let pending = &head.as_slice()[self.cursor.min(head.len())..];
            if pending.is_empty() {
                pop_head(&mut self.queue, &mut self.cursor, pool);
                continue;
            }
            match file.write(pending) {
                Ok(0) => break,
                Ok(n) if n == pending.len() => {
                    pop_head(&mut self.queue, &mut self.cursor, pool);
                }
                Ok(n) => {
                    self.cursor += n;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(token = %self.token, error = %err, "write failed; output stays queued");
                    break;
                }
            }
        }

        if self.queue.is_empty() {
            if self.state == HandlerState::Closing {
                self.close(reactor, pool);
            } else if let Err(err) = reactor.disable(self.token, Events::WRITABLE) {
                warn!(token = %self.token, error = %err, "cannot drop write interest");
            }
        }
    }

}

fn pop_head(queue: &mut VecDeque<Packet>, cursor: &mut usize, pool: &mut PacketPool) {
    if let Some(done) = queue.pop_front() {
        pool.release(done);
    }
    *cursor = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Dispatch;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    const SHORT: Option<Duration> = Some(Duration::from_millis(20));

    struct Harness {
        reactor: Reactor,
        core: Core,
    }

    struct Core {
        pool: PacketPool,
        handler: AsyncHandler,
        inbox: Inbox,
    }

    impl Dispatch for Core {
        fn dispatch(&mut self, reactor: &mut Reactor, token: Token, events: Events) {
            assert_eq!(token, self.handler.token());
            self.handler
                .on_ready(reactor, &mut self.pool, events, &mut self.inbox);
        }
    }

    impl Harness {
        fn new() -> (Self, UnixStream) {
            let (local, remote) = UnixStream::pair().unwrap();
            let mut reactor = Reactor::new().unwrap();
            let handler = AsyncHandler::new(local, &mut reactor).unwrap();
            let harness = Self {
                reactor,
                core: Core {
                    pool: PacketPool::new(),
                    handler,
                    inbox: Inbox::new(),
                },
            };
            (harness, remote)
        }

        fn turn(&mut self) {
            self.reactor.turn(SHORT, &mut self.core).unwrap();
        }

        fn enqueue(&mut self, bytes: &[u8]) {
            let mut packet = self.core.pool.acquire();
            assert_eq!(packet.append(bytes), bytes.len());
            self.core
                .handler
                .enqueue(&mut self.reactor, &mut self.core.pool, packet);
        }

        fn interest(&self) -> Option<Events> {
            self.reactor.interest(self.core.handler.token())
        }
    }

    /// Turn the reactor while draining `remote` until `want` bytes arrived
    /// or the peer closed.
    fn drain(harness: &mut Harness, remote: &mut UnixStream, want: usize) -> (Vec<u8>, bool) {
        remote.set_nonblocking(true).unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; 1024];
        for _ in 0..10_000 {
            harness.turn();
            loop {
                match remote.read(&mut buf) {
                    Ok(0) => return (got, true),
                    Ok(n) => got.extend_from_slice(&buf[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => panic!("read failed: {err}"),
                }
            }
            if got.len() >= want && harness.core.handler.queued() == 0 {
                return (got, false);
            }
        }
        (got, false)
    }

    fn patterned(count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| (0..crate::PACKET_CAPACITY).map(|j| ((i * 7 + j) % 251) as u8).collect())
            .collect()
    }

    #[test]
    fn reads_are_posted_to_receiver() {
        let (mut harness, mut remote) = Harness::new();
        remote.write_all(b"hello").unwrap();
        harness.turn();

        let packets = harness.core.inbox.take_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].as_slice(), b"hello");
        for packet in packets {
            harness.core.pool.release(packet);
        }
        assert_eq!(harness.core.pool.in_flight(), 0);
    }

    #[test]
    fn data_before_hangup_is_delivered_then_closed() {
        let (mut harness, mut remote) = Harness::new();
        remote.write_all(b"last words").unwrap();
        drop(remote);
        harness.turn();

        let packets = harness.core.inbox.take_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].as_slice(), b"last words");
        assert!(harness.core.inbox.is_closed());
        assert!(harness.core.handler.is_closed());
        assert!(harness.reactor.is_empty());
        for packet in packets {
            harness.core.pool.release(packet);
        }
    }

    #[test]
    fn write_interest_tracks_queue() {
        let (mut harness, mut remote) = Harness::new();
        assert_eq!(harness.interest(), Some(Events::READABLE));

        harness.enqueue(b"ping");
        assert_eq!(harness.interest(), Some(Events::READABLE | Events::WRITABLE));

        harness.turn();
        assert_eq!(harness.core.handler.queued(), 0);
        assert_eq!(harness.interest(), Some(Events::READABLE));

        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(harness.core.pool.in_flight(), 0);
    }

    #[test]
    fn fifo_order_survives_partial_writes() {
        let (mut harness, mut remote) = Harness::new();
        // Far more than a socket buffer holds, so writes come up short.
        let chunks = patterned(120);
        for chunk in &chunks {
            harness.enqueue(chunk);
        }
        let expected: Vec<u8> = chunks.concat();

        let (got, closed) = drain(&mut harness, &mut remote, expected.len());
        assert!(!closed);
        assert_eq!(got.len(), expected.len());
        assert!(got == expected, "bytes arrived out of order");
        assert_eq!(harness.core.handler.queued(), 0);
        assert_eq!(harness.core.pool.in_flight(), 0);
    }

    #[test]
    fn hard_write_error_keeps_output_queued() {
        let (mut harness, remote) = Harness::new();
        remote.shutdown(std::net::Shutdown::Read).unwrap();

        harness.enqueue(b"nobody listens");
        harness.turn();

        assert_eq!(harness.core.handler.state(), HandlerState::Open);
        assert_eq!(harness.core.handler.queued(), 1);
        assert_eq!(harness.core.pool.in_flight(), 1);

        harness
            .core
            .handler
            .close(&mut harness.reactor, &mut harness.core.pool);
        assert_eq!(harness.core.pool.in_flight(), 0);
    }

    #[test]
    fn shutdown_with_empty_queue_closes_immediately() {
        let (mut harness, mut remote) = Harness::new();
        harness
            .core
            .handler
            .shutdown(&mut harness.reactor, &mut harness.core.pool);
        assert!(harness.core.handler.is_closed());
        assert!(!harness.core.inbox.is_closed());

        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn shutdown_drains_queue_before_closing() {
        let (mut harness, mut remote) = Harness::new();
        let chunks = patterned(80);
        for chunk in &chunks {
            harness.enqueue(chunk);
        }
        harness
            .core
            .handler
            .shutdown(&mut harness.reactor, &mut harness.core.pool);
        assert_eq!(harness.core.handler.state(), HandlerState::Closing);
        assert_eq!(harness.interest(), Some(Events::WRITABLE));

        let expected = chunks.concat();
        let (got, closed) = drain(&mut harness, &mut remote, usize::MAX);
        assert!(closed, "peer should see end of stream after the drain");
        assert!(got == expected, "queued output must be delivered in full");
        assert!(harness.core.handler.is_closed());
        assert!(harness.core.inbox.take_packets().is_empty());
        assert!(!harness.core.inbox.is_closed());
        assert_eq!(harness.core.pool.in_flight(), 0);
    }

    #[test]
    fn enqueue_after_close_releases_packet() {
        let (mut harness, _remote) = Harness::new();
        harness
            .core
            .handler
            .close(&mut harness.reactor, &mut harness.core.pool);
        harness.enqueue(b"late");
        assert_eq!(harness.core.handler.queued(), 0);
        assert_eq!(harness.core.pool.in_flight(), 0);
    }
}
