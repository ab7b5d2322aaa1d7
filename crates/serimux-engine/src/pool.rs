//! Fixed-capacity packet buffers recycled through a free list.

/// Payload capacity of one packet; also the largest single socket read.
pub const PACKET_CAPACITY: usize = 4000;

/// An owned byte buffer with a length and an optional channel tag.
///
/// Packets are not `Clone`: returning one to the pool moves it, so a
/// released packet can never be touched again.
pub struct Packet {
    data: Box<[u8; PACKET_CAPACITY]>,
    len: usize,
    channel: Option<u8>,
}

impl Packet {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; PACKET_CAPACITY]),
            len: 0,
            channel: None,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == PACKET_CAPACITY
    }

    pub fn channel(&self) -> Option<u8> {
        self.channel
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.channel = Some(channel);
    }

    /// Append as much of `bytes` as fits; returns how many bytes were copied.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(PACKET_CAPACITY - self.len);
        self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    /// The whole buffer, for reading into. Follow with [`Packet::set_len`].
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len.min(PACKET_CAPACITY);
    }

    fn reset(&mut self) {
        self.len = 0;
        self.channel = None;
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Free list of packets. Grows on shortage, never shrinks.
#[derive(Debug, Default)]
pub struct PacketPool {
    free: Vec<Packet>,
    allocated: usize,
}

impl PacketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared packet, allocating a new one if the free list is empty.
    pub fn acquire(&mut self) -> Packet {
        match self.free.pop() {
            Some(packet) => packet,
            None => {
                self.allocated += 1;
                Packet::new()
            }
        }
    }

    /// Return a packet to the free list.
    pub fn release(&mut self, mut packet: Packet) {
        packet.reset();
        self.free.push(packet);
    }

    /// Packets ever allocated by this pool.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Packets currently sitting on the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Packets currently owned by someone other than the pool.
    pub fn in_flight(&self) -> usize {
        self.allocated - self.free.len()
    }
}
