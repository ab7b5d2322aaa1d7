use serimux_frame::{FIRST_CLIENT_CHANNEL, MAX_CHANNEL};

use crate::reactor::Token;

/// Channel numbers handed to clients, 1 through 255.
///
/// Allocation continues round-robin after the last channel handed out and
/// skips numbers still in use. Channel 0 is never allocated.
#[derive(Debug)]
pub struct ChannelTable {
    last: u8,
    owners: [Option<Token>; 256],
    in_use: usize,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self {
            last: 0,
            owners: [None; 256],
            in_use: 0,
        }
    }
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next free channel for `owner`, or `None` if all are taken.
    pub fn allocate(&mut self, owner: Token) -> Option<u8> {
        let mut candidate = self.last;
        for _ in FIRST_CLIENT_CHANNEL..=MAX_CHANNEL {
            candidate = if candidate == MAX_CHANNEL {
                FIRST_CLIENT_CHANNEL
            } else {
                candidate + 1
            };
            let slot = &mut self.owners[usize::from(candidate)];
            if slot.is_none() {
                *slot = Some(owner);
                self.last = candidate;
                self.in_use += 1;
                return Some(candidate);
            }
        }
        None
    }

    pub fn release(&mut self, channel: u8) {
        if self.owners[usize::from(channel)].take().is_some() {
            self.in_use -= 1;
        }
    }

    pub fn owner(&self, channel: u8) -> Option<Token> {
        self.owners[usize::from(channel)]
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one_and_advances() {
        let mut table = ChannelTable::new();
        assert_eq!(table.allocate(Token(10)), Some(1));
        assert_eq!(table.allocate(Token(11)), Some(2));
        table.release(1);
        // Round-robin: a released channel is not reused right away.
        assert_eq!(table.allocate(Token(12)), Some(3));
        assert_eq!(table.owner(2), Some(Token(11)));
        assert_eq!(table.owner(1), None);
    }

    #[test]
    fn wraps_around_and_never_yields_zero() {
        let mut table = ChannelTable::new();
        for expected in 1..=255u8 {
            assert_eq!(table.allocate(Token(usize::from(expected))), Some(expected));
        }
        assert_eq!(table.in_use(), 255);
        assert_eq!(table.allocate(Token(999)), None);

        table.release(7);
        assert_eq!(table.allocate(Token(999)), Some(7));
        assert_eq!(table.allocate(Token(1000)), None);
    }

    #[test]
    fn allocated_channels_are_unique() {
        let mut table = ChannelTable::new();
        let mut seen = std::collections::HashSet::new();
        for round in 0..1000usize {
            let channel = table.allocate(Token(round)).unwrap();
            assert_ne!(channel, 0);
            assert!(seen.insert(channel), "channel {channel} handed out twice");
            if round % 3 == 0 {
                table.release(channel);
                seen.remove(&channel);
            }
            if seen.len() == 200 {
                for channel in seen.drain() {
                    table.release(channel);
                }
            }
        }
    }

    #[test]
    fn releasing_free_channel_is_harmless() {
        let mut table = ChannelTable::new();
        table.release(5);
        assert_eq!(table.in_use(), 0);
    }
}
