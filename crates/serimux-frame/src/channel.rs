//! Channel numbering on the serial link.
//!
//! Channel 0 carries connection-management text. Every other channel is
//! owned by at most one local client at a time.

/// Connection management (connect, disconnect, ok/ko replies).
pub const CONTROL: u8 = 0;

/// Lowest channel number handed to a client.
pub const FIRST_CLIENT_CHANNEL: u8 = 1;

/// Highest channel number representable in the two-digit header field.
pub const MAX_CHANNEL: u8 = 0xff;

/// Returns true if the channel is the control channel.
pub fn is_control(id: u8) -> bool {
    id == CONTROL
}
