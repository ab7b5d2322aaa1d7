//! Control-channel text protocol.
//!
//! | Direction       | Message                      |
//! |-----------------|------------------------------|
//! | local → remote  | `connect:<name>:<hex2>`      |
//! | remote → local  | `ok:connect:<hex2>`          |
//! | remote → local  | `ko:connect:<hex2>:<reason>` |
//! | either          | `disconnect:<hex2>`          |
//! | remote → local  | `X00...` (version probe)     |

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{channel_hex, parse_hex};

const CONNECT: &[u8] = b"connect:";
const OK_CONNECT: &[u8] = b"ok:connect:";
const KO_CONNECT: &[u8] = b"ko:connect:";
const DISCONNECT: &[u8] = b"disconnect:";
const VERSION_PROBE: &[u8] = b"X00";

/// One message carried on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Ask the remote side to open `channel` for service `name`.
    Connect { name: Bytes, channel: u8 },
    /// The remote side accepted the registration of `channel`.
    Connected { channel: u8 },
    /// The remote side refused the registration of `channel`.
    Refused { channel: u8, reason: Bytes },
    /// `channel` is being torn down.
    Disconnect { channel: u8 },
    /// Emulator probe used to detect the daemon version.
    VersionProbe,
    /// Anything else.
    Unknown(Bytes),
}

impl ControlMessage {
    /// Classify a control-channel payload. Never fails: unrecognized text maps
    /// to [`ControlMessage::Unknown`].
    pub fn parse(payload: &[u8]) -> Self {
        if let Some(rest) = payload.strip_prefix(OK_CONNECT) {
            if let Some(channel) = exact_channel(rest) {
                return Self::Connected { channel };
            }
        } else if let Some(rest) = payload.strip_prefix(KO_CONNECT) {
            if rest.len() >= 2 && (rest.len() == 2 || rest[2] == b':') {
                if let Some(channel) = exact_channel(&rest[..2]) {
                    let reason = rest.get(3..).unwrap_or_default();
                    return Self::Refused {
                        channel,
                        reason: Bytes::copy_from_slice(reason),
                    };
                }
            }
        } else if let Some(rest) = payload.strip_prefix(DISCONNECT) {
            if let Some(channel) = exact_channel(rest) {
                return Self::Disconnect { channel };
            }
        } else if payload.starts_with(VERSION_PROBE) {
            return Self::VersionProbe;
        } else if let Some(rest) = payload.strip_prefix(CONNECT) {
            if let Some(split) = rest.iter().rposition(|&b| b == b':') {
                if let Some(channel) = exact_channel(&rest[split + 1..]) {
                    return Self::Connect {
                        name: Bytes::copy_from_slice(&rest[..split]),
                        channel,
                    };
                }
            }
        }
        Self::Unknown(Bytes::copy_from_slice(payload))
    }

    /// Render the message as control-channel text.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            Self::Connect { name, channel } => {
                out.put_slice(CONNECT);
                out.put_slice(name);
                out.put_u8(b':');
                out.put_slice(&channel_hex(*channel));
            }
            Self::Connected { channel } => {
                out.put_slice(OK_CONNECT);
                out.put_slice(&channel_hex(*channel));
            }
            Self::Refused { channel, reason } => {
                out.put_slice(KO_CONNECT);
                out.put_slice(&channel_hex(*channel));
                out.put_u8(b':');
                out.put_slice(reason);
            }
            Self::Disconnect { channel } => {
                out.put_slice(DISCONNECT);
                out.put_slice(&channel_hex(*channel));
            }
            Self::VersionProbe => out.put_slice(VERSION_PROBE),
            Self::Unknown(text) => out.put_slice(text),
        }
        out.freeze()
    }

    /// Encoded length without allocating.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Connect { name, .. } => CONNECT.len() + name.len() + 3,
            Self::Connected { .. } => OK_CONNECT.len() + 2,
            Self::Refused { reason, .. } => KO_CONNECT.len() + 3 + reason.len(),
            Self::Disconnect { .. } => DISCONNECT.len() + 2,
            Self::VersionProbe => VERSION_PROBE.len(),
            Self::Unknown(text) => text.len(),
        }
    }
}

fn exact_channel(digits: &[u8]) -> Option<u8> {
    if digits.len() != 2 {
        return None;
    }
    parse_hex(digits).map(|v| v as u8)
}
