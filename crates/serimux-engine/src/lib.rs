//! Single-threaded engine that multiplexes local Unix-socket clients over
//! one framed serial link.
//!
//! Everything runs on one [`Reactor`]: the serial transport, the client
//! listener and every client socket are non-blocking descriptors driven by
//! level-triggered readiness. Bytes move in pooled, fixed-capacity
//! [`Packet`]s.

pub mod channels;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod multiplexer;
pub mod pool;
pub mod reactor;
pub mod serial;

pub use channels::ChannelTable;
pub use client::{Client, Registration, REPLY_KO, REPLY_OK};
pub use config::{ListenEndpoint, MuxConfig, DEFAULT_SOCKET, DEFAULT_TRANSPORT};
pub use error::{MuxError, Result};
pub use handler::{AsyncHandler, HandlerState, Inbox, Receiver};
pub use multiplexer::Multiplexer;
pub use pool::{Packet, PacketPool, PACKET_CAPACITY};
pub use reactor::{Dispatch, Events, Reactor, Token};
pub use serial::{quote, SerialFramer};
