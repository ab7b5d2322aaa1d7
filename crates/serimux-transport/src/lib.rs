//! OS endpoints for serimux.
//!
//! Two kinds of descriptor enter the multiplexer:
//! - the physical transport (a serial device, or a Unix socket standing in for one)
//! - the local listening socket that clients connect to
//!
//! This is the lowest layer. It owns descriptor setup only; readiness and
//! buffering live in `serimux-engine`.

pub mod error;
pub mod fd;
pub mod serial;
pub mod uds;

pub use error::{Result, TransportError};
pub use fd::set_nonblocking;
pub use serial::open_transport;
pub use uds::UnixDomainSocket;
