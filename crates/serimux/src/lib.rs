//! Multiplex local Unix-socket clients over one framed serial link.
//!
//! # Crate Structure
//!
//! - [`transport`]: Opening the serial transport and the client listening socket
//! - [`frame`]: Hex-header framing and the control-channel protocol
//! - [`engine`]: The single-threaded reactor and multiplexer

/// Re-export transport types.
pub mod transport {
    pub use serimux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use serimux_frame::*;
}

/// Re-export engine types.
pub mod engine {
    pub use serimux_engine::*;
}
