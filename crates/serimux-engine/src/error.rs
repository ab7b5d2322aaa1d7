use serimux_transport::TransportError;

/// Errors that stop the multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Opening or binding one of the endpoints failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Creating the readiness reactor failed.
    #[error("failed to create reactor: {0}")]
    Reactor(#[source] std::io::Error),

    /// A descriptor could not be added to the reactor.
    #[error("failed to register descriptor: {0}")]
    Register(#[source] std::io::Error),

    /// Waiting for readiness failed.
    #[error("reactor wait failed: {0}")]
    Wait(#[source] std::io::Error),

    /// The serial transport hung up or reported an error.
    #[error("serial transport closed")]
    TransportClosed,

    /// The client listening socket hung up or reported an error.
    #[error("client listener closed")]
    ListenerClosed,
}

/// Result type alias for multiplexer operations.
pub type Result<T> = std::result::Result<T, MuxError>;
