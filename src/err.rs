/// Error taxonomy for the socket API surface (spec S7).
///
/// Fatal per-connection errors latch onto the socket as a "last error" and
/// are replayed to subsequent blocking calls; see `Tcb::last_error`.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("tun device error: {0}")]
    TunError(String),

    #[error("port {0} has been unexpectedly closed")]
    PortClosed(u16),

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("operation requires an established association")]
    NotConnected,

    #[error("write after shutdown or close")]
    BrokenPipe,

    #[error("write after shutdown or close (signal suppressed)")]
    SilentBrokenPipe,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("underlying network link is down")]
    NoNetworkConnection,

    #[error("operation would block")]
    WouldBlock,

    #[error("operation interrupted")]
    Interrupted,

    #[error("operation timed out")]
    Timeout,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("insufficient resources")]
    InsufficientResources,

    #[error("destination unreachable")]
    DestinationUnreachable,
}

/// Picks the right error for an expired wait (spec S7): a zero-duration wait
/// is a non-blocking poll that found nothing ready, while any other expired
/// deadline is a genuine timeout.
pub(crate) fn timeout_error(non_blocking: bool) -> Error {
    if non_blocking {
        Error::WouldBlock
    } else {
        Error::Timeout
    }
}

impl From<tidy_tuntap::error::Error> for Error {
    fn from(e: tidy_tuntap::error::Error) -> Self {
        Error::TunError(e.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        use std::io::ErrorKind;

        let kind = match e {
            Error::NotConnected => ErrorKind::NotConnected,
            Error::BrokenPipe | Error::SilentBrokenPipe => ErrorKind::BrokenPipe,
            Error::ConnectionReset => ErrorKind::ConnectionReset,
            Error::ConnectionClosed => ErrorKind::UnexpectedEof,
            Error::WouldBlock => ErrorKind::WouldBlock,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::Timeout => ErrorKind::TimedOut,
            Error::InvalidParameter(_) => ErrorKind::InvalidInput,
            Error::NotSupported(_) => ErrorKind::Unsupported,
            _ => ErrorKind::Other,
        };

        std::io::Error::new(kind, e.to_string())
    }
}
