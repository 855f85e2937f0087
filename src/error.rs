use thiserror::Error;

/// Errors surfaced to the application through the socket API.
///
/// Malformed inbound segments are never propagated to the caller - the network is the
///  fault domain, not the application - so [CapError::MalformedSegment] only shows up
///  as the codec's diagnostic. Transport-level send failures are treated as transient
///  (the segment stays buffered and retransmission retries); [CapError::Transport] is
///  surfaced only for failures of local operations like `bind`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapError {
    #[error("address in use")]
    AddressInUse,

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("peer unreachable - retry bound exhausted")]
    PeerUnreachable,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation would block")]
    WouldBlock,

    #[error("malformed segment: {0}")]
    MalformedSegment(&'static str),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for CapError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            CapError::AddressInUse
        }
        else {
            CapError::Transport(e.to_string())
        }
    }
}
