use thiserror::Error;

/// Errors that can occur in mesh discovery and session operations.
///
/// None of these are fatal to the process: discovery failures degrade
/// connectivity, session failures are reported to the caller and the
/// affected peer falls back to `Disconnected`.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Advertising or browsing resources could not be acquired
    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    /// Send attempted on a peer that has no Connected session
    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    /// Requested peer is not in the peer table or has no known address
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Best-effort send could not be queued for delivery
    #[error("transmission failed: {0}")]
    TransmissionFailed(String),

    /// Invite/accept did not converge within the handshake window
    #[error("handshake timed out: {0}")]
    HandshakeTimeout(String),

    /// Remote side declined the invite
    #[error("invite rejected: {0}")]
    HandshakeRejected(String),

    /// Wire protocol violation or unexpected frame
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Failed to serialize or deserialize a beacon or frame
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Frame length prefix exceeds the allowed maximum
    #[error("frame too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Internal channel was closed
    #[error("channel closed")]
    ChannelClosed,

    /// I/O operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for MeshError {
    fn from(e: bincode::Error) -> Self {
        MeshError::SerializationError(e.to_string())
    }
}

/// Convenience Result type for mesh operations
pub type Result<T> = std::result::Result<T, MeshError>;
