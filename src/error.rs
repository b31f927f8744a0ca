use std::time::Duration;

/// faults that end (or are isolated to) a single peer session. none of these abort the swarm.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// the peer sent a frame that cannot be skipped over safely.
    #[error("malformed frame: {0}")]
    ProtocolFraming(String),

    /// wrong protocol string or info hash in the peer handshake, never retried.
    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("peer closed the connection")]
    PeerClosed,
}

impl PeerError {
    /// whether the swarm may try the same address again later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::HandshakeMismatch(_) | Self::ProtocolFraming(_))
    }
}
