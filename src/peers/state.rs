use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::PeerError;
use crate::piece_picker::BlockId;
use crate::torrent::Bitfield;

/// where a peer connection is in its life. the connector covers everything up to
/// `HandshakeVerified`, the session takes it from there.
#[derive(Debug)]
pub enum SessionState {
    Connecting,
    HandshakeSent,
    HandshakeVerified,
    Active,
    Closed(CloseReason),
}

#[derive(Debug)]
pub enum CloseReason {
    /// the swarm asked the session to stop.
    Shutdown,
    Failed(PeerError),
}

impl CloseReason {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Shutdown => false,
            Self::Failed(err) => err.is_retryable(),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shutdown => f.write_str("shutdown"),
            Self::Failed(err) => write!(f, "{}", err),
        }
    }
}

/// everything one session knows about its remote peer. owned by that session alone.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub bitfield: Bitfield,
    /// the peer refuses our requests.
    pub peer_choking: bool,
    /// we refuse the peer's requests.
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_interested: bool,
    /// requests in flight to the peer and when they were sent.
    pub outstanding: BTreeMap<BlockId, Instant>,
}

impl PeerState {
    pub fn new(n_pieces: usize) -> Self {
        Self {
            bitfield: Bitfield::repeat(false, n_pieces),
            peer_choking: true,
            am_choking: true,
            am_interested: false,
            peer_interested: false,
            outstanding: BTreeMap::new(),
        }
    }

    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.am_interested
    }

    /// drop every request older than `timeout` and hand them back.
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<BlockId> {
        let expired: Vec<BlockId> = self
            .outstanding
            .iter()
            .filter(|(_, sent_at)| now.saturating_duration_since(**sent_at) >= timeout)
            .map(|(block, _)| *block)
            .collect();
        expired.iter().for_each(|block| {
            self.outstanding.remove(block);
        });
        expired
    }

    pub fn take_outstanding(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.outstanding).into_keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_take_expired() {
        let mut state = PeerState::new(4);
        let start = Instant::now();
        let old = BlockId { piece: 0, offset: 0 };
        let fresh = BlockId {
            piece: 0,
            offset: 16384,
        };
        state.outstanding.insert(old, start);
        state
            .outstanding
            .insert(fresh, start + Duration::from_secs(5));

        let expired = state.take_expired(start + Duration::from_secs(6), Duration::from_secs(3));
        assert_eq!(expired, vec![old]);
        assert_eq!(state.take_outstanding(), vec![fresh]);
        assert!(state.outstanding.is_empty());
    }

    #[rstest]
    fn test_fresh_peer_is_choked_both_ways() {
        let state = PeerState::new(10);
        assert!(state.peer_choking && state.am_choking);
        assert!(!state.can_request());
        assert_eq!(state.bitfield.len(), 10);
    }
}
