use std::time::Instant;

use crate::peers::PeerAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    Missing,
    Requested { peer: PeerAddr, at: Instant },
    Received(Vec<u8>),
}

/// lifecycle of one piece:
/// Missing -> InProgress -> Verifying -> Complete, or back to Missing on a hash mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    InProgress(Vec<BlockState>),
    Verifying,
    Complete,
}

impl PieceState {
    pub fn is_wanted(&self) -> bool {
        matches!(self, Self::Missing | Self::InProgress(_))
    }

    /// an in progress piece that nobody is working on anymore, it can drop back to Missing.
    pub(super) fn is_untouched(&self) -> bool {
        match self {
            Self::InProgress(blocks) => blocks.iter().all(|block| *block == BlockState::Missing),
            _ => false,
        }
    }
}
