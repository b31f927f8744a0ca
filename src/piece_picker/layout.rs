use std::cmp::min;

use super::BlockId;
use crate::peers::{BlockLength, BlockOffset, PieceIndex, PieceLength};

/// per torrent size constants, everything about piece and block boundaries derives from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    piece_length: PieceLength,
    total_length: u64,
    block_length: BlockLength,
}

impl PieceLayout {
    pub const BLOCK_LENGTH: BlockLength = 1 << 14;

    pub fn new(piece_length: PieceLength, total_length: u64) -> Self {
        Self::with_block_length(piece_length, total_length, Self::BLOCK_LENGTH)
    }

    pub fn with_block_length(
        piece_length: PieceLength,
        total_length: u64,
        block_length: BlockLength,
    ) -> Self {
        assert!(piece_length > 0, "piece length must be non zero");
        assert!(block_length > 0, "block length must be non zero");
        Self {
            piece_length,
            total_length,
            block_length,
        }
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> usize {
        self.total_length.div_ceil(self.piece_length as u64) as usize
    }

    pub fn last_piece_length(&self) -> PieceLength {
        match (self.total_length % self.piece_length as u64) as PieceLength {
            0 => self.piece_length,
            remainder => remainder,
        }
    }

    /// exact length of piece `index`, only the final piece may be shorter.
    pub fn piece_length(&self, index: PieceIndex) -> PieceLength {
        if index + 1 == self.piece_count() {
            self.last_piece_length()
        } else {
            self.piece_length
        }
    }

    /// byte offset of the start of piece `index` in the whole torrent.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_length as u64
    }

    pub fn block_count(&self, index: PieceIndex) -> usize {
        self.piece_length(index).div_ceil(self.block_length) as usize
    }

    pub fn block_length(&self, block: BlockId) -> BlockLength {
        min(
            self.block_length,
            self.piece_length(block.piece).saturating_sub(block.offset),
        )
    }

    pub fn block_offset(&self, block_index: usize) -> BlockOffset {
        block_index as BlockOffset * self.block_length
    }

    /// position of the block starting at `offset` inside its piece, None for offsets that are not
    /// on a block boundary of that piece.
    pub fn block_index(&self, index: PieceIndex, offset: BlockOffset) -> Option<usize> {
        let aligned = offset % self.block_length == 0;
        (index < self.piece_count() && aligned && offset < self.piece_length(index))
            .then_some((offset / self.block_length) as usize)
    }

    pub fn blocks(&self, index: PieceIndex) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.block_count(index)).map(move |block_index| BlockId {
            piece: index,
            offset: self.block_offset(block_index),
        })
    }
}
