use std::collections::HashMap;
use std::time::Instant;

use crate::peers::{BlockOffset, PeerAddr, PieceIndex};
use crate::prelude::*;
use crate::torrent::{Bitfield, Bitslice};

use super::{BlockId, BlockState, PieceHash, PieceLayout, PieceState};

/// what became of a block handed to [`PiecePicker::block_received`].
#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    Stored,
    /// the last block of the piece arrived, the piece is now `Verifying` and its bytes must be
    /// checked against `hash` before calling [`PiecePicker::finish_verification`].
    PieceReady {
        index: PieceIndex,
        piece: Vec<u8>,
        hash: PieceHash,
    },
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub complete: usize,
    pub in_progress: usize,
    pub total: usize,
}

/// global piece and block ownership. this is plain data with no locking of its own, callers
/// share it through [`super::PiecePickerHandle`].
#[derive(Debug)]
pub struct PiecePicker {
    layout: PieceLayout,
    hashes: Vec<PieceHash>,
    pieces: Vec<PieceState>,
    availability: Vec<u32>,
    peers: HashMap<PeerAddr, Bitfield>,
    n_complete: usize,
}

impl PiecePicker {
    pub fn new(layout: PieceLayout, hashes: Vec<PieceHash>) -> anyhow::Result<Self> {
        let n_pieces = layout.piece_count();
        if hashes.len() != n_pieces {
            anyhow::bail!(
                "{} piece hashes supplied for a layout of {} pieces",
                hashes.len(),
                n_pieces
            );
        }

        Ok(Self {
            layout,
            hashes,
            pieces: vec![PieceState::Missing; n_pieces],
            availability: vec![0; n_pieces],
            peers: HashMap::new(),
            n_complete: 0,
        })
    }

    pub fn layout(&self) -> PieceLayout {
        self.layout
    }

    pub fn piece_state(&self, index: PieceIndex) -> Option<&PieceState> {
        self.pieces.get(index)
    }

    /// replace everything known about the pieces `peer` holds.
    pub fn peer_has_pieces(&mut self, peer: PeerAddr, bitfield: &Bitslice) {
        let mut pieces = Bitfield::repeat(false, self.pieces.len());
        let n_common = pieces.len().min(bitfield.len());
        pieces[..n_common].copy_from_bitslice(&bitfield[..n_common]);

        pieces
            .iter_ones()
            .for_each(|index| self.availability[index] += 1);

        if let Some(previous) = self.peers.insert(peer, pieces) {
            previous
                .iter_ones()
                .for_each(|index| self.availability[index] -= 1);
        }
    }

    pub fn peer_has_piece(&mut self, peer: PeerAddr, index: PieceIndex) {
        let n_pieces = self.pieces.len();
        if index >= n_pieces {
            warn!(%peer, index, "peer announced a piece index out of range");
            return;
        }

        let pieces = self
            .peers
            .entry(peer)
            .or_insert_with(|| Bitfield::repeat(false, n_pieces));
        if !pieces[index] {
            pieces.set(index, true);
            self.availability[index] += 1;
        }
    }

    /// whether `peer` holds at least one piece we still need.
    pub fn wants_from(&self, peer: PeerAddr) -> bool {
        self.peers.get(&peer).is_some_and(|pieces| {
            pieces
                .iter_ones()
                .any(|index| self.pieces[index].is_wanted())
        })
    }

    /// pick up to `max` missing blocks from pieces `peer` has and mark them requested by it.
    /// blocks of already started pieces go first so few pieces are open at once, then untouched
    /// pieces rarest first. ties go to the lowest piece index.
    pub fn assign_blocks(&mut self, peer: PeerAddr, max: usize, now: Instant) -> Vec<BlockId> {
        let mut assigned = Vec::new();
        let Some(has) = self.peers.get(&peer) else {
            return assigned;
        };
        if max == 0 {
            return assigned;
        }

        let started = has
            .iter_ones()
            .filter(|&index| matches!(self.pieces[index], PieceState::InProgress(_)));
        let mut fresh: Vec<PieceIndex> = has
            .iter_ones()
            .filter(|&index| self.pieces[index] == PieceState::Missing)
            .collect();
        fresh.sort_by_key(|&index| (self.availability[index], index));
        let candidates: Vec<PieceIndex> = started.chain(fresh).collect();

        let layout = self.layout;
        for index in candidates {
            if assigned.len() == max {
                break;
            }

            let state = &mut self.pieces[index];
            if *state == PieceState::Missing {
                trace!(index, "starting piece");
                *state = PieceState::InProgress(vec![
                    BlockState::Missing;
                    layout.block_count(index)
                ]);
            }

            let PieceState::InProgress(blocks) = state else {
                continue;
            };
            for (block_index, block) in blocks.iter_mut().enumerate() {
                if *block != BlockState::Missing {
                    continue;
                }
                *block = BlockState::Requested { peer, at: now };
                assigned.push(BlockId {
                    piece: index,
                    offset: layout.block_offset(block_index),
                });
                if assigned.len() == max {
                    break;
                }
            }
        }

        assigned
    }

    /// accept a block only if it is currently requested from `peer` and has the right length.
    /// anything else (duplicates, unsolicited or late blocks) is a logged no-op.
    pub fn block_received(
        &mut self,
        peer: PeerAddr,
        index: PieceIndex,
        offset: BlockOffset,
        payload: Vec<u8>,
    ) -> BlockOutcome {
        let Some(block_index) = self.layout.block_index(index, offset) else {
            warn!(%peer, index, offset, "block outside of the torrent layout ignored");
            return BlockOutcome::Ignored;
        };
        let expected_length = self.layout.block_length(BlockId {
            piece: index,
            offset,
        });

        let PieceState::InProgress(blocks) = &mut self.pieces[index] else {
            debug!(%peer, index, offset, "block for a piece not in progress ignored");
            return BlockOutcome::Ignored;
        };

        let block = &mut blocks[block_index];
        match &*block {
            BlockState::Requested { peer: owner, .. } if *owner == peer => {}
            _ => {
                debug!(%peer, index, offset, "unsolicited or duplicate block ignored");
                return BlockOutcome::Ignored;
            }
        }

        if payload.len() != expected_length as usize {
            warn!(
                %peer,
                index,
                offset,
                expected_length,
                received = payload.len(),
                "block with wrong length dropped, re-queueing"
            );
            *block = BlockState::Missing;
            self.reset_if_untouched(index);
            return BlockOutcome::Ignored;
        }

        *block = BlockState::Received(payload);
        if !blocks
            .iter()
            .all(|block| matches!(block, BlockState::Received(_)))
        {
            return BlockOutcome::Stored;
        }

        let mut piece = Vec::with_capacity(self.layout.piece_length(index) as usize);
        let PieceState::InProgress(blocks) =
            std::mem::replace(&mut self.pieces[index], PieceState::Verifying)
        else {
            unreachable!("piece state was matched as in progress above");
        };
        for block in blocks {
            if let BlockState::Received(bytes) = block {
                piece.extend(bytes);
            }
        }

        debug!(index, "all blocks received, verifying piece");
        BlockOutcome::PieceReady {
            index,
            piece,
            hash: self.hashes[index],
        }
    }

    /// settle a piece that is `Verifying`. returns true only on the single transition to
    /// `Complete`.
    pub fn finish_verification(&mut self, index: PieceIndex, hash_matches: bool) -> bool {
        let Some(state) = self.pieces.get_mut(index) else {
            return false;
        };
        if *state != PieceState::Verifying {
            warn!(index, "verification finished for a piece that was not verifying");
            return false;
        }

        if hash_matches {
            *state = PieceState::Complete;
            self.n_complete += 1;
            true
        } else {
            warn!(index, "piece failed hash verification, discarding its blocks");
            *state = PieceState::Missing;
            false
        }
    }

    /// return the given blocks to `Missing` if `peer` is still the one holding them.
    pub fn release_blocks(
        &mut self,
        peer: PeerAddr,
        released: impl IntoIterator<Item = BlockId>,
    ) -> usize {
        let mut n_released = 0;
        for BlockId { piece, offset } in released {
            let Some(block_index) = self.layout.block_index(piece, offset) else {
                continue;
            };
            let PieceState::InProgress(blocks) = &mut self.pieces[piece] else {
                continue;
            };

            let block = &mut blocks[block_index];
            if matches!(block, BlockState::Requested { peer: owner, .. } if *owner == peer) {
                *block = BlockState::Missing;
                n_released += 1;
                self.reset_if_untouched(piece);
            }
        }
        n_released
    }

    pub fn request_timed_out(&mut self, peer: PeerAddr, block: BlockId) -> bool {
        self.release_blocks(peer, [block]) == 1
    }

    /// forget `peer`: its requested blocks go back to `Missing` and its pieces no longer count
    /// towards availability.
    pub fn peer_disconnected(&mut self, peer: PeerAddr) -> usize {
        let held = self.requested_by(peer);
        let n_released = self.release_blocks(peer, held);

        if let Some(pieces) = self.peers.remove(&peer) {
            pieces
                .iter_ones()
                .for_each(|index| self.availability[index] -= 1);
        }
        n_released
    }

    pub fn requested_by(&self, peer: PeerAddr) -> Vec<BlockId> {
        let layout = self.layout;
        self.pieces
            .iter()
            .enumerate()
            .filter_map(|(index, state)| match state {
                PieceState::InProgress(blocks) => Some((index, blocks)),
                _ => None,
            })
            .flat_map(|(index, blocks)| {
                blocks
                    .iter()
                    .enumerate()
                    .filter_map(move |(block_index, block)| match block {
                        BlockState::Requested { peer: owner, .. } if *owner == peer => {
                            Some(BlockId {
                                piece: index,
                                offset: layout.block_offset(block_index),
                            })
                        }
                        _ => None,
                    })
            })
            .collect()
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.pieces.get(index) == Some(&PieceState::Complete)
    }

    pub fn is_complete(&self) -> bool {
        self.n_complete == self.pieces.len()
    }

    /// the pieces we hold, as sent in our own bitfield message.
    pub fn bitfield(&self) -> Bitfield {
        self.pieces
            .iter()
            .map(|state| *state == PieceState::Complete)
            .collect()
    }

    pub fn progress(&self) -> Progress {
        Progress {
            complete: self.n_complete,
            in_progress: self
                .pieces
                .iter()
                .filter(|state| matches!(state, PieceState::InProgress(_) | PieceState::Verifying))
                .count(),
            total: self.pieces.len(),
        }
    }

    fn reset_if_untouched(&mut self, index: PieceIndex) {
        if self.pieces[index].is_untouched() {
            trace!(index, "no blocks left in flight, piece back to missing");
            self.pieces[index] = PieceState::Missing;
        }
    }
}
