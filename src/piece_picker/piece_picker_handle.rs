use super::{BlockId, BlockOutcome, PieceDone, PieceLayout, PiecePicker, Progress};
use crate::peers::{BlockOffset, PeerAddr, PieceIndex};
use crate::prelude::*;
use crate::torrent::{Bitfield, Bitslice};
use sha1_smol::Sha1;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};

/// cloneable handle every session uses to reach the one shared [`PiecePicker`]. all mutation is
/// serialized behind a mutex held only for the bookkeeping, hashing happens outside of it while
/// the piece sits in `Verifying`.
#[derive(Debug, Clone)]
pub struct PiecePickerHandle {
    picker: Arc<Mutex<PiecePicker>>,
    layout: PieceLayout,
    piece_tx: mpsc::UnboundedSender<PieceDone>,
    have_tx: broadcast::Sender<PieceIndex>,
    complete_tx: Arc<watch::Sender<bool>>,
    /// bumped whenever blocks go back to `Missing`, so idle sessions ask for work again.
    released_tx: Arc<watch::Sender<u64>>,
}

impl PiecePickerHandle {
    const HAVE_BUFFER_SIZE: usize = 64;

    pub fn new(picker: PiecePicker, piece_tx: mpsc::UnboundedSender<PieceDone>) -> Self {
        let layout = picker.layout();
        let (have_tx, _) = broadcast::channel(Self::HAVE_BUFFER_SIZE);
        let (complete_tx, _) = watch::channel(picker.is_complete());
        let (released_tx, _) = watch::channel(0);

        Self {
            picker: Arc::new(Mutex::new(picker)),
            layout,
            piece_tx,
            have_tx,
            complete_tx: Arc::new(complete_tx),
            released_tx: Arc::new(released_tx),
        }
    }

    // a panic while holding the lock can only come from a bug in the picker itself, the data is
    // still the best state we have.
    fn lock(&self) -> MutexGuard<'_, PiecePicker> {
        self.picker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn layout(&self) -> PieceLayout {
        self.layout
    }

    pub fn peer_has_pieces(&self, peer: PeerAddr, bitfield: &Bitslice) {
        self.lock().peer_has_pieces(peer, bitfield)
    }

    pub fn peer_has_piece(&self, peer: PeerAddr, index: PieceIndex) {
        self.lock().peer_has_piece(peer, index)
    }

    pub fn wants_from(&self, peer: PeerAddr) -> bool {
        self.lock().wants_from(peer)
    }

    pub fn assign_blocks(&self, peer: PeerAddr, max: usize) -> Vec<BlockId> {
        self.lock().assign_blocks(peer, max, Instant::now())
    }

    #[instrument(level = "trace", skip(self, payload), fields(len = payload.len()))]
    pub fn block_received(
        &self,
        peer: PeerAddr,
        index: PieceIndex,
        offset: BlockOffset,
        payload: Vec<u8>,
    ) {
        let outcome = self.lock().block_received(peer, index, offset, payload);
        let BlockOutcome::PieceReady { index, piece, hash } = outcome else {
            return;
        };

        let hash_matches = Sha1::from(&piece).digest().bytes() == hash;
        let (completed, swarm_complete) = {
            let mut picker = self.lock();
            let completed = picker.finish_verification(index, hash_matches);
            // queued while still locked, no session may read the piece back before storage
            // has its write.
            if completed && self.piece_tx.send(PieceDone { index, piece }).is_err() {
                error!(index, "storage is gone, verified piece dropped");
            }
            (completed, picker.is_complete())
        };

        if !completed {
            if !hash_matches {
                self.notify_released();
            }
            return;
        }

        info!(index, "piece verified");
        // no subscribed sessions is fine.
        let _ = self.have_tx.send(index);
        if swarm_complete {
            info!("all pieces verified");
            self.complete_tx.send_replace(true);
        }
    }

    pub fn peer_disconnected(&self, peer: PeerAddr) {
        let n_released = self.lock().peer_disconnected(peer);
        debug!(%peer, n_released, "released blocks of disconnected peer");
        if n_released > 0 {
            self.notify_released();
        }
    }

    pub fn request_timed_out(&self, peer: PeerAddr, block: BlockId) {
        if self.lock().request_timed_out(peer, block) {
            debug!(%peer, ?block, "request timed out, block re-queued");
            self.notify_released();
        }
    }

    pub fn release_blocks(&self, peer: PeerAddr, blocks: impl IntoIterator<Item = BlockId>) {
        let n_released = self.lock().release_blocks(peer, blocks);
        debug!(%peer, n_released, "abandoned requests returned");
        if n_released > 0 {
            self.notify_released();
        }
    }

    fn notify_released(&self) {
        self.released_tx.send_modify(|generation| *generation += 1);
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.lock().has_piece(index)
    }

    pub fn is_complete(&self) -> bool {
        *self.complete_tx.borrow()
    }

    pub fn bitfield(&self) -> Bitfield {
        self.lock().bitfield()
    }

    pub fn progress(&self) -> Progress {
        self.lock().progress()
    }

    /// indices of pieces as they get verified, used to send `Have` messages.
    pub fn subscribe_haves(&self) -> broadcast::Receiver<PieceIndex> {
        self.have_tx.subscribe()
    }

    /// changes every time assigned blocks become requestable again.
    pub fn subscribe_released(&self) -> watch::Receiver<u64> {
        self.released_tx.subscribe()
    }

    pub async fn wait_complete(&self) {
        let mut complete_rx = self.complete_tx.subscribe();
        // the sender lives as long as self, so this can't fail.
        let _ = complete_rx.wait_for(|complete| *complete).await;
    }
}
