mod layout;
mod piece_picker;
mod piece_picker_handle;
mod piece_state;

use crate::peers::{BlockOffset, PieceIndex};

pub use layout::PieceLayout;
pub use piece_picker::{BlockOutcome, PiecePicker, Progress};
pub use piece_picker_handle::PiecePickerHandle;
pub use piece_state::{BlockState, PieceState};

pub type PieceHash = [u8; sha1_smol::DIGEST_LENGTH];

/// address of one request unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub piece: PieceIndex,
    pub offset: BlockOffset,
}

/// a verified piece on its way to persistence, produced exactly once per piece.
#[derive(Debug)]
pub struct PieceDone {
    pub index: PieceIndex,
    pub piece: Vec<u8>,
}
