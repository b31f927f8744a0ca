mod bitfield;
mod info_hash;
mod peer_id;

pub use bitfield::{bitfield_from_wire, Bitfield, Bitslice};
pub use info_hash::InfoHash;
pub use peer_id::PeerId;
