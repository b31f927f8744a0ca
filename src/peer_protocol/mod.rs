pub mod codec;
pub mod handshake;

pub use codec::{decode_frame, upgrade_stream, Decoded, PeerFrames, PeerMessage, PeerMessageCodec};
pub use handshake::PeerHandshake;
