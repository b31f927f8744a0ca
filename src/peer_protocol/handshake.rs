use crate::error::PeerError;
use crate::torrent::{InfoHash, PeerId};

/// the fixed 68 byte handshake exchanged before any length prefixed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshake {
    pub reserved_bytes: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl PeerHandshake {
    pub const PROTOCOL_PREFIX: [u8; 19] = *b"BitTorrent protocol";
    pub const SIZE: usize = 1 + Self::PROTOCOL_PREFIX.len() + 8 + 20 + 20;

    const RESERVED_START: usize = 1 + Self::PROTOCOL_PREFIX.len();
    const INFO_HASH_START: usize = Self::RESERVED_START + 8;
    const PEER_ID_START: usize = Self::INFO_HASH_START + InfoHash::INFO_HASH_SIZE;

    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved_bytes: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn into_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0] = Self::PROTOCOL_PREFIX.len() as u8;
        bytes[1..Self::RESERVED_START].copy_from_slice(&Self::PROTOCOL_PREFIX);
        bytes[Self::RESERVED_START..Self::INFO_HASH_START].copy_from_slice(&self.reserved_bytes);
        bytes[Self::INFO_HASH_START..Self::PEER_ID_START].copy_from_slice(self.info_hash.as_ref());
        bytes[Self::PEER_ID_START..].copy_from_slice(self.peer_id.as_ref());
        bytes
    }

    /// parse a handshake reply, rejecting anything that is not the bittorrent protocol. the
    /// reserved bytes are kept but not interpreted.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Result<Self, PeerError> {
        let prefix = &bytes[1..Self::RESERVED_START];
        if bytes[0] as usize != Self::PROTOCOL_PREFIX.len() || prefix != Self::PROTOCOL_PREFIX {
            return Err(PeerError::HandshakeMismatch(format!(
                "unknown protocol prefix '{}'",
                String::from_utf8_lossy(prefix)
            )));
        }

        let mut reserved_bytes = [0; 8];
        reserved_bytes.copy_from_slice(&bytes[Self::RESERVED_START..Self::INFO_HASH_START]);

        let mut info_hash = [0; InfoHash::INFO_HASH_SIZE];
        info_hash.copy_from_slice(&bytes[Self::INFO_HASH_START..Self::PEER_ID_START]);

        let mut peer_id = [0; PeerId::PEER_ID_SIZE];
        peer_id.copy_from_slice(&bytes[Self::PEER_ID_START..]);

        Ok(Self {
            reserved_bytes,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    const INFO_HASH: [u8; 20] = [3; 20];
    const PEER_ID_SUFFIX: [u8; PeerId::SUFFIX_LEN] = [7; PeerId::SUFFIX_LEN];
    type PH = PeerHandshake;
    type HB = [u8; PeerHandshake::SIZE];

    #[fixture]
    fn peer_id() -> PeerId {
        PeerId::with_suffix(&PEER_ID_SUFFIX)
    }

    #[fixture]
    fn info_hash() -> InfoHash {
        InfoHash::new(INFO_HASH)
    }

    #[fixture]
    fn handshake(info_hash: InfoHash, peer_id: PeerId) -> PH {
        PH::new(info_hash, peer_id)
    }

    #[fixture]
    fn handshake_bytes(info_hash: InfoHash, peer_id: PeerId) -> HB {
        let mut out: Vec<u8> = Vec::new();
        out.push(19);
        out.extend_from_slice(b"BitTorrent protocol");
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(info_hash.as_ref());
        out.extend_from_slice(peer_id.as_ref());

        out.try_into().unwrap()
    }

    #[rstest]
    fn test_into_bytes(handshake: PeerHandshake, handshake_bytes: HB) {
        assert_eq!(handshake_bytes.len(), 68);
        assert_eq!(handshake.into_bytes(), handshake_bytes);
    }

    #[rstest]
    fn test_decode_from_bytes(handshake: PeerHandshake, handshake_bytes: HB) {
        let out = PH::from_bytes(&handshake_bytes).unwrap();
        assert_eq!(out, handshake);
    }

    #[rstest]
    fn test_reserved_bytes_are_not_interpreted(handshake_bytes: HB) {
        let mut bytes = handshake_bytes;
        bytes[20..28].copy_from_slice(&[0xFF; 8]);

        let out = PH::from_bytes(&bytes).unwrap();
        assert_eq!(out.reserved_bytes, [0xFF; 8]);
        assert_eq!(out.info_hash, InfoHash::new(INFO_HASH));
    }

    #[rstest]
    fn test_wrong_protocol_is_rejected(handshake_bytes: HB) {
        let mut bytes = handshake_bytes;
        bytes[1..20].copy_from_slice(b"BitTorrent protocoL");

        assert!(matches!(
            PH::from_bytes(&bytes),
            Err(PeerError::HandshakeMismatch(_))
        ));
    }
}
