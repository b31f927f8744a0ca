use crate::error::PeerError;
use crate::prelude::*;
use tokio_util::{
    bytes::{Buf, BufMut, BytesMut},
    codec::{Decoder, Encoder, Framed},
};

pub type PeerFrames<S> = Framed<S, PeerMessageCodec>;

pub fn upgrade_stream<S>(stream: S) -> PeerFrames<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    Framed::new(stream, PeerMessageCodec::new())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Port(u16),
    /// any message id outside the base protocol, kept so extensions degrade gracefully.
    Unknown {
        id: u8,
        payload: Vec<u8>,
    },
}

impl PeerMessage {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;

    /// message id on the wire, keepalives have none.
    pub fn id(&self) -> Option<u8> {
        type PM = PeerMessage;
        Some(match self {
            PM::KeepAlive => return None,
            PM::Choke => Self::CHOKE,
            PM::Unchoke => Self::UNCHOKE,
            PM::Interested => Self::INTERESTED,
            PM::NotInterested => Self::NOT_INTERESTED,
            PM::Have(_) => Self::HAVE,
            PM::Bitfield(_) => Self::BITFIELD,
            PM::Request { .. } => Self::REQUEST,
            PM::Piece { .. } => Self::PIECE,
            PM::Cancel { .. } => Self::CANCEL,
            PM::Port(_) => Self::PORT,
            PM::Unknown { id, .. } => *id,
        })
    }

    fn payload_len(&self) -> usize {
        const U32: usize = std::mem::size_of::<u32>();
        type PM = PeerMessage;
        match self {
            PM::KeepAlive | PM::Choke | PM::Unchoke | PM::Interested | PM::NotInterested => 0,
            PM::Have(_) => U32,
            PM::Bitfield(bitfield) => bitfield.len(),
            PM::Request { .. } | PM::Cancel { .. } => 3 * U32,
            PM::Piece { block, .. } => 2 * U32 + block.len(),
            PM::Port(_) => std::mem::size_of::<u16>(),
            PM::Unknown { payload, .. } => payload.len(),
        }
    }

    // parse the body of a frame whose id byte was already read, None if the payload length is
    // wrong for the id.
    fn from_parts(id: u8, mut payload: &[u8]) -> Option<Self> {
        const U32: usize = std::mem::size_of::<u32>();
        type PM = PeerMessage;

        let len = payload.len();
        let msg = match id {
            Self::CHOKE if len == 0 => PM::Choke,
            Self::UNCHOKE if len == 0 => PM::Unchoke,
            Self::INTERESTED if len == 0 => PM::Interested,
            Self::NOT_INTERESTED if len == 0 => PM::NotInterested,
            Self::HAVE if len == U32 => PM::Have(payload.get_u32()),
            Self::BITFIELD => PM::Bitfield(payload.to_vec()),
            Self::REQUEST if len == 3 * U32 => PM::Request {
                index: payload.get_u32(),
                begin: payload.get_u32(),
                length: payload.get_u32(),
            },
            Self::PIECE if len >= 2 * U32 => PM::Piece {
                index: payload.get_u32(),
                begin: payload.get_u32(),
                block: payload.to_vec(),
            },
            Self::CANCEL if len == 3 * U32 => PM::Cancel {
                index: payload.get_u32(),
                begin: payload.get_u32(),
                length: payload.get_u32(),
            },
            Self::PORT if len == std::mem::size_of::<u16>() => PM::Port(payload.get_u16()),
            Self::CHOKE..=Self::PORT => return None,
            _ => PM::Unknown {
                id,
                payload: payload.to_vec(),
            },
        };
        Some(msg)
    }
}

/// outcome of decoding one complete frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Message(PeerMessage, usize),
    /// a frame with a known id but an invalid payload length, the frame boundary is still
    /// trustworthy so the frame is dropped.
    Skipped(usize),
}

const LEN_HEADER_SIZE: usize = std::mem::size_of::<u32>();

/// decode the frame at the front of `src`. returns `Ok(None)` when `src` does not yet hold a
/// whole frame.
pub fn decode_frame(src: &[u8]) -> Result<Option<Decoded>, PeerError> {
    if src.len() < LEN_HEADER_SIZE {
        return Ok(None);
    }

    let len_header = (&src[..LEN_HEADER_SIZE]).get_u32() as usize;
    if len_header == 0 {
        return Ok(Some(Decoded::Message(
            PeerMessage::KeepAlive,
            LEN_HEADER_SIZE,
        )));
    }

    // prevent malicious peers from making us buffer without bound.
    if len_header > PeerMessageCodec::MAX_FRAME_SIZE {
        return Err(PeerError::ProtocolFraming(format!(
            "frame of size {} exceeds the {} byte limit",
            len_header,
            PeerMessageCodec::MAX_FRAME_SIZE
        )));
    }

    let frame_len = LEN_HEADER_SIZE + len_header;
    if src.len() < frame_len {
        return Ok(None);
    }

    let id = src[LEN_HEADER_SIZE];
    let payload = &src[LEN_HEADER_SIZE + 1..frame_len];
    Ok(Some(match PeerMessage::from_parts(id, payload) {
        Some(msg) => Decoded::Message(msg, frame_len),
        None => {
            warn!(
                id,
                payload_len = payload.len(),
                "skipping frame with invalid payload length"
            );
            Decoded::Skipped(frame_len)
        }
    }))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PeerMessageCodec;

impl PeerMessageCodec {
    pub const MAX_FRAME_SIZE: usize = 1 << 21;

    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PeerMessageCodec {
    type Item = PeerMessage;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match decode_frame(&src[..])? {
                Some(Decoded::Message(msg, consumed)) => {
                    src.advance(consumed);
                    return Ok(Some(msg));
                }
                Some(Decoded::Skipped(consumed)) => src.advance(consumed),
                None => {
                    if src.len() >= LEN_HEADER_SIZE {
                        let frame_len =
                            LEN_HEADER_SIZE + (&src[..LEN_HEADER_SIZE]).get_u32() as usize;
                        src.reserve(frame_len - src.len());
                    }
                    return Ok(None);
                }
            }
        }
    }
}

impl Encoder<PeerMessage> for PeerMessageCodec {
    type Error = PeerError;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let Some(id) = item.id() else {
            dst.put_u32(0);
            return Ok(());
        };

        let payload_len = item.payload_len();
        dst.reserve(LEN_HEADER_SIZE + 1 + payload_len);
        dst.put_u32(1 + payload_len as u32);
        dst.put_u8(id);

        type PM = PeerMessage;
        match item {
            PM::KeepAlive | PM::Choke | PM::Unchoke | PM::Interested | PM::NotInterested => {}
            PM::Have(index) => dst.put_u32(index),
            PM::Request {
                index,
                begin,
                length,
            }
            | PM::Cancel {
                index,
                begin,
                length,
            } => {
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            PM::Piece {
                index,
                begin,
                block,
            } => {
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_slice(&block);
            }
            PM::Port(port) => dst.put_u16(port),
            PM::Bitfield(payload) | PM::Unknown { payload, .. } => dst.put_slice(&payload),
        }
        Ok(())
    }
}
