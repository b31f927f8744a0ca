use super::{PeerAddr, PeerStream, SessionState};
use crate::error::PeerError;
use crate::peer_protocol::PeerHandshake;
use crate::prelude::*;
use crate::torrent::PeerId;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct PeerConnector<S: PeerStream> {
    peer_addr: PeerAddr,
    stream: S,
    state: SessionState,
}

/// interface type between PeerConnector and PeerSession, only exists once the remote handshake
/// checked out.
#[derive(Debug)]
pub struct PeerConnection<S: PeerStream> {
    pub peer_addr: PeerAddr,
    pub peer_id: PeerId,
    pub(super) stream: S,
}

impl PeerConnector<TcpStream> {
    #[instrument(name = "connect to peer", level = "info", fields(%peer_addr), skip_all)]
    pub async fn connect(peer_addr: PeerAddr, timeout: Duration) -> Result<Self, PeerError> {
        debug!(state = ?SessionState::Connecting);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(peer_addr))
            .await
            .map_err(|_| PeerError::ConnectTimeout(timeout))?
            .inspect_err(|err| {
                debug!("failed to connect to peer: {}", err);
            })?;

        info!("connected to peer");
        Ok(Self::from_parts(peer_addr, stream))
    }
}

impl<S: PeerStream> PeerConnector<S> {
    pub fn from_parts(peer_addr: PeerAddr, stream: S) -> Self {
        Self {
            peer_addr,
            stream,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// send our handshake and check the reply carries the same protocol and info hash.
    #[instrument(name = "handshake", level = "info", fields(peer_addr = %self.peer_addr), skip_all)]
    pub async fn handshake(
        mut self,
        handshake: PeerHandshake,
    ) -> Result<PeerConnection<S>, PeerError> {
        let expected_info_hash = handshake.info_hash;

        debug!("sending handshake to peer");
        self.stream.write_all(&handshake.into_bytes()).await?;
        self.stream.flush().await?;
        self.state = SessionState::HandshakeSent;

        let mut reply = [0; PeerHandshake::SIZE];
        self.stream.read_exact(&mut reply).await?;
        let reply = PeerHandshake::from_bytes(&reply).inspect_err(|err| {
            warn!("rejecting peer handshake: {}", err);
        })?;

        if reply.info_hash != expected_info_hash {
            warn!(info_hash = %reply.info_hash, "peer replied with a different info hash");
            return Err(PeerError::HandshakeMismatch(format!(
                "expected info hash {}, peer sent {}",
                expected_info_hash, reply.info_hash
            )));
        }

        self.state = SessionState::HandshakeVerified;
        info!(peer_id = %reply.peer_id, "peer handshake verified");

        Ok(PeerConnection {
            peer_addr: self.peer_addr,
            peer_id: reply.peer_id,
            stream: self.stream,
        })
    }
}
