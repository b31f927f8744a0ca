use std::sync::Arc;
use std::time::Instant;

use futures::SinkExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{CloseReason, PeerAddr, PeerConnection, PeerConnector, PeerState, PeerStream};
use super::{BlockLength, BlockOffset, PieceIndex, SessionState};
use crate::config::SwarmConfig;
use crate::error::PeerError;
use crate::peer_protocol::{upgrade_stream, PeerFrames, PeerHandshake, PeerMessage};
use crate::piece_picker::{BlockId, PiecePickerHandle};
use crate::prelude::*;
use crate::storage::StorageHandle;
use crate::torrent::{bitfield_from_wire, InfoHash, PeerId};

/// what every session shares with the rest of the swarm.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub picker: PiecePickerHandle,
    pub storage: StorageHandle,
    pub config: Arc<SwarmConfig>,
    pub shutdown: CancellationToken,
}

/// connect, handshake and run a session against `peer_addr` until it closes. whatever happens
/// the peer's block assignments are released before this returns.
#[instrument(name = "peer session", level = "info", fields(%peer_addr), skip_all)]
pub async fn run_session(peer_addr: PeerAddr, ctx: SessionContext) -> CloseReason {
    let connect_timeout = ctx.config.connect_timeout;
    let handshake = PeerHandshake::new(ctx.info_hash, ctx.peer_id);

    let established = async {
        let connector = PeerConnector::connect(peer_addr, connect_timeout).await?;
        time::timeout(connect_timeout, connector.handshake(handshake))
            .await
            .map_err(|_| PeerError::ConnectTimeout(connect_timeout))?
    };

    let connection = tokio::select! {
        _ = ctx.shutdown.cancelled() => {
            ctx.picker.peer_disconnected(peer_addr);
            return CloseReason::Shutdown;
        }
        connection = established => connection,
    };

    match connection {
        Ok(connection) => PeerSession::new(connection, ctx).run().await,
        Err(err) => {
            ctx.picker.peer_disconnected(peer_addr);
            CloseReason::Failed(err)
        }
    }
}

#[derive(Debug)]
pub struct PeerSession<S: PeerStream> {
    peer_addr: PeerAddr,
    peer_id: PeerId,
    frames: PeerFrames<S>,
    state: SessionState,
    peer: PeerState,
    haves: broadcast::Receiver<PieceIndex>,
    released: watch::Receiver<u64>,
    ctx: SessionContext,
}

impl<S: PeerStream> PeerSession<S> {
    /// largest block we are willing to serve in one request.
    const MAX_SERVED_LENGTH: BlockLength = 1 << 17;

    pub fn new(
        PeerConnection {
            peer_addr,
            peer_id,
            stream,
        }: PeerConnection<S>,
        ctx: SessionContext,
    ) -> Self {
        let n_pieces = ctx.picker.layout().piece_count();
        Self {
            peer_addr,
            peer_id,
            frames: upgrade_stream(stream),
            state: SessionState::HandshakeVerified,
            peer: PeerState::new(n_pieces),
            haves: ctx.picker.subscribe_haves(),
            released: ctx.picker.subscribe_released(),
            ctx,
        }
    }

    /// run the message loop until the connection ends. returns the terminal close reason after
    /// the orchestrator has taken back every block this peer held.
    pub async fn run(mut self) -> CloseReason {
        let reason = match self.event_loop().await {
            Ok(()) => CloseReason::Shutdown,
            Err(err) => CloseReason::Failed(err),
        };

        info!(peer_id = %self.peer_id, %reason, "session closed");
        self.ctx.picker.peer_disconnected(self.peer_addr);
        self.state = SessionState::Closed(reason);

        match self.state {
            SessionState::Closed(reason) => reason,
            _ => unreachable!("state was just set to closed"),
        }
    }

    async fn event_loop(&mut self) -> Result<(), PeerError> {
        self.start().await?;

        let config = self.ctx.config.clone();
        let mut expiry_check = time::interval(config.request_timeout / 2);
        expiry_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keepalive = time::interval_at(
            time::Instant::now() + config.keepalive_interval,
            config.keepalive_interval,
        );

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    debug!("swarm shutting down, closing session");
                    return Ok(());
                }

                msg = self.frames.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => {
                            info!("peer closed the connection");
                            return Err(PeerError::PeerClosed);
                        }
                    };
                    self.handle_peer_message(msg).await?;
                }

                have = self.haves.recv() => {
                    match have {
                        Ok(index) => self.announce_piece(index).await?,
                        Err(RecvError::Lagged(n_missed)) => {
                            warn!(n_missed, "missed piece completions, re-checking interest");
                            self.update_interest().await?;
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }

                changed = self.released.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    // blocks dropped by some session or a failed piece may be ours to take.
                    self.update_interest().await?;
                    self.fill_pipeline().await?;
                }

                _ = expiry_check.tick() => self.expire_requests(config.request_timeout).await?,

                _ = keepalive.tick() => {
                    trace!("sending keepalive");
                    self.frames.send(PeerMessage::KeepAlive).await?;
                }
            }
        }
    }

    async fn start(&mut self) -> Result<(), PeerError> {
        self.state = SessionState::Active;
        debug!(state = ?self.state);

        let mut ours = self.ctx.picker.bitfield();
        if ours.any() {
            ours.set_uninitialized(false);
            debug!("sending our bitfield");
            self.frames.feed(PeerMessage::Bitfield(ours.into_vec())).await?;
        }

        // no choking algorithm, everyone may request.
        self.frames.send(PeerMessage::Unchoke).await?;
        self.peer.am_choking = false;
        Ok(())
    }

    async fn handle_peer_message(&mut self, msg: PeerMessage) -> Result<(), PeerError> {
        type PM = PeerMessage;
        match msg {
            PM::KeepAlive => trace!("received keepalive"),

            PM::Choke => {
                info!("peer choked");
                self.peer.peer_choking = true;
                // the peer may silently drop anything still in flight.
                let abandoned = self.peer.take_outstanding();
                self.ctx.picker.release_blocks(self.peer_addr, abandoned);
            }

            PM::Unchoke => {
                info!("peer unchoked");
                self.peer.peer_choking = false;
                self.fill_pipeline().await?;
            }

            PM::Interested => {
                debug!("peer interested");
                self.peer.peer_interested = true;
            }

            PM::NotInterested => {
                debug!("peer not interested");
                self.peer.peer_interested = false;
            }

            PM::Have(index) => {
                let index = index as PieceIndex;
                trace!(index, "received have");
                if index < self.peer.bitfield.len() {
                    self.peer.bitfield.set(index, true);
                }
                self.ctx.picker.peer_has_piece(self.peer_addr, index);
                self.update_interest().await?;
                self.fill_pipeline().await?;
            }

            PM::Bitfield(bytes) => {
                self.peer.bitfield = bitfield_from_wire(&bytes, self.peer.bitfield.len());
                debug!(n_pieces = self.peer.bitfield.count_ones(), "received bitfield");
                self.ctx
                    .picker
                    .peer_has_pieces(self.peer_addr, &self.peer.bitfield);
                self.update_interest().await?;
                self.fill_pipeline().await?;
            }

            PM::Request {
                index,
                begin,
                length,
            } => self.serve_request(index as PieceIndex, begin, length).await?,

            PM::Piece {
                index,
                begin,
                block,
            } => {
                let block_id = BlockId {
                    piece: index as PieceIndex,
                    offset: begin,
                };
                if self.peer.outstanding.remove(&block_id).is_none() {
                    debug!(?block_id, "received a block this session did not request");
                }
                self.ctx
                    .picker
                    .block_received(self.peer_addr, block_id.piece, begin, block);
                self.fill_pipeline().await?;
            }

            PM::Cancel {
                index,
                begin,
                length,
            } => {
                // requests are answered as soon as they arrive, nothing is queued to cancel.
                debug!(index, begin, length, "peer cancelled a request");
            }

            PM::Port(port) => debug!(port, "peer announced a dht port, ignoring"),

            PM::Unknown { id, payload } => {
                debug!(id, len = payload.len(), "skipping unknown message");
            }
        }
        Ok(())
    }

    async fn update_interest(&mut self) -> Result<(), PeerError> {
        let wants = self.ctx.picker.wants_from(self.peer_addr);
        if wants == self.peer.am_interested {
            return Ok(());
        }

        self.peer.am_interested = wants;
        if wants {
            info!("sending interested");
            self.frames.send(PeerMessage::Interested).await
        } else {
            info!("sending not interested");
            self.frames.send(PeerMessage::NotInterested).await
        }
    }

    /// top up requests in flight to the pipelining limit with blocks the orchestrator assigns.
    async fn fill_pipeline(&mut self) -> Result<(), PeerError> {
        if !self.peer.can_request() {
            return Ok(());
        }

        let room = self
            .ctx
            .config
            .pipeline_limit
            .saturating_sub(self.peer.outstanding.len());
        if room == 0 {
            return Ok(());
        }

        let blocks = self.ctx.picker.assign_blocks(self.peer_addr, room);
        if blocks.is_empty() {
            return Ok(());
        }

        let layout = self.ctx.picker.layout();
        let now = Instant::now();
        for block in blocks {
            self.peer.outstanding.insert(block, now);
            let request = PeerMessage::Request {
                index: block.piece as u32,
                begin: block.offset,
                length: layout.block_length(block),
            };
            trace!(?request, "sending request");
            self.frames.feed(request).await?;
        }
        self.frames.flush().await
    }

    async fn expire_requests(&mut self, timeout: std::time::Duration) -> Result<(), PeerError> {
        let expired = self.peer.take_expired(Instant::now(), timeout);
        if expired.is_empty() {
            return Ok(());
        }

        let layout = self.ctx.picker.layout();
        for block in expired {
            warn!(?block, "request timed out");
            self.ctx.picker.request_timed_out(self.peer_addr, block);
            self.frames
                .feed(PeerMessage::Cancel {
                    index: block.piece as u32,
                    begin: block.offset,
                    length: layout.block_length(block),
                })
                .await?;
        }
        self.frames.flush().await?;
        self.fill_pipeline().await
    }

    async fn announce_piece(&mut self, index: PieceIndex) -> Result<(), PeerError> {
        if !self.peer.bitfield.get(index).is_some_and(|has| *has) {
            trace!(index, "sending have");
            self.frames.send(PeerMessage::Have(index as u32)).await?;
        }
        self.update_interest().await
    }

    async fn serve_request(
        &mut self,
        index: PieceIndex,
        begin: BlockOffset,
        length: BlockLength,
    ) -> Result<(), PeerError> {
        if self.peer.am_choking {
            debug!(index, begin, "ignoring request from choked peer");
            return Ok(());
        }

        let layout = self.ctx.picker.layout();
        let in_bounds = index < layout.piece_count()
            && (begin as u64 + length as u64) <= layout.piece_length(index) as u64;
        if length == 0 || length > Self::MAX_SERVED_LENGTH || !in_bounds {
            warn!(index, begin, length, "ignoring invalid request");
            return Ok(());
        }
        if !self.ctx.picker.has_piece(index) {
            debug!(index, "ignoring request for a piece we do not have");
            return Ok(());
        }

        match self.ctx.storage.read_block(index, begin, length).await {
            Ok(block) => {
                trace!(index, begin, length, "serving block");
                self.frames
                    .send(PeerMessage::Piece {
                        index: index as u32,
                        begin,
                        block,
                    })
                    .await
            }
            Err(err) => {
                warn!(index, begin, "could not read block for peer: {:#}", err);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece_picker::{PieceDone, PieceLayout, PiecePicker};
    use crate::storage::ReadBlock;
    use rand::Rng;
    use rstest::{fixture, rstest};
    use sha1_smol::Sha1;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const PIECE_LENGTH: u32 = 32768;

    struct Harness {
        ctx: SessionContext,
        data: Vec<u8>,
        piece_rx: mpsc::UnboundedReceiver<PieceDone>,
        read_rx: mpsc::Receiver<ReadBlock>,
    }

    fn remote_addr() -> PeerAddr {
        PeerAddr::new(Ipv4Addr::new(10, 1, 1, 1), 51413)
    }

    #[fixture]
    fn harness() -> Harness {
        let mut rng = rand::thread_rng();
        let data: Vec<u8> = (0..2 * PIECE_LENGTH as usize).map(|_| rng.gen()).collect();
        let hashes = data
            .chunks(PIECE_LENGTH as usize)
            .map(|piece| Sha1::from(piece).digest().bytes())
            .collect();
        let layout = PieceLayout::new(PIECE_LENGTH, data.len() as u64);

        let (piece_tx, piece_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::channel(4);
        let ctx = SessionContext {
            info_hash: InfoHash::new([3; 20]),
            peer_id: PeerId::with_random_suffix(),
            picker: PiecePickerHandle::new(PiecePicker::new(layout, hashes).unwrap(), piece_tx),
            storage: StorageHandle::new(read_tx),
            config: Arc::new(SwarmConfig::default()),
            shutdown: CancellationToken::new(),
        };
        Harness {
            ctx,
            data,
            piece_rx,
            read_rx,
        }
    }

    fn start(ctx: &SessionContext) -> (PeerFrames<DuplexStream>, JoinHandle<CloseReason>) {
        start_with(ctx, remote_addr())
    }

    fn start_with(
        ctx: &SessionContext,
        peer_addr: PeerAddr,
    ) -> (PeerFrames<DuplexStream>, JoinHandle<CloseReason>) {
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let connection = PeerConnection {
            peer_addr,
            peer_id: PeerId::with_random_suffix(),
            stream: ours,
        };
        let session = tokio::spawn(PeerSession::new(connection, ctx.clone()).run());
        (upgrade_stream(theirs), session)
    }

    async fn next_message(remote: &mut PeerFrames<DuplexStream>) -> PeerMessage {
        loop {
            let msg = time::timeout(Duration::from_secs(5), remote.next())
                .await
                .expect("session should have sent something")
                .expect("session closed the connection")
                .expect("session sent a malformed frame");
            if msg != PeerMessage::KeepAlive {
                return msg;
            }
        }
    }

    async fn take_requests(remote: &mut PeerFrames<DuplexStream>, n: usize) -> Vec<BlockId> {
        let mut requested = Vec::new();
        while requested.len() < n {
            match next_message(remote).await {
                PeerMessage::Request { index, begin, .. } => requested.push(BlockId {
                    piece: index as PieceIndex,
                    offset: begin,
                }),
                other => panic!("expected a request, got {:?}", other),
            }
        }
        requested
    }

    #[rstest]
    #[tokio::test]
    async fn test_downloads_from_unchoking_peer(harness: Harness) {
        let Harness {
            ctx,
            data,
            mut piece_rx,
            ..
        } = harness;
        let (mut remote, session) = start(&ctx);

        assert_eq!(next_message(&mut remote).await, PeerMessage::Unchoke);
        remote
            .send(PeerMessage::Bitfield(vec![0b1100_0000]))
            .await
            .unwrap();
        assert_eq!(next_message(&mut remote).await, PeerMessage::Interested);

        remote.send(PeerMessage::Unchoke).await.unwrap();
        let mut served = 0;
        while served < 4 {
            let requested = take_requests(&mut remote, 1).await[0];
            let start = requested.piece * PIECE_LENGTH as usize + requested.offset as usize;
            let length = ctx.picker.layout().block_length(requested) as usize;
            remote
                .send(PeerMessage::Piece {
                    index: requested.piece as u32,
                    begin: requested.offset,
                    block: data[start..start + length].to_vec(),
                })
                .await
                .unwrap();
            served += 1;
        }

        // the peer already has both pieces, so no have, just losing interest.
        assert_eq!(next_message(&mut remote).await, PeerMessage::NotInterested);
        assert!(ctx.picker.is_complete());

        let mut persisted: Vec<PieceIndex> = Vec::new();
        while let Ok(PieceDone { index, .. }) = piece_rx.try_recv() {
            persisted.push(index);
        }
        persisted.sort();
        assert_eq!(persisted, vec![0, 1]);

        drop(remote);
        assert!(matches!(
            session.await.unwrap(),
            CloseReason::Failed(PeerError::PeerClosed)
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn test_choke_returns_requests(harness: Harness) {
        let ctx = harness.ctx;
        let (mut remote, session) = start(&ctx);

        next_message(&mut remote).await;
        remote
            .send(PeerMessage::Bitfield(vec![0b1100_0000]))
            .await
            .unwrap();
        remote.send(PeerMessage::Unchoke).await.unwrap();
        assert_eq!(next_message(&mut remote).await, PeerMessage::Interested);
        take_requests(&mut remote, 4).await;
        assert_eq!(ctx.picker.progress().in_progress, 2);

        remote.send(PeerMessage::Choke).await.unwrap();
        time::timeout(Duration::from_secs(5), async {
            while ctx.picker.progress().in_progress != 0 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("choke should release every block");

        ctx.shutdown.cancel();
        assert!(matches!(session.await.unwrap(), CloseReason::Shutdown));
    }

    #[rstest]
    #[tokio::test]
    async fn test_disconnect_releases_blocks(harness: Harness) {
        let ctx = harness.ctx;
        let (mut remote, session) = start(&ctx);

        next_message(&mut remote).await;
        remote
            .send(PeerMessage::Bitfield(vec![0b1100_0000]))
            .await
            .unwrap();
        remote.send(PeerMessage::Unchoke).await.unwrap();
        next_message(&mut remote).await;
        let requested = take_requests(&mut remote, 4).await;

        drop(remote);
        assert!(matches!(
            session.await.unwrap(),
            CloseReason::Failed(PeerError::PeerClosed)
        ));

        let other = PeerAddr::new(Ipv4Addr::new(10, 1, 1, 2), 51413);
        ctx.picker
            .peer_has_pieces(other, &crate::torrent::Bitfield::repeat(true, 2));
        let mut reassigned = ctx.picker.assign_blocks(other, 10);
        let mut requested = requested;
        reassigned.sort();
        requested.sort();
        assert_eq!(reassigned, requested);
    }

    #[rstest]
    #[tokio::test]
    async fn test_idle_session_takes_over_released_blocks(harness: Harness) {
        let ctx = harness.ctx;
        let (mut first, first_session) = start(&ctx);
        next_message(&mut first).await;
        first
            .send(PeerMessage::Bitfield(vec![0b1100_0000]))
            .await
            .unwrap();
        first.send(PeerMessage::Unchoke).await.unwrap();
        assert_eq!(next_message(&mut first).await, PeerMessage::Interested);
        let mut requested = take_requests(&mut first, 4).await;

        // everything is already assigned, the second peer gets nothing to do.
        let (mut second, second_session) =
            start_with(&ctx, PeerAddr::new(Ipv4Addr::new(10, 1, 1, 2), 51413));
        assert_eq!(next_message(&mut second).await, PeerMessage::Unchoke);
        second
            .send(PeerMessage::Bitfield(vec![0b1100_0000]))
            .await
            .unwrap();
        second.send(PeerMessage::Unchoke).await.unwrap();
        assert_eq!(next_message(&mut second).await, PeerMessage::Interested);

        drop(first);
        assert!(matches!(
            first_session.await.unwrap(),
            CloseReason::Failed(PeerError::PeerClosed)
        ));

        let mut taken_over = take_requests(&mut second, 4).await;
        taken_over.sort();
        requested.sort();
        assert_eq!(taken_over, requested);

        ctx.shutdown.cancel();
        assert!(matches!(second_session.await.unwrap(), CloseReason::Shutdown));
    }

    #[rstest]
    #[tokio::test]
    async fn test_serves_verified_pieces_only(harness: Harness) {
        let Harness {
            ctx,
            data,
            mut read_rx,
            ..
        } = harness;

        // verify piece 0 through some other peer first.
        let seeder = PeerAddr::new(Ipv4Addr::new(10, 1, 1, 3), 51413);
        ctx.picker.peer_has_piece(seeder, 0);
        for block in ctx.picker.assign_blocks(seeder, 10) {
            let start = block.offset as usize;
            let length = ctx.picker.layout().block_length(block) as usize;
            ctx.picker
                .block_received(seeder, 0, block.offset, data[start..start + length].to_vec());
        }
        assert!(ctx.picker.has_piece(0));

        let storage_data = data.clone();
        tokio::spawn(async move {
            while let Some(read) = read_rx.recv().await {
                let start = read.index * PIECE_LENGTH as usize + read.begin as usize;
                let block = storage_data[start..start + read.length as usize].to_vec();
                let _ = read.reply.send(Ok(block));
            }
        });

        let (mut remote, session) = start(&ctx);
        assert_eq!(
            next_message(&mut remote).await,
            PeerMessage::Bitfield(vec![0b1000_0000])
        );
        assert_eq!(next_message(&mut remote).await, PeerMessage::Unchoke);

        for ignored in [
            PeerMessage::Request {
                index: 1,
                begin: 0,
                length: 16384,
            },
            PeerMessage::Request {
                index: 0,
                begin: 0,
                length: 1 << 18,
            },
            PeerMessage::Request {
                index: 0,
                begin: PIECE_LENGTH - 10,
                length: 16384,
            },
        ] {
            remote.send(ignored).await.unwrap();
        }
        remote
            .send(PeerMessage::Request {
                index: 0,
                begin: 100,
                length: 16384,
            })
            .await
            .unwrap();

        assert_eq!(
            next_message(&mut remote).await,
            PeerMessage::Piece {
                index: 0,
                begin: 100,
                block: data[100..100 + 16384].to_vec(),
            }
        );

        ctx.shutdown.cancel();
        assert!(matches!(session.await.unwrap(), CloseReason::Shutdown));
    }

    #[rstest]
    #[tokio::test]
    async fn test_timed_out_requests_are_cancelled(harness: Harness) {
        let ctx = SessionContext {
            config: Arc::new(SwarmConfig {
                request_timeout: Duration::from_millis(100),
                ..SwarmConfig::default()
            }),
            ..harness.ctx
        };
        let (mut remote, session) = start(&ctx);

        next_message(&mut remote).await;
        remote
            .send(PeerMessage::Bitfield(vec![0b1000_0000]))
            .await
            .unwrap();
        remote.send(PeerMessage::Unchoke).await.unwrap();
        next_message(&mut remote).await;
        let mut requested = take_requests(&mut remote, 2).await;
        requested.sort();

        // nothing answered, after the timeout both are cancelled and asked for again.
        let mut cancelled = Vec::new();
        let mut rerequested = Vec::new();
        while rerequested.len() < 2 {
            match next_message(&mut remote).await {
                PeerMessage::Cancel { index, begin, .. } => cancelled.push(BlockId {
                    piece: index as PieceIndex,
                    offset: begin,
                }),
                PeerMessage::Request { index, begin, .. } => rerequested.push(BlockId {
                    piece: index as PieceIndex,
                    offset: begin,
                }),
                other => panic!("unexpected {:?}", other),
            }
        }
        cancelled.sort();
        rerequested.sort();
        assert_eq!(cancelled, requested);
        assert_eq!(rerequested, requested);

        ctx.shutdown.cancel();
        assert!(matches!(session.await.unwrap(), CloseReason::Shutdown));
    }
}
