mod connector;
mod session;
mod state;

use tokio::io::{AsyncRead, AsyncWrite};

pub use connector::{PeerConnection, PeerConnector};
pub use session::{run_session, PeerSession, SessionContext};
pub use state::{CloseReason, PeerState, SessionState};

pub type PeerAddr = std::net::SocketAddrV4;
pub type PieceIndex = usize;
pub type PieceLength = u32;
pub type BlockLength = u32;
pub type BlockOffset = u32;

/// the transport a session runs over. tcp in production, in memory pipes in tests.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
