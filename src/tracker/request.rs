use crate::torrent::{InfoHash, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerRequest {
    /// sha1 hash of the bencoded info dictionary, sent percent encoded as raw bytes.
    pub info_hash: InfoHash,

    pub peer_id: PeerId,

    /// port we report for incoming connections.
    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    /// bytes still missing, the full torrent length before anything is verified.
    pub left: u64,

    /// omitted for the regular re-announces.
    pub event: Option<AnnounceEvent>,
}

impl TrackerRequest {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, port: u16, left: u64) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            event: Some(AnnounceEvent::Started),
        }
    }

    /// query string of the announce url. always asks for the compact peer list.
    pub fn to_url_query(&self) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            urlencoding::encode_binary(self.info_hash.as_ref()),
            urlencoding::encode_binary(self.peer_id.as_ref()),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        );
        if let Some(event) = self.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }
        query
    }
}
