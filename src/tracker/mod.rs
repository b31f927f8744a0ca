pub mod peers;
pub mod request;
pub mod response;

use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::peers::PeerAddr;
use crate::piece_picker::PiecePickerHandle;
use crate::prelude::*;
use request::{AnnounceEvent, TrackerRequest};
use response::{TrackerResponse, TrackerResponseResult};

#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    fn announce_url(&self, request: &TrackerRequest) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, request.to_url_query())
    }

    #[instrument(name = "announce", level = "info", fields(url = %self.url), skip_all)]
    pub async fn announce(&self, request: &TrackerRequest) -> anyhow::Result<TrackerResponse> {
        // the query is percent encoded already.
        let body = self
            .client
            .get(self.announce_url(request))
            .send()
            .await
            .context("tracker unreachable")?
            .error_for_status()?
            .bytes()
            .await?;

        let response: TrackerResponseResult = serde_bencode::from_bytes(&body)
            .map_err(anyhow::Error::msg)
            .context("malformed tracker response")?;
        let response = response.into_result()?;

        info!(
            n_peers = response.peer_addresses.as_ref().len(),
            interval = response.request_interval_seconds,
            "tracker responded"
        );
        Ok(response)
    }
}

const CLOSING_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// re-announce every `interval` (or whatever the tracker asks for) and hand newly learnt peers
/// to the swarm. failures are only logged, the swarm keeps going with the peers it has. on
/// shutdown the tracker is told we are done.
pub async fn reannounce(
    tracker: HttpTracker,
    mut request: TrackerRequest,
    mut interval: Duration,
    picker: PiecePickerHandle,
    addr_tx: mpsc::Sender<Vec<PeerAddr>>,
    shutdown: CancellationToken,
) {
    request.event = None;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        update_counts(&mut request, &picker);
        match tracker.announce(&request).await {
            Ok(response) => {
                interval = Duration::from_secs(response.request_interval_seconds.max(1));
                if addr_tx
                    .send(response.peer_addresses.into_inner())
                    .await
                    .is_err()
                {
                    debug!("swarm is gone, no more re-announces");
                    break;
                }
            }
            Err(err) => warn!("re-announce failed: {:#}", err),
        }
    }

    update_counts(&mut request, &picker);
    for &event in closing_events(request.left) {
        request.event = Some(event);
        match tokio::time::timeout(CLOSING_ANNOUNCE_TIMEOUT, tracker.announce(&request)).await {
            Ok(Ok(_)) => debug!(?event, "tracker notified"),
            Ok(Err(err)) => warn!(?event, "closing announce failed: {:#}", err),
            Err(_) => warn!(?event, "tracker did not answer the closing announce in time"),
        }
    }
}

fn closing_events(left: u64) -> &'static [AnnounceEvent] {
    if left == 0 {
        &[AnnounceEvent::Completed, AnnounceEvent::Stopped]
    } else {
        &[AnnounceEvent::Stopped]
    }
}

fn update_counts(request: &mut TrackerRequest, picker: &PiecePickerHandle) {
    request.left = bytes_left(picker);
    request.downloaded = picker.layout().total_length() - request.left;
}

/// bytes of every piece not yet verified.
pub fn bytes_left(picker: &PiecePickerHandle) -> u64 {
    let layout = picker.layout();
    picker
        .bitfield()
        .iter_zeros()
        .map(|index| layout.piece_length(index) as u64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::piece_picker::{PieceLayout, PiecePicker};
    use crate::torrent::{InfoHash, PeerId};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    #[rstest]
    fn test_announce_url_separator() {
        let request = TrackerRequest::new(
            InfoHash::new([0; 20]),
            PeerId::with_suffix(b"abcdefghijkl"),
            6881,
            10,
        );

        let plain = HttpTracker::new(Client::new(), "http://tracker.example.org/announce");
        assert!(plain
            .announce_url(&request)
            .starts_with("http://tracker.example.org/announce?info_hash=%00"));

        let keyed = HttpTracker::new(Client::new(), "http://tracker.example.org/announce?key=1");
        assert!(keyed
            .announce_url(&request)
            .starts_with("http://tracker.example.org/announce?key=1&info_hash="));
    }

    #[rstest]
    #[case(0, &[AnnounceEvent::Completed, AnnounceEvent::Stopped])]
    #[case(1, &[AnnounceEvent::Stopped])]
    fn test_closing_events(#[case] left: u64, #[case] expected: &[AnnounceEvent]) {
        assert_eq!(closing_events(left), expected);
    }

    // a one shot http tracker on localhost recording the query of every announce it gets.
    async fn tracker_stub(n_announces: usize) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/announce", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let body = b"d8:intervali1800e5:peers0:e";
            let mut queries = Vec::new();
            for _ in 0..n_announces {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).await.unwrap();
                    assert!(n > 0, "client hung up mid request");
                    head.extend_from_slice(&buf[..n]);
                }
                let request_line = String::from_utf8_lossy(&head)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                queries.push(request_line);

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.write_all(body).await.unwrap();
                stream.shutdown().await.unwrap();
            }
            queries
        });
        (url, server)
    }

    #[rstest]
    #[tokio::test]
    async fn test_shutdown_sends_stopped() {
        let (url, server) = tracker_stub(1).await;
        let (piece_tx, _piece_rx) = mpsc::unbounded_channel();
        let picker = PiecePickerHandle::new(
            PiecePicker::new(PieceLayout::new(32768, 32768), vec![[0; 20]]).unwrap(),
            piece_tx,
        );
        let request = TrackerRequest::new(
            InfoHash::new([0; 20]),
            PeerId::with_suffix(b"abcdefghijkl"),
            6881,
            32768,
        );
        let (addr_tx, _addr_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        reannounce(
            HttpTracker::new(Client::new(), url),
            request,
            Duration::from_secs(3600),
            picker,
            addr_tx,
            shutdown,
        )
        .await;

        let queries = server.await.unwrap();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].contains("left=32768"));
        assert!(queries[0].contains("&event=stopped"));
    }

    #[rstest]
    fn test_bytes_left_counts_short_last_piece() {
        let layout = PieceLayout::new(32768, 32768 + 100);
        let (piece_tx, _piece_rx) = mpsc::unbounded_channel();
        let picker = PiecePickerHandle::new(
            PiecePicker::new(layout, vec![[0; 20]; 2]).unwrap(),
            piece_tx,
        );
        assert_eq!(bytes_left(&picker), 32768 + 100);
    }
}
