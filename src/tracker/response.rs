use super::peers::PeerAddresses;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerResponse {
    #[serde(rename = "interval")]
    pub request_interval_seconds: u64,

    #[serde(rename = "peers")]
    pub peer_addresses: PeerAddresses,

    #[serde(default)]
    #[serde(rename = "complete")]
    pub seeders: Option<u64>,

    #[serde(default)]
    #[serde(rename = "incomplete")]
    pub leechers: Option<u64>,
}

// kept apart from TrackerResponse so a `failure reason` dictionary deserializes too, callers turn
// it into a Result with `into_result`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TrackerResponseResult {
    Failure {
        #[serde(rename = "failure reason")]
        failure_reason: String,
    },
    Success(TrackerResponse),
}

impl TrackerResponseResult {
    pub fn into_result(self) -> anyhow::Result<TrackerResponse> {
        match self {
            Self::Success(tracker_response) => Ok(tracker_response),
            Self::Failure { failure_reason } => {
                anyhow::bail!("{} (tracker)", failure_reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[rstest]
    fn test_compact_response() {
        let mut bytes = b"d8:completei3e10:incompletei1e8:intervali1800e5:peers12:".to_vec();
        bytes.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x00, 0x50]);
        bytes.push(b'e');

        let response: TrackerResponseResult = serde_bencode::from_bytes(&bytes).unwrap();
        let response = response.into_result().unwrap();

        assert_eq!(response.request_interval_seconds, 1800);
        assert_eq!(response.seeders, Some(3));
        assert_eq!(
            response.peer_addresses.as_ref(),
            &[
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6881),
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80),
            ]
        );
    }

    #[rstest]
    fn test_failure_reason() {
        let bytes = b"d14:failure reason17:torrent not founde";
        let response: TrackerResponseResult = serde_bencode::from_bytes(bytes).unwrap();

        let err = response.into_result().unwrap_err();
        assert!(err.to_string().contains("torrent not found"));
    }
}
