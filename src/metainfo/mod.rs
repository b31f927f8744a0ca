mod download_info;
mod files;
pub mod tracker_url;

pub use download_info::DownloadInfo;
pub use files::{FileInfo, TorrentFile};
pub use tracker_url::TrackerUrl;

use crate::prelude::*;
use crate::torrent::InfoHash;
use anyhow::Context;
use serde::Deserialize;
use serde_bencode::value::Value;
use std::path::Path;

/// the outer dictionary of a `.torrent` file. `info` is kept as a generic bencode value so
/// it can be re-encoded with every key it came with for the info hash.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: Option<TrackerUrlEntry>,

    info: Value,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,

    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,

    #[serde(default)]
    comment: Option<String>,
}

// `announce` may carry a scheme we don't speak, that is no reason to reject the whole torrent.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct TrackerUrlEntry(String);

#[derive(Debug)]
pub struct Metainfo {
    pub info: DownloadInfo,
    pub info_hash: InfoHash,
    /// every usable tracker, `announce` first, then the `announce-list` tiers in order.
    pub trackers: Vec<TrackerUrl>,
    pub created_by: Option<String>,
    pub comment: Option<String>,
}

impl Metainfo {
    pub fn from_bencode_file(file: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = file.as_ref();
        let contents = std::fs::read(file)
            .with_context(|| format!("could not read metainfo file {}", file.display()))?;
        Self::from_bytes(&contents)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(bytes).map_err(anyhow::Error::msg)?;

        let info_bytes = serde_bencode::to_bytes(&raw.info).map_err(anyhow::Error::msg)?;
        let info_hash = InfoHash::of(&info_bytes);
        let info: DownloadInfo = serde_bencode::from_bytes(&info_bytes)
            .map_err(anyhow::Error::msg)
            .context("malformed info dictionary")?;
        info.validate()?;

        let mut trackers: Vec<TrackerUrl> = Vec::new();
        let listed = raw.announce.into_iter().map(|entry| entry.0).chain(
            raw.announce_list
                .into_iter()
                .flatten()
                .flatten(),
        );
        for url in listed {
            match TrackerUrl::new(url.as_str()) {
                Ok(tracker) if !trackers.contains(&tracker) => trackers.push(tracker),
                Ok(_) => {}
                Err(err) => debug!(%url, "skipping tracker: {}", err),
            }
        }

        info!(%info_hash, name = info.name(), "parsed metainfo");
        Ok(Self {
            info,
            info_hash,
            trackers,
            created_by: raw.created_by,
            comment: raw.comment,
        })
    }

    /// the first tracker reachable over http.
    pub fn http_tracker(&self) -> Option<&str> {
        self.trackers.iter().find_map(|tracker| match tracker {
            TrackerUrl::Http(url) => Some(url.as_str()),
            TrackerUrl::Udp(_) => None,
        })
    }
}
