use serde::Deserialize;
use std::path::PathBuf;

/// one entry of the `files` list of a multi file torrent.
#[derive(Debug, Clone, Deserialize)]
pub struct FileInfo {
    pub path: Vec<String>,
    pub length: u64,

    #[serde(default)]
    pub md5sum: Option<String>,
}

/// a file of the torrent as laid out on disk, relative to the output directory. files are
/// concatenated in order to form the byte stream the pieces are cut from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub path: PathBuf,
    pub length: u64,
}

/// a path segment from the metainfo that is safe to join onto the output directory.
pub(super) fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
}
