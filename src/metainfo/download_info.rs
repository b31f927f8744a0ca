use super::files::{is_safe_segment, FileInfo, TorrentFile};
use crate::piece_picker::{PieceHash, PieceLayout};
use crate::peers::PieceLength;
use serde::Deserialize;
use std::path::PathBuf;

/// the `info` dictionary of a torrent.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DownloadInfo {
    MultiFile {
        #[serde(rename = "name")]
        dirname: String,

        files: Vec<FileInfo>,

        #[serde(rename = "piece length")]
        piece_length: u64,

        #[serde(with = "piece_hashes_parser")]
        pieces: Vec<PieceHash>,

        #[serde(default)]
        private: Option<i64>,
    },

    SingleFile {
        #[serde(rename = "name")]
        filename: String,
        length: u64,

        #[serde(default)]
        md5sum: Option<String>,

        #[serde(rename = "piece length")]
        piece_length: u64,

        #[serde(with = "piece_hashes_parser")]
        pieces: Vec<PieceHash>,

        #[serde(default)]
        private: Option<i64>,
    },
}

impl DownloadInfo {
    pub fn name(&self) -> &str {
        match self {
            Self::MultiFile { dirname, .. } => dirname,
            Self::SingleFile { filename, .. } => filename,
        }
    }

    pub fn piece_length(&self) -> u64 {
        match self {
            Self::MultiFile { piece_length, .. } | Self::SingleFile { piece_length, .. } => {
                *piece_length
            }
        }
    }

    pub fn piece_hashes(&self) -> &[PieceHash] {
        match self {
            Self::MultiFile { pieces, .. } | Self::SingleFile { pieces, .. } => pieces,
        }
    }

    pub fn total_length(&self) -> u64 {
        match self {
            Self::SingleFile { length, .. } => *length,
            Self::MultiFile { files, .. } => files.iter().map(|file| file.length).sum(),
        }
    }

    pub fn is_private(&self) -> bool {
        match self {
            Self::MultiFile { private, .. } | Self::SingleFile { private, .. } => {
                *private == Some(1)
            }
        }
    }

    /// files in torrent order, relative to the output directory. multi file torrents live in a
    /// directory named after the torrent.
    pub fn files(&self) -> Vec<TorrentFile> {
        match self {
            Self::SingleFile {
                filename, length, ..
            } => vec![TorrentFile {
                path: PathBuf::from(filename),
                length: *length,
            }],
            Self::MultiFile { dirname, files, .. } => files
                .iter()
                .map(|file| TorrentFile {
                    path: std::iter::once(dirname)
                        .chain(file.path.iter())
                        .collect::<PathBuf>(),
                    length: file.length,
                })
                .collect(),
        }
    }

    pub fn layout(&self) -> anyhow::Result<PieceLayout> {
        let piece_length = PieceLength::try_from(self.piece_length())
            .ok()
            .filter(|length| *length > 0)
            .ok_or_else(|| anyhow::anyhow!("invalid piece length {}", self.piece_length()))?;
        Ok(PieceLayout::new(piece_length, self.total_length()))
    }

    /// reject torrents the rest of the client can't work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !is_safe_segment(self.name()) {
            anyhow::bail!("unsafe torrent name {:?}", self.name());
        }
        if let Self::MultiFile { files, .. } = self {
            if files.is_empty() {
                anyhow::bail!("multi file torrent without files");
            }
            if let Some(file) = files
                .iter()
                .find(|file| file.path.is_empty() || !file.path.iter().all(|s| is_safe_segment(s)))
            {
                anyhow::bail!("unsafe file path {:?}", file.path);
            }
        }
        if self.total_length() == 0 {
            anyhow::bail!("torrent has no content");
        }

        let layout = self.layout()?;
        if layout.piece_count() != self.piece_hashes().len() {
            anyhow::bail!(
                "torrent lists {} piece hashes for {} pieces",
                self.piece_hashes().len(),
                layout.piece_count()
            );
        }
        Ok(())
    }
}

mod piece_hashes_parser {
    use crate::piece_picker::PieceHash;
    use serde::de::{self, Visitor};
    use static_str_ops::static_format;
    const HASH_SIZE: usize = std::mem::size_of::<PieceHash>();

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<PieceHash>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_bytes(PieceHashVisitor)
    }

    struct PieceHashVisitor;
    impl<'de> Visitor<'de> for PieceHashVisitor {
        type Value = Vec<PieceHash>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str(static_format!(
                "a byte sequence whose length is a multiple of {}",
                HASH_SIZE
            ))
        }

        fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let chunks = bytes.chunks_exact(HASH_SIZE);
            if !chunks.remainder().is_empty() {
                return Err(E::custom(static_format!(
                    "piece hashes should be a multiple of length {}",
                    HASH_SIZE
                )));
            }

            Ok(chunks
                .map(|chunk| {
                    let mut hash = [0; HASH_SIZE];
                    hash.copy_from_slice(chunk);
                    hash
                })
                .collect())
        }
    }
}
