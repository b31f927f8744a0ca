use std::io::{self, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::metainfo::TorrentFile;
use crate::peers::{BlockLength, BlockOffset, PieceIndex};
use crate::piece_picker::{PieceDone, PieceLayout};
use crate::prelude::*;

/// a block read on behalf of a session serving a peer request.
#[derive(Debug)]
pub struct ReadBlock {
    pub index: PieceIndex,
    pub begin: BlockOffset,
    pub length: BlockLength,
    pub reply: oneshot::Sender<io::Result<Vec<u8>>>,
}

/// cloneable handle sessions use to read verified data back from disk.
#[derive(Debug, Clone)]
pub struct StorageHandle {
    read_tx: mpsc::Sender<ReadBlock>,
}

impl StorageHandle {
    pub fn new(read_tx: mpsc::Sender<ReadBlock>) -> Self {
        Self { read_tx }
    }

    pub async fn read_block(
        &self,
        index: PieceIndex,
        begin: BlockOffset,
        length: BlockLength,
    ) -> io::Result<Vec<u8>> {
        let (reply, reply_rx) = oneshot::channel();
        self.read_tx
            .send(ReadBlock {
                index,
                begin,
                length,
                reply,
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "storage has shut down"))?;

        reply_rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "storage dropped the read"))?
    }
}

#[derive(Debug)]
struct StorageFile {
    path: PathBuf,
    /// where the file starts in the concatenated torrent data.
    offset: u64,
    length: u64,
}

/// part of a byte range of the torrent that falls inside one file.
#[derive(Debug, PartialEq, Eq)]
struct Span<'a> {
    path: &'a Path,
    file_offset: u64,
    buf: Range<usize>,
}

/// persistence actor. owns every file of the torrent, writes each verified piece it is handed
/// and serves block reads. stops once every [`crate::piece_picker::PiecePickerHandle`] is gone.
#[derive(Debug)]
pub struct Storage {
    files: Vec<StorageFile>,
    layout: PieceLayout,
    piece_rx: mpsc::UnboundedReceiver<PieceDone>,
    read_rx: mpsc::Receiver<ReadBlock>,
}

impl Storage {
    const READ_BUFFER_SIZE: usize = 32;

    /// create (or reuse) every file under `root` at its full length.
    pub async fn create(
        root: impl AsRef<Path>,
        files: &[TorrentFile],
        layout: PieceLayout,
        piece_rx: mpsc::UnboundedReceiver<PieceDone>,
    ) -> anyhow::Result<(Self, StorageHandle)> {
        let root = root.as_ref();
        let mut storage_files = Vec::with_capacity(files.len());
        let mut offset = 0;

        for file in files {
            let path = root.join(&file.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("could not create directory {}", parent.display()))?;
            }

            let handle = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .await
                .with_context(|| format!("could not create file {}", path.display()))?;
            handle.set_len(file.length).await?;
            debug!(path = %path.display(), length = file.length, "file ready");

            storage_files.push(StorageFile {
                path,
                offset,
                length: file.length,
            });
            offset += file.length;
        }

        if offset != layout.total_length() {
            anyhow::bail!(
                "files add up to {} bytes but the torrent has {}",
                offset,
                layout.total_length()
            );
        }

        let (read_tx, read_rx) = mpsc::channel(Self::READ_BUFFER_SIZE);
        let storage = Self {
            files: storage_files,
            layout,
            piece_rx,
            read_rx,
        };
        Ok((storage, StorageHandle::new(read_tx)))
    }

    #[instrument(name = "storage", level = "info", skip_all)]
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                // pending writes go first so reads see every piece handed over before them.
                biased;

                piece = self.piece_rx.recv() => {
                    let Some(PieceDone { index, piece }) = piece else {
                        debug!("no more pieces will arrive, stopping");
                        return Ok(());
                    };
                    self.write_piece(index, &piece)
                        .await
                        .with_context(|| format!("could not write piece {}", index))?;
                    debug!(index, "piece written");
                }

                Some(read) = self.read_rx.recv() => {
                    let block = self.read_block(read.index, read.begin, read.length).await;
                    if let Err(err) = &block {
                        warn!(index = read.index, begin = read.begin, "block read failed: {}", err);
                    }
                    // the session may have closed in the meantime.
                    let _ = read.reply.send(block);
                }
            }
        }
    }

    async fn write_piece(&self, index: PieceIndex, piece: &[u8]) -> io::Result<()> {
        let start = self.layout.piece_offset(index);
        for span in self.spans(start, piece.len()) {
            let mut file = OpenOptions::new().write(true).open(span.path).await?;
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.write_all(&piece[span.buf]).await?;
            file.flush().await?;
        }
        Ok(())
    }

    async fn read_block(
        &self,
        index: PieceIndex,
        begin: BlockOffset,
        length: BlockLength,
    ) -> io::Result<Vec<u8>> {
        let start = self.layout.piece_offset(index) + begin as u64;
        if start + length as u64 > self.layout.total_length() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block reaches past the end of the torrent",
            ));
        }

        let mut block = vec![0; length as usize];
        for span in self.spans(start, block.len()) {
            let mut file = fs::File::open(span.path).await?;
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.read_exact(&mut block[span.buf]).await?;
        }
        Ok(block)
    }

    /// split `len` bytes starting at torrent offset `start` into per file pieces.
    fn spans(&self, start: u64, len: usize) -> Vec<Span<'_>> {
        let end = start + len as u64;
        self.files
            .iter()
            .filter(|file| file.length > 0)
            .filter_map(|file| {
                let file_end = file.offset + file.length;
                let from = start.max(file.offset);
                let to = end.min(file_end);
                (from < to).then(|| Span {
                    path: &file.path,
                    file_offset: from - file.offset,
                    buf: (from - start) as usize..(to - start) as usize,
                })
            })
            .collect()
    }
}
