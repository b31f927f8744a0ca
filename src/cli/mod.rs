use clap::{self, value_parser, Parser};
use std::path::PathBuf;

pub mod metainfo_file_path;
use metainfo_file_path::MetainfoFilePath;

#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
/// a cli bittorrent (v1) client written in rust.
pub struct Cli {
    #[arg(required = true)]
    /// the source for the torrent information, i.e a torrent file.
    /// torrent files must have the .torrent extention
    pub source: MetainfoFilePath,

    #[arg(short, long, default_value = "8860")]
    /// the port reported to the tracker for incoming connections.
    pub port: u16,

    #[arg(short, long, default_value = ".")]
    /// directory the downloaded files are written into.
    pub output: PathBuf,

    #[arg(long, default_value = "30", value_parser = value_parser!(u32).range(1..))]
    /// maximum number of peers to download from at once.
    pub max_peers: u32,

    #[arg(long, default_value = "5", value_parser = value_parser!(u32).range(1..))]
    /// block requests kept in flight per peer.
    pub pipeline: u32,

    #[arg(long, default_value = "30", value_parser = value_parser!(u64).range(1..))]
    /// seconds before an unanswered block request is handed to another peer.
    pub request_timeout_secs: u64,

    #[arg(long, default_value = "10", value_parser = value_parser!(u64).range(1..))]
    /// seconds allowed for connecting to a peer and for its handshake.
    pub connect_timeout_secs: u64,

    #[arg(long, default_value = "3", value_parser = value_parser!(u32).range(1..))]
    /// times a peer address is tried before giving up on it.
    pub connect_attempts: u32,

    #[arg(long, default_value = "90", value_parser = value_parser!(u64).range(1..))]
    /// seconds between keepalive messages.
    pub keepalive_secs: u64,
}
