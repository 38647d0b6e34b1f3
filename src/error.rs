//! The error types used throughout the engine.
//!
//! Per-peer and per-segment failures never escape the torrent downloader
//! (they're logged and recovered from locally); only startup-time fatal
//! errors and a handful of contract violations are expressed here.

use crate::{PieceIndex, TorrentId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(&'static str),

    #[error("invalid piece index {0}")]
    InvalidPieceIndex(PieceIndex),

    #[error("peer sent a handshake with an invalid protocol string")]
    InvalidHandshake,

    #[error("peer advertised an info hash that doesn't match the torrent")]
    InvalidPeerInfoHash,

    #[error("peer sent a message whose declared length is invalid")]
    InvalidMessageLength,

    #[error("tracker announce failed: {0}")]
    TrackerFailure(String),

    #[error("no usable trackers for torrent {0}")]
    NoUsableTrackers(TorrentId),

    #[error("torrent {0} is not known to the engine")]
    InvalidTorrentId(TorrentId),

    #[error("torrent already exists: {0}")]
    TorrentAlreadyExists(TorrentId),

    #[error("engine channel closed unexpectedly")]
    ChannelClosed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
