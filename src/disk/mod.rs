//! The disk actor: the only part of the engine that touches the file
//! system. It runs as its own task so that segment hashing and vectored
//! file writes - both potentially blocking - never stall the peer I/O
//! event loop.

mod io;

use tokio::sync::{mpsc, oneshot};

use crate::{error::Result, storage_info::StorageInfo, PieceIndex, TorrentId};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

/// A request sent to the disk actor.
pub(crate) enum Command {
    /// Preallocates a torrent's files and registers it with the disk actor.
    /// Tolerates a download directory that already exists (a resumed
    /// download).
    Open {
        id: TorrentId,
        info: StorageInfo,
        /// All segment SHA-1 hashes, concatenated in order (20 bytes each).
        segment_hashes: Vec<u8>,
        /// The number of file descriptors kept open at once for this
        /// torrent; beyond this the least recently used is closed and
        /// reopened on demand.
        open_file_lru_size: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Writes an already hash-verified segment to the files it overlaps.
    WriteSegment { id: TorrentId, segment_id: PieceIndex, data: Vec<u8> },
    /// Reads a segment's bytes back from disk, to serve an upload request.
    ReadSegment {
        id: TorrentId,
        segment_id: PieceIndex,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// Reads a segment back and checks it against its expected hash; used
    /// once per segment at startup to resume a partial download.
    CheckSegment {
        id: TorrentId,
        segment_id: PieceIndex,
        reply: oneshot::Sender<Result<bool>>,
    },
    /// Drops a torrent's open file handles. The files themselves are left
    /// on disk.
    RemoveTorrent { id: TorrentId },
    Shutdown,
}

/// An event the disk actor reports back to the engine/torrent.
#[derive(Debug)]
pub(crate) enum Alert {
    SegmentWritten { id: TorrentId, segment_id: PieceIndex, result: std::result::Result<(), String> },
}

/// Spawns the disk actor as a background task and returns a handle to send
/// it commands, plus the channel on which it reports write outcomes.
pub(crate) fn spawn() -> (CommandSender, AlertReceiver) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (alert_tx, alert_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut disk = io::Disk::new(cmd_rx, alert_tx);
        disk.run().await;
    });
    (cmd_tx, alert_rx)
}
