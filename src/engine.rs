//! The crate's public facade: owns the shared disk actor, the single
//! inbound listener, and every running torrent downloader, and hands out
//! [`TorrentId`]s for callers to address them by.

use std::{collections::HashMap, time::Duration};

use tokio::sync::{mpsc, oneshot};

use crate::{
    conf::{Conf, TorrentConf},
    disk, listener,
    error::{Error, Result},
    metainfo::Metainfo,
    storage_info::StorageInfo,
    torrent, PieceIndex, TorrentId, TorrentStats,
};

/// How long the shared inbound listener waits for a peer's handshake before
/// dropping the connection. Not part of [`TorrentConf`] since the listener
/// is bound once for the whole engine, before any torrent config exists.
const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A notification the engine surfaces to its owner for conditions that
/// can't be folded into a `Result` return, because they happen after the
/// call that triggered them has already returned.
#[derive(Debug)]
pub enum EngineAlert {
    /// A segment failed to write to disk; the write will not be retried
    /// automatically.
    SegmentWriteFailed { id: TorrentId, segment_id: PieceIndex, error: String },
}

struct TorrentHandle {
    commands: mpsc::UnboundedSender<torrent::Command>,
}

/// The engine: the crate's single composition root and public entry point.
///
/// Owns the shared disk actor, the inbound connection listener, and a
/// `TorrentId -> TorrentHandle` map. Dropping the engine does not cancel
/// any of its spawned tasks; call [`Engine::shutdown`] for an orderly stop.
pub struct Engine {
    conf: Conf,
    disk_cmds: disk::CommandSender,
    listener_cmds: mpsc::UnboundedSender<listener::Command>,
    torrents: HashMap<TorrentId, TorrentHandle>,
    next_id: TorrentId,
}

impl Engine {
    /// Spawns the disk actor and the inbound listener and returns the
    /// engine along with the channel on which it reports alerts.
    pub async fn new(conf: Conf) -> Result<(Self, mpsc::UnboundedReceiver<EngineAlert>)> {
        let (disk_cmds, mut disk_alerts) = disk::spawn();
        let listener_cmds = listener::spawn(conf.engine.listen_port, INBOUND_HANDSHAKE_TIMEOUT).await?;

        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(alert) = disk_alerts.recv().await {
                match alert {
                    disk::Alert::SegmentWritten { id, segment_id, result: Err(error) } => {
                        let _ = alert_tx.send(EngineAlert::SegmentWriteFailed { id, segment_id, error });
                    }
                    disk::Alert::SegmentWritten { result: Ok(()), .. } => {}
                }
            }
        });

        Ok((
            Self { conf, disk_cmds, listener_cmds, torrents: HashMap::new(), next_id: 0 },
            alert_rx,
        ))
    }

    /// Parses `metainfo`, preallocates its files, and starts downloading
    /// (or seeding, if already complete) it as a new torrent. Returns the
    /// id the caller can use to address it in future calls.
    pub async fn create_torrent(
        &mut self,
        metainfo: Metainfo,
        torrent_conf: TorrentConf,
    ) -> Result<TorrentId> {
        let download_dir = torrent_conf.download_dir.clone();
        let storage = StorageInfo::new(&metainfo, download_dir)?;
        let segment_hashes_nested = metainfo.segment_hashes()?;
        let mut segment_hashes = Vec::with_capacity(segment_hashes_nested.len() * 20);
        for hash in &segment_hashes_nested {
            segment_hashes.extend_from_slice(hash);
        }

        let id = self.next_id;
        self.next_id += 1;
        let open_file_lru_size = torrent_conf.open_file_lru_size;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.disk_cmds.send(disk::Command::Open {
            id,
            info: storage.clone(),
            segment_hashes,
            open_file_lru_size,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| Error::ChannelClosed)??;

        let commands = torrent::spawn(
            id,
            metainfo,
            storage,
            std::sync::Arc::new(torrent_conf),
            self.conf.engine.client_id,
            self.conf.engine.listen_port,
            self.disk_cmds.clone(),
            self.listener_cmds.clone(),
        )
        .await?;

        self.torrents.insert(id, TorrentHandle { commands });
        Ok(id)
    }

    /// Returns a snapshot of a torrent's progress.
    pub async fn torrent_stats(&self, id: TorrentId) -> Result<TorrentStats> {
        let handle = self.torrents.get(&id).ok_or(Error::InvalidTorrentId(id))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle.commands.send(torrent::Command::Stats(reply_tx))?;
        reply_rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Stops downloading/seeding a torrent and drops its disk state. The
    /// torrent's already-downloaded files are left on disk.
    pub fn remove_torrent(&mut self, id: TorrentId) -> Result<()> {
        let handle = self.torrents.remove(&id).ok_or(Error::InvalidTorrentId(id))?;
        let _ = handle.commands.send(torrent::Command::Shutdown);
        let _ = self.disk_cmds.send(disk::Command::RemoveTorrent { id });
        Ok(())
    }

    /// Shuts down every torrent, then the listener, then the disk actor.
    pub fn shutdown(mut self) {
        let ids: Vec<TorrentId> = self.torrents.keys().copied().collect();
        for id in ids {
            let _ = self.remove_torrent(id);
        }
        let _ = self.listener_cmds.send(listener::Command::Shutdown);
        let _ = self.disk_cmds.send(disk::Command::Shutdown);
    }
}
