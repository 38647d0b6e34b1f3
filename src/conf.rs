//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default torrentine client id.
pub const TORRENTINE_CLIENT_ID: &PeerId = b"-TN0100-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default torrentine client id,
    /// [`TORRENTINE_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *TORRENTINE_CLIENT_ID,
                listen_port: 6881,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The TCP port on which the inbound listener accepts peer connections.
    pub listen_port: u16,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// The max number of segment downloaders running concurrently.
    pub max_concurrent_segments: usize,

    /// The max number of in-flight (pending) block requests per segment
    /// downloader, summed across all its peers.
    pub max_pending_blocks_per_segment: usize,

    /// The number of peers assigned to a single segment downloader.
    pub peers_per_segment: usize,

    /// The number of timed-out block requests a peer may accumulate within a
    /// single segment download before it is dropped.
    pub strike_threshold: u32,

    /// How long a pending block request may remain unanswered before it
    /// reverts to missing and is requestable again.
    pub block_timeout: Duration,

    /// How long we wait for a peer to unchoke us after declaring interest.
    pub unchoke_timeout: Duration,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to this.
    pub announce_interval: Duration,

    /// The tracker HTTP/UDP request timeout.
    pub tracker_request_timeout: Duration,

    /// The delay between tracker retry attempts after a transient failure.
    pub tracker_retry_backoff: Duration,

    /// The number of open file descriptors the disk layer keeps cached for
    /// a torrent with many small files.
    pub open_file_lru_size: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_connected_peer_count: 50,
            max_concurrent_segments: 5,
            max_pending_blocks_per_segment: 5,
            peers_per_segment: 2,
            strike_threshold: 5,
            block_timeout: Duration::from_secs(2),
            unchoke_timeout: Duration::from_secs(10),
            announce_interval: Duration::from_secs(60),
            tracker_request_timeout: Duration::from_secs(10),
            tracker_retry_backoff: Duration::from_secs(10),
            open_file_lru_size: 10,
        }
    }
}
