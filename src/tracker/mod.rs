//! Tracker communication: announcing to HTTP and UDP trackers and collecting
//! the peer addresses they return.
//!
//! A torrent may list several trackers (the primary `announce` URL plus
//! everything in `announce-list`). [`TrackerManager`] holds one client per
//! tracker and fans an announce out to all of them concurrently, merging
//! and deduplicating the peer addresses they return.

mod http;
mod udp;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::join_all;

use crate::{error::Result, Error, PeerId, Sha1Hash, TorrentId};

/// The event accompanying a tracker announce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// Sent with the first announce of a torrent's session.
    Started,
    /// The download finished.
    Completed,
    /// The torrent was removed from the engine.
    Stopped,
    /// A regular periodic announce; no event parameter is included.
    None,
}

/// The parameters of an announce request, refreshed by the torrent before
/// each announce.
#[derive(Clone, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

/// What a tracker returned in response to an announce.
#[derive(Clone, Debug, Default)]
pub(crate) struct Response {
    pub peers: Vec<SocketAddr>,
    /// Number of seconds the client should wait before announcing again.
    pub interval: Option<Duration>,
}

/// A single tracker endpoint, either HTTP(S) or UDP.
enum Client {
    Http(http::HttpTracker),
    Udp(udp::UdpTracker),
}

impl Client {
    fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Some(Client::Http(http::HttpTracker::new(url.to_owned())))
        } else if url.starts_with("udp://") {
            udp::UdpTracker::new(url).ok().map(Client::Udp)
        } else {
            log::warn!("Unsupported tracker scheme, skipping: {}", url);
            None
        }
    }

    async fn announce(&mut self, announce: &Announce, timeout: Duration) -> Result<Response> {
        match self {
            Client::Http(c) => c.announce(announce, timeout).await,
            Client::Udp(c) => c.announce(announce, timeout).await,
        }
    }

    fn url(&self) -> &str {
        match self {
            Client::Http(c) => &c.url,
            Client::Udp(c) => &c.url,
        }
    }
}

/// Announces to every one of a torrent's trackers concurrently, merging and
/// deduplicating the peer addresses they return. Trackers that fail are
/// logged and skipped for this announce, but remain eligible on the next
/// call.
pub(crate) struct TrackerManager {
    torrent_id: TorrentId,
    clients: Vec<Client>,
    request_timeout: Duration,
}

impl TrackerManager {
    /// Builds a manager from the torrent's deduplicated tracker URL list.
    /// Returns an error if none of the URLs use a scheme we support.
    pub fn new(
        torrent_id: TorrentId,
        urls: &[String],
        request_timeout: Duration,
    ) -> Result<Self> {
        let clients: Vec<Client> = urls.iter().filter_map(|url| Client::from_url(url)).collect();
        if clients.is_empty() {
            return Err(Error::NoUsableTrackers(torrent_id));
        }
        Ok(Self { torrent_id, clients, request_timeout })
    }

    /// Gathers all clients concurrently, merging and deduplicating the peer
    /// addresses they return. The shortest interval any tracker asked for is
    /// kept, so the next periodic announce honors the most demanding one.
    pub async fn announce(&mut self, announce: Announce) -> Result<Response> {
        let timeout = self.request_timeout;
        let urls: Vec<String> = self.clients.iter().map(|c| c.url().to_owned()).collect();
        let responses =
            join_all(self.clients.iter_mut().map(|client| client.announce(&announce, timeout)))
                .await;

        let mut peers = HashSet::new();
        let mut interval = None;
        let mut last_err = None;
        let mut any_ok = false;
        for (url, result) in urls.into_iter().zip(responses) {
            match result {
                Ok(response) => {
                    any_ok = true;
                    log::info!(
                        "Torrent {} got {} peers from tracker {}",
                        self.torrent_id,
                        response.peers.len(),
                        url
                    );
                    peers.extend(response.peers);
                    if let Some(i) = response.interval {
                        interval = Some(interval.map_or(i, |cur: Duration| cur.min(i)));
                    }
                }
                Err(e) => {
                    log::warn!("Torrent {} announce to {} failed: {}", self.torrent_id, url, e);
                    last_err = Some(e);
                }
            }
        }

        if !any_ok {
            return Err(last_err.unwrap_or(Error::NoUsableTrackers(self.torrent_id)));
        }
        Ok(Response { peers: peers.into_iter().collect(), interval })
    }
}
