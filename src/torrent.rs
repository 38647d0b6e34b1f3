//! The per-torrent controller: owns the rarity map, the set of connected
//! peers, the live segment downloaders, and this torrent's statistics. One
//! instance runs as its own task per torrent the engine manages.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    conf::TorrentConf,
    disk,
    error::{Error, Result},
    listener,
    metainfo::Metainfo,
    peer::{self, InboundHandshake, Message, PeerEvent, PeerHandle},
    piece::RarityQueue,
    segment_download,
    storage_info::StorageInfo,
    tracker::{Announce, Event as TrackerEvent, TrackerManager},
    Bitfield, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// A snapshot of a torrent's progress, returned to callers of
/// [`crate::Engine::torrent_stats`].
#[derive(Clone, Debug)]
pub struct TorrentStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    /// `bitfield[id] == true` iff segment `id` has been verified and
    /// written to disk.
    pub bitfield: Bitfield,
    pub connected_peer_count: usize,
}

/// A request sent to a running torrent downloader.
pub(crate) enum Command {
    /// An inbound connection whose handshake named this torrent's info hash.
    InboundPeer { inbound: InboundHandshake, addr: SocketAddr },
    Stats(oneshot::Sender<TorrentStats>),
    Shutdown,
}

/// Starts a torrent downloader as a background task and registers it with
/// the inbound listener. Returns a handle other engine components use to
/// send it commands.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn spawn(
    id: TorrentId,
    metainfo: Metainfo,
    storage: StorageInfo,
    conf: Arc<TorrentConf>,
    client_id: PeerId,
    listen_port: u16,
    disk_cmds: disk::CommandSender,
    listener_cmds: mpsc::UnboundedSender<listener::Command>,
) -> Result<mpsc::UnboundedSender<Command>> {
    let info_hash = metainfo.info_hash()?;
    let tracker_urls = metainfo.trackers();
    let tracker = TrackerManager::new(id, &tracker_urls, conf.tracker_request_timeout)?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let _ = listener_cmds
        .send(listener::Command::Register { info_hash, torrent: cmd_tx.clone() });

    let downloader = Downloader {
        id,
        info_hash,
        storage,
        conf,
        client_id,
        listen_port,
        disk_cmds,
        listener_cmds,
        tracker,
        peers: HashMap::new(),
        busy_peers: HashSet::new(),
        rarity: RarityQueue::new(),
        active_segments: HashMap::new(),
        segment_peers: HashMap::new(),
        downloaded: 0,
        uploaded: 0,
        bitfield: Bitfield::repeat(false, metainfo.segment_count()),
        segment_hashes: metainfo
            .segment_hashes()?
            .into_iter()
            .flatten()
            .collect(),
    };

    tokio::spawn(async move {
        downloader.run(cmd_rx).await;
    });

    Ok(cmd_tx)
}

/// How a just-finished segment download concluded, reported back from its
/// task to the torrent loop.
enum SegmentCompletion {
    Done { segment_id: PieceIndex, outcome: segment_download::Outcome },
}

struct Downloader {
    id: TorrentId,
    info_hash: Sha1Hash,
    storage: StorageInfo,
    conf: Arc<TorrentConf>,
    client_id: PeerId,
    listen_port: u16,
    disk_cmds: disk::CommandSender,
    listener_cmds: mpsc::UnboundedSender<listener::Command>,
    tracker: TrackerManager,

    /// Every connected peer's last known bitfield.
    peers: HashMap<PeerHandle, Bitfield>,
    /// Peers currently lent to a segment downloader; excluded from being
    /// assigned to a second one concurrently.
    busy_peers: HashSet<PeerHandle>,
    rarity: RarityQueue,
    active_segments: HashMap<PieceIndex, mpsc::UnboundedSender<segment_download::Event>>,
    /// The peers lent to each active segment downloader, so completion can
    /// free exactly those peers rather than every currently busy one.
    segment_peers: HashMap<PieceIndex, Vec<PeerHandle>>,

    downloaded: u64,
    uploaded: u64,
    /// `true` at index `id` once segment `id` is verified and on disk.
    bitfield: Bitfield,
    /// Flat, concatenated 20-byte SHA-1 hashes, one per segment.
    segment_hashes: Vec<u8>,
}

impl Downloader {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        log::info!("Starting torrent {} downloader", self.id);

        if let Err(e) = self.resume_scan().await {
            log::warn!("Torrent {} resume scan failed: {}", self.id, e);
        }

        let (peer_events_tx, mut peer_events) = mpsc::unbounded_channel::<PeerEvent>();
        let (completions_tx, mut completions) = mpsc::unbounded_channel::<SegmentCompletion>();
        let (needs_peer_tx, mut needs_peer_rx) = mpsc::unbounded_channel::<PieceIndex>();

        let mut announce_interval = match self.announce(TrackerEvent::Started, &peer_events_tx).await {
            Ok(interval) => interval,
            Err(e) => {
                log::warn!("Torrent {} initial announce failed: {}", self.id, e);
                self.conf.announce_interval
            }
        };

        loop {
            self.schedule_segments(&completions_tx, &needs_peer_tx);

            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::InboundPeer { inbound, addr }) => {
                            self.accept_inbound(inbound, addr, peer_events_tx.clone()).await;
                        }
                        Some(Command::Stats(reply)) => {
                            let _ = reply.send(self.stats());
                        }
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down torrent {} downloader", self.id);
                            break;
                        }
                    }
                }
                event = peer_events.recv() => {
                    if let Some(event) = event {
                        self.on_peer_event(event).await;
                    }
                }
                completion = completions.recv() => {
                    if let Some(SegmentCompletion::Done { segment_id, outcome }) = completion {
                        self.on_segment_complete(segment_id, outcome);
                    }
                }
                segment_id = needs_peer_rx.recv() => {
                    if let Some(segment_id) = segment_id {
                        self.replace_peer_for_segment(segment_id);
                    }
                }
                // recreated fresh each pass so the wait is always measured
                // from the end of the last announce, honoring whatever
                // interval the tracker asked for
                _ = tokio::time::delay_for(announce_interval) => {
                    match self.announce(TrackerEvent::None, &peer_events_tx).await {
                        Ok(interval) => announce_interval = interval,
                        Err(e) => log::warn!("Torrent {} periodic announce failed: {}", self.id, e),
                    }
                }
            }
        }

        let _ = self.announce(TrackerEvent::Stopped, &peer_events_tx).await;
        let _ = self.listener_cmds.send(listener::Command::Deregister { info_hash: self.info_hash });
        for peer in self.peers.keys() {
            peer.shutdown();
        }
    }

    /// Checks every segment's on-disk bytes against its expected hash so a
    /// restarted download resumes instead of re-fetching verified data.
    async fn resume_scan(&mut self) -> Result<()> {
        for id in 0..self.storage.piece_count {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.disk_cmds
                .send(disk::Command::CheckSegment { id: self.id, segment_id: id, reply: reply_tx })?;
            match reply_rx.await {
                Ok(Ok(true)) => {
                    self.bitfield.set(id, true);
                    self.downloaded += self.storage.piece_len(id).unwrap_or(0) as u64;
                }
                Ok(Ok(false)) | Ok(Err(_)) => {}
                Err(_) => return Err(Error::ChannelClosed),
            }
        }
        log::info!(
            "Torrent {} resume scan found {}/{} segments already complete",
            self.id,
            self.bitfield.count_ones(),
            self.storage.piece_count
        );
        Ok(())
    }

    fn left(&self) -> u64 {
        let complete: u64 = (0..self.bitfield.len())
            .filter(|&id| self.bitfield[id])
            .map(|id| self.storage.piece_len(id).unwrap_or(0) as u64)
            .sum();
        self.storage.download_len.saturating_sub(complete)
    }

    fn stats(&self) -> TorrentStats {
        TorrentStats {
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            left: self.left(),
            bitfield: self.bitfield.clone(),
            connected_peer_count: self.peers.len(),
        }
    }

    /// Announces to the torrent's trackers and dials any newly learned peer
    /// addresses. Returns the interval the next periodic announce should
    /// wait for - whatever the trackers asked for, or the configured
    /// default if none did.
    async fn announce(
        &mut self,
        event: TrackerEvent,
        peer_events: &mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<std::time::Duration> {
        let announce = Announce {
            info_hash: self.info_hash,
            peer_id: self.client_id,
            port: self.listen_port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.left(),
            event,
        };
        let response = self.tracker.announce(announce).await?;
        log::info!("Torrent {} got {} peer addresses from tracker", self.id, response.peers.len());

        for addr in response.peers {
            if self.peers.len() >= self.conf.max_connected_peer_count {
                break;
            }
            if self.peers.keys().any(|p| p.addr() == addr) {
                continue;
            }
            self.dial(addr, peer_events.clone());
        }
        Ok(response.interval.unwrap_or(self.conf.announce_interval))
    }

    fn dial(&self, addr: SocketAddr, peer_events: mpsc::UnboundedSender<PeerEvent>) {
        let info_hash = self.info_hash;
        let client_id = self.client_id;
        let handshake_timeout = self.conf.tracker_request_timeout;
        let bitfield = self.bitfield.clone();
        tokio::spawn(async move {
            match peer::connect(addr, info_hash, client_id, handshake_timeout, peer_events.clone())
                .await
            {
                Ok(handle) => {
                    // send our bitfield immediately, even if it's all zeroes;
                    // the connection otherwise announces itself via its own
                    // bitfield / disconnect events
                    let _ = handle.send(Message::Bitfield(bitfield));
                }
                Err(e) => log::debug!("Failed to connect to peer {}: {}", addr, e),
            }
        });
    }

    async fn accept_inbound(
        &mut self,
        inbound: InboundHandshake,
        addr: SocketAddr,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) {
        if self.peers.len() >= self.conf.max_connected_peer_count {
            log::debug!("Rejecting inbound peer {}, torrent {} is at capacity", addr, self.id);
            return;
        }
        let info_hash = self.info_hash;
        let client_id = self.client_id;
        let bitfield = self.bitfield.clone();
        tokio::spawn(async move {
            match peer::accept(inbound, addr, info_hash, client_id, peer_events).await {
                Ok(handle) => {
                    let _ = handle.send(Message::Bitfield(bitfield));
                }
                Err(e) => log::debug!("Inbound handshake with {} failed: {}", addr, e),
            }
        });
    }

    /// Closes the connection if `peer` hasn't unchoked us within
    /// `unchoke_timeout` of us declaring interest in it.
    fn spawn_unchoke_watchdog(&self, peer: PeerHandle) {
        let timeout = self.conf.unchoke_timeout;
        let torrent_id = self.id;
        tokio::spawn(async move {
            tokio::time::delay_for(timeout).await;
            if peer.is_choked() {
                log::debug!(
                    "Torrent {} closing peer {}: never unchoked us within {:?}",
                    torrent_id,
                    peer.addr(),
                    timeout
                );
                peer.shutdown();
            }
        });
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Bitfield { peer, bitfield } => {
                self.update_rarity_for_new_bitfield(&bitfield);
                self.peers.insert(peer.clone(), bitfield);
                // interested as soon as the peer has anything we're missing
                let _ = peer.send(Message::Interested);
                self.spawn_unchoke_watchdog(peer);
            }
            PeerEvent::Have { peer, index } => {
                if let Some(bits) = self.peers.get_mut(&peer) {
                    if index < bits.len() && !bits[index] {
                        bits.set(index, true);
                        if index >= self.bitfield.len() || !self.bitfield[index] {
                            let current = self.count_owners(index);
                            self.rarity.set_rarity(index, current);
                        }
                    }
                }
            }
            PeerEvent::Unchoked { .. } | PeerEvent::Choked { .. } => {
                // tracked on the peer handle itself; scheduling re-evaluates
                // choke state on its own each tick
            }
            PeerEvent::Interested { peer } => {
                // simple policy: always unchoke an interested peer
                let _ = peer.send(Message::Unchoke);
            }
            PeerEvent::NotInterested { .. } => {}
            PeerEvent::Block { peer, block, data } => {
                if let Some(sender) = self.active_segments.get(&block.piece_index) {
                    let _ = sender.send(segment_download::Event::Block { peer, block, data });
                }
            }
            PeerEvent::Requested { peer, block } => {
                self.serve_upload(peer, block).await;
            }
            PeerEvent::Disconnected { peer, cause } => {
                log::debug!("Torrent {} lost peer {}: {:?}", self.id, peer.addr(), cause);
                self.peers.remove(&peer);
                if self.busy_peers.remove(&peer) {
                    for (segment_id, peers) in self.segment_peers.iter_mut() {
                        if let Some(pos) = peers.iter().position(|p| p == &peer) {
                            peers.remove(pos);
                            if let Some(sender) = self.active_segments.get(segment_id) {
                                let _ =
                                    sender.send(segment_download::Event::RemovePeer(peer.clone()));
                            }
                        }
                    }
                }
            }
        }
    }

    async fn serve_upload(&mut self, peer: PeerHandle, block: crate::BlockInfo) {
        // only serve a peer we've unchoked and that has declared interest in us
        if peer.is_choking_peer() || !peer.is_peer_interested() {
            return;
        }
        if block.piece_index >= self.bitfield.len() || !self.bitfield[block.piece_index] {
            return;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .disk_cmds
            .send(disk::Command::ReadSegment { id: self.id, segment_id: block.piece_index, reply: reply_tx })
            .is_err()
        {
            return;
        }
        if let Ok(Ok(segment_data)) = reply_rx.await {
            let start = block.offset as usize;
            let end = (start + block.len as usize).min(segment_data.len());
            if start < end {
                let data = segment_data[start..end].to_vec();
                self.uploaded += data.len() as u64;
                let _ = peer.send(Message::Piece {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data,
                });
            }
        }
    }

    fn update_rarity_for_new_bitfield(&mut self, bitfield: &Bitfield) {
        for id in 0..self.storage.piece_count {
            if id < self.bitfield.len() && self.bitfield[id] {
                continue; // already have it, never schedule it
            }
            if id < bitfield.len() && bitfield[id] {
                let count = self.count_owners(id) + 1;
                self.rarity.set_rarity(id, count);
            }
        }
    }

    fn count_owners(&self, segment: PieceIndex) -> u32 {
        self.peers.values().filter(|bf| segment < bf.len() && bf[segment]).count() as u32
    }

    /// Starts new segment downloaders while there is spare concurrency and
    /// idle peers that have something rare to offer.
    fn schedule_segments(
        &mut self,
        completions: &mpsc::UnboundedSender<SegmentCompletion>,
        needs_peer: &mpsc::UnboundedSender<PieceIndex>,
    ) {
        while self.active_segments.len() < self.conf.max_concurrent_segments {
            if self.rarity.is_empty() {
                break;
            }
            let segment_id = self.rarity.pop();
            if segment_id < self.bitfield.len() && self.bitfield[segment_id] {
                continue; // completed via another path since being queued
            }

            let owners: Vec<PeerHandle> = self
                .peers
                .iter()
                .filter(|(peer, bf)| {
                    !self.busy_peers.contains(*peer) && segment_id < bf.len() && bf[segment_id]
                })
                .take(self.conf.peers_per_segment)
                .map(|(peer, _)| peer.clone())
                .collect();

            if owners.is_empty() {
                // no free peer has it right now; put it back for later
                self.rarity.set_rarity(segment_id, self.count_owners(segment_id));
                break;
            }

            for peer in &owners {
                self.busy_peers.insert(peer.clone());
            }
            self.segment_peers.insert(segment_id, owners.clone());

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            self.active_segments.insert(segment_id, events_tx);

            let segment_len = match self.storage.piece_len(segment_id) {
                Ok(len) => len,
                Err(_) => continue,
            };
            let expected_hash = self.expected_hash(segment_id);
            let torrent_id = self.id;
            let disk_cmds = self.disk_cmds.clone();
            let conf = Arc::clone(&self.conf);
            let completions = completions.clone();
            let needs_peer = needs_peer.clone();

            tokio::spawn(async move {
                let (segment_id, outcome) = segment_download::run(
                    torrent_id,
                    segment_id,
                    segment_len,
                    expected_hash,
                    owners,
                    events_rx,
                    needs_peer,
                    disk_cmds,
                    conf,
                )
                .await;
                let _ = completions.send(SegmentCompletion::Done { segment_id, outcome });
            });
        }
    }

    fn expected_hash(&self, segment_id: PieceIndex) -> Sha1Hash {
        let start = segment_id * 20;
        let mut hash = [0u8; 20];
        if let Some(bytes) = self.segment_hashes.get(start..start + 20) {
            hash.copy_from_slice(bytes);
        }
        hash
    }

    /// A segment downloader lost a peer (disconnect, eviction, or a dead
    /// send channel) and asked for a substitute. Lends it another idle owner
    /// of the same segment, if one is connected and free, rather than
    /// letting the downloader run dry and restart the whole segment.
    fn replace_peer_for_segment(&mut self, segment_id: PieceIndex) {
        let Some(sender) = self.active_segments.get(&segment_id) else { return };
        let already_lent = self.segment_peers.get(&segment_id);
        let candidate = self
            .peers
            .iter()
            .find(|(peer, bf)| {
                !self.busy_peers.contains(*peer)
                    && segment_id < bf.len()
                    && bf[segment_id]
                    && already_lent.map_or(true, |lent| !lent.contains(peer))
            })
            .map(|(peer, _)| peer.clone());

        if let Some(peer) = candidate {
            log::debug!(
                "Torrent {} lending replacement peer {} to segment {}",
                self.id,
                peer.addr(),
                segment_id
            );
            self.busy_peers.insert(peer.clone());
            self.segment_peers.entry(segment_id).or_default().push(peer.clone());
            let _ = sender.send(segment_download::Event::AddPeer(peer));
        }
    }

    fn on_segment_complete(&mut self, segment_id: PieceIndex, outcome: segment_download::Outcome) {
        self.active_segments.remove(&segment_id);
        if let Some(peers) = self.segment_peers.remove(&segment_id) {
            for peer in peers {
                self.busy_peers.remove(&peer);
            }
        }

        match outcome {
            segment_download::Outcome::Success => {
                self.bitfield.set(segment_id, true);
                self.downloaded += self.storage.piece_len(segment_id).unwrap_or(0) as u64;
                for peer in self.peers.keys() {
                    let _ = peer.send(Message::Have { piece_index: segment_id });
                }
                log::info!("Torrent {} completed segment {}", self.id, segment_id);
            }
            segment_download::Outcome::HashMismatch | segment_download::Outcome::NoPeersLeft => {
                log::warn!(
                    "Torrent {} segment {} failed ({:?}), re-queueing",
                    self.id, segment_id, outcome
                );
                let rarity = self.count_owners(segment_id);
                if rarity > 0 {
                    self.rarity.set_rarity(segment_id, rarity);
                }
            }
        }
    }
}
