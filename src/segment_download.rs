//! Downloads a single segment: requests its blocks from whichever peers
//! were assigned to it, reaps timed-out requests, strikes uncooperative
//! peers, and once every block has arrived, verifies and hands the
//! assembled bytes to the disk actor.
//!
//! Runs as its own task per in-progress segment (the engine runs up to
//! `max_concurrent_segments` of these at once), mirroring the "one
//! downloading task per segment" shape of the system this was modeled on,
//! but driven by a deadline check during reaping rather than a
//! cancelable per-block timer task.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use crate::{
    conf::TorrentConf,
    disk,
    peer::{Message, PeerHandle},
    piece::{Block, BlockStatus},
    BlockInfo, PieceIndex, Sha1Hash, TorrentId,
};

/// An event relevant to an in-progress segment download, forwarded to it by
/// the torrent after demultiplexing on piece index / peer identity.
pub(crate) enum Event {
    Block { peer: PeerHandle, block: BlockInfo, data: Vec<u8> },
    AddPeer(PeerHandle),
    RemovePeer(PeerHandle),
}

/// How a segment download concluded.
#[derive(Debug)]
pub(crate) enum Outcome {
    Success,
    /// The assembled segment failed hash verification; the downloaded
    /// blocks are discarded and the segment should be retried.
    HashMismatch,
    /// Every assigned peer was struck out or disconnected before the
    /// segment could complete.
    NoPeersLeft,
}

/// The peer -> in-flight-blocks task table, plus each peer's strike count.
struct Tasks {
    by_peer: HashMap<PeerHandle, HashSet<u32>>,
    strikes: HashMap<PeerHandle, u32>,
}

impl Tasks {
    fn new(peers: Vec<PeerHandle>) -> Self {
        let by_peer = peers.iter().cloned().map(|p| (p, HashSet::new())).collect();
        let strikes = peers.into_iter().map(|p| (p, 0)).collect();
        Self { by_peer, strikes }
    }

    fn add_peer(&mut self, peer: PeerHandle) {
        self.by_peer.entry(peer.clone()).or_insert_with(HashSet::new);
        self.strikes.entry(peer).or_insert(0);
    }

    fn remove_peer(&mut self, peer: &PeerHandle) -> HashSet<u32> {
        self.strikes.remove(peer);
        self.by_peer.remove(peer).unwrap_or_default()
    }

    fn total_pending(&self) -> usize {
        self.by_peer.values().map(|s| s.len()).sum()
    }

    /// The peer with the fewest in-flight requests - the next one to assign
    /// a block to.
    fn laziest_peer(&self) -> Option<PeerHandle> {
        self.by_peer.iter().min_by_key(|(_, blocks)| blocks.len()).map(|(peer, _)| peer.clone())
    }

    fn strike(&mut self, peer: &PeerHandle) -> u32 {
        let entry = self.strikes.entry(peer.clone()).or_insert(0);
        *entry += 1;
        *entry
    }
}

/// Downloads `segment_id`, returning the outcome. On success the assembled
/// bytes have already been handed to the disk actor for writing.
pub(crate) async fn run(
    torrent_id: TorrentId,
    segment_id: PieceIndex,
    segment_len: u32,
    expected_hash: Sha1Hash,
    initial_peers: Vec<PeerHandle>,
    mut events: mpsc::UnboundedReceiver<Event>,
    needs_peer: mpsc::UnboundedSender<PieceIndex>,
    disk_cmds: disk::CommandSender,
    conf: Arc<TorrentConf>,
) -> (PieceIndex, Outcome) {
    log::info!("Starting download of segment {}", segment_id);

    let block_count = crate::block_count(segment_len);
    let mut blocks: Vec<Block> = (0..block_count)
        .map(|i| Block::new(i as u32 * crate::BLOCK_LEN, crate::block_len(segment_len, i)))
        .collect();
    let mut tasks = Tasks::new(initial_peers);

    loop {
        if tasks.by_peer.is_empty() {
            return (segment_id, Outcome::NoPeersLeft);
        }

        reap_expired(&mut blocks, &mut tasks);
        assign_requests(
            segment_id,
            &mut blocks,
            &mut tasks,
            conf.max_pending_blocks_per_segment,
            conf.strike_threshold,
            conf.block_timeout,
            &needs_peer,
        );

        if blocks.iter().all(|b| b.status == BlockStatus::Retrieved) {
            break;
        }

        let tick = tokio::time::delay_for(Duration::from_millis(50));
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(Event::Block { peer, block, data }) => {
                        on_block(&mut blocks, &mut tasks, &peer, block, data);
                    }
                    Some(Event::AddPeer(peer)) => {
                        tasks.add_peer(peer);
                    }
                    Some(Event::RemovePeer(peer)) => {
                        let reclaimed = tasks.remove_peer(&peer);
                        revert_blocks(&mut blocks, &reclaimed);
                        let _ = needs_peer.send(segment_id);
                    }
                    None => return (segment_id, Outcome::NoPeersLeft),
                }
            }
            _ = tick => {}
        }
    }

    let data: Vec<u8> = blocks
        .iter()
        .flat_map(|b| b.data.as_ref().expect("complete segment missing block data").clone())
        .collect();
    let digest = Sha1::digest(&data);
    if digest.as_slice() != expected_hash {
        log::warn!("Segment {} failed hash verification", segment_id);
        return (segment_id, Outcome::HashMismatch);
    }

    if let Err(e) =
        disk_cmds.send(disk::Command::WriteSegment { id: torrent_id, segment_id, data })
    {
        log::warn!("Segment {} could not be handed to disk actor: {}", segment_id, e);
    }

    log::info!("Segment {} downloaded successfully", segment_id);
    (segment_id, Outcome::Success)
}

fn on_block(
    blocks: &mut [Block],
    tasks: &mut Tasks,
    peer: &PeerHandle,
    block: BlockInfo,
    data: Vec<u8>,
) {
    let Some(pending) = tasks.by_peer.get_mut(peer) else {
        log::warn!("Received block from peer not assigned to this segment");
        return;
    };
    if !pending.remove(&block.offset) {
        log::warn!("Received unrequested block at offset {}", block.offset);
        return;
    }
    let index = block.index_in_piece();
    if let Some(b) = blocks.get_mut(index) {
        b.mark_retrieved(data);
    }
}

fn revert_blocks(blocks: &mut [Block], offsets: &HashSet<u32>) {
    for block in blocks.iter_mut() {
        if offsets.contains(&block.offset) && block.status != BlockStatus::Retrieved {
            block.revert_to_missing();
        }
    }
}

/// Reverts blocks whose pending deadline has elapsed and strikes the peer
/// they were requested from.
fn reap_expired(blocks: &mut [Block], tasks: &mut Tasks) {
    let now = Instant::now();
    let expired_offsets: Vec<u32> =
        blocks.iter().filter(|b| b.is_expired(now)).map(|b| b.offset).collect();
    if expired_offsets.is_empty() {
        return;
    }

    let mut struck = Vec::new();
    for (peer, pending) in tasks.by_peer.iter_mut() {
        let mut hit = false;
        for offset in &expired_offsets {
            if pending.remove(offset) {
                hit = true;
            }
        }
        if hit {
            struck.push(peer.clone());
        }
    }

    for block in blocks.iter_mut() {
        if expired_offsets.contains(&block.offset) {
            block.revert_to_missing();
        }
    }

    for peer in struck {
        let strikes = tasks.strike(&peer);
        log::debug!("Peer struck ({} strikes) for a timed-out block", strikes);
    }
}

/// Evicts peers that exceeded the strike threshold, then assigns missing
/// blocks to the least-loaded remaining peer until either the missing list
/// or the per-segment pending budget is exhausted.
fn assign_requests(
    segment_id: PieceIndex,
    blocks: &mut [Block],
    tasks: &mut Tasks,
    max_pending: usize,
    strike_threshold: u32,
    block_timeout: Duration,
    needs_peer: &mpsc::UnboundedSender<PieceIndex>,
) {
    let to_evict: Vec<PeerHandle> = tasks
        .strikes
        .iter()
        .filter(|(_, &strikes)| strikes > strike_threshold)
        .map(|(peer, _)| peer.clone())
        .collect();
    for peer in to_evict {
        log::info!("Evicting peer past strike threshold from segment {}", segment_id);
        peer.shutdown();
        let reclaimed = tasks.remove_peer(&peer);
        revert_blocks(blocks, &reclaimed);
        let _ = needs_peer.send(segment_id);
    }

    loop {
        if tasks.by_peer.is_empty() || tasks.total_pending() >= max_pending {
            break;
        }
        let Some(missing_index) = blocks.iter().position(|b| b.status == BlockStatus::Missing)
        else {
            break;
        };
        let Some(peer) = tasks.laziest_peer() else { break };
        if peer.is_choked() {
            // no usable peer right now; avoid busy-looping on a choked peer
            break;
        }

        let block = &mut blocks[missing_index];
        let info = BlockInfo { piece_index: segment_id, offset: block.offset, len: block.len };
        if peer.send(Message::Request(info)).is_err() {
            // the connection actor is gone; drop the peer instead of
            // retrying it forever against the same dead channel
            tasks.remove_peer(&peer);
            let _ = needs_peer.send(segment_id);
            continue;
        }
        block.mark_pending(block_timeout);
        tasks.by_peer.get_mut(&peer).unwrap().insert(block.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_blocks_skips_already_retrieved() {
        let mut blocks = vec![Block::new(0, crate::BLOCK_LEN)];
        blocks[0].mark_pending(Duration::from_secs(2));
        blocks[0].mark_retrieved(vec![0; crate::BLOCK_LEN as usize]);
        let mut offsets = HashSet::new();
        offsets.insert(0u32);
        revert_blocks(&mut blocks, &offsets);
        assert_eq!(blocks[0].status, BlockStatus::Retrieved);
    }

    #[test]
    fn reap_expired_reverts_and_strikes() {
        let mut blocks = vec![Block::new(0, crate::BLOCK_LEN)];
        blocks[0].mark_pending(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        let mut tasks = Tasks { by_peer: HashMap::new(), strikes: HashMap::new() };
        // no real peer handle available without a live connection; exercise
        // the block-side effect only.
        let now = Instant::now();
        assert!(blocks[0].is_expired(now));
        reap_expired(&mut blocks, &mut tasks);
        assert_eq!(blocks[0].status, BlockStatus::Missing);
    }
}
