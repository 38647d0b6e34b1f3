//! Scenario-level tests against the public engine API.
//!
//! The first few exercise the engine with no peers at all (fresh torrent
//! stats, resume scan). The rest drive a real TCP connection against the
//! engine's own inbound listener through a minimal hand-rolled peer-wire
//! client (`FakePeer`) that speaks just enough of the protocol to stand in
//! for a real remote peer - full single-peer downloads, a hash mismatch
//! followed by recovery, mid-segment peer replacement, rarest-first
//! scheduling, and the unchoke watchdog.

use std::convert::TryInto;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use torrentine::metainfo::{Info, Metainfo};
use torrentine::{Conf, Engine, TorrentConf};

/// 16 KiB, matching the engine's fixed block size.
const BLOCK_LEN: u32 = 0x4000;

/// A single-file torrent: `T=6, L=3`, matching the engine's literal
/// single-file/single-peer scenario, minus the peer.
fn sample_metainfo_bytes() -> Vec<u8> {
    build_metainfo_bytes("sample.bin", 3, &[b"abc".to_vec(), b"def".to_vec()]).0
}

/// Builds bencoded metainfo bytes (and the concatenated file bytes it
/// describes) for an arbitrary set of same-length-scheme segments.
fn build_metainfo_bytes(name: &str, piece_length: u32, segments: &[Vec<u8>]) -> (Vec<u8>, Vec<u8>) {
    let mut pieces = Vec::new();
    let mut file = Vec::new();
    for segment in segments {
        pieces.extend_from_slice(&Sha1::digest(segment));
        file.extend_from_slice(segment);
    }
    let info = Info {
        name: name.to_owned(),
        pieces: ByteBuf::from(pieces),
        piece_length,
        length: Some(file.len() as u64),
        files: None,
        private: None,
    };
    let metainfo =
        Metainfo { info, announce: Some("http://127.0.0.1:1/announce".into()), announce_list: None };
    (serde_bencode::to_bytes(&metainfo).unwrap(), file)
}

async fn new_test_engine(download_dir: std::path::PathBuf) -> Engine {
    new_test_engine_on_port(download_dir, 0).await
}

/// Like [`new_test_engine`], but on a caller-chosen port - needed whenever a
/// test has to dial the engine's listener itself, since nothing in the
/// public API surfaces back which port an ephemeral (`0`) bind picked.
async fn new_test_engine_on_port(download_dir: std::path::PathBuf, port: u16) -> Engine {
    let mut conf = Conf::new(download_dir);
    conf.engine.listen_port = port;
    let (engine, _alerts) = Engine::new(conf).await.expect("engine should start");
    engine
}

async fn poll_stats_until(
    engine: &Engine,
    id: u32,
    mut done: impl FnMut(&torrentine::TorrentStats) -> bool,
) -> torrentine::TorrentStats {
    let mut stats = engine.torrent_stats(id).await.unwrap();
    for _ in 0..200 {
        if done(&stats) {
            break;
        }
        tokio::time::delay_for(Duration::from_millis(20)).await;
        stats = engine.torrent_stats(id).await.unwrap();
    }
    stats
}

#[tokio::test]
async fn fresh_torrent_has_nothing_downloaded() {
    let dir = tempdir().unwrap();
    let mut engine = new_test_engine(dir.path().to_path_buf()).await;

    let metainfo = Metainfo::from_bytes(&sample_metainfo_bytes()).unwrap();
    let torrent_conf = TorrentConf::new(dir.path().to_path_buf());
    let id = engine.create_torrent(metainfo, torrent_conf).await.unwrap();

    let stats = engine.torrent_stats(id).await.unwrap();
    assert_eq!(stats.downloaded, 0);
    assert_eq!(stats.left, 6);
    assert!(!stats.bitfield[0]);
    assert!(!stats.bitfield[1]);

    engine.shutdown();
}

#[tokio::test]
async fn resume_scan_finds_already_complete_download() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("sample.bin"), b"abcdef").unwrap();

    let mut engine = new_test_engine(dir.path().to_path_buf()).await;
    let metainfo = Metainfo::from_bytes(&sample_metainfo_bytes()).unwrap();
    let torrent_conf = TorrentConf::new(dir.path().to_path_buf());
    let id = engine.create_torrent(metainfo, torrent_conf).await.unwrap();

    // the resume scan runs asynchronously in the torrent's own task, started
    // right after create_torrent returns; poll briefly for it to finish
    let stats = poll_stats_until(&engine, id, |s| s.left == 0).await;

    assert_eq!(stats.left, 0);
    assert_eq!(stats.downloaded, 6);
    assert!(stats.bitfield[0]);
    assert!(stats.bitfield[1]);

    engine.shutdown();
}

#[tokio::test]
async fn unknown_torrent_id_is_an_error() {
    let dir = tempdir().unwrap();
    let engine = new_test_engine(dir.path().to_path_buf()).await;
    assert!(engine.torrent_stats(999).await.is_err());
}

/// Message ids from the peer wire protocol, hand-rolled here since the test
/// binary can't reach the engine's private codec.
#[derive(Debug, PartialEq, Eq)]
enum FakeMessage {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { piece_index: u32, offset: u32, len: u32 },
    Piece { piece_index: u32, offset: u32, data: Vec<u8> },
    Other,
}

/// A minimal BitTorrent peer-wire client driving a raw TCP socket, standing
/// in for a remote peer in tests. Speaks only as much of the protocol as the
/// scenarios below need.
struct FakePeer {
    stream: TcpStream,
}

impl FakePeer {
    /// Connects to the engine's listener and completes the handshake.
    /// Retries the whole connection a few times: the listener may accept the
    /// socket before the torrent it's for has finished registering with it,
    /// in which case the connection is silently dropped and a fresh attempt
    /// is needed.
    async fn connect(port: u16, info_hash: [u8; 20]) -> Self {
        let mut last_err = None;
        for attempt in 0..25 {
            if attempt > 0 {
                tokio::time::delay_for(Duration::from_millis(20)).await;
            }
            match Self::try_connect(port, info_hash).await {
                Ok(peer) => return peer,
                Err(e) => last_err = Some(e),
            }
        }
        panic!("fake peer could not connect: {:?}", last_err);
    }

    async fn try_connect(port: u16, info_hash: [u8; 20]) -> std::io::Result<Self> {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let mut stream = TcpStream::connect(addr).await?;

        let mut handshake = Vec::with_capacity(68);
        handshake.push(19u8);
        handshake.extend_from_slice(b"BitTorrent protocol");
        handshake.extend_from_slice(&[0u8; 8]);
        handshake.extend_from_slice(&info_hash);
        let peer_id: &[u8; 20] = b"-FK0001-000000000000";
        handshake.extend_from_slice(peer_id);
        stream.write_all(&handshake).await?;

        let mut reply = [0u8; 68];
        stream.read_exact(&mut reply).await?;
        Ok(Self { stream })
    }

    async fn send_frame(&mut self, id: u8, payload: &[u8]) {
        let len = (payload.len() + 1) as u32;
        let mut frame = Vec::with_capacity(4 + payload.len() + 1);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(id);
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn send_bitfield(&mut self, bytes: &[u8]) {
        self.send_frame(5, bytes).await;
    }

    async fn send_unchoke(&mut self) {
        self.send_frame(1, &[]).await;
    }

    async fn send_piece(&mut self, piece_index: u32, offset: u32, data: &[u8]) {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&piece_index.to_be_bytes());
        payload.extend_from_slice(&offset.to_be_bytes());
        payload.extend_from_slice(data);
        self.send_frame(7, &payload).await;
    }

    async fn read_message(&mut self) -> FakeMessage {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf);
        if len == 0 {
            return FakeMessage::Other; // keep-alive
        }
        let mut body = vec![0u8; len as usize];
        self.stream.read_exact(&mut body).await.unwrap();
        match body[0] {
            0 => FakeMessage::Choke,
            1 => FakeMessage::Unchoke,
            2 => FakeMessage::Interested,
            3 => FakeMessage::NotInterested,
            4 => FakeMessage::Have(u32::from_be_bytes(body[1..5].try_into().unwrap())),
            5 => FakeMessage::Bitfield(body[1..].to_vec()),
            6 => FakeMessage::Request {
                piece_index: u32::from_be_bytes(body[1..5].try_into().unwrap()),
                offset: u32::from_be_bytes(body[5..9].try_into().unwrap()),
                len: u32::from_be_bytes(body[9..13].try_into().unwrap()),
            },
            7 => FakeMessage::Piece {
                piece_index: u32::from_be_bytes(body[1..5].try_into().unwrap()),
                offset: u32::from_be_bytes(body[5..9].try_into().unwrap()),
                data: body[9..].to_vec(),
            },
            _ => FakeMessage::Other,
        }
    }

    /// Reads messages until the next `Request`, unchoking the engine as soon
    /// as it declares interest - without that, it will never request
    /// anything from us.
    async fn next_request(&mut self) -> (u32, u32, u32) {
        loop {
            match self.read_message().await {
                FakeMessage::Interested => self.send_unchoke().await,
                FakeMessage::Request { piece_index, offset, len } => {
                    return (piece_index, offset, len)
                }
                _ => {}
            }
        }
    }
}

#[tokio::test]
async fn single_peer_serves_full_download() {
    let dir = tempdir().unwrap();
    let port = 18881;
    let mut engine = new_test_engine_on_port(dir.path().to_path_buf(), port).await;

    let (metainfo_bytes, file_bytes) = build_metainfo_bytes("single.bin", 3, &[b"abc".to_vec(), b"def".to_vec()]);
    let metainfo = Metainfo::from_bytes(&metainfo_bytes).unwrap();
    let info_hash = metainfo.info_hash().unwrap();
    let torrent_conf = TorrentConf::new(dir.path().to_path_buf());
    let id = engine.create_torrent(metainfo, torrent_conf).await.unwrap();

    tokio::spawn(async move {
        let mut peer = FakePeer::connect(port, info_hash).await;
        peer.send_bitfield(&[0b1100_0000]).await; // has both pieces
        loop {
            let (piece_index, offset, len) = peer.next_request().await;
            let start = piece_index as usize * 3 + offset as usize;
            let data = &file_bytes[start..start + len as usize];
            peer.send_piece(piece_index, offset, data).await;
        }
    });

    let stats = poll_stats_until(&engine, id, |s| s.left == 0).await;
    assert_eq!(stats.left, 0);
    assert_eq!(stats.downloaded, 6);
    assert!(stats.bitfield[0]);
    assert!(stats.bitfield[1]);

    engine.shutdown();
}

#[tokio::test]
async fn hash_mismatch_is_retried_until_it_succeeds() {
    let dir = tempdir().unwrap();
    let port = 18882;
    let mut engine = new_test_engine_on_port(dir.path().to_path_buf(), port).await;

    let (metainfo_bytes, file_bytes) = build_metainfo_bytes("retry.bin", 3, &[b"abc".to_vec(), b"def".to_vec()]);
    let metainfo = Metainfo::from_bytes(&metainfo_bytes).unwrap();
    let info_hash = metainfo.info_hash().unwrap();
    let torrent_conf = TorrentConf::new(dir.path().to_path_buf());
    let id = engine.create_torrent(metainfo, torrent_conf).await.unwrap();

    tokio::spawn(async move {
        let mut peer = FakePeer::connect(port, info_hash).await;
        peer.send_bitfield(&[0b1100_0000]).await;
        let mut corrupted_piece_0_once = false;
        loop {
            let (piece_index, offset, len) = peer.next_request().await;
            if piece_index == 0 && !corrupted_piece_0_once {
                corrupted_piece_0_once = true;
                peer.send_piece(piece_index, offset, &vec![0xFFu8; len as usize]).await;
                continue;
            }
            let start = piece_index as usize * 3 + offset as usize;
            let data = &file_bytes[start..start + len as usize];
            peer.send_piece(piece_index, offset, data).await;
        }
    });

    let stats = poll_stats_until(&engine, id, |s| s.left == 0).await;
    assert_eq!(stats.left, 0, "a corrupted piece should be re-requested, not left failed forever");
    assert_eq!(stats.downloaded, 6);

    engine.shutdown();
}

#[tokio::test]
async fn segment_continues_from_a_replacement_peer_after_disconnect() {
    let dir = tempdir().unwrap();
    let port = 18883;
    let mut engine = new_test_engine_on_port(dir.path().to_path_buf(), port).await;

    // a single piece made of two blocks, so a full restart (vs. picking up
    // only the missing block) is observable
    let piece: Vec<u8> = vec![0xAAu8; BLOCK_LEN as usize]
        .into_iter()
        .chain(vec![0xBBu8; BLOCK_LEN as usize])
        .collect();
    let (metainfo_bytes, file_bytes) = build_metainfo_bytes("replace.bin", BLOCK_LEN * 2, &[piece]);
    let metainfo = Metainfo::from_bytes(&metainfo_bytes).unwrap();
    let info_hash = metainfo.info_hash().unwrap();
    let mut torrent_conf = TorrentConf::new(dir.path().to_path_buf());
    torrent_conf.peers_per_segment = 1;
    let id = engine.create_torrent(metainfo, torrent_conf).await.unwrap();

    // peer A: answers the first block's request, then drops the connection
    // instead of answering the second
    let mut peer_a = FakePeer::connect(port, info_hash).await;
    peer_a.send_bitfield(&[0b1000_0000]).await;
    let (piece_index, offset, len) = peer_a.next_request().await;
    assert_eq!((piece_index, offset), (0, 0));
    peer_a.send_piece(piece_index, offset, &file_bytes[..len as usize]).await;
    let (_, offset, _) = peer_a.next_request().await;
    assert_eq!(offset, BLOCK_LEN, "the second block should be requested next");
    drop(peer_a);

    // peer B: connects only after A is already the segment's sole owner, so
    // it can only ever join by being lent as a replacement
    let requested_offsets = Arc::new(Mutex::new(Vec::new()));
    let requested_offsets2 = Arc::clone(&requested_offsets);
    let file_bytes2 = file_bytes.clone();
    tokio::spawn(async move {
        let mut peer_b = FakePeer::connect(port, info_hash).await;
        peer_b.send_bitfield(&[0b1000_0000]).await;
        loop {
            let (piece_index, offset, len) = peer_b.next_request().await;
            requested_offsets2.lock().unwrap().push(offset);
            let start = offset as usize;
            let data = &file_bytes2[start..start + len as usize];
            peer_b.send_piece(piece_index, offset, data).await;
        }
    });

    let stats = poll_stats_until(&engine, id, |s| s.left == 0).await;
    assert_eq!(stats.left, 0);
    assert_eq!(stats.downloaded, file_bytes.len() as u64);

    // if the segment had restarted from scratch instead of being lent a
    // replacement peer, B would have been asked for both blocks, including
    // the one A already delivered
    assert_eq!(*requested_offsets.lock().unwrap(), vec![BLOCK_LEN]);

    engine.shutdown();
}

#[tokio::test]
async fn scheduler_prefers_rarer_segments_with_id_tie_break() {
    let dir = tempdir().unwrap();
    let port = 18884;
    let mut engine = new_test_engine_on_port(dir.path().to_path_buf(), port).await;

    let (metainfo_bytes, file_bytes) = build_metainfo_bytes(
        "rarity.bin",
        3,
        &[b"abc".to_vec(), b"def".to_vec(), b"ghi".to_vec()],
    );
    let metainfo = Metainfo::from_bytes(&metainfo_bytes).unwrap();
    let info_hash = metainfo.info_hash().unwrap();
    let mut torrent_conf = TorrentConf::new(dir.path().to_path_buf());
    // serialize scheduling so the run order reflects the rarity queue alone
    torrent_conf.max_concurrent_segments = 1;
    let id = engine.create_torrent(metainfo, torrent_conf).await.unwrap();

    // peer A only ever advertises piece 0: the only segment available until
    // peer B connects
    let mut peer_a = FakePeer::connect(port, info_hash).await;
    peer_a.send_bitfield(&[0b1000_0000]).await;
    let (piece_index, offset, len) = peer_a.next_request().await;
    assert_eq!(piece_index, 0);
    peer_a.send_piece(piece_index, offset, &file_bytes[offset as usize..offset as usize + len as usize]).await;

    // peer B advertises pieces 1 and 2 together, while segment 0 is still
    // the only one running (max_concurrent_segments == 1) - both land in
    // the rarity queue in the same update, tied at rarity 1
    let mut peer_b = FakePeer::connect(port, info_hash).await;
    peer_b.send_bitfield(&[0b0110_0000]).await;

    // wait for segment 0 to actually finish before reading from B, so the
    // next pick is driven purely by the rarity queue, not by timing
    let stats = poll_stats_until(&engine, id, |s| s.bitfield[0]).await;
    assert!(stats.bitfield[0]);

    let (piece_index, offset, len) = peer_b.next_request().await;
    assert_eq!(piece_index, 1, "a tie in rarity should break on the lower segment id");
    peer_b
        .send_piece(piece_index, offset, &file_bytes[3 + offset as usize..3 + offset as usize + len as usize])
        .await;

    let (piece_index, offset, len) = peer_b.next_request().await;
    assert_eq!(piece_index, 2);
    peer_b
        .send_piece(piece_index, offset, &file_bytes[6 + offset as usize..6 + offset as usize + len as usize])
        .await;

    let stats = poll_stats_until(&engine, id, |s| s.left == 0).await;
    assert_eq!(stats.left, 0);

    engine.shutdown();
}

#[tokio::test]
async fn unresponsive_peer_is_dropped_by_the_unchoke_watchdog() {
    let dir = tempdir().unwrap();
    let port = 18885;
    let mut engine = new_test_engine_on_port(dir.path().to_path_buf(), port).await;

    let (metainfo_bytes, _file_bytes) =
        build_metainfo_bytes("watchdog.bin", 3, &[b"abc".to_vec(), b"def".to_vec()]);
    let metainfo = Metainfo::from_bytes(&metainfo_bytes).unwrap();
    let info_hash = metainfo.info_hash().unwrap();
    let mut torrent_conf = TorrentConf::new(dir.path().to_path_buf());
    torrent_conf.unchoke_timeout = Duration::from_millis(150);
    let id = engine.create_torrent(metainfo, torrent_conf).await.unwrap();

    let mut peer = FakePeer::connect(port, info_hash).await;
    peer.send_bitfield(&[0b1100_0000]).await;
    // never answers with an Unchoke

    let stats = poll_stats_until(&engine, id, |s| s.connected_peer_count == 0).await;
    assert_eq!(stats.connected_peer_count, 0, "the watchdog should have dropped the silent peer");

    engine.shutdown();
}
