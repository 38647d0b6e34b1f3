//! The peer connection actor: handshake, the receive/dispatch loop, and the
//! small piece of state (choke/interest) a connection to a single peer needs
//! to keep.

mod codec;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

use codec::{HandshakeCodec, PeerCodec};

pub(crate) use codec::{Handshake, Message};

/// An event a peer connection reports to its torrent for processing.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// The peer's full bitfield - sent at most once, as the first message
    /// after the handshake, per the peer-wire contract.
    Bitfield { peer: PeerHandle, bitfield: Bitfield },
    /// The peer now has segment `index` (a `have` message).
    Have { peer: PeerHandle, index: PieceIndex },
    Choked { peer: PeerHandle },
    Unchoked { peer: PeerHandle },
    Interested { peer: PeerHandle },
    NotInterested { peer: PeerHandle },
    /// The peer sent block data in response to a request.
    Block { peer: PeerHandle, block: BlockInfo, data: Vec<u8> },
    /// The peer requested a block from us (only relevant once we seed).
    Requested { peer: PeerHandle, block: BlockInfo },
    /// The connection closed, for whatever reason.
    Disconnected { peer: PeerHandle, cause: Option<String> },
}

/// A command sent to a running peer connection by its torrent.
#[derive(Debug)]
pub(crate) enum Command {
    SendMessage(Message),
    Shutdown,
}

/// A cheaply cloneable, hashable handle to a running peer connection.
///
/// Equality and hashing are based on the identity of the shared connection
/// state (its `Arc`'s address), not field values, so a
/// `HashMap<PeerHandle, _>` behaves like a map keyed on "this particular
/// connection" - this is how the torrent downloader tracks each peer's
/// in-flight block set.
#[derive(Clone, Debug)]
pub(crate) struct PeerHandle {
    addr: SocketAddr,
    inner: Arc<PeerShared>,
}

#[derive(Debug)]
struct PeerShared {
    commands: mpsc::UnboundedSender<Command>,
    choked: AtomicBool,
    interested: AtomicBool,
    peer_choked: AtomicBool,
    peer_interested: AtomicBool,
}

impl PeerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn send(&self, msg: Message) -> Result<()> {
        match msg {
            Message::Interested => self.inner.interested.store(true, Ordering::Relaxed),
            Message::Choke => self.inner.peer_choked.store(true, Ordering::Relaxed),
            Message::Unchoke => self.inner.peer_choked.store(false, Ordering::Relaxed),
            _ => {}
        }
        self.inner.commands.send(Command::SendMessage(msg)).map_err(|_| Error::ChannelClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.inner.commands.send(Command::Shutdown);
    }

    /// True if the peer has choked us (we may not request blocks from it).
    pub fn is_choked(&self) -> bool {
        self.inner.choked.load(Ordering::Relaxed)
    }

    /// True if we have declared interest in this peer.
    pub fn is_interested(&self) -> bool {
        self.inner.interested.load(Ordering::Relaxed)
    }

    /// True if we are choking this peer (we haven't sent it an `unchoke`).
    pub fn is_choking_peer(&self) -> bool {
        self.inner.peer_choked.load(Ordering::Relaxed)
    }

    /// True if the peer has declared interest in our pieces.
    pub fn is_peer_interested(&self) -> bool {
        self.inner.peer_interested.load(Ordering::Relaxed)
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for PeerHandle {}

impl std::hash::Hash for PeerHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

/// Connects to an outbound peer, performs the handshake, then spawns the
/// receive/send loop as a background task and returns a handle to it.
///
/// Events produced by the connection (bitfield, have, choke, block data,
/// ...) are delivered asynchronously on `events` until the connection
/// closes, at which point a final [`PeerEvent::Disconnected`] is sent.
pub(crate) async fn connect(
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    handshake_timeout: Duration,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> Result<PeerHandle> {
    log::info!("Connecting to peer {}", addr);
    let socket = timeout(handshake_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::InvalidHandshake)??;

    let mut handshake_io = Framed::new(socket, HandshakeCodec);
    log::debug!("Sending handshake to peer {}", addr);
    handshake_io.send(Handshake::new(info_hash, client_id)).await?;

    log::debug!("Awaiting handshake from peer {}", addr);
    let peer_handshake = timeout(handshake_timeout, handshake_io.next())
        .await
        .map_err(|_| Error::InvalidHandshake)?
        .ok_or(Error::InvalidHandshake)??;
    if peer_handshake.info_hash != info_hash {
        log::warn!("Peer {} advertised a mismatched info hash", addr);
        return Err(Error::InvalidPeerInfoHash);
    }
    log::info!("Peer {} handshake complete", addr);

    // switch codecs, carrying over any bytes already buffered past the
    // handshake by the framed reader
    let old_parts = handshake_io.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let io = Framed::from_parts(new_parts);

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let handle = PeerHandle {
        addr,
        inner: Arc::new(PeerShared {
            commands: commands_tx,
            choked: AtomicBool::new(true),
            interested: AtomicBool::new(false),
            peer_choked: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
        }),
    };

    tokio::spawn(run(handle.clone(), io, commands_rx, events));

    Ok(handle)
}

/// An inbound connection whose handshake has been read but not yet
/// answered - enough for the listener to learn the `info_hash` and route
/// the connection to the right torrent.
pub(crate) struct InboundHandshake {
    parts: FramedParts<TcpStream, HandshakeCodec>,
    pub handshake: Handshake,
}

/// Reads (and only reads) an inbound peer's handshake off a freshly accepted
/// socket, without yet replying. Used by the listener to learn which
/// torrent a connection is for before handing it off.
pub(crate) async fn read_handshake(
    socket: TcpStream,
    handshake_timeout: Duration,
) -> Result<InboundHandshake> {
    let mut io = Framed::new(socket, HandshakeCodec);
    let handshake = timeout(handshake_timeout, io.next())
        .await
        .map_err(|_| Error::InvalidHandshake)?
        .ok_or(Error::InvalidHandshake)??;
    Ok(InboundHandshake { parts: io.into_parts(), handshake })
}

/// Completes an inbound handshake: the remote peer's handshake has already
/// been read by the listener (that's how it learned which torrent this
/// connection is for); here we just validate it, answer with our own
/// handshake, and spawn the same receive/send loop `connect` uses.
pub(crate) async fn accept(
    inbound: InboundHandshake,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> Result<PeerHandle> {
    if inbound.handshake.info_hash != info_hash {
        return Err(Error::InvalidPeerInfoHash);
    }

    let mut handshake_io = Framed::from_parts(inbound.parts);
    handshake_io.send(Handshake::new(info_hash, client_id)).await?;

    let old_parts = handshake_io.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let io = Framed::from_parts(new_parts);

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let handle = PeerHandle {
        addr,
        inner: Arc::new(PeerShared {
            commands: commands_tx,
            choked: AtomicBool::new(true),
            interested: AtomicBool::new(false),
            peer_choked: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
        }),
    };

    tokio::spawn(run(handle.clone(), io, commands_rx, events));

    Ok(handle)
}

async fn run(
    handle: PeerHandle,
    mut io: Framed<TcpStream, PeerCodec>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let mut first_message = true;
    let cause = loop {
        tokio::select! {
            msg = io.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = dispatch(&handle, msg, first_message, &events) {
                            log::warn!("Peer {} protocol error: {}", handle.addr(), e);
                            break Some(e.to_string());
                        }
                        first_message = false;
                    }
                    Some(Err(e)) => {
                        log::debug!("Peer {} connection error: {}", handle.addr(), e);
                        break Some(e.to_string());
                    }
                    None => break None,
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::SendMessage(msg)) => {
                        if let Err(e) = io.send(msg).await {
                            log::debug!("Peer {} send error: {}", handle.addr(), e);
                            break Some(e.to_string());
                        }
                    }
                    Some(Command::Shutdown) | None => break None,
                }
            }
        }
    };
    let _ = events.send(PeerEvent::Disconnected { peer: handle, cause });
}

fn dispatch(
    handle: &PeerHandle,
    msg: Message,
    first_message: bool,
    events: &mpsc::UnboundedSender<PeerEvent>,
) -> Result<()> {
    match msg {
        Message::KeepAlive => {}
        Message::Choke => {
            handle.inner.choked.store(true, Ordering::Relaxed);
            let _ = events.send(PeerEvent::Choked { peer: handle.clone() });
        }
        Message::Unchoke => {
            handle.inner.choked.store(false, Ordering::Relaxed);
            let _ = events.send(PeerEvent::Unchoked { peer: handle.clone() });
        }
        Message::Interested => {
            handle.inner.peer_interested.store(true, Ordering::Relaxed);
            let _ = events.send(PeerEvent::Interested { peer: handle.clone() });
        }
        Message::NotInterested => {
            handle.inner.peer_interested.store(false, Ordering::Relaxed);
            let _ = events.send(PeerEvent::NotInterested { peer: handle.clone() });
        }
        Message::Have { piece_index } => {
            let _ = events.send(PeerEvent::Have { peer: handle.clone(), index: piece_index });
        }
        Message::Bitfield(bitfield) => {
            if !first_message {
                // only valid as the first post-handshake message; a later
                // one is ignored rather than treated as a protocol violation
                log::debug!("Peer {} sent a bitfield after the first message, ignoring", handle.addr());
                return Ok(());
            }
            let _ = events.send(PeerEvent::Bitfield { peer: handle.clone(), bitfield });
        }
        Message::Request(block) => {
            let _ = events.send(PeerEvent::Requested { peer: handle.clone(), block });
        }
        Message::Piece { piece_index, offset, data } => {
            let block = BlockInfo { piece_index, offset, len: data.len() as u32 };
            let _ = events.send(PeerEvent::Block { peer: handle.clone(), block, data });
        }
        Message::Cancel(_) => {
            // we never queue outbound piece sends, so there's nothing to cancel
        }
    }
    Ok(())
}
