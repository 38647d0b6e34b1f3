//! The inbound connection listener: binds a single TCP port shared by every
//! torrent the engine manages, reads just enough of each new connection's
//! handshake to learn its `info_hash`, and routes it to the matching
//! torrent - or drops it if no torrent claims that hash.
//!
//! Deliberately does not attempt any NAT traversal (no UPnP/NAT-PMP port
//! mapping): the operator is expected to forward the configured port
//! themselves if they want inbound connectivity from behind a NAT.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use tokio::{net::TcpListener, sync::mpsc};

use crate::{error::Result, peer, torrent, Sha1Hash};

/// A request sent to the listener by the engine.
pub(crate) enum Command {
    /// Registers a torrent as a recipient of inbound connections advertising
    /// its info hash.
    Register { info_hash: Sha1Hash, torrent: mpsc::UnboundedSender<torrent::Command> },
    /// Stops routing inbound connections to a removed torrent.
    Deregister { info_hash: Sha1Hash },
    Shutdown,
}

/// Binds the listening socket and spawns the accept loop as a background
/// task, returning a handle to send it registration commands.
pub(crate) async fn spawn(
    listen_port: u16,
    handshake_timeout: Duration,
) -> Result<mpsc::UnboundedSender<Command>> {
    let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
    log::info!("Inbound listener bound on port {}", listen_port);

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(listener, handshake_timeout, cmd_rx));
    Ok(cmd_tx)
}

async fn run(
    listener: TcpListener,
    handshake_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut torrents: HashMap<Sha1Hash, mpsc::UnboundedSender<torrent::Command>> = HashMap::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        let torrents = torrents.clone();
                        tokio::spawn(handle_inbound(socket, addr, handshake_timeout, torrents));
                    }
                    Err(e) => log::warn!("Inbound accept failed: {}", e),
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Register { info_hash, torrent }) => {
                        torrents.insert(info_hash, torrent);
                    }
                    Some(Command::Deregister { info_hash }) => {
                        torrents.remove(&info_hash);
                    }
                    Some(Command::Shutdown) | None => {
                        log::info!("Shutting down inbound listener");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_inbound(
    socket: tokio::net::TcpStream,
    addr: SocketAddr,
    handshake_timeout: Duration,
    torrents: HashMap<Sha1Hash, mpsc::UnboundedSender<torrent::Command>>,
) {
    let inbound = match peer::read_handshake(socket, handshake_timeout).await {
        Ok(inbound) => inbound,
        Err(e) => {
            log::debug!("Inbound handshake from {} failed: {}", addr, e);
            return;
        }
    };

    match torrents.get(&inbound.handshake.info_hash) {
        Some(sender) => {
            log::debug!("Routing inbound connection {} to its torrent", addr);
            let _ = sender.send(torrent::Command::InboundPeer { inbound, addr });
        }
        None => {
            log::debug!("Inbound connection {} names an unknown torrent, dropping", addr);
        }
    }
}
