//! The BEP-15 UDP tracker protocol: a connect exchange establishing a
//! short-lived connection id, followed by an announce exchange that returns
//! compact peer records.

use std::{convert::TryInto, net::SocketAddr, time::Duration};

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{Error, Result};

use super::{Announce, Event, Response};

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// Initial delay before the first retry; doubled after each further attempt.
const RETRY_BACKOFF: Duration = Duration::from_secs(15);
/// Total attempts (the first try plus retries) before giving up.
const MAX_ATTEMPTS: u32 = 8;

pub(crate) struct UdpTracker {
    pub url: String,
    addr: SocketAddr,
}

impl UdpTracker {
    pub fn new(url: &str) -> Result<Self> {
        let stripped = url.trim_start_matches("udp://");
        let host_port = stripped.split('/').next().unwrap_or(stripped);
        let addr = std::net::ToSocketAddrs::to_socket_addrs(host_port)
            .ok()
            .and_then(|mut it| it.next())
            .ok_or_else(|| Error::TrackerFailure(format!("could not resolve {}", url)))?;
        Ok(Self { url: url.to_owned(), addr })
    }

    /// Announces to this tracker, retrying with exponential backoff (15s
    /// initial delay, doubling each attempt) up to [`MAX_ATTEMPTS`] times -
    /// UDP announces have no delivery guarantee, so a single dropped packet
    /// shouldn't permanently fail the tracker.
    pub async fn announce(&mut self, announce: &Announce, request_timeout: Duration) -> Result<Response> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = RETRY_BACKOFF * 2u32.pow(attempt - 1);
                log::debug!(
                    "Retrying UDP tracker {} in {:?} (attempt {}/{})",
                    self.url,
                    backoff,
                    attempt + 1,
                    MAX_ATTEMPTS
                );
                tokio::time::delay_for(backoff).await;
            }
            match self.try_announce(announce, request_timeout).await {
                Ok(response) => return Ok(response),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::TrackerFailure("udp tracker exhausted retries".into())))
    }

    async fn try_announce(&self, announce: &Announce, request_timeout: Duration) -> Result<Response> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.addr).await?;

        let connection_id = self.connect(&socket, request_timeout).await?;
        self.announce_with_connection(&socket, connection_id, announce, request_timeout).await
    }

    async fn connect(&self, socket: &UdpSocket, request_timeout: Duration) -> Result<u64> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let mut req = Vec::with_capacity(16);
        req.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        req.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());

        let mut buf = [0u8; 16];
        let len = send_and_receive(socket, &req, &mut buf, request_timeout).await?;
        if len < 16 {
            return Err(Error::TrackerFailure("connect response too short".into()));
        }
        let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let resp_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if action != ACTION_CONNECT || resp_transaction_id != transaction_id {
            return Err(Error::TrackerFailure("unexpected connect response".into()));
        }
        Ok(u64::from_be_bytes(buf[8..16].try_into().unwrap()))
    }

    async fn announce_with_connection(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
        announce: &Announce,
        request_timeout: Duration,
    ) -> Result<Response> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let event: u32 = match announce.event {
            Event::None => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        };

        let mut req = Vec::with_capacity(98);
        req.extend_from_slice(&connection_id.to_be_bytes());
        req.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());
        req.extend_from_slice(&announce.info_hash);
        req.extend_from_slice(&announce.peer_id);
        req.extend_from_slice(&announce.downloaded.to_be_bytes());
        req.extend_from_slice(&announce.left.to_be_bytes());
        req.extend_from_slice(&announce.uploaded.to_be_bytes());
        req.extend_from_slice(&event.to_be_bytes());
        req.extend_from_slice(&0u32.to_be_bytes()); // ip, 0 = default
        req.extend_from_slice(&rand::thread_rng().gen::<u32>().to_be_bytes()); // key
        req.extend_from_slice(&(-1i32).to_be_bytes()); // num_want, -1 = default
        req.extend_from_slice(&announce.port.to_be_bytes());
        debug_assert_eq!(req.len(), 98);

        let mut buf = [0u8; 2048];
        let len = send_and_receive(socket, &req, &mut buf, request_timeout).await?;
        if len < 20 {
            return Err(Error::TrackerFailure("announce response too short".into()));
        }
        let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let resp_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if resp_transaction_id != transaction_id {
            return Err(Error::TrackerFailure("unexpected announce response".into()));
        }
        if action != ACTION_ANNOUNCE {
            return Err(Error::TrackerFailure("tracker returned an error action".into()));
        }
        let interval = u32::from_be_bytes(buf[8..12].try_into().unwrap());

        let mut peers = Vec::new();
        for chunk in buf[20..len].chunks_exact(6) {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            peers.push(SocketAddr::from((ip, port)));
        }

        Ok(Response { peers, interval: Some(Duration::from_secs(interval as u64)) })
    }
}

async fn send_and_receive(
    socket: &UdpSocket,
    req: &[u8],
    buf: &mut [u8],
    request_timeout: Duration,
) -> Result<usize> {
    socket.send(req).await?;
    let len = timeout(request_timeout, socket.recv(buf))
        .await
        .map_err(|_| Error::TrackerFailure("udp tracker request timed out".into()))??;
    Ok(len)
}
