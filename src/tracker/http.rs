//! The HTTP(S) tracker announce protocol: a bencoded GET response keyed by
//! `peers` (compact or list form) and an optional `failure reason`.

use std::{net::SocketAddr, time::Duration};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;

use crate::error::{Error, Result};

use super::{Announce, Event, Response};

pub(crate) struct HttpTracker {
    pub url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(url: String) -> Self {
        Self { url, client: reqwest::Client::new() }
    }

    pub async fn announce(&mut self, announce: &Announce, timeout: Duration) -> Result<Response> {
        let query = build_query(announce);
        let url = format!("{}?{}", self.url, query);
        log::debug!("Announcing to HTTP tracker {}", self.url);

        let resp = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::TrackerFailure(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::TrackerFailure(format!(
                "tracker returned status {}",
                resp.status()
            )));
        }
        let body = resp.bytes().await.map_err(|e| Error::TrackerFailure(e.to_string()))?;
        parse_response(&body)
    }
}

fn build_query(announce: &Announce) -> String {
    let event = match announce.event {
        Event::Started => Some("started"),
        Event::Completed => Some("completed"),
        Event::Stopped => Some("stopped"),
        Event::None => None,
    };
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&compact=1&uploaded={}&downloaded={}&left={}",
        percent_encode(&announce.info_hash, NON_ALPHANUMERIC),
        percent_encode(&announce.peer_id, NON_ALPHANUMERIC),
        announce.port,
        announce.uploaded,
        announce.downloaded,
        announce.left,
    );
    if let Some(event) = event {
        query.push_str("&event=");
        query.push_str(event);
    }
    query
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    peers: Option<RawPeers>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(#[serde(with = "serde_bytes")] ByteBuf),
    List(Vec<RawPeer>),
}

#[derive(Debug, Deserialize)]
struct RawPeer {
    ip: String,
    port: u16,
}

fn parse_response(body: &[u8]) -> Result<Response> {
    let raw: RawResponse =
        serde_bencode::from_bytes(body).map_err(|e| Error::TrackerFailure(e.to_string()))?;

    if let Some(reason) = raw.failure_reason {
        return Err(Error::TrackerFailure(reason));
    }

    let mut peers = Vec::new();
    match raw.peers {
        Some(RawPeers::Compact(bytes)) => {
            for chunk in bytes.chunks_exact(6) {
                let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                peers.push(SocketAddr::from((ip, port)));
            }
        }
        Some(RawPeers::List(list)) => {
            for peer in list {
                if let Ok(ip) = peer.ip.parse() {
                    peers.push(SocketAddr::new(ip, peer.port));
                }
            }
        }
        None => {}
    }

    let interval = raw.min_interval.or(raw.interval).map(Duration::from_secs);

    Ok(Response { peers, interval })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_list() {
        let mut bencoded = b"d8:intervali1800e5:peers12:".to_vec();
        bencoded.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]); // 127.0.0.1:6881
        bencoded.extend_from_slice(&[10, 0, 0, 1, 0x1A, 0xE2]); // 10.0.0.1:6882
        bencoded.push(b'e');

        let response = parse_response(&bencoded).unwrap();
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn failure_reason_takes_priority_over_peers() {
        let bencoded = b"d14:failure reason11:bad requeste";
        let err = parse_response(bencoded).unwrap_err();
        assert!(matches!(err, Error::TrackerFailure(_)));
    }

    #[test]
    fn parses_dictionary_peer_list() {
        let bencoded =
            b"d5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let response = parse_response(bencoded).unwrap();
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port(), 6881);
    }
}
