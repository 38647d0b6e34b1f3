//! Encoding/decoding for the peer-wire protocol: the fixed-width handshake
//! frame and the ten length-prefixed message kinds.
//!
//! All multi-byte integers are big endian. A message frame is a 4 byte
//! length prefix `N` followed by `N` bytes of payload; `N == 0` is the
//! keep-alive. Otherwise the first payload byte is the message id.

use std::convert::TryInto;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&[0; 8]);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let pstrlen = buf[0];
        if pstrlen as usize != 19 || &buf[1..20] != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidHandshake);
        }
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        buf.advance(HANDSHAKE_LEN);
        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) | Message::Cancel(block) => {
                let id = if matches!(msg, Message::Request(_)) {
                    MessageId::Request
                } else {
                    MessageId::Cancel
                };
                buf.put_u32(13);
                buf.put_u8(id as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Piece { piece_index, offset, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
            if len == 0 {
                // keep-alive
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }
            if buf.len() < 4 + len {
                return Ok(None);
            }

            let id = buf[4];
            let payload = &buf[5..4 + len];
            let msg = match id {
                0 => Some(Message::Choke),
                1 => Some(Message::Unchoke),
                2 => Some(Message::Interested),
                3 => Some(Message::NotInterested),
                4 => {
                    if payload.len() != 4 {
                        return Err(Error::InvalidMessageLength);
                    }
                    let piece_index =
                        u32::from_be_bytes(payload[0..4].try_into().unwrap());
                    Some(Message::Have { piece_index: piece_index as PieceIndex })
                }
                5 => {
                    let bytes = payload.to_vec();
                    Some(Message::Bitfield(Bitfield::from_vec(bytes)))
                }
                6 | 8 => {
                    if payload.len() != 12 {
                        return Err(Error::InvalidMessageLength);
                    }
                    let piece_index =
                        u32::from_be_bytes(payload[0..4].try_into().unwrap());
                    let offset =
                        u32::from_be_bytes(payload[4..8].try_into().unwrap());
                    let length =
                        u32::from_be_bytes(payload[8..12].try_into().unwrap());
                    let block = BlockInfo {
                        piece_index: piece_index as PieceIndex,
                        offset,
                        len: length,
                    };
                    Some(if id == 6 {
                        Message::Request(block)
                    } else {
                        Message::Cancel(block)
                    })
                }
                7 => {
                    if payload.len() < 8 {
                        return Err(Error::InvalidMessageLength);
                    }
                    let piece_index =
                        u32::from_be_bytes(payload[0..4].try_into().unwrap());
                    let offset =
                        u32::from_be_bytes(payload[4..8].try_into().unwrap());
                    let data = payload[8..].to_vec();
                    Some(Message::Piece {
                        piece_index: piece_index as PieceIndex,
                        offset,
                        data,
                    })
                }
                other => {
                    // unknown message id: log and discard the frame, the
                    // connection stays open per the peer-wire contract
                    log::warn!("Unknown peer message id {}, discarding", other);
                    None
                }
            };

            buf.advance(4 + len);

            if let Some(msg) = msg {
                return Ok(Some(msg));
            }
            // unknown id: loop around and try to decode the next frame
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrips_fixed_messages() {
        roundtrip(Message::Choke);
        roundtrip(Message::Unchoke);
        roundtrip(Message::Interested);
        roundtrip(Message::NotInterested);
        roundtrip(Message::Have { piece_index: 7 });
        roundtrip(Message::Request(BlockInfo {
            piece_index: 3,
            offset: 0x4000,
            len: 0x4000,
        }));
        roundtrip(Message::Cancel(BlockInfo {
            piece_index: 3,
            offset: 0x4000,
            len: 0x4000,
        }));
        roundtrip(Message::Piece {
            piece_index: 1,
            offset: 0,
            data: vec![1, 2, 3, 4],
        });
    }

    #[test]
    fn roundtrips_bitfield() {
        let bitfield = Bitfield::from_vec(vec![0b1100_0001]);
        roundtrip(Message::Bitfield(bitfield));
    }

    #[test]
    fn decodes_keep_alive() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn skips_unknown_message_id_without_closing() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        // unknown id 42, then a well-formed Choke frame
        buf.put_u32(1);
        buf.put_u8(42);
        buf.put_u32(1);
        buf.put_u8(MessageId::Choke as u8);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Choke);
    }

    #[test]
    fn handshake_roundtrips() {
        let info_hash = [7; 20];
        let peer_id = [9; 20];
        let handshake = Handshake::new(info_hash, peer_id);
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        codec.encode(handshake, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn handshake_rejects_bad_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"not BitTorrent prot");
        buf.put_slice(&[0; 8]);
        buf.put_slice(&[0; 20]);
        buf.put_slice(&[0; 20]);
        let mut codec = HandshakeCodec;
        assert!(codec.decode(&mut buf).is_err());
    }
}
