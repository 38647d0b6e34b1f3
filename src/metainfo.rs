//! Bencoded `.torrent` metainfo parsing.
//!
//! This is the "metainfo decoding" collaborator the download engine treats as
//! external (it never re-derives a torrent descriptor on its own), but it is
//! shipped here in full since the engine cannot be exercised end to end
//! without turning a `.torrent` file into a [`Metainfo`].

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{error::Error, Sha1Hash};

#[derive(Debug, Serialize, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    #[serde(default)]
    pub announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// Derives the torrent's 20 byte info hash by re-bencoding the `info`
    /// dictionary and taking its SHA-1 digest.
    pub fn info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Returns the flat list of tracker announce URLs, deduplicated, primary
    /// `announce` first, followed by everything in `announce-list`.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(announce) = &self.announce {
            urls.push(announce.clone());
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !urls.contains(url) {
                        urls.push(url.clone());
                    }
                }
            }
        }
        urls
    }

    /// Returns the number of segments (pieces) in the torrent: `⌈T/L⌉`.
    pub fn segment_count(&self) -> usize {
        let hash_len = self.info.pieces.len();
        debug_assert_eq!(hash_len % 20, 0);
        hash_len / 20
    }

    /// Returns the expected SHA-1 hash of segment `id`.
    pub fn segment_hash(&self, id: usize) -> Result<Sha1Hash, Error> {
        let start = id * 20;
        let end = start + 20;
        if end > self.info.pieces.len() {
            return Err(Error::InvalidPieceIndex(id));
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[start..end]);
        Ok(hash)
    }

    /// Returns every segment's expected SHA-1 hash, in order.
    pub fn segment_hashes(&self) -> Result<Vec<Sha1Hash>, Error> {
        (0..self.segment_count()).map(|id| self.segment_hash(id)).collect()
    }

    /// The total length of the torrent's payload, summed across all files.
    pub fn total_len(&self) -> u64 {
        match &self.info.files {
            Some(files) => files.iter().map(|f| f.length as u64).sum(),
            None => self.info.length.unwrap_or(0),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}
