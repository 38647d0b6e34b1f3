use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    os::unix::io::AsRawFd,
    sync::Mutex,
};

use lru::LruCache;
use nix::sys::uio::pwritev;
use sha1::{Digest, Sha1};

use super::{Alert, AlertSender, Command, CommandReceiver};
use crate::{
    error::{Error, Result},
    iovecs::IoVecs,
    storage_info::{FileInfo, FsStructure, StorageInfo},
    PieceIndex, Sha1Hash, TorrentId,
};

/// The disk actor's event loop and per-torrent file handle bookkeeping.
pub(super) struct Disk {
    torrents: HashMap<TorrentId, Torrent>,
    cmd_port: CommandReceiver,
    alert_chan: AlertSender,
}

impl Disk {
    pub(super) fn new(cmd_port: CommandReceiver, alert_chan: AlertSender) -> Self {
        Self { torrents: HashMap::new(), cmd_port, alert_chan }
    }

    pub(super) async fn run(&mut self) {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::Open { id, info, segment_hashes, open_file_lru_size, reply } => {
                    let result = self.open(id, info, segment_hashes, open_file_lru_size);
                    let _ = reply.send(result);
                }
                Command::WriteSegment { id, segment_id, data } => {
                    self.write_segment(id, segment_id, data);
                }
                Command::ReadSegment { id, segment_id, reply } => {
                    let _ = reply.send(self.read_segment(id, segment_id));
                }
                Command::CheckSegment { id, segment_id, reply } => {
                    let _ = reply.send(self.check_segment(id, segment_id));
                }
                Command::RemoveTorrent { id } => {
                    self.torrents.remove(&id);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk IO event loop");
                    break;
                }
            }
        }
    }

    fn open(
        &mut self,
        id: TorrentId,
        info: StorageInfo,
        segment_hashes: Vec<u8>,
        open_file_lru_size: usize,
    ) -> Result<()> {
        if self.torrents.contains_key(&id) {
            return Err(Error::TorrentAlreadyExists(id));
        }
        let torrent = Torrent::open(info, segment_hashes, open_file_lru_size)?;
        self.torrents.insert(id, torrent);
        Ok(())
    }

    fn torrent(&self, id: TorrentId) -> Result<&Torrent> {
        self.torrents.get(&id).ok_or(Error::InvalidTorrentId(id))
    }

    fn write_segment(&mut self, id: TorrentId, segment_id: PieceIndex, data: Vec<u8>) {
        let result = match self.torrents.get(&id).ok_or(Error::InvalidTorrentId(id)) {
            Ok(torrent) => torrent.write_segment(segment_id, &data),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            log::warn!("Torrent {} failed to write segment {}: {}", id, segment_id, e);
        }
        let _ = self.alert_chan.send(Alert::SegmentWritten {
            id,
            segment_id,
            result: result.map_err(|e| e.to_string()),
        });
    }

    fn read_segment(&self, id: TorrentId, segment_id: PieceIndex) -> Result<Vec<u8>> {
        self.torrent(id)?.read_segment(segment_id)
    }

    fn check_segment(&self, id: TorrentId, segment_id: PieceIndex) -> Result<bool> {
        self.torrent(id)?.check_segment(segment_id)
    }
}

/// Per-torrent disk state: the file layout and a bounded cache of the
/// handles backing it.
struct Torrent {
    info: StorageInfo,
    /// All segment SHA-1 hashes, concatenated in order (20 bytes each).
    segment_hashes: Vec<u8>,
    files: Vec<FileInfo>,
    /// Open handles for at most `open_file_lru_size` of `files` at once,
    /// keyed by index into `files`; least recently used is closed and
    /// reopened on demand beyond that bound.
    open_files: Mutex<LruCache<usize, File>>,
}

impl Torrent {
    /// Creates the directory structure (if needed) and preallocates every
    /// file to its full declared length, then closes it again; handles are
    /// reopened lazily through `open_files`. Tolerates the download
    /// directory already existing, so a previously started download can be
    /// resumed: existing files are not truncated.
    fn open(info: StorageInfo, segment_hashes: Vec<u8>, open_file_lru_size: usize) -> Result<Self> {
        let preallocate = |file: FileInfo| -> Result<FileInfo> {
            if let Some(parent) = file.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let handle = OpenOptions::new().read(true).write(true).create(true).open(&file.path)?;
            handle.set_len(file.len)?;
            Ok(file)
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!("Torrent is a single {} byte file {:?}", file.len, file.path);
                let file = FileInfo {
                    path: info.download_dir.join(&file.path),
                    len: file.len,
                    torrent_offset: file.torrent_offset,
                };
                vec![preallocate(file)?]
            }
            FsStructure::Archive { files } => {
                log::debug!("Torrent is multi file, {} files", files.len());
                files
                    .iter()
                    .map(|file| {
                        preallocate(FileInfo {
                            path: info.download_dir.join(&file.path),
                            len: file.len,
                            torrent_offset: file.torrent_offset,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };

        let open_files = Mutex::new(LruCache::new(open_file_lru_size.max(1)));
        Ok(Self { info, segment_hashes, files, open_files })
    }

    /// Runs `f` against the file at `index`, opening it on a cache miss.
    /// The preallocation in `open` already created and sized the file, so
    /// this never (re)truncates it.
    fn with_file<R>(&self, index: usize, f: impl FnOnce(&File) -> Result<R>) -> Result<R> {
        let mut cache = self.open_files.lock().expect("open file cache mutex poisoned");
        if !cache.contains(&index) {
            let handle = OpenOptions::new().read(true).write(true).open(&self.files[index].path)?;
            cache.put(index, handle);
        }
        let handle = cache.get(&index).expect("just inserted");
        f(handle)
    }

    fn expected_hash(&self, segment_id: PieceIndex) -> Result<Sha1Hash> {
        let start = segment_id * 20;
        let end = start + 20;
        let bytes =
            self.segment_hashes.get(start..end).ok_or(Error::InvalidPieceIndex(segment_id))?;
        let mut hash = [0; 20];
        hash.copy_from_slice(bytes);
        Ok(hash)
    }

    fn write_segment(&self, segment_id: PieceIndex, data: &[u8]) -> Result<()> {
        let segment_offset = segment_id as u64 * self.info.piece_len as u64;
        let files_range = self.info.files_intersecting_piece(segment_id)?;
        debug_assert!(!files_range.is_empty());

        // the writer only ever hands us one contiguous buffer per segment
        let blocks = vec![data.to_vec()];
        let mut iovecs = IoVecs::new(&blocks);
        let mut file_offset = segment_offset;

        for index in files_range {
            let slice = self.files[index]
                .get_slice(file_offset, data.len() as u64 - (file_offset - segment_offset));
            self.with_file(index, |handle| write_vectored_at(handle, &mut iovecs, slice.offset, slice.len))?;
            file_offset += slice.len;
        }
        debug_assert!(iovecs.is_empty());

        Ok(())
    }

    fn read_segment(&self, segment_id: PieceIndex) -> Result<Vec<u8>> {
        let len = self.info.piece_len(segment_id)?;
        let segment_offset = segment_id as u64 * self.info.piece_len as u64;
        let files_range = self.info.files_intersecting_piece(segment_id)?;

        let mut buf = vec![0u8; len as usize];
        let mut written = 0usize;
        for index in files_range {
            let slice = self.files[index]
                .get_slice(segment_offset + written as u64, len as u64 - written as u64);
            let end = written + slice.len as usize;
            let n = self.with_file(index, |handle| read_at(handle, &mut buf[written..end], slice.offset))?;
            written += n;
        }
        Ok(buf)
    }

    fn check_segment(&self, segment_id: PieceIndex) -> Result<bool> {
        let data = self.read_segment(segment_id)?;
        let expected = self.expected_hash(segment_id)?;
        let digest = Sha1::digest(&data);
        Ok(digest.as_slice() == expected)
    }
}

/// Writes exactly `len` bytes from the front of `iovecs` at `offset`,
/// looping `pwritev` to completion in case of a partial write.
fn write_vectored_at(handle: &File, iovecs: &mut IoVecs, offset: u64, len: u64) -> Result<()> {
    let mut remaining = len;
    while remaining > 0 {
        let bufs = iovecs.take(remaining);
        if bufs.is_empty() {
            break;
        }
        let write_count = pwritev(handle.as_raw_fd(), &bufs, offset as i64)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        iovecs.advance(write_count);
        remaining -= write_count as u64;
    }
    Ok(())
}

fn read_at(handle: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    use std::os::unix::fs::FileExt;
    Ok(handle.read_at(buf, offset)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metainfo::Metainfo, storage_info::StorageInfo};
    use sha1::{Digest, Sha1};
    use std::path::PathBuf;

    fn sample_metainfo() -> Vec<u8> {
        let piece0 = Sha1::digest(b"abc");
        let piece1 = Sha1::digest(b"def");
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&piece0);
        pieces.extend_from_slice(&piece1);
        let info = crate::metainfo::Info {
            name: "sample.bin".into(),
            pieces: serde_bytes::ByteBuf::from(pieces),
            piece_length: 3,
            length: Some(6),
            files: None,
            private: None,
        };
        let metainfo =
            Metainfo { info, announce: Some("http://t/announce".into()), announce_list: None };
        serde_bencode::to_bytes(&metainfo).unwrap()
    }

    #[test]
    fn writes_and_checks_single_file_segments() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = sample_metainfo();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        let info = StorageInfo::new(&metainfo, PathBuf::from(dir.path())).unwrap();
        let hashes = metainfo.segment_hashes().unwrap();
        let mut flat_hashes = Vec::new();
        for h in &hashes {
            flat_hashes.extend_from_slice(h);
        }

        let torrent = Torrent::open(info, flat_hashes, 10).unwrap();
        torrent.write_segment(0, b"abc").unwrap();
        torrent.write_segment(1, b"def").unwrap();

        assert!(torrent.check_segment(0).unwrap());
        assert!(torrent.check_segment(1).unwrap());
        assert_eq!(torrent.read_segment(0).unwrap(), b"abc");
        assert_eq!(torrent.read_segment(1).unwrap(), b"def");
    }
}
