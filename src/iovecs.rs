//! A thin wrapper around [`nix::sys::uio::IoVec`] that lets a vectored write
//! be split across several files without copying the underlying block
//! buffers, and resumed after a partial (short) `pwritev` call.
//!
//! A segment that straddles file boundaries is written with one or more
//! `pwritev` calls per file: the writer asks [`IoVecs`] for at most
//! `file_len` bytes' worth of buffers, writes them, and advances past
//! however many bytes the kernel actually accepted.

use nix::sys::uio::IoVec as NixIoVec;

pub(crate) type IoVec<'a> = NixIoVec<&'a [u8]>;

/// A view over the not-yet-written prefix of a run of block buffers.
pub(crate) struct IoVecs<'a> {
    bufs: Vec<IoVec<'a>>,
}

impl<'a> IoVecs<'a> {
    /// Builds a view over the entirety of `buffers`.
    pub fn new(buffers: &'a [Vec<u8>]) -> Self {
        Self { bufs: buffers.iter().map(|b| IoVec::from_slice(b)).collect() }
    }

    /// Returns up to `limit` bytes' worth of buffers from the front of the
    /// remaining run, without consuming them. Used to bound a `pwritev`
    /// call to the part of a segment that overlaps a single file.
    pub fn take(&self, limit: u64) -> Vec<IoVec<'a>> {
        let mut out = Vec::new();
        let mut remaining = limit;
        for buf in &self.bufs {
            if remaining == 0 {
                break;
            }
            let slice = buf.as_slice();
            let take = (slice.len() as u64).min(remaining) as usize;
            out.push(IoVec::from_slice(&slice[..take]));
            remaining -= take as u64;
        }
        out
    }

    /// True once every buffer in the run has been fully consumed.
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Drops `count` bytes from the front of the run, as confirmed written
    /// by a (possibly partial) `pwritev` call.
    pub fn advance(&mut self, mut count: usize) {
        while count > 0 {
            let Some(first) = self.bufs.first() else { break };
            let first_len = first.as_slice().len();
            if count < first_len {
                let rest = &first.as_slice()[count..];
                // `IoVec::as_slice` elides its return lifetime down to
                // `&self` rather than `'a`, even though the bytes it points
                // at really do live for `'a` (they're borrowed from the
                // original block buffer at construction time), so this
                // reconstructs the longer-lived slice from the same pointer.
                self.bufs[0] = IoVec::from_slice(unsafe {
                    std::slice::from_raw_parts(rest.as_ptr(), rest.len())
                });
                return;
            }
            count -= first_len;
            self.bufs.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_bounds_to_file_length_across_buffers() {
        let blocks = vec![b"hello ".to_vec(), b"world".to_vec()];
        let iovecs = IoVecs::new(&blocks);
        let taken = iovecs.take(8);
        let collected: Vec<u8> = taken.iter().flat_map(|b| b.as_slice().to_vec()).collect();
        assert_eq!(collected, b"hello wo");
    }

    #[test]
    fn advance_consumes_whole_and_partial_buffers() {
        let blocks = vec![b"0123456789".to_vec()];
        let mut iovecs = IoVecs::new(&blocks);
        iovecs.advance(4);
        let remaining: Vec<u8> =
            iovecs.take(100).iter().flat_map(|b| b.as_slice().to_vec()).collect();
        assert_eq!(remaining, b"456789");
    }

    #[test]
    fn advance_past_end_of_run_empties_it() {
        let blocks = vec![b"abc".to_vec(), b"def".to_vec()];
        let mut iovecs = IoVecs::new(&blocks);
        iovecs.advance(6);
        assert!(iovecs.is_empty());
    }
}
