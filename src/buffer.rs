//! Growable byte buffer with cheap prepend, used for per-connection I/O.
//!
//! Layout: `[prepend region][readable region][writable region]`, tracked by
//! two indices into a single `Vec<u8>`. `reader` never drops below
//! [`Buffer::PREPEND_RESERVE`], leaving room for higher layers to stick a
//! length header in front of an already-written payload without copying it.

use std::io::{self, IoSliceMut, Read};
use std::os::fd::RawFd;

const INITIAL_SIZE: usize = 1024;
const EXTRA_BUF_SIZE: usize = 65536;

#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Buffer {
    /// Bytes reserved at the front of every buffer for cheap header prepend.
    pub const PREPEND_RESERVE: usize = 8;

    pub fn new() -> Buffer {
        let mut buf = Vec::with_capacity(Self::PREPEND_RESERVE + INITIAL_SIZE);
        buf.resize(buf.capacity(), 0);
        Buffer {
            buf,
            reader: Self::PREPEND_RESERVE,
            writer: Self::PREPEND_RESERVE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Advances the reader past `n` bytes. Resets both indices when the
    /// buffer has been fully drained, so repeated small reads don't creep
    /// the write cursor toward the end of the allocation forever.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n == self.readable_bytes() {
            self.reader = Self::PREPEND_RESERVE;
            self.writer = Self::PREPEND_RESERVE;
        } else {
            self.reader += n;
        }
    }

    pub fn retrieve_all(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        self.retrieve_as_vec(n)
    }

    pub fn retrieve_as_vec(&mut self, n: usize) -> Vec<u8> {
        let result = self.peek()[..n].to_vec();
        self.retrieve(n);
        result
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let writer = self.writer;
        self.buf[writer..writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        let reader = self.reader;
        self.buf[reader..reader + data.len()].copy_from_slice(data);
    }

    /// Ensures at least `need` bytes are writable, compacting in place when
    /// the combined prepend+trailing slack covers it, else reallocating.
    fn ensure_writable(&mut self, need: usize) {
        if self.writable_bytes() >= need {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() >= need + Self::PREPEND_RESERVE {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader..self.writer, Self::PREPEND_RESERVE);
            self.reader = Self::PREPEND_RESERVE;
            self.writer = Self::PREPEND_RESERVE + readable;
        } else {
            self.buf.resize(self.writer + need, 0);
        }
    }

    /// Scattered read: absorbs whatever the kernel hands back into the
    /// writable tail, spilling any overflow into a stack buffer and only
    /// then growing, so a single burst doesn't require pre-sizing the
    /// buffer to the largest possible read.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut file = ManuallyDroppedFile::new(fd);
        let n = {
            let mut slices = [
                IoSliceMut::new(&mut self.buf[self.writer..]),
                IoSliceMut::new(&mut extra_buf),
            ];
            file.read_vectored(&mut slices)?
        };

        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra_buf[..n - writable]);
        }
        Ok(n)
    }

    /// Single write of the readable region; caller inspects the return
    /// value and calls `retrieve` with however much actually went out.
    pub fn write_fd(&self, fd: RawFd) -> io::Result<usize> {
        let mut file = ManuallyDroppedFile::new(fd);
        file.write(self.peek())
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A `std::fs::File` that doesn't close the underlying fd on drop: we only
/// ever borrow the fd of a `Socket` we don't own, for the duration of one
/// syscall.
struct ManuallyDroppedFile(std::mem::ManuallyDrop<std::fs::File>);

impl ManuallyDroppedFile {
    fn new(fd: RawFd) -> Self {
        use std::os::fd::FromRawFd;
        ManuallyDroppedFile(std::mem::ManuallyDrop::new(unsafe {
            std::fs::File::from_raw_fd(fd)
        }))
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.0.read_vectored(bufs)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        self.0.write(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_with_reserved_prepend() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), Buffer::PREPEND_RESERVE);
    }

    #[test]
    fn append_then_retrieve_roundtrips() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.retrieve_as_vec(11), b"hello world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), Buffer::PREPEND_RESERVE);
    }

    #[test]
    fn retrieve_all_resets_to_prepend_reserve_after_partial_reads() {
        let mut buf = Buffer::new();
        buf.append(b"0123456789");
        buf.retrieve(4);
        assert_eq!(buf.readable_bytes(), 6);
        assert_eq!(buf.retrieve_all(), b"456789");
        assert_eq!(buf.prependable_bytes(), Buffer::PREPEND_RESERVE);
    }

    #[test]
    fn prepend_writes_just_before_reader() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&[0, 0, 0, 7]);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.peek()[..4], &[0, 0, 0, 7]);
    }

    #[test]
    fn grow_by_compaction_preserves_readable_bytes() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; 64]);
        buf.retrieve(60);
        // plenty of prependable + writable slack now; this should compact
        // in place rather than reallocate.
        let before = buf.peek().to_vec();
        buf.append(&vec![2u8; 32]);
        assert_eq!(&buf.peek()[..before.len()], &before[..]);
        assert_eq!(buf.readable_bytes(), before.len() + 32);
    }

    #[test]
    fn grow_by_reallocation_when_compaction_is_not_enough() {
        let mut buf = Buffer::new();
        buf.append(&vec![9u8; 1024]); // fills the initial allocation
        let before = buf.peek().to_vec();
        buf.append(&vec![1u8; 2048]);
        assert_eq!(&buf.peek()[..before.len()], &before[..]);
        assert_eq!(buf.readable_bytes(), before.len() + 2048);
    }

    #[test]
    #[should_panic]
    fn retrieve_more_than_readable_panics() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(4);
    }
}
