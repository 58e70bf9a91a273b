//! A fixed-minimum/maximum-capacity ring of bytes.
//!
//! [`CircularByteBuffer`] backs the staging area a [`zio`](../zio/index.html)
//! object uses when it cannot move bytes directly between a descriptor and
//! an envelope. It grows on demand up to a maximum capacity and never drops
//! data silently: a write that would overflow the maximum fails instead.

use std::os::fd::AsFd;

use rustix::io::{Errno, IoSlice, IoSliceMut};
use zio_log::instrument;

mod error;

pub use error::BufError;

/// Outcome of a single nonblocking fill from a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// `n` bytes were read into the buffer.
    Read(usize),
    /// The descriptor reported end-of-file (a zero-length read).
    Eof,
    /// The descriptor had no data ready; not an error.
    WouldBlock,
}

/// Outcome of a single nonblocking drain to a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// `n` bytes were written out of the buffer.
    Wrote(usize),
    /// The descriptor was not ready to accept data; not an error.
    WouldBlock,
}

/// Bytes accepted by [`CircularByteBuffer::write`].
///
/// Under the no-drop policy `dropped` is always `0`; the field exists so the
/// type mirrors buffers that implement an overwrite policy instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    /// Bytes copied into the ring.
    pub written: usize,
    /// Bytes discarded to make room. Always `0` for this no-drop ring.
    pub dropped: usize,
}

/// A growable ring buffer of bytes with a hard maximum capacity.
///
/// The buffer never silently discards data: [`write`](Self::write) fails
/// with [`BufError::BufferFull`] rather than overwriting unread bytes.
pub struct CircularByteBuffer {
    data: Vec<u8>,
    /// Index of the first valid byte.
    start: usize,
    /// Number of valid bytes currently stored.
    len: usize,
    max_capacity: usize,
}

impl CircularByteBuffer {
    /// Creates a buffer backed by `min_capacity` bytes initially, growing up
    /// to `max_capacity` as needed.
    ///
    /// # Panics
    /// Panics if `min_capacity` is `0` or exceeds `max_capacity`.
    pub fn new(min_capacity: usize, max_capacity: usize) -> Self {
        assert!(min_capacity > 0, "min_capacity must be nonzero");
        assert!(
            min_capacity <= max_capacity,
            "min_capacity must not exceed max_capacity"
        );
        Self {
            data: vec![0; min_capacity],
            start: 0,
            len: 0,
            max_capacity,
        }
    }

    /// Creates a buffer using the defaults from the wire-protocol spec:
    /// capacity grows within `[64, 1_638_400]` bytes.
    pub fn with_defaults() -> Self {
        Self::new(64, 1_638_400)
    }

    /// Number of bytes currently stored.
    pub fn used(&self) -> usize {
        self.len
    }

    /// Number of additional bytes that can be accepted before hitting
    /// `max_capacity`.
    pub fn free(&self) -> usize {
        self.max_capacity - self.len
    }

    /// `true` if no bytes are stored.
    pub fn empty(&self) -> bool {
        self.len == 0
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn write_pos(&self) -> usize {
        (self.start + self.len) % self.capacity()
    }

    /// Grows the backing allocation (doubling, capped at `max_capacity`)
    /// until at least `additional` more bytes can be accepted, or fails if
    /// even `max_capacity` cannot fit them.
    fn ensure_room(&mut self, additional: usize) -> Result<(), BufError> {
        if additional > self.free() {
            return Err(BufError::BufferFull);
        }
        let required = self.len + additional;
        if required <= self.capacity() {
            return Ok(());
        }
        let mut new_cap = self.capacity().max(1);
        while new_cap < required {
            new_cap = (new_cap * 2).min(self.max_capacity);
        }
        self.relocate(new_cap);
        Ok(())
    }

    fn relocate(&mut self, new_cap: usize) {
        let mut new_data = vec![0u8; new_cap];
        let n = self.copy_used_into(&mut new_data[..self.len]);
        debug_assert_eq!(n, self.len);
        self.data = new_data;
        self.start = 0;
    }

    fn copy_used_into(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        let cap = self.capacity();
        let first = (cap - self.start).min(n);
        dst[..first].copy_from_slice(&self.data[self.start..self.start + first]);
        if n > first {
            dst[first..n].copy_from_slice(&self.data[..n - first]);
        }
        n
    }

    /// Appends `bytes` to the ring, growing as needed.
    ///
    /// Fails with [`BufError::BufferFull`] rather than dropping any of
    /// `bytes` if the ring cannot grow enough to hold them all.
    pub fn write(&mut self, bytes: &[u8]) -> Result<WriteReport, BufError> {
        if bytes.is_empty() {
            return Ok(WriteReport {
                written: 0,
                dropped: 0,
            });
        }
        self.ensure_room(bytes.len())?;
        let cap = self.capacity();
        let pos = self.write_pos();
        let first = (cap - pos).min(bytes.len());
        self.data[pos..pos + first].copy_from_slice(&bytes[..first]);
        if bytes.len() > first {
            self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        }
        self.len += bytes.len();
        Ok(WriteReport {
            written: bytes.len(),
            dropped: 0,
        })
    }

    /// Copies up to `dst.len()` bytes out of the ring into `dst`, removing
    /// them. Returns the number of bytes copied.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.copy_used_into(dst);
        self.start = (self.start + n) % self.capacity().max(1);
        self.len -= n;
        n
    }

    /// Copies up to `dst.len()` bytes through and including the first
    /// newline into `dst`, removing them. Returns `0` if no complete line
    /// is buffered yet (the caller should fall back to [`read`](Self::read)
    /// once EOF makes it clear no newline is coming).
    pub fn read_line(&mut self, dst: &mut [u8]) -> usize {
        let cap = self.capacity();
        let scan_len = self.len.min(dst.len());
        let mut line_len = None;
        for i in 0..scan_len {
            let idx = (self.start + i) % cap;
            if self.data[idx] == b'\n' {
                line_len = Some(i + 1);
                break;
            }
        }
        match line_len {
            Some(n) => self.read(&mut dst[..n]),
            None => 0,
        }
    }

    /// Performs a single nonblocking read from `fd` into the ring's free
    /// region(s).
    ///
    /// `max` caps how many bytes this call will try to accept, in addition
    /// to the hard cap of `max_capacity`. The amount actually offered to the
    /// read syscall is capped at whatever headroom the *current* allocation
    /// has, not the hard maximum: the ring grows one doubling step only once
    /// that headroom is exhausted, so a handful of bytes on the first fill
    /// doesn't jump the backing allocation straight to `max_capacity`.
    pub fn write_from_fd(
        &mut self,
        fd: impl AsFd,
        max: Option<usize>,
    ) -> Result<FillOutcome, BufError> {
        instrument!(zio_log::Level::TRACE, "write_from_fd");
        let target = max.unwrap_or(usize::MAX).min(self.free());
        if target == 0 {
            return Ok(FillOutcome::WouldBlock);
        }
        let mut want = target.min(self.capacity() - self.len);
        if want == 0 {
            self.ensure_room(1)?;
            want = target.min(self.capacity() - self.len);
        }

        let cap = self.capacity();
        let pos = self.write_pos();
        let first_len = (cap - pos).min(want);
        let second_len = want - first_len;

        loop {
            let result = if second_len == 0 {
                rustix::io::read(&fd, &mut self.data[pos..pos + first_len])
            } else {
                let (head, tail) = self.data.split_at_mut(pos);
                let mut slices = [
                    IoSliceMut::new(&mut tail[..first_len]),
                    IoSliceMut::new(&mut head[..second_len]),
                ];
                rustix::io::readv(&fd, &mut slices)
            };
            return match result {
                Ok(0) => Ok(FillOutcome::Eof),
                Ok(n) => {
                    self.len += n;
                    Ok(FillOutcome::Read(n))
                }
                Err(Errno::AGAIN) => Ok(FillOutcome::WouldBlock),
                Err(Errno::INTR) => continue,
                Err(e) => Err(BufError::Io(e.into())),
            };
        }
    }

    /// Performs a single nonblocking write from the ring's used region(s)
    /// to `fd`.
    ///
    /// `max` caps how many bytes this call will try to drain, in addition
    /// to however many bytes are currently buffered.
    pub fn read_to_fd(
        &mut self,
        fd: impl AsFd,
        max: Option<usize>,
    ) -> Result<DrainOutcome, BufError> {
        instrument!(zio_log::Level::TRACE, "read_to_fd");
        let want = max.unwrap_or(usize::MAX).min(self.len);
        if want == 0 {
            return Ok(DrainOutcome::Wrote(0));
        }

        let cap = self.capacity();
        let first_len = (cap - self.start).min(want);
        let second_len = want - first_len;

        loop {
            let result = if second_len == 0 {
                rustix::io::write(&fd, &self.data[self.start..self.start + first_len])
            } else {
                let slices = [
                    IoSlice::new(&self.data[self.start..self.start + first_len]),
                    IoSlice::new(&self.data[..second_len]),
                ];
                rustix::io::writev(&fd, &slices)
            };
            return match result {
                Ok(n) => {
                    self.start = (self.start + n) % cap;
                    self.len -= n;
                    Ok(DrainOutcome::Wrote(n))
                }
                Err(Errno::AGAIN) => Ok(DrainOutcome::WouldBlock),
                Err(Errno::INTR) => continue,
                Err(e) => Err(BufError::Io(e.into())),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let mut buf = CircularByteBuffer::new(8, 64);
        assert_eq!(buf.write(b"hello").unwrap().written, 5);
        assert_eq!(buf.used(), 5);
        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert!(buf.empty());
    }

    #[test]
    fn wraparound_write_and_read() {
        let mut buf = CircularByteBuffer::new(8, 64);
        buf.write(b"123456").unwrap();
        let mut out = [0u8; 4];
        buf.read(&mut out);
        assert_eq!(&out, b"1234");
        // write_pos is now 6, start is 4; this write should wrap.
        buf.write(b"abcd").unwrap();
        assert_eq!(buf.used(), 6);
        let mut rest = [0u8; 6];
        buf.read(&mut rest);
        assert_eq!(&rest, b"56abcd");
    }

    #[test]
    fn grows_up_to_max_then_fails() {
        let mut buf = CircularByteBuffer::new(4, 8);
        buf.write(&[0u8; 8]).unwrap();
        assert_eq!(buf.free(), 0);
        assert!(matches!(
            buf.write(&[0u8]).unwrap_err(),
            BufError::BufferFull
        ));
        assert_eq!(buf.used(), 8);
    }

    #[test]
    fn read_line_waits_for_newline() {
        let mut buf = CircularByteBuffer::new(16, 64);
        buf.write(b"partial").unwrap();
        let mut out = [0u8; 16];
        assert_eq!(buf.read_line(&mut out), 0);
        buf.write(b" line\nmore").unwrap();
        let n = buf.read_line(&mut out);
        assert_eq!(&out[..n], b"partial line\n");
        assert_eq!(buf.used(), 4);
    }

    #[test]
    fn write_from_fd_does_not_grow_past_current_headroom_on_a_small_fill() {
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        rustix::io::write(&write_end, b"xyz").unwrap();

        let mut buf = CircularByteBuffer::with_defaults();
        assert_eq!(buf.capacity(), 64);
        match buf.write_from_fd(&read_end, None).unwrap() {
            FillOutcome::Read(n) => assert_eq!(n, 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            buf.capacity(),
            64,
            "a 3-byte fill must not grow the ring to its max capacity"
        );
    }

    #[test]
    fn write_from_fd_grows_one_step_at_a_time_once_headroom_is_exhausted() {
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        rustix::io::write(&write_end, &[0u8; 96]).unwrap();

        let mut buf = CircularByteBuffer::new(8, 1024);
        assert_eq!(buf.capacity(), 8);
        // First fill only offers the 8 bytes already allocated.
        match buf.write_from_fd(&read_end, None).unwrap() {
            FillOutcome::Read(n) => assert_eq!(n, 8),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(buf.capacity(), 8);
        // Second fill has no headroom left, so it grows one doubling step
        // before reading more, rather than jumping to max_capacity.
        match buf.write_from_fd(&read_end, None).unwrap() {
            FillOutcome::Read(n) => assert_eq!(n, 8),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(buf.capacity(), 16);
    }

    #[test]
    fn fill_and_drain_through_a_pipe() {
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        rustix::io::write(&write_end, b"payload").unwrap();
        drop(write_end);

        let mut buf = CircularByteBuffer::new(64, 1024);
        match buf.write_from_fd(&read_end, None).unwrap() {
            FillOutcome::Read(n) => assert_eq!(n, 7),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(buf.write_from_fd(&read_end, None).unwrap(), FillOutcome::Eof);

        let (drain_read, drain_write) = rustix::pipe::pipe().unwrap();
        match buf.read_to_fd(&drain_write, None).unwrap() {
            DrainOutcome::Wrote(n) => assert_eq!(n, 7),
            DrainOutcome::WouldBlock => panic!("unexpected would-block"),
        }
        drop(drain_write);
        let mut out = [0u8; 7];
        rustix::io::read(&drain_read, &mut out).unwrap();
        assert_eq!(&out, b"payload");
    }
}
