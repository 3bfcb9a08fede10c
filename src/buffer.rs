use std::collections::VecDeque;
use std::io::{Error, ErrorKind, Result};
use std::os::fd::OwnedFd;

pub const DEFAULT_CAPACITY: usize = 4096;

// Most descriptors accepted by a single receive.
pub const MAX_FDS_PER_MSG: usize = 28;

pub const FD_CAPACITY: usize = MAX_FDS_PER_MSG * 4;

#[derive(Debug)]
struct FdGroup {
    offset: usize,
    fds: Vec<OwnedFd>,
}

#[derive(Debug)]
pub struct Pending<'a> {
    pub bytes: &'a [u8],
    pub fds: &'a [OwnedFd],
}

#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    // Read cursor.
    tail: usize,
    // Write cursor.
    head: usize,
    groups: VecDeque<FdGroup>,
    fd_count: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be non-zero");
        Buffer {
            data: vec![0; capacity].into_boxed_slice(),
            tail: 0,
            head: 0,
            groups: VecDeque::new(),
            fd_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.head - self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    // Counts the space reclaimable by compaction.
    pub fn space(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn queued_fds(&self) -> usize {
        self.fd_count
    }

    pub fn fd_space(&self) -> usize {
        FD_CAPACITY.saturating_sub(self.fd_count)
    }

    // At least one byte and a full message worth of descriptors.
    pub fn has_room(&self) -> bool {
        self.space() > 0 && self.fd_space() >= MAX_FDS_PER_MSG
    }

    /// Appends as much of `bytes` as fits. `fds` are taken only if at least
    /// one byte was stored.
    pub fn write(&mut self, bytes: &[u8], fds: &mut Vec<OwnedFd>) -> usize {
        if bytes.is_empty() || fds.len() > self.fd_space() {
            return 0;
        }
        if self.capacity() - self.head < bytes.len() {
            self.compact();
        }

        let n = bytes.len().min(self.capacity() - self.head);
        if n == 0 {
            return 0;
        }
        self.data[self.head..self.head + n].copy_from_slice(&bytes[..n]);
        self.commit(n, fds);
        n
    }

    /// Lets `f` receive directly into the spare region. `f` gets the spare
    /// bytes, a vector to push received descriptors into, and the most
    /// descriptors it may accept. Returns what `f` returned; a zero-length
    /// result discards any descriptors `f` produced. A full buffer reports
    /// `WouldBlock` without calling `f`.
    pub fn fill_with<F>(&mut self, f: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8], &mut Vec<OwnedFd>, usize) -> Result<usize>,
    {
        if self.tail > 0 {
            self.compact();
        }
        if self.head == self.capacity() {
            return Err(Error::new(ErrorKind::WouldBlock, "buffer is full"));
        }

        let max_fds = self.fd_space().min(MAX_FDS_PER_MSG);
        let mut fds = Vec::new();
        let head = self.head;
        let n = f(&mut self.data[head..], &mut fds, max_fds)?;
        debug_assert!(n <= self.capacity() - head);
        if n > 0 {
            self.commit(n, &mut fds);
        }
        Ok(n)
    }

    // Stops short of the next descriptor group so each descriptor leaves with
    // the byte it arrived with.
    pub fn read_available(&self) -> Pending<'_> {
        let mut groups = self.groups.iter();
        let (fds, boundary) = match groups.next() {
            Some(group) if group.offset == self.tail => {
                (&group.fds[..], groups.next().map(|next| next.offset))
            }
            Some(group) => (&[][..], Some(group.offset)),
            None => (&[][..], None),
        };
        let end = boundary.unwrap_or(self.head);
        Pending {
            bytes: &self.data[self.tail..end],
            fds,
        }
    }

    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consumed past the write cursor");
        if n == 0 {
            return;
        }
        self.tail += n;
        while let Some(group) = self.groups.front() {
            if group.offset >= self.tail {
                break;
            }
            if let Some(group) = self.groups.pop_front() {
                self.fd_count -= group.fds.len();
            }
        }
        if self.tail == self.head {
            self.tail = 0;
            self.head = 0;
        }
    }

    fn commit(&mut self, n: usize, fds: &mut Vec<OwnedFd>) {
        if !fds.is_empty() {
            self.fd_count += fds.len();
            self.groups.push_back(FdGroup {
                offset: self.head,
                fds: std::mem::take(fds),
            });
        }
        self.head += n;
    }

    // Moves the unread bytes to the front of the region.
    fn compact(&mut self) {
        if self.tail == 0 {
            return;
        }
        let shift = self.tail;
        self.data.copy_within(self.tail..self.head, 0);
        self.head -= shift;
        self.tail = 0;
        for group in self.groups.iter_mut() {
            group.offset -= shift;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::{AsRawFd, FromRawFd};

    fn pipe() -> (std::fs::File, OwnedFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(ret, 0, "pipe2 failed");
        unsafe {
            (
                std::fs::File::from_raw_fd(fds[0]),
                OwnedFd::from_raw_fd(fds[1]),
            )
        }
    }

    #[test]
    fn bytes_come_back_in_order() {
        let mut buf = Buffer::with_capacity(16);
        assert_eq!(buf.write(b"hello ", &mut Vec::new()), 6);
        assert_eq!(buf.write(b"world", &mut Vec::new()), 5);

        let pending = buf.read_available();
        assert_eq!(pending.bytes, b"hello world");
        assert!(pending.fds.is_empty());

        buf.consume(6);
        assert_eq!(buf.read_available().bytes, b"world");
        buf.consume(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn write_stores_only_the_prefix_that_fits() {
        let mut buf = Buffer::with_capacity(8);
        assert_eq!(buf.write(b"0123456789", &mut Vec::new()), 8);
        assert_eq!(buf.write(b"x", &mut Vec::new()), 0);
        assert_eq!(buf.read_available().bytes, b"01234567");
        assert!(!buf.has_room());
    }

    #[test]
    fn cursors_reset_when_drained() {
        let mut buf = Buffer::with_capacity(8);
        buf.write(b"abcdefgh", &mut Vec::new());
        buf.consume(8);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.write(b"12345678", &mut Vec::new()), 8);
    }

    #[test]
    fn partial_consume_makes_room_by_compaction() {
        let mut buf = Buffer::with_capacity(8);
        buf.write(b"abcdefgh", &mut Vec::new());
        buf.consume(5);
        assert_eq!(buf.space(), 5);
        assert_eq!(buf.write(b"12345", &mut Vec::new()), 5);
        assert_eq!(buf.read_available().bytes, b"fgh12345");
    }

    #[test]
    fn fill_with_receives_into_spare_region() {
        let mut buf = Buffer::with_capacity(8);
        buf.write(b"ab", &mut Vec::new());
        let n = buf
            .fill_with(|spare, _, max_fds| {
                assert_eq!(spare.len(), 6);
                assert_eq!(max_fds, MAX_FDS_PER_MSG);
                spare[..3].copy_from_slice(b"cde");
                Ok(3)
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf.read_available().bytes, b"abcde");
    }

    #[test]
    fn fill_with_propagates_errors() {
        let mut buf = Buffer::default();
        let err = buf
            .fill_with(|_, _, _| Err(std::io::ErrorKind::WouldBlock.into()))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
        assert!(buf.is_empty());
    }

    #[test]
    fn descriptor_waits_for_preceding_bytes() {
        let (_r, w) = pipe();
        let mut buf = Buffer::with_capacity(32);
        buf.write(b"abc", &mut Vec::new());
        let mut fds = vec![w];
        assert_eq!(buf.write(b"de", &mut fds), 2);
        assert!(fds.is_empty());
        assert_eq!(buf.queued_fds(), 1);

        let pending = buf.read_available();
        assert_eq!(pending.bytes, b"abc");
        assert!(pending.fds.is_empty());

        buf.consume(3);
        let pending = buf.read_available();
        assert_eq!(pending.bytes, b"de");
        assert_eq!(pending.fds.len(), 1);

        buf.consume(1);
        assert_eq!(buf.queued_fds(), 0);
        assert_eq!(buf.read_available().bytes, b"e");
    }

    #[test]
    fn descriptor_range_ends_at_next_group() {
        let (_r1, w1) = pipe();
        let (_r2, w2) = pipe();
        let mut buf = Buffer::with_capacity(32);
        buf.write(b"ab", &mut vec![w1]);
        buf.write(b"cd", &mut vec![w2]);

        let pending = buf.read_available();
        assert_eq!(pending.bytes, b"ab");
        assert_eq!(pending.fds.len(), 1);
        buf.consume(2);

        let pending = buf.read_available();
        assert_eq!(pending.bytes, b"cd");
        assert_eq!(pending.fds.len(), 1);
    }

    #[test]
    fn rejected_write_leaves_descriptors_with_caller() {
        let (_r, w) = pipe();
        let raw = w.as_raw_fd();
        let mut buf = Buffer::with_capacity(2);
        buf.write(b"xy", &mut Vec::new());

        let mut fds = vec![w];
        assert_eq!(buf.write(b"z", &mut fds), 0);
        assert_eq!(fds.len(), 1);
        assert_eq!(fds[0].as_raw_fd(), raw);
        assert_eq!(buf.queued_fds(), 0);
    }

    #[test]
    fn dropping_buffer_closes_queued_descriptors() {
        let (mut r, w) = pipe();
        let mut buf = Buffer::default();
        buf.write(b"x", &mut vec![w]);
        drop(buf);

        // With the only write end closed the read end reports end-of-file.
        let mut out = Vec::new();
        assert_eq!(r.read_to_end(&mut out).unwrap(), 0);
    }

    #[test]
    fn compaction_keeps_descriptor_offsets() {
        let (_r, w) = pipe();
        let mut buf = Buffer::with_capacity(8);
        buf.write(b"abcd", &mut Vec::new());
        buf.write(b"ef", &mut vec![w]);
        buf.consume(4);
        assert_eq!(buf.write(b"ghijkl", &mut Vec::new()), 6);

        let pending = buf.read_available();
        assert_eq!(pending.bytes, b"efghijkl");
        assert_eq!(pending.fds.len(), 1);
    }
}
