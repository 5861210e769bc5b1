//! Lock-free single-producer / single-consumer byte ring.
//!
//! The read cursor (`head`) is only ever stored by the [`Consumer`] and the
//! write cursor (`tail`) only by the [`Producer`]. One byte of capacity is
//! always left unused so that `head == tail` unambiguously means empty.
//!
//! Overflow drops data: [`Producer::write`] accepts the prefix that fits and
//! counts the rest as dropped. Nothing is signalled back to the writer.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::constants::POLL_INTERVAL_US;

struct Shared {
    buf:     Box<[UnsafeCell<u8>]>,
    head:    AtomicUsize,
    tail:    AtomicUsize,
    closed:  AtomicBool,
    started: AtomicBool,
    /// set when the [`Consumer`] is dropped
    orphaned: AtomicBool,
    dropped: AtomicU64,
}

// SAFETY: the producer only writes bytes in [tail, head-1) and the consumer
// only reads bytes in [head, tail); the two regions never overlap and each
// cursor has exactly one writer.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn capacity(&self) -> usize { self.buf.len() }

    fn base(&self) -> *mut u8 { UnsafeCell::raw_get(self.buf.as_ptr()) }

    fn used(&self, head: usize, tail: usize) -> usize {
        (tail + self.capacity() - head) % self.capacity()
    }
}

/// Create a ring holding at most `capacity - 1` bytes.
pub fn ring_buffer(capacity: usize) -> (Producer, Consumer) {
    let capacity = capacity.max(2);
    let buf: Box<[UnsafeCell<u8>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
    let shared = Arc::new(Shared {
        buf,
        head:    AtomicUsize::new(0),
        tail:    AtomicUsize::new(0),
        closed:  AtomicBool::new(false),
        started: AtomicBool::new(false),
        orphaned: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });
    (Producer { shared: shared.clone() }, Consumer { shared })
}

/// Write half. Dropping it marks the ring closed.
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Copy as much of `data` as fits; returns the number of bytes accepted.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let s = &self.shared;
        if !data.is_empty() {
            s.started.store(true, Ordering::Release);
        }
        let cap = s.capacity();
        let tail = s.tail.load(Ordering::Relaxed);
        let head = s.head.load(Ordering::Acquire);
        let free = cap - 1 - s.used(head, tail);
        let n = data.len().min(free);

        if n > 0 {
            let first = n.min(cap - tail);
            // SAFETY: [tail, tail+first) and [0, n-first) lie in the free region.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), s.base().add(tail), first);
                std::ptr::copy_nonoverlapping(data.as_ptr().add(first), s.base(), n - first);
            }
            s.tail.store((tail + n) % cap, Ordering::Release);
        }
        if n < data.len() {
            s.dropped.fetch_add((data.len() - n) as u64, Ordering::Relaxed);
        }
        n
    }

    /// Store all of `data` or nothing, so the reader never sees a torn packet.
    pub fn try_write_all(&mut self, data: &[u8]) -> bool {
        if self.free_space() < data.len() {
            self.shared.started.store(true, Ordering::Release);
            self.shared.dropped.fetch_add(data.len() as u64, Ordering::Relaxed);
            return false;
        }
        self.write(data) == data.len()
    }

    /// True once the [`Consumer`] has been dropped.
    pub fn is_orphaned(&self) -> bool { self.shared.orphaned.load(Ordering::Acquire) }

    pub fn bytes_used(&self) -> usize {
        let s = &self.shared;
        s.used(s.head.load(Ordering::Acquire), s.tail.load(Ordering::Relaxed))
    }

    pub fn capacity(&self) -> usize { self.shared.capacity() - 1 }

    pub fn free_space(&self) -> usize {
        self.shared.capacity() - 1 - self.bytes_used()
    }

    pub fn dropped(&self) -> u64 { self.shared.dropped.load(Ordering::Relaxed) }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

/// Read half.
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Occupancy as seen from the reader. May briefly under-report, never over-reports.
    pub fn bytes_used(&self) -> usize {
        let s = &self.shared;
        s.used(s.head.load(Ordering::Relaxed), s.tail.load(Ordering::Acquire))
    }

    pub fn capacity(&self) -> usize { self.shared.capacity() - 1 }

    /// Bytes the producer could not store so far.
    pub fn dropped(&self) -> u64 { self.shared.dropped.load(Ordering::Relaxed) }

    /// True once the producer has offered its first bytes.
    pub fn has_started(&self) -> bool { self.shared.started.load(Ordering::Acquire) }

    /// True once the producer is gone; queued bytes may remain.
    pub fn is_closed(&self) -> bool { self.shared.closed.load(Ordering::Acquire) }

    /// True once the producer is gone and everything it wrote has been read.
    pub fn is_finished(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) && self.bytes_used() == 0
    }

    /// Poll until `count` bytes are queued. Returns false if the producer
    /// closed the ring before that could happen.
    fn wait_for(&self, count: usize) -> bool {
        loop {
            if self.bytes_used() >= count {
                return true;
            }
            if self.shared.closed.load(Ordering::Acquire) {
                // the producer may have written right before closing
                return self.bytes_used() >= count;
            }
            std::thread::sleep(Duration::from_micros(POLL_INTERVAL_US));
        }
    }

    /// Block until `offset + 1` bytes are queued and return the byte at
    /// `offset` without consuming anything. `None` at end of stream.
    pub fn peek(&self, offset: usize) -> Option<u8> {
        if offset >= self.capacity() || !self.wait_for(offset + 1) {
            return None;
        }
        let s = &self.shared;
        let at = (s.head.load(Ordering::Relaxed) + offset) % s.capacity();
        // SAFETY: `at` lies within the filled region [head, tail).
        Some(unsafe { *s.base().add(at) })
    }

    /// Block until `buf.len()` bytes are available, then fill `buf` completely.
    /// Returns 0 at permanent end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() || buf.len() > self.capacity() || !self.wait_for(buf.len()) {
            return 0;
        }
        self.copy_out(buf);
        buf.len()
    }

    /// Block until at least one byte is available and copy up to `buf.len()`.
    /// Returns 0 at permanent end of stream.
    pub fn read_some(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() || !self.wait_for(1) {
            return 0;
        }
        let n = buf.len().min(self.bytes_used());
        self.copy_out(&mut buf[..n]);
        n
    }

    /// Like [`read`](Self::read), but once the producer is gone hands out
    /// whatever is left instead of nothing.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> usize {
        let want = buf.len().min(self.capacity());
        if want == 0 {
            return 0;
        }
        self.wait_for(want);
        let n = want.min(self.bytes_used());
        self.copy_out(&mut buf[..n]);
        n
    }

    /// Discard up to `count` queued bytes without copying. Returns bytes skipped.
    pub fn skip(&mut self, count: usize) -> usize {
        let s = &self.shared;
        let n = count.min(self.bytes_used());
        let head = s.head.load(Ordering::Relaxed);
        s.head.store((head + n) % s.capacity(), Ordering::Release);
        n
    }

    fn copy_out(&mut self, buf: &mut [u8]) {
        let s = &self.shared;
        let cap = s.capacity();
        let head = s.head.load(Ordering::Relaxed);
        let n = buf.len();
        let first = n.min(cap - head);
        // SAFETY: the caller checked that n bytes starting at head are filled.
        unsafe {
            std::ptr::copy_nonoverlapping(s.base().add(head), buf.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(s.base(), buf.as_mut_ptr().add(first), n - first);
        }
        s.head.store((head + n) % cap, Ordering::Release);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shared.orphaned.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;

    #[test]
    fn short_write_when_full() {
        let (mut tx, rx) = ring_buffer(16);
        assert_eq!(tx.write(&[1u8; 10]), 10);
        // 15 usable bytes, 10 used
        assert_eq!(tx.write(&[2u8; 10]), 5);
        assert_eq!(rx.bytes_used(), 15);
        assert_eq!(rx.dropped(), 5);
        assert_eq!(tx.write(&[3u8]), 0);
        assert_eq!(rx.dropped(), 6);
    }

    #[test]
    fn wraps_around_the_end() {
        let (mut tx, mut rx) = ring_buffer(8);
        let mut out = [0u8; 5];
        assert_eq!(tx.write(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(rx.read(&mut out), 5);
        assert_eq!(tx.write(&[6, 7, 8, 9, 10, 11]), 6);
        let mut out = [0u8; 6];
        assert_eq!(rx.read(&mut out), 6);
        assert_eq!(out, [6, 7, 8, 9, 10, 11]);
        assert_eq!(rx.bytes_used(), 0);
    }

    #[test]
    fn skip_discards() {
        let (mut tx, mut rx) = ring_buffer(32);
        tx.write(&[0, 1, 2, 3, 4, 5]);
        assert_eq!(rx.skip(4), 4);
        let mut out = [0u8; 2];
        rx.read(&mut out);
        assert_eq!(out, [4, 5]);
    }

    #[test]
    fn read_returns_zero_after_close() {
        let (mut tx, mut rx) = ring_buffer(32);
        tx.write(&[9, 9, 9]);
        drop(tx);
        let mut out = [0u8; 4];
        assert_eq!(rx.read(&mut out), 0);
        let mut out = [0u8; 3];
        assert_eq!(rx.read(&mut out), 3);
        assert!(rx.is_finished());
        assert_eq!(rx.read_some(&mut out), 0);
    }

    #[test]
    fn all_or_nothing_write() {
        let (mut tx, rx) = ring_buffer(10);
        assert!(!rx.has_started());
        assert!(tx.try_write_all(&[1; 6]));
        assert!(!tx.try_write_all(&[2; 6]));
        assert_eq!(rx.bytes_used(), 6);
        assert_eq!(rx.dropped(), 6);
        assert!(rx.has_started());
    }

    #[test]
    fn peek_leaves_the_bytes_queued() {
        let (mut tx, mut rx) = ring_buffer(8);
        tx.write(&[1, 2, 3, 4, 5, 6]);
        rx.skip(4);
        // wraps around the end of the buffer
        tx.write(&[7, 8, 9]);
        assert_eq!(rx.peek(0), Some(5));
        assert_eq!(rx.peek(4), Some(9));
        assert_eq!(rx.bytes_used(), 5);
        drop(tx);
        assert_eq!(rx.peek(5), None);
        let mut out = [0u8; 5];
        assert_eq!(rx.read(&mut out), 5);
        assert_eq!(out, [5, 6, 7, 8, 9]);
    }

    #[test]
    fn orphaned_once_the_reader_is_gone() {
        let (tx, rx) = ring_buffer(8);
        assert!(!tx.is_orphaned());
        drop(rx);
        assert!(tx.is_orphaned());
    }

    #[test]
    fn read_chunk_hands_out_the_tail() {
        let (mut tx, mut rx) = ring_buffer(64);
        tx.write(&[1, 2, 3, 4, 5]);
        drop(tx);
        assert!(rx.is_closed());
        let mut out = [0u8; 4];
        assert_eq!(rx.read_chunk(&mut out), 4);
        assert_eq!(rx.read_chunk(&mut out), 1);
        assert_eq!(out[0], 5);
        assert_eq!(rx.read_chunk(&mut out), 0);
    }

    #[test]
    fn blocking_read_across_threads() {
        let (mut tx, mut rx) = ring_buffer(64);
        let writer = std::thread::spawn(move || {
            for chunk in (0u8..200).collect::<Vec<_>>().chunks(7) {
                let mut rest = chunk;
                while !rest.is_empty() {
                    let n = tx.write(rest);
                    rest = &rest[n..];
                    std::thread::yield_now();
                }
            }
        });
        let mut got = Vec::new();
        let mut buf = [0u8; 10];
        while got.len() < 200 {
            let n = rx.read(&mut buf);
            assert_eq!(n, 10);
            got.extend_from_slice(&buf);
        }
        writer.join().unwrap();
        assert_eq!(got, (0u8..200).collect::<Vec<_>>());
    }

    #[quickcheck]
    fn prop_bytes_used_tracks_writes_minus_reads(writes: u8, reads: u8) -> bool {
        let (n, m) = (writes as usize, reads as usize);
        if m > n { return true; }
        let (mut tx, mut rx) = ring_buffer(512);
        for i in 0..n { tx.write(&[i as u8]); }
        let mut b = [0u8; 1];
        for _ in 0..m { rx.read(&mut b); }
        rx.bytes_used() == n - m
    }
}
