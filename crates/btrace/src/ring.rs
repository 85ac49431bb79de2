//! Trace-buffer handle and circular reader.
//!
//! A [`RingBuffer`] owns the memory the kernel writes trace data into,
//! reached through the [`RingMemory`] trait, plus the head value the reader
//! consumed last.  The kernel and CPU keep writing while we read, so bytes
//! are only ever copied out; nothing hands out references into the shared
//! region.
//!
//! All offset arithmetic is delegated to [`crate::verified::ring`].
//!
//! ```text
//!  0                   stop         start                size
//!  ├───────────────────┼────────────┼────────────────────┤
//!  │ … newest (run 2)  │  not read  │ oldest … (run 1)   │
//!  └───────────────────┴────────────┴────────────────────┘
//!        read_circular(head, n) = run 1 ++ run 2
//! ```

use crate::verified::ring as arith;

/// Memory backing a ring buffer.
///
/// Implemented by the perf mmap regions in [`crate::perf`].  Implementations
/// never need to bounds-check `copy_at`: [`RingBuffer`] does it before
/// delegating.
pub trait RingMemory {
    /// Size of the circular data region in bytes.
    fn size(&self) -> usize;

    /// Current value of the writer's head counter.
    fn head(&self) -> u64;

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    fn copy_at(&self, offset: usize, dst: &mut [u8]);
}

/// Backward-scan window over the ring, see [`arith::window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingWindow {
    /// Offset just past the newest byte.
    pub start: usize,
    /// Where the backward scan resumes after stepping past offset zero.
    pub end: usize,
}

/// Exclusive owner of one mapped trace buffer and its read cursor.
pub struct RingBuffer {
    memory: Box<dyn RingMemory + Send>,
    last_head: u64,
}

impl RingBuffer {
    pub fn new(memory: Box<dyn RingMemory + Send>) -> Self {
        Self {
            memory,
            last_head: 0,
        }
    }

    /// Size of the data region in bytes.
    pub fn size(&self) -> usize {
        self.memory.size()
    }

    /// Current kernel head.
    pub fn head(&self) -> u64 {
        self.memory.head()
    }

    /// Head value consumed by the last successful read.
    pub fn last_head(&self) -> u64 {
        self.last_head
    }

    pub(crate) fn consume(&mut self, head: u64) {
        self.last_head = head;
    }

    /// Whether the kernel wrote anything since the last read.
    pub fn has_new_data(&self) -> bool {
        self.head() != self.last_head
    }

    /// Copy the `size` most recent bytes ending at `head`.
    pub fn read(&self, head: u64, size: usize) -> Vec<u8> {
        read_circular(self, head, size)
    }

    pub fn window(&self, head: u64) -> RingWindow {
        let (start, end) = arith::window(head, self.size());
        RingWindow { start, end }
    }

    /// Copy `dst.len()` bytes from `offset`.
    ///
    /// # Panics
    ///
    /// If the range leaves the data region.
    pub(crate) fn copy_at(&self, offset: usize, dst: &mut [u8]) {
        let in_bounds = offset
            .checked_add(dst.len())
            .is_some_and(|end| end <= self.size());
        assert!(
            in_bounds,
            "read of {} bytes at {offset} outside ring of {} bytes",
            dst.len(),
            self.size()
        );
        self.memory.copy_at(offset, dst);
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("size", &self.size())
            .field("last_head", &self.last_head)
            .finish()
    }
}

/// Copy the `size` most recent bytes of `ring` that end at `head`.
///
/// `size` must not exceed the ring size.  A zero `size` returns an empty
/// vector without touching the buffer.
pub fn read_circular(ring: &RingBuffer, head: u64, size: usize) -> Vec<u8> {
    if size == 0 {
        return Vec::new();
    }
    assert!(
        size <= ring.size(),
        "read of {size} bytes from a {} byte ring",
        ring.size()
    );

    let (first, second) = arith::copy_runs(head, size, ring.size());
    let mut out = vec![0u8; size];
    let split = first.len();
    ring.copy_at(first.start, &mut out[..split]);
    if let Some(second) = second {
        ring.copy_at(second.start, &mut out[split..]);
    }
    out
}


#[cfg(test)]
mod tests {
    use super::testing::VecRing;
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn filled(size: usize, written: usize) -> (RingBuffer, Vec<u8>) {
        let stream: Vec<u8> = (0..written).map(|i| (i * 7 + i / 251) as u8).collect();
        let mut ring = VecRing::new(size);
        ring.write(&stream);
        (ring.into_ring(), stream)
    }

    /// Reference: lay the ring out twice and slice the unwrapped copy.
    fn doubled_reference(ring: &RingBuffer, head: u64, size: usize) -> Vec<u8> {
        let n = ring.size();
        let mut doubled = vec![0u8; 2 * n];
        ring.copy_at(0, &mut doubled[..n]);
        ring.copy_at(0, &mut doubled[n..]);
        let stop = (head % n as u64) as usize + n;
        doubled[stop - size..stop].to_vec()
    }

    #[test]
    fn zero_size_read_is_empty() {
        let (ring, _) = filled(64, 10);
        assert!(read_circular(&ring, 10, 0).is_empty());
    }

    #[test]
    fn read_before_wrap_returns_stream_tail() {
        let (ring, stream) = filled(64, 40);
        assert_eq!(ring.read(40, 16), stream[24..40]);
        assert_eq!(ring.read(40, 40), stream);
    }

    #[test]
    fn read_after_wrap_returns_latest_bytes_in_order() {
        let (ring, stream) = filled(64, 150);
        assert_eq!(ring.read(150, 64), stream[86..150]);
        assert_eq!(ring.read(150, 30), stream[120..150]);
    }

    #[test]
    fn circular_read_matches_doubled_buffer_for_every_pair() {
        let (ring, _) = filled(64, 200);
        for head in 0..256u64 {
            for size in 1..=64 {
                assert_eq!(
                    read_circular(&ring, head, size),
                    doubled_reference(&ring, head, size),
                    "head={head} size={size}"
                );
            }
        }
    }

    #[test]
    fn circular_read_matches_doubled_buffer_randomized() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x6274_7261);
        for _ in 0..64 {
            let size = 1usize << rng.gen_range(6..13);
            let written = rng.gen_range(0..4 * size);
            let (ring, _) = filled(size, written);
            for _ in 0..64 {
                let head = rng.gen_range(0..1u64 << 40);
                let len = rng.gen_range(1..=size);
                assert_eq!(
                    ring.read(head, len),
                    doubled_reference(&ring, head, len),
                    "ring={size} head={head} len={len}"
                );
            }
        }
    }

    #[test]
    #[should_panic(expected = "outside ring")]
    fn copy_outside_region_panics() {
        let (ring, _) = filled(64, 10);
        let mut buf = [0u8; 8];
        ring.copy_at(60, &mut buf);
    }

    #[test]
    fn cursor_tracks_new_data() {
        let mut vec_ring = VecRing::new(64);
        vec_ring.write(&[1, 2, 3]);
        let mut ring = vec_ring.into_ring();
        assert!(ring.has_new_data());
        ring.consume(3);
        assert_eq!(ring.last_head(), 3);
        assert!(!ring.has_new_data());
    }
}
