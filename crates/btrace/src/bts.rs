//! Branch-pair (BTS) sample decoder.
//!
//! Branch trace is collected in the ring as fixed-size perf sample records
//! holding the branch source (`from`) and destination (`to`).  The decoder
//! walks the records backwards from the newest one and turns each adjacent
//! pair of samples `s1`, `s2` into a block `[s1.to, s2.from]`.
//!
//! The newest block ends at the thread's current PC.  The oldest block's
//! start is unknown and is emitted with `begin == 0`; the read protocol
//! prunes it for full reads and keeps it for delta reads so it can be
//! stitched onto earlier trace.
//!
//! Records are written back to back modulo the buffer size, so one record
//! may have its lower part at the end of the buffer and its upper part at
//! the beginning.  [`RecordPlacement`] names the three cases.

use crate::data::{BtsTrace, ControlFlowBlock};
use crate::kallsyms::KernelRange;
use crate::ring::{RingBuffer, RingWindow};
use crate::verified::ring::{place_record, RecordPlacement};
use log::warn;

/// `PERF_RECORD_SAMPLE`.
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// Size of one sample: `perf_event_header` (8) + ip (8) + addr (8).
pub const BTS_RECORD_SIZE: usize = 24;

/// One decoded perf branch sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtsSample {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
    /// Branch source (`PERF_SAMPLE_IP`).
    pub from: u64,
    /// Branch destination (`PERF_SAMPLE_ADDR`).
    pub to: u64,
}

impl BtsSample {
    /// A well-formed sample record for the branch `from -> to`.
    pub fn branch(from: u64, to: u64) -> Self {
        Self {
            kind: PERF_RECORD_SAMPLE,
            misc: 0,
            size: BTS_RECORD_SIZE as u16,
            from,
            to,
        }
    }

    pub fn from_bytes(raw: &[u8; BTS_RECORD_SIZE]) -> Self {
        let u16_at = |at: usize| u16::from_ne_bytes([raw[at], raw[at + 1]]);
        let u32_at = |at: usize| u32::from_ne_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[at..at + 8]);
            u64::from_ne_bytes(b)
        };
        Self {
            kind: u32_at(0),
            misc: u16_at(4),
            size: u16_at(6),
            from: u64_at(8),
            to: u64_at(16),
        }
    }

    pub fn to_bytes(&self) -> [u8; BTS_RECORD_SIZE] {
        let mut raw = [0u8; BTS_RECORD_SIZE];
        raw[0..4].copy_from_slice(&self.kind.to_ne_bytes());
        raw[4..6].copy_from_slice(&self.misc.to_ne_bytes());
        raw[6..8].copy_from_slice(&self.size.to_ne_bytes());
        raw[8..16].copy_from_slice(&self.from.to_ne_bytes());
        raw[16..24].copy_from_slice(&self.to.to_ne_bytes());
        raw
    }

    /// Consistency check meant to catch getting out of sync with the stream.
    pub fn is_valid(&self) -> bool {
        self.kind == PERF_RECORD_SAMPLE && self.size as usize == BTS_RECORD_SIZE
    }
}

/// Decode up to `size` bytes of samples ending at `window.start`.
///
/// Blocks are returned newest first and always end with one block whose
/// `begin` is zero.  A sample failing validation stops decoding: what was
/// decoded so far is returned with `incomplete` set.
pub fn decode(
    ring: &RingBuffer,
    window: RingWindow,
    size: usize,
    pc: u64,
    kernel: &KernelRange,
) -> BtsTrace {
    let mut blocks = Vec::new();
    let mut incomplete = false;
    let mut block = ControlFlowBlock { begin: 0, end: pc };
    let mut cursor = window.start;
    let mut raw = [0u8; BTS_RECORD_SIZE];

    // The buffer may end in a partial record when its size is not a
    // multiple of the sample size; never consume one.
    let mut read = BTS_RECORD_SIZE - 1;
    while read < size {
        read += BTS_RECORD_SIZE;

        let Some(placement) = place_record(cursor, window.end, BTS_RECORD_SIZE) else {
            warn!("Branch trace may be incomplete.");
            incomplete = true;
            break;
        };
        match placement {
            RecordPlacement::Inside { offset } | RecordPlacement::Outside { offset } => {
                ring.copy_at(offset, &mut raw);
            }
            RecordPlacement::Split {
                tail_offset,
                tail_len,
                head_len,
            } => {
                let (lower, upper) = raw.split_at_mut(tail_len);
                ring.copy_at(tail_offset, lower);
                ring.copy_at(0, &mut upper[..head_len]);
            }
        }
        cursor = placement.next_cursor();

        let sample = BtsSample::from_bytes(&raw);
        if !sample.is_valid() {
            warn!("Branch trace may be incomplete.");
            incomplete = true;
            break;
        }

        // Branches from user into kernel are suppressed by the hardware;
        // the reverse direction is not, so filter it here.
        if kernel.contains(sample.from) {
            continue;
        }

        block.begin = sample.to;
        blocks.push(block);
        block = ControlFlowBlock {
            begin: 0,
            end: sample.from,
        };
    }

    // The chronologically first block: its end is known, its start is not.
    block.begin = 0;
    blocks.push(block);

    BtsTrace { blocks, incomplete }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::testing::VecRing;

    const USER: KernelRange = KernelRange::unknown();
    const KERNEL_FROM: u64 = 0xffff_ffff_8123_4567;

    fn ring_with(samples: &[BtsSample], size: usize) -> RingBuffer {
        let mut ring = VecRing::new(size);
        for s in samples {
            ring.write(&s.to_bytes());
        }
        ring.into_ring()
    }

    fn decode_all(ring: &RingBuffer, pc: u64) -> BtsTrace {
        let head = ring.head();
        let size = crate::verified::ring::full_read_size(head, ring.size());
        decode(ring, ring.window(head), size, pc, &USER)
    }

    /// Branches that chain: sample i jumps from 0x1000*i + 0x10 to 0x1000*(i+1).
    fn chain(n: u64) -> Vec<BtsSample> {
        (0..n)
            .map(|i| BtsSample::branch(0x1000 * i + 0x10, 0x1000 * (i + 1)))
            .collect()
    }

    #[test]
    fn sample_byte_layout() {
        let s = BtsSample::branch(0x401000, 0x402000);
        let raw = s.to_bytes();
        assert_eq!(u32::from_ne_bytes(raw[0..4].try_into().unwrap()), 9);
        assert_eq!(u16::from_ne_bytes(raw[6..8].try_into().unwrap()), 24);
        assert_eq!(BtsSample::from_bytes(&raw), s);
        assert!(s.is_valid());
    }

    #[test]
    fn n_samples_give_n_plus_one_blocks_newest_first() {
        let ring = ring_with(&chain(5), 4096);
        let trace = decode_all(&ring, 0x5800);

        assert!(!trace.incomplete);
        assert_eq!(trace.blocks.len(), 6);
        assert_eq!(
            trace.blocks[0],
            ControlFlowBlock {
                begin: 0x5000,
                end: 0x5800
            }
        );
        for (i, block) in trace.blocks.iter().enumerate().skip(1) {
            // Block i runs from the destination of sample 4-i to the
            // source of sample 5-i.
            let newer = 5 - i as u64;
            assert_eq!(block.end, 0x1000 * newer + 0x10, "block {i}");
            if i < 5 {
                assert_eq!(block.begin, 0x1000 * newer, "block {i}");
            }
        }
        assert_eq!(
            trace.blocks.last(),
            Some(&ControlFlowBlock { begin: 0, end: 0x10 })
        );
    }

    #[test]
    fn empty_buffer_gives_only_the_open_block() {
        let ring = ring_with(&[], 4096);
        let trace = decode_all(&ring, 0x1234);
        assert_eq!(trace.blocks, vec![ControlFlowBlock { begin: 0, end: 0x1234 }]);
    }

    #[test]
    fn kernel_sample_is_skipped_without_breaking_the_chain() {
        let samples = [
            BtsSample::branch(0x1010, 0x2000),
            BtsSample::branch(KERNEL_FROM, 0x2100),
            BtsSample::branch(0x2010, 0x3000),
        ];
        let ring = ring_with(&samples, 4096);
        let trace = decode_all(&ring, 0x3020);

        assert_eq!(
            trace.blocks,
            vec![
                ControlFlowBlock { begin: 0x3000, end: 0x3020 },
                ControlFlowBlock { begin: 0x2000, end: 0x2010 },
                ControlFlowBlock { begin: 0, end: 0x1010 },
            ]
        );
    }

    #[test]
    fn kernel_detection_uses_known_start() {
        let samples = [
            BtsSample::branch(0x1010, 0x2000),
            // MSB set but below _text: a user address on this kernel.
            BtsSample::branch(0x8000_0000_0000_2010, 0x3000),
        ];
        let ring = ring_with(&samples, 4096);
        let head = ring.head();
        let kernel = KernelRange::starting_at(0xffff_ffff_8100_0000);
        let trace = decode(&ring, ring.window(head), head as usize, 0x3020, &kernel);
        assert_eq!(trace.blocks.len(), 3);
        assert_eq!(trace.blocks[1].end, 0x8000_0000_0000_2010);
    }

    #[test]
    fn invalid_record_stops_decoding_with_partial_result() {
        let mut bogus = BtsSample::branch(0x9999, 0x9999);
        bogus.kind = 1; // PERF_RECORD_MMAP
        let samples = [
            BtsSample::branch(0x1010, 0x2000),
            bogus,
            BtsSample::branch(0x2010, 0x3000),
            BtsSample::branch(0x3010, 0x4000),
        ];
        let ring = ring_with(&samples, 4096);
        let trace = decode_all(&ring, 0x4020);

        assert!(trace.incomplete);
        assert_eq!(
            trace.blocks,
            vec![
                ControlFlowBlock { begin: 0x4000, end: 0x4020 },
                ControlFlowBlock { begin: 0x3000, end: 0x3010 },
                ControlFlowBlock { begin: 0, end: 0x2010 },
            ]
        );
    }

    #[test]
    fn wrong_record_size_is_invalid() {
        let mut s = BtsSample::branch(1, 2);
        s.size = 32;
        assert!(!s.is_valid());
    }

    #[test]
    fn record_split_across_wrap_is_reassembled() {
        // 4096 is not a multiple of 24, so once the stream wraps some
        // record straddles the end of the buffer.
        let samples = chain(200);
        let ring = ring_with(&samples, 4096);
        let trace = decode_all(&ring, 0xc8800);

        assert!(!trace.incomplete);
        // 4096 / 24 = 170 whole samples fit, plus the open block.
        assert_eq!(trace.blocks.len(), 171);
        for (i, block) in trace.blocks.iter().enumerate().skip(1).take(169) {
            let newer = 200 - i as u64;
            assert_eq!(block.end, 0x1000 * newer + 0x10, "block {i}");
            assert_eq!(block.begin, 0x1000 * newer, "block {i}");
        }
    }

    #[test]
    fn full_buffer_never_yields_more_samples_than_fit() {
        // More samples than the buffer holds: only the newest survive.
        let samples = chain(300);
        let ring = ring_with(&samples, 4096);
        let trace = decode_all(&ring, 0x12c800);

        let closed = trace.blocks.len() - 1;
        assert_eq!(closed, 4096 / BTS_RECORD_SIZE);
        // The oldest decoded sample is number 300 - 170 = 130.
        assert_eq!(trace.blocks.last().map(|b| b.end), Some(0x1000 * 130 + 0x10));
    }

    #[test]
    fn every_head_position_decodes_consistently() {
        // Slide the stream start so splits land on every possible offset.
        for pad in 0..BTS_RECORD_SIZE {
            let mut vec_ring = VecRing::new(4096);
            vec_ring.write(&vec![0u8; pad]);
            for s in chain(250) {
                vec_ring.write(&s.to_bytes());
            }
            let ring = vec_ring.into_ring();
            let head = ring.head();
            // Only whole samples written after the padding are decodable.
            let size = (250 * BTS_RECORD_SIZE).min(4096);
            let trace = decode(&ring, ring.window(head), size, 0xfa800, &USER);
            assert!(!trace.incomplete, "pad={pad}");
            assert_eq!(trace.blocks.len(), 171, "pad={pad}");
            assert_eq!(trace.blocks[1].end, 0x1000 * 249 + 0x10, "pad={pad}");
        }
    }
}
