//! Decoded trace data as returned by reads.
//!
//! Branch-pair reads yield [`BtsTrace`]: control-flow blocks, newest first.
//! Packet-stream reads yield [`PtTrace`]: the raw packet bytes, tagged with
//! the CPU they were recorded on, for an external decoder.

use crate::config::TraceFormat;
use crate::cpu::TraceCpu;
use crate::error::BtraceError;
use serde::{Deserialize, Serialize};

/// A straight-line run of instructions `[begin, end]`.
///
/// `end` is the address of the last instruction, typically the branch that
/// left the block.  A zero `begin` means the start is unknown, which only
/// happens for the oldest block of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlFlowBlock {
    pub begin: u64,
    pub end: u64,
}

impl ControlFlowBlock {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub fn has_known_begin(&self) -> bool {
        self.begin != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BtsTrace {
    /// Index 0 is the most recent block.
    pub blocks: Vec<ControlFlowBlock>,
    /// Decoding stopped early on a corrupt record.
    pub incomplete: bool,
}

impl BtsTrace {
    /// Attach a delta read onto this trace.
    ///
    /// The oldest block of `delta` has an unknown start; the thread got
    /// there by falling through from where the previous read left it, so
    /// that block is merged with our newest one.  A delta consisting of the
    /// single block ending at the previous PC means the thread made no
    /// progress and is dropped.
    pub fn stitch(&mut self, mut delta: BtsTrace) -> Result<(), BtraceError> {
        let Some(&newest) = self.blocks.first() else {
            delta.prune_unknown_begin();
            *self = delta;
            return Ok(());
        };
        let Some(oldest) = delta.blocks.last_mut() else {
            return Ok(());
        };
        if oldest.end < newest.end {
            return Err(BtraceError::Stitch);
        }
        oldest.begin = newest.begin;
        if delta.blocks.len() == 1 && delta.blocks[0].end == newest.end {
            return Ok(());
        }

        self.blocks.remove(0);
        delta.blocks.append(&mut self.blocks);
        self.blocks = delta.blocks;
        self.incomplete |= delta.incomplete;
        Ok(())
    }

    /// Drop the trailing block whose start is unknown.
    pub(crate) fn prune_unknown_begin(&mut self) {
        if self.blocks.last().is_some_and(|b| !b.has_known_begin()) {
            self.blocks.pop();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtTrace {
    pub cpu: TraceCpu,
    /// Packet bytes, oldest first.
    pub data: Vec<u8>,
}

/// Trace data of either format.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TraceData {
    #[default]
    None,
    Bts(BtsTrace),
    Pt(PtTrace),
}

impl TraceData {
    pub fn format(&self) -> TraceFormat {
        match self {
            Self::None => TraceFormat::None,
            Self::Bts(_) => TraceFormat::Bts,
            Self::Pt(_) => TraceFormat::Pt,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Bts(bts) => bts.blocks.is_empty(),
            Self::Pt(pt) => pt.data.is_empty(),
        }
    }

    /// Append `newer`, which was read after `self`.
    ///
    /// Branch-pair blocks of `newer` go in front, packet bytes go after.
    /// Empty data on either side adopts the other.
    pub fn append(&mut self, newer: TraceData) -> Result<(), BtraceError> {
        if newer.is_empty() {
            return Ok(());
        }
        if self.is_empty() {
            *self = newer;
            return Ok(());
        }
        match (&mut *self, newer) {
            (Self::Bts(older), Self::Bts(mut newer)) => {
                newer.blocks.append(&mut older.blocks);
                older.blocks = newer.blocks;
                older.incomplete |= newer.incomplete;
                Ok(())
            }
            (Self::Pt(older), Self::Pt(mut newer)) => {
                older.data.append(&mut newer.data);
                Ok(())
            }
            (existing, incoming) => Err(BtraceError::FormatMismatch {
                existing: existing.format(),
                incoming: incoming.format(),
            }),
        }
    }

    /// Stitch a delta read onto `self`.
    ///
    /// Only branch-pair data supports delta reads; anything else is a
    /// format error.
    pub fn stitch(&mut self, delta: TraceData) -> Result<(), BtraceError> {
        match (&mut *self, delta) {
            (_, Self::None) => Ok(()),
            (Self::None, Self::Bts(mut delta)) => {
                delta.prune_unknown_begin();
                *self = Self::Bts(delta);
                Ok(())
            }
            (Self::Bts(older), Self::Bts(delta)) => older.stitch(delta),
            (existing, incoming) => Err(BtraceError::FormatMismatch {
                existing: existing.format(),
                incoming: incoming.format(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bts(blocks: &[(u64, u64)]) -> BtsTrace {
        BtsTrace {
            blocks: blocks.iter().map(|&(b, e)| ControlFlowBlock::new(b, e)).collect(),
            incomplete: false,
        }
    }

    #[test]
    fn append_puts_newer_blocks_first() {
        let mut data = TraceData::Bts(bts(&[(0x300, 0x310), (0x200, 0x210)]));
        let newer = TraceData::Bts(bts(&[(0x500, 0x510), (0x400, 0x410)]));
        data.append(newer).unwrap();
        let TraceData::Bts(trace) = data else {
            panic!("expected bts");
        };
        let begins: Vec<_> = trace.blocks.iter().map(|b| b.begin).collect();
        assert_eq!(begins, [0x500, 0x400, 0x300, 0x200]);
    }

    #[test]
    fn append_concatenates_packets() {
        let cpu = TraceCpu::default();
        let mut data = TraceData::Pt(PtTrace { cpu, data: vec![1, 2] });
        data.append(TraceData::Pt(PtTrace { cpu, data: vec![3] })).unwrap();
        assert_eq!(data, TraceData::Pt(PtTrace { cpu, data: vec![1, 2, 3] }));
    }

    #[test]
    fn append_to_empty_adopts_newer() {
        let mut data = TraceData::None;
        let newer = TraceData::Bts(bts(&[(0x10, 0x20)]));
        data.append(newer.clone()).unwrap();
        assert_eq!(data, newer);

        data.append(TraceData::None).unwrap();
        assert_eq!(data, newer);
    }

    #[test]
    fn append_rejects_mixed_formats() {
        let mut data = TraceData::Bts(bts(&[(0x10, 0x20)]));
        let pt = TraceData::Pt(PtTrace {
            cpu: TraceCpu::default(),
            data: vec![0x02, 0x82],
        });
        let err = data.append(pt).unwrap_err();
        assert!(matches!(
            err,
            BtraceError::FormatMismatch {
                existing: TraceFormat::Bts,
                incoming: TraceFormat::Pt
            }
        ));
    }

    #[test]
    fn is_empty_and_format() {
        assert!(TraceData::None.is_empty());
        assert!(TraceData::Bts(BtsTrace::default()).is_empty());
        assert_eq!(TraceData::Bts(BtsTrace::default()).format(), TraceFormat::Bts);
        assert_eq!(TraceData::None.format(), TraceFormat::None);
    }

    #[test]
    fn stitch_merges_fall_through_block() {
        // Previous read stopped at PC 0x2040 inside the block starting at 0x2000.
        let mut trace = bts(&[(0x2000, 0x2040), (0x1000, 0x1010)]);
        // The thread fell through to 0x2050, jumped to 0x3000, now at 0x3008.
        let delta = bts(&[(0x3000, 0x3008), (0, 0x2050)]);
        trace.stitch(delta).unwrap();
        assert_eq!(trace, bts(&[(0x3000, 0x3008), (0x2000, 0x2050), (0x1000, 0x1010)]));
    }

    #[test]
    fn stitch_drops_delta_without_progress() {
        let mut trace = bts(&[(0x2000, 0x2040)]);
        trace.stitch(bts(&[(0, 0x2040)])).unwrap();
        assert_eq!(trace, bts(&[(0x2000, 0x2040)]));
    }

    #[test]
    fn stitch_rejects_delta_ending_before_previous_pc() {
        let mut trace = bts(&[(0x2000, 0x2040)]);
        let err = trace.stitch(bts(&[(0x3000, 0x3008), (0, 0x2010)])).unwrap_err();
        assert!(matches!(err, BtraceError::Stitch));
        assert_eq!(trace, bts(&[(0x2000, 0x2040)]), "failed stitch leaves trace untouched");
    }

    #[test]
    fn stitch_onto_nothing_prunes_unknown_block() {
        let mut data = TraceData::None;
        data.stitch(TraceData::Bts(bts(&[(0x3000, 0x3008), (0, 0x2050)])))
            .unwrap();
        assert_eq!(data, TraceData::Bts(bts(&[(0x3000, 0x3008)])));
    }
}
