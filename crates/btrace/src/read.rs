//! Read protocol: ALL / NEW / DELTA reads over a live ring.
//!
//! The kernel keeps writing while we decode.  A branch-pair read therefore
//! samples the head, decodes, and samples the head again; if it moved, the
//! oldest part of what was decoded may have been overwritten and the pass
//! is repeated.  After `retries` passes the last one is accepted, since a
//! thread that branches faster than we can decode would otherwise starve
//! the reader.
//!
//! ```text
//!   head₀ ──► decode ──► head₁ ─┬─ head₀ == head₁ ─► accept
//!     ▲                         │
//!     └──── retries left ◄──────┘
//! ```

use crate::bts;
use crate::config::ReadType;
use crate::cpu::TraceCpu;
use crate::data::{BtsTrace, PtTrace, TraceData};
use crate::error::BtraceError;
use crate::kallsyms::KernelRange;
use crate::ring::{read_circular, RingBuffer};
use crate::verified::ring::{delta_read_size, full_read_size};
use log::debug;

/// Read branch-pair trace from `ring`.
///
/// `pc` supplies the traced thread's current instruction pointer, the end
/// of the newest block.  It is only consulted when there is something to
/// decode.  On success the ring's cursor moves to the head the accepted
/// pass observed.
pub fn read_bts(
    ring: &mut RingBuffer,
    read_type: ReadType,
    retries: u32,
    kernel: &KernelRange,
    pc: impl FnOnce() -> Result<u64, BtraceError>,
) -> Result<TraceData, BtraceError> {
    if read_type == ReadType::New && !ring.has_new_data() {
        return Ok(TraceData::Bts(BtsTrace::default()));
    }

    let pc = pc()?;
    let buffer_size = ring.size();
    let passes = retries.max(1);
    let mut pass = 1;

    let (head, mut trace) = loop {
        let head = ring.head();
        let size = match read_type {
            ReadType::Delta => delta_read_size(head, ring.last_head(), buffer_size)
                .ok_or(BtraceError::Overflow { read_type })?,
            ReadType::All | ReadType::New => full_read_size(head, buffer_size),
        };

        let trace = bts::decode(ring, ring.window(head), size, pc, kernel);

        if ring.head() == head || pass >= passes {
            break (head, trace);
        }
        debug!("trace head moved during read pass {pass}/{passes}");
        pass += 1;
    };

    // Delta reads keep the block with the unknown start so the caller can
    // stitch it onto the trace it already has.
    if read_type != ReadType::Delta {
        trace.prune_unknown_begin();
    }
    ring.consume(head);
    Ok(TraceData::Bts(trace))
}

/// Read packet-stream trace from `ring`.
///
/// Packet data cannot be stitched without decoding it, so delta reads are
/// not supported.  New and full reads copy the whole buffer.
pub fn read_pt(
    ring: &mut RingBuffer,
    read_type: ReadType,
    cpu: TraceCpu,
) -> Result<TraceData, BtraceError> {
    match read_type {
        ReadType::Delta => Err(BtraceError::NotSupported(
            "Delta reads are not supported for packet-stream trace.".to_string(),
        )),
        ReadType::New if !ring.has_new_data() => Ok(TraceData::Pt(PtTrace {
            cpu,
            data: Vec::new(),
        })),
        ReadType::All | ReadType::New => {
            let head = ring.head();
            let data = read_circular(ring, head, ring.size());
            ring.consume(head);
            Ok(TraceData::Pt(PtTrace { cpu, data }))
        }
    }
}
