//! Pure, verifiable arithmetic for the perf ring buffer.
//!
//! The kernel keeps a monotonically growing `head` counter; the buffer
//! itself is a power-of-two sized circular region.  Every function here
//! maps head/size pairs to offsets inside `[0, buffer_size)` and is
//! guarded by `debug_assert!` pre- and postconditions.
//!
//! # Mapping to callers
//!
//! | Verified function     | Caller                                   |
//! |-----------------------|------------------------------------------|
//! | [`copy_runs`]         | `ring::read_circular`                    |
//! | [`window`]            | `ring::RingBuffer::window`               |
//! | [`place_record`]      | `bts::decode`                            |
//! | [`full_read_size`]    | `read::read_bts`                         |
//! | [`delta_read_size`]   | `read::read_bts`                         |
//! | [`buffer_pages`]      | `session::enable_bts`, `session::enable_pt` |
//! | [`data_region`]       | `session::enable_bts`                    |

use std::ops::Range;

// ─── Circular copy ──────────────────────────────────────────────────

/// Compute the one or two byte runs holding the `size` most recent bytes
/// that end at `head`.
///
/// The first run is always present.  The second run exists only when the
/// requested range wraps past the end of the buffer; it then starts at
/// offset zero.  Concatenating the runs in order yields the bytes in the
/// order the kernel wrote them.
///
/// # Panics (debug only)
///
/// - `buffer_size` must be non-zero.
/// - `size` must be in `1..=buffer_size`.
///
/// # Properties verified by `verus/ring_spec.rs`
///
/// - both runs lie inside `[0, buffer_size)`
/// - the run lengths sum to `size`
pub(crate) fn copy_runs(
    head: u64,
    size: usize,
    buffer_size: usize,
) -> (Range<usize>, Option<Range<usize>>) {
    debug_assert!(buffer_size > 0, "buffer_size must be non-zero");
    debug_assert!(size > 0, "empty reads never reach copy_runs");
    debug_assert!(size <= buffer_size, "read of {size} exceeds buffer of {buffer_size}");

    let buffer = buffer_size as u64;
    let size64 = size as u64;

    // A head smaller than the read size can only mean the counter has
    // wrapped inside the buffer; promote it by one buffer to avoid underflow.
    let head = if head < size64 { head + buffer } else { head };
    let tail = head - size64;

    let start = (tail % buffer) as usize;
    let stop = (head % buffer) as usize;

    let runs = if start < stop {
        (start..stop, None)
    } else {
        (start..buffer_size, (stop > 0).then_some(0..stop))
    };

    debug_assert_eq!(
        runs.0.len() + runs.1.as_ref().map_or(0, |r| r.len()),
        size,
        "runs must cover exactly the requested size"
    );
    runs
}

/// Backward-scan window for in-place decoding.
///
/// Returns `(start, end)`: decoding walks backwards from `start`; once it
/// steps past offset zero it reappears at `end`.  Before the buffer has
/// wrapped for the first time (`head <= buffer_size`) there is nothing valid
/// beyond `start`, so `end == start`.
pub(crate) fn window(head: u64, buffer_size: usize) -> (usize, usize) {
    debug_assert!(buffer_size > 0, "buffer_size must be non-zero");

    let start = (head % buffer_size as u64) as usize;
    let end = if head <= buffer_size as u64 {
        start
    } else {
        buffer_size
    };

    debug_assert!(start <= end && end <= buffer_size);
    (start, end)
}

// ─── Record placement ───────────────────────────────────────────────

/// Where the record ending at a given cursor lives in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordPlacement {
    /// Entirely inside `[0, cursor)`, starting at `offset`.
    Inside { offset: usize },
    /// Entirely before offset zero; it reappears whole at `offset`,
    /// just below the window end.
    Outside { offset: usize },
    /// Straddles the wrap point: the lower `tail_len` bytes sit at
    /// `[tail_offset, end)` and the remaining upper bytes at `[0, head_len)`.
    Split {
        tail_offset: usize,
        tail_len: usize,
        head_len: usize,
    },
}

impl RecordPlacement {
    /// Cursor to continue the backward walk from.
    pub(crate) fn next_cursor(&self) -> usize {
        match *self {
            Self::Inside { offset } | Self::Outside { offset } => offset,
            Self::Split { tail_offset, .. } => tail_offset,
        }
    }
}

/// Classify the record of `record_size` bytes that ends at `cursor`.
///
/// Returns `None` when the record cannot be placed inside a window ending at
/// `end` (the window is smaller than a record), which callers treat as a
/// corrupt stream.
pub(crate) fn place_record(cursor: usize, end: usize, record_size: usize) -> Option<RecordPlacement> {
    debug_assert!(record_size > 0);
    debug_assert!(cursor <= end, "cursor {cursor} past window end {end}");

    if cursor >= record_size {
        return Some(RecordPlacement::Inside {
            offset: cursor - record_size,
        });
    }

    let missing = record_size - cursor;
    let tail_offset = end.checked_sub(missing)?;
    if cursor == 0 {
        Some(RecordPlacement::Outside {
            offset: tail_offset,
        })
    } else {
        Some(RecordPlacement::Split {
            tail_offset,
            tail_len: missing,
            head_len: cursor,
        })
    }
}

// ─── Read sizes ─────────────────────────────────────────────────────

/// Number of bytes a full read covers: the whole buffer, or everything
/// written so far if the buffer has not filled up yet.
pub(crate) fn full_read_size(head: u64, buffer_size: usize) -> usize {
    if head < buffer_size as u64 {
        head as usize
    } else {
        buffer_size
    }
}

/// Number of bytes written between `last_head` and `head`.
///
/// Returns `None` if the counter went backwards or if more than
/// `buffer_size` bytes were written, in which case the oldest of them have
/// already been overwritten.
pub(crate) fn delta_read_size(head: u64, last_head: u64, buffer_size: usize) -> Option<usize> {
    let delta = head.checked_sub(last_head)?;
    if delta > buffer_size as u64 {
        return None;
    }
    let size = delta as usize;
    debug_assert!(size <= buffer_size);
    Some(size)
}

// ─── Buffer negotiation ─────────────────────────────────────────────

/// Convert a requested size in bytes into a power-of-two page count.
///
/// Rounds up to whole pages, requests at least one page, then rounds up to
/// the next power of two, which is what the perf mmap interface accepts.
pub(crate) fn buffer_pages(requested_bytes: u32, page_size: usize) -> usize {
    debug_assert!(page_size.is_power_of_two(), "page size {page_size} is not a power of two");

    let bytes = requested_bytes as usize;
    let pages = bytes.div_ceil(page_size).max(1);
    let pages = pages.next_power_of_two();

    debug_assert!(pages.is_power_of_two());
    debug_assert!(pages * page_size >= bytes);
    pages
}

// ─── Data area ──────────────────────────────────────────────────────

/// Offset of `data_size` in `struct perf_event_mmap_page`.  Kernels whose
/// header page is shorter than this predate `data_offset`/`data_size`.
pub(crate) const DATA_SIZE_OFFSET: usize = 1048;

/// Locate the data area of a branch-pair mapping.
///
/// `mapped_len` covers the header page plus the data pages.  Newer kernels
/// describe the data area in the header page (`header_size` reaches
/// `data_size`); older ones place it right after the first page.  Returns
/// `(offset, size)`, or `None` if the described area does not fit into a
/// `u32` or into the mapping.
pub(crate) fn data_region(
    header_size: u32,
    data_offset: u64,
    data_size: u64,
    page_size: usize,
    mapped_len: usize,
) -> Option<(usize, usize)> {
    debug_assert!(mapped_len > page_size, "mapping must hold more than the header page");

    let (offset, size) = if DATA_SIZE_OFFSET <= header_size as usize {
        if data_size > u32::MAX as u64 {
            return None;
        }
        (usize::try_from(data_offset).ok()?, data_size as usize)
    } else {
        (page_size, mapped_len - page_size)
    };

    if size == 0 || offset.checked_add(size)? > mapped_len {
        return None;
    }
    Some((offset, size))
}
