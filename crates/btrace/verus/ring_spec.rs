// Verus specification for the perf ring-buffer arithmetic.
//
// These specs document the verification properties of the pure functions
// in `src/verified/ring.rs`.  They are NOT compiled by `cargo`; they are
// consumed by the Verus verifier:
//
//     verus verus/ring_spec.rs
//
// Reference: https://verus-lang.github.io/verus/guide/

verus! {

// ═══════════════════════════════════════════════════════════════════════
// copy_runs
// ═══════════════════════════════════════════════════════════════════════

/// Spec: the promoted head never underflows when subtracting `size`.
pub open spec fn promoted_head(head: u64, size: u64, buffer: u64) -> u64 {
    if head < size { (head + buffer) as u64 } else { head }
}

/// Executable copy_runs, modelled with (start, end) pairs.  The second run
/// is `(0, 0)` when the read does not wrap.
pub fn copy_runs(head: u64, size: u64, buffer: u64) -> (result: ((u64, u64), (u64, u64)))
    requires
        buffer > 0,
        0 < size <= buffer,
        head <= u64::MAX - buffer,
    ensures
        // 1. Both runs lie inside the buffer.
        result.0.0 <= result.0.1 <= buffer,
        result.1.0 <= result.1.1 <= buffer,
        // 2. The second run, if any, starts at zero.
        result.1.1 > 0 ==> result.1.0 == 0,
        // 3. The runs cover exactly `size` bytes.
        (result.0.1 - result.0.0) + (result.1.1 - result.1.0) == size,
{
    let h = if head < size { head + buffer } else { head };
    let tail = h - size;
    let start = tail % buffer;
    let stop = h % buffer;
    if start < stop {
        ((start, stop), (0, 0))
    } else {
        ((start, buffer), (0, stop))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// window
// ═══════════════════════════════════════════════════════════════════════

pub fn window(head: u64, buffer: u64) -> (result: (u64, u64))
    requires
        buffer > 0,
    ensures
        result.0 <= result.1 <= buffer,
        // Before the first wrap there is nothing past the start.
        head <= buffer ==> result.0 == result.1,
        head > buffer ==> result.1 == buffer,
{
    let start = head % buffer;
    if head <= buffer { (start, start) } else { (start, buffer) }
}

// ═══════════════════════════════════════════════════════════════════════
// place_record
// ═══════════════════════════════════════════════════════════════════════

/// Placement modelled as (kind, offset, tail_len, head_len) with
/// kind 0 = inside, 1 = outside, 2 = split.
pub fn place_record(cursor: u64, end: u64, record: u64) -> (result: Option<(u8, u64, u64, u64)>)
    requires
        record > 0,
        cursor <= end,
    ensures
        // 1. A placed record never leaves the window.
        result.is_some() ==> result.unwrap().1 + record <= end
            || result.unwrap().0 == 2u8,
        // 2. Split records are divided into exactly `record` bytes.
        result.is_some() && result.unwrap().0 == 2u8 ==>
            result.unwrap().2 + result.unwrap().3 == record
            && result.unwrap().1 + result.unwrap().2 == end,
        // 3. The walk always moves backwards or wraps.
        result.is_some() && result.unwrap().0 == 0u8 ==> result.unwrap().1 < cursor,
        // 4. Only a window smaller than one record fails.
        result.is_none() <==> (cursor < record && end < record - cursor),
{
    if cursor >= record {
        Some((0u8, cursor - record, 0, 0))
    } else {
        let missing = record - cursor;
        if end < missing {
            None
        } else if cursor == 0 {
            Some((1u8, end - missing, 0, 0))
        } else {
            Some((2u8, end - missing, missing, cursor))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Read sizes
// ═══════════════════════════════════════════════════════════════════════

pub fn full_read_size(head: u64, buffer: u64) -> (result: u64)
    ensures
        result <= buffer,
        result <= head,
        head >= buffer ==> result == buffer,
{
    if head < buffer { head } else { buffer }
}

pub fn delta_read_size(head: u64, last_head: u64, buffer: u64) -> (result: Option<u64>)
    ensures
        // 1. Accepted deltas fit into the buffer.
        result.is_some() ==> result.unwrap() <= buffer,
        result.is_some() ==> result.unwrap() == head - last_head,
        // 2. A head behind the cursor is always rejected.
        head < last_head ==> result.is_none(),
        // 3. So is a delta larger than the buffer.
        head >= last_head && head - last_head > buffer ==> result.is_none(),
{
    if head < last_head {
        None
    } else if head - last_head > buffer {
        None
    } else {
        Some(head - last_head)
    }
}

/// A delta read of zero bytes is accepted and reads nothing.
proof fn settled_head_reads_nothing(head: u64, buffer: u64)
    ensures
        delta_read_size(head, head, buffer) == Some(0u64),
{ }

// ═══════════════════════════════════════════════════════════════════════
// data_region
// ═══════════════════════════════════════════════════════════════════════

pub const DATA_SIZE_OFFSET: u64 = 1048u64;

pub fn data_region(
    header_size: u64,
    data_offset: u64,
    data_size: u64,
    page: u64,
    mapped: u64,
) -> (result: Option<(u64, u64)>)
    requires
        mapped > page,
    ensures
        // 1. The region is non-empty and inside the mapping.
        result.is_some() ==> result.unwrap().1 > 0
            && result.unwrap().0 + result.unwrap().1 <= mapped,
        // 2. Header-described sizes fit a u32.
        result.is_some() && header_size >= DATA_SIZE_OFFSET ==>
            result.unwrap().1 <= 0xffff_ffffu64,
        // 3. Old kernels get the area right after the first page.
        result.is_some() && header_size < DATA_SIZE_OFFSET ==>
            result.unwrap() == (page, (mapped - page) as u64),
{
    let (offset, size) = if header_size >= DATA_SIZE_OFFSET {
        if data_size > 0xffff_ffffu64 {
            return None;
        }
        (data_offset, data_size)
    } else {
        (page, mapped - page)
    };
    if size == 0 || offset > mapped || size > mapped - offset {
        None
    } else {
        Some((offset, size))
    }
}

}
