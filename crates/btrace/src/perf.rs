//! Thin wrappers over the Linux perf_event interface.
//!
//! - [`PerfEventAttr`]: the `perf_event_attr` ABI struct and the two event
//!   flavours we open (branch sampling and the Intel PT PMU).
//! - [`open_event`]: `perf_event_open(2)` for one thread on any CPU.
//! - [`Mapping`]: an owned `mmap` region, unmapped on drop.
//! - [`PerfRing`]: the mapped header page plus data or AUX area, exposed to
//!   the reader as [`RingMemory`].

use crate::ring::RingMemory;
use crate::verified::ring::DATA_SIZE_OFFSET;
use log::warn;
use std::io;
use std::mem::offset_of;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

/// perf_event_attr structure (`PERF_ATTR_SIZE_VER8`).
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    __reserved_2: u16,
    pub aux_sample_size: u32,
    __reserved_3: u32,
    pub sig_data: u64,
    pub config3: u64,
}

const _: () = assert!(std::mem::size_of::<PerfEventAttr>() == 136);

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;

pub const FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const FLAG_EXCLUDE_HV: u64 = 1 << 6;
pub const FLAG_EXCLUDE_IDLE: u64 = 1 << 7;

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

impl PerfEventAttr {
    fn user_only(type_: u32) -> Self {
        Self {
            type_,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            flags: FLAG_EXCLUDE_KERNEL | FLAG_EXCLUDE_HV | FLAG_EXCLUDE_IDLE,
            ..Self::default()
        }
    }

    /// Sample every taken branch, recording source and destination.
    pub fn branch_sampling() -> Self {
        Self {
            config: PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
            sample_period: 1,
            sample_type: PERF_SAMPLE_IP | PERF_SAMPLE_ADDR,
            ..Self::user_only(PERF_TYPE_HARDWARE)
        }
    }

    /// Processor trace on the PMU with dynamic type `pmu_type`.
    pub fn processor_trace(pmu_type: u32) -> Self {
        Self::user_only(pmu_type)
    }
}

/// Open `attr` for thread `tid` on any CPU, without a group.
pub fn open_event(attr: &PerfEventAttr, tid: i32) -> io::Result<OwnedFd> {
    // SAFETY: attr points to a fully initialised perf_event_attr whose size
    // field matches its layout.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            tid,
            -1i32, // cpu = any
            -1i32, // group_fd = none
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the kernel just handed us this descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

/// System page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Mappings
// ═══════════════════════════════════════════════════════════════════════

/// A shared `mmap` of a perf descriptor, unmapped on drop.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain memory owned by this value.
unsafe impl Send for Mapping {}

impl Mapping {
    /// Map `len` bytes of `fd` at `offset` read-only.
    pub fn read_only(fd: BorrowedFd<'_>, len: usize, offset: usize) -> io::Result<Self> {
        Self::map(fd, len, libc::PROT_READ, offset)
    }

    /// Map `len` bytes of `fd` at `offset` read-write.
    pub fn read_write(fd: BorrowedFd<'_>, len: usize, offset: usize) -> io::Result<Self> {
        Self::map(fd, len, libc::PROT_READ | libc::PROT_WRITE, offset)
    }

    fn map(fd: BorrowedFd<'_>, len: usize, prot: libc::c_int, offset: usize) -> io::Result<Self> {
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        // SAFETY: a fresh mapping chosen by the kernel aliases nothing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping we own.
        if unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) } != 0 {
            warn!(
                "failed to unmap {} byte trace region: {}",
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Header page
// ═══════════════════════════════════════════════════════════════════════

/// `struct perf_event_mmap_page`, the first page of every perf mapping.
#[repr(C)]
#[allow(dead_code)]
struct PerfEventMmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    __reserved_1: u32,
    time_cycles: u64,
    time_mask: u64,
    __reserved: [u8; 928],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
    aux_head: u64,
    aux_tail: u64,
    aux_offset: u64,
    aux_size: u64,
}

const _: () = {
    assert!(offset_of!(PerfEventMmapPage, size) == 72);
    assert!(offset_of!(PerfEventMmapPage, data_head) == 1024);
    assert!(offset_of!(PerfEventMmapPage, data_size) == DATA_SIZE_OFFSET);
    assert!(offset_of!(PerfEventMmapPage, aux_head) == 1056);
    assert!(offset_of!(PerfEventMmapPage, aux_size) == 1080);
};

/// Layout fields of a header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    /// Size of the header the kernel filled in.
    pub size: u32,
    pub data_offset: u64,
    pub data_size: u64,
}

/// Which header counter tracks the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadField {
    Data,
    Aux,
}

fn header(mapping: &Mapping) -> *mut PerfEventMmapPage {
    debug_assert!(mapping.len() >= std::mem::size_of::<PerfEventMmapPage>());
    mapping.as_ptr().cast()
}

/// Read the layout fields of the header page at the start of `mapping`.
pub fn header_layout(mapping: &Mapping) -> HeaderLayout {
    let page = header(mapping);
    // SAFETY: the mapping starts with a header page; the kernel only
    // changes these fields at mmap time.
    unsafe {
        HeaderLayout {
            size: ptr::addr_of!((*page).size).read_volatile(),
            data_offset: ptr::addr_of!((*page).data_offset).read_volatile(),
            data_size: ptr::addr_of!((*page).data_size).read_volatile(),
        }
    }
}

/// Describe the AUX area to the kernel before mapping it.
///
/// `mapping` must be the read-write header page.
pub fn set_aux_area(mapping: &Mapping, offset: u64, size: u64) {
    let page = header(mapping);
    // SAFETY: writable header page; the kernel reads these at AUX mmap time.
    unsafe {
        ptr::addr_of_mut!((*page).aux_offset).write_volatile(offset);
        ptr::addr_of_mut!((*page).aux_size).write_volatile(size);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Ring memory
// ═══════════════════════════════════════════════════════════════════════

/// Mapped perf buffer as seen by the reader.
///
/// Fields drop in declaration order: the AUX area is released before the
/// header page that describes it.
#[derive(Debug)]
pub struct PerfRing {
    aux: Option<Mapping>,
    header: Mapping,
    head: HeadField,
    data_offset: usize,
    size: usize,
}

impl PerfRing {
    /// Branch-pair ring: header page and data pages in one mapping, the data
    /// area at `[data_offset, data_offset + size)`.
    ///
    /// Returns `None` if the data area does not lie inside the mapping.
    pub fn data_area(mapping: Mapping, data_offset: usize, size: usize) -> Option<Self> {
        let end = data_offset.checked_add(size)?;
        if end > mapping.len() {
            return None;
        }
        Some(Self {
            aux: None,
            header: mapping,
            head: HeadField::Data,
            data_offset,
            size,
        })
    }

    /// Packet-stream ring: header page plus a separately mapped AUX area.
    pub fn aux_area(header: Mapping, aux: Mapping) -> Self {
        let size = aux.len();
        Self {
            aux: Some(aux),
            header,
            head: HeadField::Aux,
            data_offset: 0,
            size,
        }
    }

    fn data(&self) -> *const u8 {
        let base = self.aux.as_ref().unwrap_or(&self.header).as_ptr();
        // SAFETY: data_offset + size lies within the mapping.
        unsafe { base.add(self.data_offset) }
    }
}

impl RingMemory for PerfRing {
    fn size(&self) -> usize {
        self.size
    }

    fn head(&self) -> u64 {
        let page = header(&self.header);
        // SAFETY: the header page is mapped and the head fields are 8-byte
        // aligned.  The kernel publishes them with a release store.
        let head = unsafe {
            let field = match self.head {
                HeadField::Data => ptr::addr_of!((*page).data_head),
                HeadField::Aux => ptr::addr_of!((*page).aux_head),
            };
            &*field.cast::<AtomicU64>()
        };
        head.load(Ordering::Acquire)
    }

    fn copy_at(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() <= self.size);
        // SAFETY: RingBuffer bounds-checks offset and length; bytes are
        // copied, never borrowed, since the kernel keeps writing them.
        unsafe {
            ptr::copy_nonoverlapping(self.data().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingBuffer;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::fd::AsFd;

    const PAGE: usize = 4096;

    #[test]
    fn branch_sampling_attr() {
        let attr = PerfEventAttr::branch_sampling();
        assert_eq!(attr.size, 136);
        assert_eq!(attr.type_, PERF_TYPE_HARDWARE);
        assert_eq!(attr.config, 4);
        assert_eq!(attr.sample_period, 1);
        assert_eq!(attr.sample_type, 0b1001);
        assert_eq!(attr.flags, 0b1110_0000);
    }

    #[test]
    fn processor_trace_attr_uses_dynamic_type() {
        let attr = PerfEventAttr::processor_trace(8);
        assert_eq!(attr.type_, 8);
        assert_eq!(attr.sample_period, 0);
        assert_eq!(attr.flags & FLAG_EXCLUDE_KERNEL, FLAG_EXCLUDE_KERNEL);
    }

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    /// A file laid out like a branch-pair mapping: header page, one data page.
    fn fake_perf_file(head: u64, data: &[u8]) -> std::fs::File {
        let mut file = tempfile::tempfile().unwrap();
        file.set_len(2 * PAGE as u64).unwrap();
        let mut put = |at: u64, bytes: &[u8]| {
            file.seek(SeekFrom::Start(at)).unwrap();
            file.write_all(bytes).unwrap();
        };
        put(72, &1088u32.to_ne_bytes());
        put(1024, &head.to_ne_bytes());
        put(1040, &(PAGE as u64).to_ne_bytes());
        put(1048, &(PAGE as u64).to_ne_bytes());
        put(PAGE as u64, data);
        file
    }

    #[test]
    fn data_ring_over_mapped_file() {
        let data: Vec<u8> = (0..PAGE).map(|i| (i % 251) as u8).collect();
        let file = fake_perf_file(PAGE as u64 + 10, &data);
        let mapping = Mapping::read_only(file.as_fd(), 2 * PAGE, 0).unwrap();

        let layout = header_layout(&mapping);
        assert_eq!(
            layout,
            HeaderLayout {
                size: 1088,
                data_offset: PAGE as u64,
                data_size: PAGE as u64
            }
        );

        let ring = RingBuffer::new(Box::new(PerfRing::data_area(mapping, PAGE, PAGE).unwrap()));
        assert_eq!(ring.size(), PAGE);
        assert_eq!(ring.head(), PAGE as u64 + 10);
        let tail = ring.read(ring.head(), 20);
        let expected: Vec<u8> = data[PAGE - 10..].iter().chain(&data[..10]).copied().collect();
        assert_eq!(tail, expected);
    }

    #[test]
    fn data_area_outside_mapping_is_rejected() {
        let file = fake_perf_file(0, &[]);
        let mapping = Mapping::read_only(file.as_fd(), 2 * PAGE, 0).unwrap();
        assert!(PerfRing::data_area(mapping, PAGE, 2 * PAGE).is_none());

        let mapping = Mapping::read_only(file.as_fd(), 2 * PAGE, 0).unwrap();
        assert!(PerfRing::data_area(mapping, usize::MAX, 1).is_none());
    }

    #[test]
    fn aux_area_is_described_through_header() {
        let file = fake_perf_file(0, &[]);
        let mapping = Mapping::read_write(file.as_fd(), PAGE, 0).unwrap();
        set_aux_area(&mapping, 2 * PAGE as u64, 8 * PAGE as u64);
        let page = header(&mapping);
        // SAFETY: test-local mapping.
        let (offset, size) = unsafe { ((*page).aux_offset, (*page).aux_size) };
        assert_eq!((offset, size), (2 * PAGE as u64, 8 * PAGE as u64));
    }

    #[test]
    fn open_branch_sampling_on_self() {
        match open_event(&PerfEventAttr::branch_sampling(), 0) {
            Ok(fd) => assert!(fd.as_raw_fd() >= 0),
            Err(e) => eprintln!("Not available: {} (expected in CI)", e),
        }
    }
}
