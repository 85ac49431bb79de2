//! Per-thread trace sessions.
//!
//! [`enable`] opens a perf event on the thread, negotiates a buffer size
//! with the kernel and maps the buffer; the result is a [`TargetInfo`] that
//! owns everything until [`TargetInfo::disable`] or drop.
//!
//! ```text
//!   TraceConfig::Bts ──► perf_event_open(HW branch instructions)
//!                          └─► mmap(header + data pages, RO)
//!
//!   TraceConfig::Pt  ──► read intel_pt/type ──► perf_event_open(PT PMU)
//!                          ├─► mmap(header page, RW)
//!                          └─► aux_offset/aux_size ──► mmap(AUX, RO)
//! ```
//!
//! Both paths round the requested size up to a power-of-two page count and
//! halve it until the kernel accepts a mapping.  The size actually obtained
//! replaces the requested one in the session's [`TraceConfig`].

use crate::config::{ReadType, ThreadId, TraceConfig, TraceFormat, Tuning};
use crate::cpu::TraceCpu;
use crate::data::TraceData;
use crate::error::BtraceError;
use crate::kallsyms::KernelRange;
use crate::perf::{self, Mapping, PerfEventAttr, PerfRing};
use crate::read::{read_bts, read_pt};
use crate::regs::{PcSource, PtraceRegisters};
use crate::ring::RingBuffer;
use crate::verified::ring::{buffer_pages, data_region};
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::os::fd::{AsFd, IntoRawFd, OwnedFd};
use std::path::Path;

/// Kernel knob consulted when the kernel refuses to open an event.
pub const PERF_EVENT_PARANOID: &str = "/proc/sys/kernel/perf_event_paranoid";

/// Dynamic PMU type of Intel Processor Trace.
pub const INTEL_PT_TYPE: &str = "/sys/bus/event_source/devices/intel_pt/type";

/// Branch tracing state of one thread.
///
/// `ring` is declared before `fd` so the mappings are released before the
/// descriptor is closed.
pub struct TargetInfo {
    ring: RingBuffer,
    fd: Option<OwnedFd>,
    config: TraceConfig,
    thread: ThreadId,
    cpu: TraceCpu,
    pc_source: Box<dyn PcSource>,
    kernel: KernelRange,
    read_retries: u32,
}

impl std::fmt::Debug for TargetInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetInfo")
            .field("thread", &self.thread)
            .field("config", &self.config)
            .field("ring", &self.ring)
            .finish_non_exhaustive()
    }
}

impl TargetInfo {
    /// Assemble a session around an already mapped ring.
    pub(crate) fn from_parts(
        thread: ThreadId,
        config: TraceConfig,
        ring: RingBuffer,
        fd: Option<OwnedFd>,
        tuning: &Tuning,
    ) -> Self {
        Self {
            ring,
            fd,
            config,
            thread,
            cpu: TraceCpu::host(),
            pc_source: Box::new(PtraceRegisters),
            kernel: KernelRange::host(),
            read_retries: tuning.read_retries,
        }
    }

    /// Obtained configuration; the size is what the kernel granted.
    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Replace the source of the thread's current PC (ptrace by default).
    pub fn set_pc_source(&mut self, source: impl PcSource + 'static) {
        self.pc_source = Box::new(source);
    }

    pub fn set_kernel_range(&mut self, kernel: KernelRange) {
        self.kernel = kernel;
    }

    /// Read trace collected so far.
    ///
    /// For branch-pair trace the thread must be stopped so its PC can be
    /// read; see [`PcSource`].
    pub fn read(&mut self, read_type: ReadType) -> Result<TraceData, BtraceError> {
        let thread = self.thread;
        let pc_source = &self.pc_source;
        match self.config.format() {
            TraceFormat::Bts => read_bts(
                &mut self.ring,
                read_type,
                self.read_retries,
                &self.kernel,
                || pc_source.read_pc(thread),
            ),
            TraceFormat::Pt => read_pt(&mut self.ring, read_type, self.cpu),
            TraceFormat::None => Err(BtraceError::BadFormat),
        }
    }

    /// Stop tracing and release the buffer and the event.
    ///
    /// Mappings are released first; a failure to close the descriptor is
    /// reported after everything else has been torn down.
    pub fn disable(self) -> Result<(), BtraceError> {
        let TargetInfo {
            ring, fd, thread, ..
        } = self;
        drop(ring);

        if let Some(fd) = fd {
            let raw = fd.into_raw_fd();
            // SAFETY: we own raw and never use it again.
            if unsafe { libc::close(raw) } != 0 {
                let err = io::Error::last_os_error();
                warn!("failed to close trace event of thread {thread}: {err}");
                return Err(BtraceError::Close(err));
            }
        }
        info!("disabled branch tracing for thread {thread}");
        Ok(())
    }
}

/// Enable branch tracing for `thread`.
pub fn enable(
    thread: ThreadId,
    config: &TraceConfig,
    tuning: &Tuning,
) -> Result<TargetInfo, BtraceError> {
    let target = match *config {
        TraceConfig::None => return Err(BtraceError::BadFormat),
        TraceConfig::Bts { .. } => enable_bts(thread, config, tuning)?,
        TraceConfig::Pt { .. } => enable_pt(thread, config, tuning)?,
    };
    info!(
        "enabled branch tracing for thread {thread}: {} (requested {})",
        target.config,
        config.size()
    );
    Ok(target)
}

fn enable_bts(
    thread: ThreadId,
    config: &TraceConfig,
    tuning: &Tuning,
) -> Result<TargetInfo, BtraceError> {
    let cpu = TraceCpu::host();
    if !cpu.supports_bts(&tuning.bts_denylist) {
        return Err(BtraceError::NotSupported(
            "BTS support has been disabled for the target cpu.".to_string(),
        ));
    }

    let fd = perf::open_event(&PerfEventAttr::branch_sampling(), thread.os_tid())
        .map_err(|err| diagnose_open_failure(err, Path::new(PERF_EVENT_PARANOID)))?;

    let page = perf::page_size();
    // One extra page for the header.
    let (mapping, mapped) = map_negotiated(config, page, |pages| {
        Mapping::read_only(fd.as_fd(), (pages + 1) * page, 0)
    })?;
    let (ring, obtained) = bts_ring(mapping, page, &mapped)?;

    Ok(TargetInfo::from_parts(
        thread,
        obtained,
        RingBuffer::new(Box::new(ring)),
        Some(fd),
        tuning,
    ))
}

fn enable_pt(
    thread: ThreadId,
    config: &TraceConfig,
    tuning: &Tuning,
) -> Result<TargetInfo, BtraceError> {
    let pmu_type = read_pt_event_type(Path::new(INTEL_PT_TYPE))?;
    let fd = perf::open_event(&PerfEventAttr::processor_trace(pmu_type), thread.os_tid())
        .map_err(|err| diagnose_open_failure(err, Path::new(PERF_EVENT_PARANOID)))?;

    let page = perf::page_size();
    let header = Mapping::read_write(fd.as_fd(), page, 0).map_err(BtraceError::MapConfigPage)?;
    let layout = perf::header_layout(&header);
    let aux_offset = layout
        .data_offset
        .checked_add(layout.data_size)
        .ok_or(BtraceError::BufferSize)?;
    let aux_at = usize::try_from(aux_offset).map_err(|_| BtraceError::BufferSize)?;

    let (aux, obtained) = map_negotiated(config, page, |pages| {
        let len = pages * page;
        perf::set_aux_area(&header, aux_offset, len as u64);
        Mapping::read_only(fd.as_fd(), len, aux_at)
    })?;

    let ring = RingBuffer::new(Box::new(PerfRing::aux_area(header, aux)));
    Ok(TargetInfo::from_parts(thread, obtained, ring, Some(fd), tuning))
}

/// Map a trace buffer for `config` with [`negotiate_pages`].
///
/// Returns the mapping and `config` with its size replaced by the size of
/// the buffer the kernel accepted.
pub(crate) fn map_negotiated<T>(
    config: &TraceConfig,
    page_size: usize,
    try_map: impl FnMut(usize) -> io::Result<T>,
) -> Result<(T, TraceConfig), BtraceError> {
    let pages = buffer_pages(config.size(), page_size);
    let (mapped, pages) =
        negotiate_pages(pages, page_size, try_map).map_err(BtraceError::MapBuffer)?;
    let size = u32::try_from(pages * page_size).map_err(|_| BtraceError::BufferSize)?;
    Ok((mapped, config.with_size(size)))
}

/// Locate the data area of a branch-pair `mapping` and record its size.
///
/// The header page may describe a data area smaller than what was mapped;
/// its size is what ends up in the returned configuration.
pub(crate) fn bts_ring(
    mapping: Mapping,
    page_size: usize,
    config: &TraceConfig,
) -> Result<(PerfRing, TraceConfig), BtraceError> {
    let layout = perf::header_layout(&mapping);
    let (offset, size) = data_region(
        layout.size,
        layout.data_offset,
        layout.data_size,
        page_size,
        mapping.len(),
    )
    .ok_or(BtraceError::BufferSize)?;
    let obtained = u32::try_from(size).map_err(|_| BtraceError::BufferSize)?;
    let ring = PerfRing::data_area(mapping, offset, size).ok_or(BtraceError::BufferSize)?;
    Ok((ring, config.with_size(obtained)))
}

/// Try to map `pages` pages, halving on failure.
///
/// Page counts whose byte size does not fit a `u32` are skipped without
/// asking the kernel.  Returns the mapping and the page count it covers, or
/// the last mapping error.
pub(crate) fn negotiate_pages<T>(
    mut pages: usize,
    page_size: usize,
    mut try_map: impl FnMut(usize) -> io::Result<T>,
) -> io::Result<(T, usize)> {
    let mut last_err = None;
    while pages > 0 {
        let fits = pages
            .checked_mul(page_size)
            .is_some_and(|bytes| bytes <= u32::MAX as usize);
        if fits {
            match try_map(pages) {
                Ok(mapped) => {
                    debug!("mapped trace buffer of {pages} pages");
                    return Ok((mapped, pages));
                }
                Err(err) => {
                    debug!("failed to map {pages} trace pages: {err}");
                    last_err = Some(err);
                }
            }
        }
        pages /= 2;
    }
    Err(last_err.unwrap_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM)))
}

/// Turn a failed `perf_event_open` into an actionable error.
pub(crate) fn diagnose_open_failure(err: io::Error, paranoid: &Path) -> BtraceError {
    match err.raw_os_error() {
        Some(libc::EPERM | libc::EACCES) => match fs::read_to_string(paranoid) {
            Err(open_err) => BtraceError::NotSupported(format!(
                "Failed to open {} ({open_err}).  Your system does not support process recording.",
                paranoid.display()
            )),
            Ok(text) => match text.trim().parse::<i32>() {
                Ok(level) if level > 2 => BtraceError::PermissionDenied(format!(
                    "You do not have permission to record the process.  Try setting {} to 2 or less.",
                    paranoid.display()
                )),
                _ => BtraceError::Open(err),
            },
        },
        Some(libc::ENOENT | libc::ENODEV | libc::EOPNOTSUPP) => {
            BtraceError::NotSupported(format!("Failed to start recording: {err}"))
        }
        _ => BtraceError::Open(err),
    }
}

/// Read the dynamic PMU type from a sysfs `type` file.
pub fn read_pt_event_type(path: &Path) -> Result<u32, BtraceError> {
    let text = fs::read_to_string(path).map_err(|source| match source.raw_os_error() {
        Some(libc::EACCES | libc::EFAULT | libc::EPERM) => BtraceError::PermissionDenied(format!(
            "Failed to open {} ({source}).  You do not have permission to use Intel PT.",
            path.display()
        )),
        Some(libc::ENOENT | libc::ENOTDIR) => BtraceError::NotSupported(format!(
            "Failed to open {} ({source}).  Your system does not support Intel PT.",
            path.display()
        )),
        _ => BtraceError::Sysfs {
            path: path.display().to_string(),
            source,
        },
    })?;
    text.trim().parse().map_err(|_| BtraceError::PtEventType {
        path: path.display().to_string(),
    })
}
