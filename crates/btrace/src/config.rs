//! Trace configuration, read types and tuning knobs.

use crate::cpu::{CpuModel, BTS_BROKEN_INTEL_MODELS};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default number of decode passes a read makes while the kernel head keeps
/// moving before it settles for the last pass.
pub const DEFAULT_READ_RETRIES: u32 = 5;

/// Default requested buffer size for either format (64 KiB).
pub const DEFAULT_BUFFER_SIZE: u32 = 64 * 1024;

/// Identifies a traced thread.
///
/// `lwp` is the kernel thread id; a zero `lwp` means the thread is the
/// process's main thread and `pid` is used instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId {
    pub pid: i32,
    pub lwp: i32,
}

impl ThreadId {
    pub fn new(pid: i32, lwp: i32) -> Self {
        Self { pid, lwp }
    }

    /// The main thread of process `pid`.
    pub fn process(pid: i32) -> Self {
        Self { pid, lwp: 0 }
    }

    /// The id to hand to `perf_event_open` and `ptrace`.
    pub fn os_tid(&self) -> i32 {
        if self.lwp != 0 {
            self.lwp
        } else {
            self.pid
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lwp != 0 && self.lwp != self.pid {
            write!(f, "{}.{}", self.pid, self.lwp)
        } else {
            write!(f, "{}", self.pid)
        }
    }
}

/// Hardware trace format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceFormat {
    None,
    /// Branch-pair format (Intel Branch Trace Store).
    Bts,
    /// Packet-stream format (Intel Processor Trace).
    Pt,
}

impl fmt::Display for TraceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Bts => write!(f, "bts"),
            Self::Pt => write!(f, "pt"),
        }
    }
}

/// Requested (before enable) or obtained (after enable) trace configuration.
///
/// `size` is in bytes.  Once a session is enabled it holds the size the
/// kernel actually granted, which may be smaller than what was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceConfig {
    None,
    Bts { size: u32 },
    Pt { size: u32 },
}

impl TraceConfig {
    pub fn bts(size: u32) -> Self {
        Self::Bts { size }
    }

    pub fn pt(size: u32) -> Self {
        Self::Pt { size }
    }

    pub fn format(&self) -> TraceFormat {
        match self {
            Self::None => TraceFormat::None,
            Self::Bts { .. } => TraceFormat::Bts,
            Self::Pt { .. } => TraceFormat::Pt,
        }
    }

    /// Buffer size in bytes, zero for [`TraceConfig::None`].
    pub fn size(&self) -> u32 {
        match *self {
            Self::None => 0,
            Self::Bts { size } | Self::Pt { size } => size,
        }
    }

    pub(crate) fn with_size(&self, size: u32) -> Self {
        match self {
            Self::None => Self::None,
            Self::Bts { .. } => Self::Bts { size },
            Self::Pt { .. } => Self::Pt { size },
        }
    }
}

impl fmt::Display for TraceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format() {
            TraceFormat::None => write!(f, "none"),
            format => {
                let size = self.size();
                if size >= 1024 && size % 1024 == 0 {
                    write!(f, "{} ({} KiB)", format, size / 1024)
                } else {
                    write!(f, "{} ({} bytes)", format, size)
                }
            }
        }
    }
}

/// How much of the trace buffer a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadType {
    /// Everything currently in the buffer, ignoring the read cursor.
    All,
    /// Like [`ReadType::All`], but returns nothing if the kernel has not
    /// written anything since the previous read.
    New,
    /// Only what was written since the previous read.
    Delta,
}

impl fmt::Display for ReadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::New => write!(f, "new"),
            Self::Delta => write!(f, "delta"),
        }
    }
}

/// Policy constants chosen empirically against real hardware and kernels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    /// Decode passes per read before accepting a result observed while the
    /// kernel head was still moving.
    pub read_retries: u32,
    /// Intel `(family, model)` pairs on which BTS is declined.
    pub bts_denylist: Vec<CpuModel>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            read_retries: DEFAULT_READ_RETRIES,
            bts_denylist: BTS_BROKEN_INTEL_MODELS.to_vec(),
        }
    }
}

impl Tuning {
    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    pub fn with_bts_denylist(mut self, denylist: Vec<CpuModel>) -> Self {
        self.bts_denylist = denylist;
        self
    }
}
