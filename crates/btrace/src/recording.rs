//! Saved branch-trace recordings.
//!
//! A [`TraceRecording`] is one read's worth of trace plus the session
//! configuration and host information, persisted as JSON so traces can be
//! inspected or decoded away from the machine they were taken on.

use crate::config::{ThreadId, TraceConfig, TraceFormat};
use crate::data::TraceData;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::fmt;
use std::fs;
use std::path::Path;

/// Errors from recording save/load.
#[derive(Debug, Snafu)]
pub enum RecordingError {
    #[snafu(display("I/O error"), context(false))]
    Io { source: std::io::Error },

    #[snafu(display("JSON error"), context(false))]
    Json { source: serde_json::Error },
}

/// Metadata about the trace environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMetadata {
    /// Kernel version string.
    pub kernel_version: String,
    /// CPU model string.
    pub cpu_model: String,
    /// Wall-clock time the recording was taken.
    pub start_time: String,
}

impl TraceMetadata {
    /// Gather metadata from the current system.
    pub fn gather() -> Self {
        let kernel_version = fs::read_to_string("/proc/version")
            .unwrap_or_default()
            .trim()
            .to_string();
        let cpu_model = fs::read_to_string("/proc/cpuinfo")
            .unwrap_or_default()
            .lines()
            .find_map(|l| l.strip_prefix("model name"))
            .and_then(|rest| rest.split_once(':'))
            .map_or_else(|| "unknown".to_string(), |(_, name)| name.trim().to_string());
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: clock_gettime writes into a timespec we own.
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        let start_time = format!("{}s_{}ns", ts.tv_sec, ts.tv_nsec);

        Self {
            kernel_version,
            cpu_model,
            start_time,
        }
    }
}

/// A recorded trace of a single thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecording {
    pub thread: ThreadId,
    /// Configuration the kernel granted.
    pub config: TraceConfig,
    pub data: TraceData,
    pub metadata: TraceMetadata,
}

impl TraceRecording {
    pub fn new(thread: ThreadId, config: TraceConfig, data: TraceData) -> Self {
        Self {
            thread,
            config,
            data,
            metadata: TraceMetadata::gather(),
        }
    }

    /// Save to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RecordingError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn summary(&self) -> TraceSummary {
        let mut summary = TraceSummary {
            format: self.data.format(),
            ..TraceSummary::default()
        };
        match &self.data {
            TraceData::None => {}
            TraceData::Bts(trace) => {
                summary.blocks = trace.blocks.len();
                summary.incomplete = trace.incomplete;
                summary.address_range = trace
                    .blocks
                    .iter()
                    .flat_map(|b| [b.begin, b.end])
                    .filter(|&addr| addr != 0)
                    .fold(None, |range, addr| match range {
                        None => Some((addr, addr)),
                        Some((lo, hi)) => Some((addr.min(lo), addr.max(hi))),
                    });
            }
            TraceData::Pt(trace) => summary.packet_bytes = trace.data.len(),
        }
        summary
    }
}

/// What a recording contains, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSummary {
    pub format: TraceFormat,
    pub blocks: usize,
    pub packet_bytes: usize,
    pub incomplete: bool,
    /// Lowest and highest known address touched by any block.
    pub address_range: Option<(u64, u64)>,
}

impl Default for TraceSummary {
    fn default() -> Self {
        Self {
            format: TraceFormat::None,
            blocks: 0,
            packet_bytes: 0,
            incomplete: false,
            address_range: None,
        }
    }
}

impl fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            TraceFormat::None => write!(f, "no trace"),
            TraceFormat::Bts => {
                write!(f, "{} blocks", self.blocks)?;
                if let Some((lo, hi)) = self.address_range {
                    write!(f, " in {lo:#x}..={hi:#x}")?;
                }
                if self.incomplete {
                    write!(f, " (incomplete)")?;
                }
                Ok(())
            }
            TraceFormat::Pt => write!(f, "{} bytes of packet data", self.packet_bytes),
        }
    }
}
