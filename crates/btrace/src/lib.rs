//! Hardware branch-trace collection for Linux.
//!
//! This crate records the control flow of a running thread with the
//! processor's branch tracing facilities, reached through `perf_event_open`,
//! and turns the kernel's trace buffer into ordered control-flow blocks.
//! Two formats are supported:
//!
//! - **BTS** (branch-pair): every taken branch as a `(from, to)` sample,
//!   decoded here into [`ControlFlowBlock`]s.
//! - **PT** (packet-stream): raw Intel Processor Trace packets, handed out
//!   as bytes for an external decoder.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Traced thread (ptrace-stopped      │
//! │  whenever trace is read)            │
//! └──────────────┬──────────────────────┘
//!                │ branches
//! ═══════════════╪══════════════════════════
//!                │ CPU + kernel perf
//! ┌──────────────▼──────────────────────┐
//! │  Ring buffer (mmap, kernel writes): │
//! │    header page: data_head/aux_head  │
//! │    data pages or AUX area           │
//! └──────────────┬──────────────────────┘
//!                │ copy out, never borrow
//! ┌──────────────▼──────────────────────┐
//! │  btrace                             │
//! │    session   → TargetInfo           │
//! │    read      → ALL / NEW / DELTA    │
//! │    bts       → ControlFlowBlocks    │
//! │    recorder  → per-thread fetch     │
//! │    recording → JSON save/load       │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use btrace::{Recorder, ThreadId, TraceConfig, TraceData};
//!
//! let thread = ThreadId::process(12345);
//! let mut recorder = Recorder::new();
//! recorder.enable(thread, &TraceConfig::bts(64 * 1024)).unwrap();
//!
//! // ... let the thread run, then stop it with ptrace ...
//!
//! if let TraceData::Bts(trace) = recorder.fetch(thread).unwrap() {
//!     for block in &trace.blocks {
//!         println!("{:#x}..={:#x}", block.begin, block.end);
//!     }
//! }
//! recorder.disable(thread).unwrap();
//! ```

pub mod bts;
pub mod config;
pub mod cpu;
pub mod data;
pub mod error;
pub mod kallsyms;
pub mod perf;
pub mod read;
pub mod recorder;
pub mod recording;
pub mod regs;
pub mod ring;
pub mod session;
pub mod verified;

pub use config::{ReadType, ThreadId, TraceConfig, TraceFormat, Tuning};
pub use cpu::TraceCpu;
pub use data::{BtsTrace, ControlFlowBlock, PtTrace, TraceData};
pub use error::{BtraceError, ErrorKind};
pub use recorder::{Recorder, SessionState};
pub use recording::TraceRecording;
pub use session::{enable, TargetInfo};
