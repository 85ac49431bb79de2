//! Command-line front end for hardware branch tracing.
//!
//! Checks what the host supports, records a running thread for a while,
//! and inspects saved recordings.
//!
//! # Usage
//!
//! ```bash
//! # What can this machine trace?
//! btrace info
//!
//! # Record thread 12345 for half a second and save the trace
//! btrace record --pid 12345 --duration-ms 500 --output trace.json
//!
//! # Show what a saved recording contains
//! btrace summary --trace trace.json
//! ```

use btrace::error::BtraceError;
use btrace::recording::{RecordingError, TraceRecording};
use btrace::session::{read_pt_event_type, INTEL_PT_TYPE, PERF_EVENT_PARANOID};
use btrace::{Recorder, ThreadId, TraceConfig, TraceCpu, TraceData, Tuning};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use snafu::{ResultExt, Snafu};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI errors for the btrace binary.
#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("{source}"), context(false))]
    Trace { source: BtraceError },
    #[snafu(display("Recording error"), context(false))]
    Recording { source: RecordingError },
    #[snafu(display("ptrace {op} of thread {tid} failed"))]
    Ptrace {
        op: &'static str,
        tid: i32,
        source: io::Error,
    },
}

#[derive(Parser)]
#[command(name = "btrace")]
#[command(about = "Hardware branch tracing (BTS / Intel PT) via perf_event")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the host CPU and which trace formats are available.
    Info,

    /// Record a running thread.
    Record {
        /// Process id of the thread to record.
        #[arg(short, long)]
        pid: i32,

        /// Thread id within the process (default: the main thread).
        #[arg(short, long)]
        tid: Option<i32>,

        /// Trace format.
        #[arg(short, long, value_enum, default_value = "bts")]
        format: FormatArg,

        /// Requested buffer size in bytes.
        #[arg(short, long, default_value_t = btrace::config::DEFAULT_BUFFER_SIZE)]
        size: u32,

        /// How long to let the thread run before reading.
        #[arg(short, long, default_value = "100")]
        duration_ms: u64,

        /// Print this many of the newest blocks.
        #[arg(short, long, default_value = "10")]
        blocks: usize,

        /// Save the recording to a JSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show what a saved recording contains.
    Summary {
        /// Path to recording file (JSON).
        #[arg(short, long)]
        trace: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Bts,
    Pt,
}

impl FormatArg {
    fn config(self, size: u32) -> TraceConfig {
        match self {
            Self::Bts => TraceConfig::bts(size),
            Self::Pt => TraceConfig::pt(size),
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info => cmd_info(),
        Commands::Record {
            pid,
            tid,
            format,
            size,
            duration_ms,
            blocks,
            output,
        } => cmd_record(
            ThreadId::new(pid, tid.unwrap_or(0)),
            format.config(size),
            Duration::from_millis(duration_ms),
            blocks,
            output,
        ),
        Commands::Summary { trace } => cmd_summary(&trace),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_info() -> Result<(), CliError> {
    let cpu = TraceCpu::host();
    let tuning = Tuning::default();
    println!("CPU: {}", cpu);

    let bts = if cpu.supports_bts(&tuning.bts_denylist) {
        "available".to_string()
    } else {
        "disabled for this cpu".to_string()
    };
    println!("BTS: {}", bts);

    let pt = match read_pt_event_type(Path::new(INTEL_PT_TYPE)) {
        Ok(pmu) => format!("available (pmu type {})", pmu),
        Err(e) => e.to_string(),
    };
    println!("PT:  {}", pt);

    match std::fs::read_to_string(PERF_EVENT_PARANOID) {
        Ok(level) => println!("perf_event_paranoid: {}", level.trim()),
        Err(e) => println!("perf_event_paranoid: unavailable ({})", e),
    }
    Ok(())
}

fn cmd_record(
    thread: ThreadId,
    config: TraceConfig,
    duration: Duration,
    show_blocks: usize,
    output: Option<PathBuf>,
) -> Result<(), CliError> {
    let tid = thread.os_tid();
    ptrace::seize(tid).context(PtraceSnafu { op: "seize", tid })?;

    let mut recorder = Recorder::new();
    let recorded = record(&mut recorder, thread, config, duration);

    if let Err(e) = recorder.disable_all() {
        warn!("{}", e);
    }
    if let Err(e) = ptrace::detach(tid) {
        warn!("failed to detach from thread {}: {}", tid, e);
    }
    let recording = recorded?;

    println!("Thread: {}", recording.thread);
    println!("Config: {}", recording.config);
    println!("Trace:  {}", recording.summary());
    if let TraceData::Bts(trace) = &recording.data {
        for block in trace.blocks.iter().take(show_blocks) {
            println!("  {:#018x} ..= {:#018x}", block.begin, block.end);
        }
    }

    if let Some(path) = output {
        recording.save(&path)?;
        eprintln!("Saved recording to {}", path.display());
    }
    Ok(())
}

/// Trace `thread` for `duration`, stop it and read everything.
fn record(
    recorder: &mut Recorder,
    thread: ThreadId,
    config: TraceConfig,
    duration: Duration,
) -> Result<TraceRecording, CliError> {
    let tid = thread.os_tid();
    let obtained = *recorder.enable(thread, &config)?.config();
    info!("recording thread {} with {}", thread, obtained);

    std::thread::sleep(duration);
    ptrace::interrupt(tid).context(PtraceSnafu { op: "interrupt", tid })?;

    let data = recorder.fetch(thread)?.clone();
    Ok(TraceRecording::new(thread, obtained, data))
}

fn cmd_summary(path: &Path) -> Result<(), CliError> {
    let recording = TraceRecording::load(path)?;

    println!("Trace: {}", path.display());
    println!("Thread: {}", recording.thread);
    println!("Config: {}", recording.config);
    println!("Kernel: {}", recording.metadata.kernel_version);
    println!("CPU: {}", recording.metadata.cpu_model);
    println!("Started: {}", recording.metadata.start_time);
    println!();
    println!("{}", recording.summary());
    Ok(())
}

/// Just enough ptrace to stop a running thread for a read.
mod ptrace {
    use std::io;
    use std::ptr;

    fn check(rc: libc::c_long) -> io::Result<()> {
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Attach without stopping the thread.
    pub fn seize(tid: i32) -> io::Result<()> {
        // SAFETY: PTRACE_SEIZE takes no memory arguments.
        check(unsafe {
            libc::ptrace(
                libc::PTRACE_SEIZE,
                tid,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            )
        })
    }

    /// Stop the thread and wait until it is in a ptrace stop.
    pub fn interrupt(tid: i32) -> io::Result<()> {
        // SAFETY: PTRACE_INTERRUPT takes no memory arguments.
        check(unsafe {
            libc::ptrace(
                libc::PTRACE_INTERRUPT,
                tid,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            )
        })?;
        let mut status = 0;
        // SAFETY: status outlives the call.
        if unsafe { libc::waitpid(tid, &mut status, libc::__WALL) } < 0 {
            return Err(io::Error::last_os_error());
        }
        if !libc::WIFSTOPPED(status) {
            return Err(io::Error::other(format!(
                "thread {} did not stop (status {:#x})",
                tid, status
            )));
        }
        Ok(())
    }

    pub fn detach(tid: i32) -> io::Result<()> {
        // SAFETY: PTRACE_DETACH takes no memory arguments.
        check(unsafe {
            libc::ptrace(
                libc::PTRACE_DETACH,
                tid,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            )
        })
    }
}
