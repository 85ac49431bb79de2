//! Registry of traced threads.
//!
//! A [`Recorder`] owns one [`TargetInfo`] per traced thread plus the trace
//! accumulated for it so far, and walks each thread through
//!
//! ```text
//!   Disabled ──► Enabling ──► Enabled ──► Disabling ──► Disabled
//!                   │                                      ▲
//!                   └──────────── enable failed ───────────┘
//! ```
//!
//! Enabling a thread that is not disabled is a caller bug and panics.
//! A thread whose enable was interrupted by a panic stays `Enabling`.

use crate::config::{ReadType, ThreadId, TraceConfig, Tuning};
use crate::data::TraceData;
use crate::error::BtraceError;
use crate::session::{self, TargetInfo};
use log::debug;
use std::collections::HashMap;
use std::fmt;

/// Creates trace sessions.  [`PerfBackend`] talks to the kernel; tests
/// substitute in-memory rings.
pub trait TraceBackend {
    fn enable(
        &self,
        thread: ThreadId,
        config: &TraceConfig,
        tuning: &Tuning,
    ) -> Result<TargetInfo, BtraceError>;
}

/// Sessions backed by `perf_event_open`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfBackend;

impl TraceBackend for PerfBackend {
    fn enable(
        &self,
        thread: ThreadId,
        config: &TraceConfig,
        tuning: &Tuning,
    ) -> Result<TargetInfo, BtraceError> {
        session::enable(thread, config, tuning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Enabling => write!(f, "enabling"),
            Self::Enabled => write!(f, "enabled"),
            Self::Disabling => write!(f, "disabling"),
        }
    }
}

#[derive(Debug)]
struct Traced {
    target: TargetInfo,
    /// Trace fetched so far, newest blocks first.
    data: TraceData,
}

pub struct Recorder<B = PerfBackend> {
    backend: B,
    tuning: Tuning,
    threads: HashMap<ThreadId, Traced>,
    /// Threads not in [`SessionState::Disabled`].
    states: HashMap<ThreadId, SessionState>,
}

impl Recorder<PerfBackend> {
    pub fn new() -> Self {
        Self::with_backend(PerfBackend, Tuning::default())
    }
}

impl Default for Recorder<PerfBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: TraceBackend> Recorder<B> {
    pub fn with_backend(backend: B, tuning: Tuning) -> Self {
        Self {
            backend,
            tuning,
            threads: HashMap::new(),
            states: HashMap::new(),
        }
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn state(&self, thread: ThreadId) -> SessionState {
        self.states
            .get(&thread)
            .copied()
            .unwrap_or(SessionState::Disabled)
    }

    fn transition(&mut self, thread: ThreadId, to: SessionState) {
        let from = self.state(thread);
        debug!("thread {thread}: branch trace {from} -> {to}");
        if to == SessionState::Disabled {
            self.states.remove(&thread);
        } else {
            self.states.insert(thread, to);
        }
    }

    /// Threads currently being traced.
    pub fn threads(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.keys().copied()
    }

    /// Start tracing `thread`.
    ///
    /// # Panics
    ///
    /// If `thread` is already enabled.
    pub fn enable(
        &mut self,
        thread: ThreadId,
        config: &TraceConfig,
    ) -> Result<&TargetInfo, BtraceError> {
        assert!(
            self.state(thread) == SessionState::Disabled,
            "branch trace already enabled for thread {thread}"
        );

        self.transition(thread, SessionState::Enabling);
        let target = match self.backend.enable(thread, config, &self.tuning) {
            Ok(target) => target,
            Err(err) => {
                self.transition(thread, SessionState::Disabled);
                return Err(err);
            }
        };
        self.transition(thread, SessionState::Enabled);

        let traced = self.threads.entry(thread).or_insert(Traced {
            target,
            data: TraceData::None,
        });
        Ok(&traced.target)
    }

    /// Stop tracing `thread` and drop its accumulated trace.
    pub fn disable(&mut self, thread: ThreadId) -> Result<(), BtraceError> {
        let traced = self
            .threads
            .remove(&thread)
            .ok_or(BtraceError::NotEnabled(thread))?;
        self.transition(thread, SessionState::Disabling);
        let result = traced.target.disable();
        self.transition(thread, SessionState::Disabled);
        result
    }

    /// Disable every thread, returning the first error.
    pub fn disable_all(&mut self) -> Result<(), BtraceError> {
        let threads: Vec<_> = self.threads().collect();
        let mut first_err = None;
        for thread in threads {
            if let Err(err) = self.disable(thread) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn target(&self, thread: ThreadId) -> Option<&TargetInfo> {
        self.threads.get(&thread).map(|t| &t.target)
    }

    pub fn target_mut(&mut self, thread: ThreadId) -> Option<&mut TargetInfo> {
        self.threads.get_mut(&thread).map(|t| &mut t.target)
    }

    pub fn config(&self, thread: ThreadId) -> Option<&TraceConfig> {
        self.target(thread).map(TargetInfo::config)
    }

    /// One raw read, bypassing the accumulated trace.
    pub fn read(&mut self, thread: ThreadId, read_type: ReadType) -> Result<TraceData, BtraceError> {
        self.target_mut(thread)
            .ok_or(BtraceError::NotEnabled(thread))?
            .read(read_type)
    }

    /// Trace accumulated by [`Recorder::fetch`].
    pub fn trace(&self, thread: ThreadId) -> Option<&TraceData> {
        self.threads.get(&thread).map(|t| &t.data)
    }

    /// Forget the accumulated trace; the next fetch reads everything.
    pub fn clear(&mut self, thread: ThreadId) {
        if let Some(traced) = self.threads.get_mut(&thread) {
            traced.data = TraceData::None;
        }
    }

    /// Bring the accumulated trace of `thread` up to date.
    ///
    /// With trace already present, only the delta is read and stitched on.
    /// If that fails (overflow, a format without delta reads, or a delta
    /// that does not connect), any new trace replaces what we had, and as a
    /// last resort everything is read again.
    pub fn fetch(&mut self, thread: ThreadId) -> Result<&TraceData, BtraceError> {
        let traced = self
            .threads
            .get_mut(&thread)
            .ok_or(BtraceError::NotEnabled(thread))?;
        let target = &mut traced.target;
        let data = &mut traced.data;

        if data.is_empty() {
            let all = target.read(ReadType::All)?;
            data.append(all)?;
            return Ok(&*data);
        }

        let extended = match target.read(ReadType::Delta) {
            Ok(delta) => data.stitch(delta),
            Err(err) => {
                debug!("thread {thread}: {err}");
                target.read(ReadType::New).map(|new| {
                    if !new.is_empty() {
                        *data = new;
                    }
                })
            }
        };

        if let Err(err) = extended {
            debug!("thread {thread}: {err}");
            *data = TraceData::None;
            let all = target.read(ReadType::All)?;
            data.append(all)?;
        }
        Ok(&*data)
    }
}
