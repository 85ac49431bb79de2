//! Error type shared by the session, read and recorder layers.

use crate::config::{ReadType, ThreadId, TraceFormat};
use std::io;
use thiserror::Error;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The format, CPU or kernel cannot do this.  Retrying will not help.
    NotSupported,
    /// The kernel refused; the message names the setting to relax.
    PermissionDenied,
    /// The requested delta has already been overwritten; fall back to a
    /// full read.
    Overflow,
    /// Anything else.
    Unknown,
}

#[derive(Error, Debug)]
pub enum BtraceError {
    #[error("{0}")]
    NotSupported(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("Branch trace buffer overflowed during a {read_type} read; read all trace instead.")]
    Overflow { read_type: ReadType },

    #[error("Failed to start recording: {0}")]
    Open(#[source] io::Error),

    #[error("Failed to map trace user page: {0}")]
    MapConfigPage(#[source] io::Error),

    #[error("Failed to map trace buffer: {0}")]
    MapBuffer(#[source] io::Error),

    #[error("Failed to determine trace buffer size.")]
    BufferSize,

    #[error("Failed to open {path}: {source}")]
    Sysfs {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read the PT event type from {path}.")]
    PtEventType { path: String },

    #[error("Bad branch trace format.")]
    BadFormat,

    #[error("Cannot combine {existing} trace with {incoming} trace.")]
    FormatMismatch {
        existing: TraceFormat,
        incoming: TraceFormat,
    },

    #[error("Error while trying to read delta trace.  Falling back to a full read.")]
    Stitch,

    #[error("Failed to read the registers of thread {thread}: {source}")]
    Registers {
        thread: ThreadId,
        #[source]
        source: io::Error,
    },

    #[error("Branch tracing is not enabled for thread {0}.")]
    NotEnabled(ThreadId),

    #[error("Failed to stop recording: {0}")]
    Close(#[source] io::Error),
}

impl BtraceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotSupported(_) | Self::BadFormat => ErrorKind::NotSupported,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Overflow { .. } => ErrorKind::Overflow,
            Self::Open(_)
            | Self::MapConfigPage(_)
            | Self::MapBuffer(_)
            | Self::BufferSize
            | Self::Sysfs { .. }
            | Self::PtEventType { .. }
            | Self::FormatMismatch { .. }
            | Self::Stitch
            | Self::Registers { .. }
            | Self::NotEnabled(_)
            | Self::Close(_) => ErrorKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_names_the_read_type() {
        let err = BtraceError::Overflow {
            read_type: ReadType::Delta,
        };
        assert_eq!(err.kind(), ErrorKind::Overflow);
        assert!(err.to_string().contains("delta"), "{err}");
    }

    #[test]
    fn kinds() {
        assert_eq!(
            BtraceError::NotSupported("x".into()).kind(),
            ErrorKind::NotSupported
        );
        assert_eq!(BtraceError::BadFormat.kind(), ErrorKind::NotSupported);
        assert_eq!(
            BtraceError::PermissionDenied("x".into()).kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            BtraceError::MapBuffer(io::Error::from_raw_os_error(libc::ENOMEM)).kind(),
            ErrorKind::Unknown
        );
    }
}
