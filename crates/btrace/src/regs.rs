//! Current PC of a traced thread.
//!
//! The newest branch-pair block ends wherever the thread is stopped now.
//! Reads ask a [`PcSource`] for it; the default one uses ptrace, which
//! requires the thread to be ptrace-stopped by the caller.

use crate::config::ThreadId;
use crate::error::BtraceError;
use std::io;

/// Supplies the current instruction pointer of a thread.
pub trait PcSource: Send {
    fn read_pc(&self, thread: ThreadId) -> Result<u64, BtraceError>;
}

impl<F> PcSource for F
where
    F: Fn(ThreadId) -> Result<u64, BtraceError> + Send,
{
    fn read_pc(&self, thread: ThreadId) -> Result<u64, BtraceError> {
        self(thread)
    }
}

/// Reads the PC through `ptrace(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PtraceRegisters;

impl PcSource for PtraceRegisters {
    fn read_pc(&self, thread: ThreadId) -> Result<u64, BtraceError> {
        read_pc(thread.os_tid()).map_err(|source| BtraceError::Registers { thread, source })
    }
}

#[cfg(target_arch = "x86_64")]
fn read_pc(tid: i32) -> io::Result<u64> {
    // SAFETY: user_regs_struct is plain old data.
    let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
    // SAFETY: PTRACE_GETREGS fills exactly one user_regs_struct.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGS,
            tid,
            std::ptr::null_mut::<libc::c_void>(),
            &mut regs as *mut libc::user_regs_struct,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(regs.rip)
}

#[cfg(target_arch = "aarch64")]
fn read_pc(tid: i32) -> io::Result<u64> {
    // SAFETY: user_regs_struct is plain old data.
    let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: (&mut regs as *mut libc::user_regs_struct).cast(),
        iov_len: std::mem::size_of::<libc::user_regs_struct>(),
    };
    // SAFETY: the iovec describes regs, which outlives the call.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid,
            libc::NT_PRSTATUS as usize as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(regs.pc)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn read_pc(_tid: i32) -> io::Result<u64> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn closures_are_pc_sources() {
        let source =
            |thread: ThreadId| -> Result<u64, BtraceError> { Ok(0x1000 + thread.os_tid() as u64) };
        assert_eq!(source.read_pc(ThreadId::process(5)).unwrap(), 0x1005);
    }

    #[test]
    fn ptrace_on_untraced_thread_fails_with_registers_error() {
        // We do not trace ourselves, so the kernel refuses.
        let thread = ThreadId::process(std::process::id() as i32);
        let err = PtraceRegisters.read_pc(thread).unwrap_err();
        assert!(matches!(err, BtraceError::Registers { .. }), "{err}");
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }
}
