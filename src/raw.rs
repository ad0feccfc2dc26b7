//! Stateless ptrace requests, addressed by pid.
//!
//! Each function issues exactly the kernel requests its name implies and classifies any
//! failure. Nothing here tracks whether the target is actually stopped: callers that want
//! that bookkeeping should use [`TraceSession`](crate::TraceSession), which is built on
//! these functions.

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal::{kill, Signal},
        wait::{self, WaitPidFlag, WaitStatus},
    },
    unistd::getpid,
};
use tracing::{debug, info};

use crate::error::{Error, Result, ResultExt};
use crate::filter::{self, SeccompProgram};
use crate::regs::{self, RegisterDescriptor};
use crate::{Options, Pid};

/// Returned by [`read_register()`] when the read fails for any reason.
pub const REGISTER_READ_FAILED: i64 = -1;

/// Request that the calling process be traced by its parent.
///
/// Async-signal-safe: may be called between `fork()` and `exec()`.
pub fn traceme() -> Result<()> {
    Ok(ptrace::traceme()?)
}

/// Request tracing by the parent, then stop the calling process with `SIGSTOP`.
///
/// When this returns, the parent has observed (or can observe, via `wait`) the calling
/// process in a ptrace-stop, and has since resumed it. Async-signal-safe.
pub fn traceme_and_stop() -> Result<()> {
    traceme()?;
    kill(getpid(), Signal::SIGSTOP)?;
    Ok(())
}

/// Attach to a running process. This will deliver a `SIGSTOP`.
///
/// **Warning:** the target may not be considered stopped until its attach-stop has been
/// seen via [`wait_for_attach_stop()`].
pub fn attach(pid: Pid) -> Result<()> {
    info!(pid = pid.as_raw(), "attaching");
    ptrace::attach(pid).for_tracee(pid)
}

/// Attach to a running process and block until it reports its attach-stop.
pub fn attach_and_wait(pid: Pid) -> Result<()> {
    attach(pid)?;
    wait_for_attach_stop(pid)
}

/// Block until `pid`, newly attached or adopted, reports the `SIGSTOP` of its attach-stop.
///
/// Signals that reach the target first are suppressed and requeued, so they are delivered
/// once the target runs again. The exception is `SIGTRAP`, which the kernel raises on its
/// own when a newly traced process completes an `execve()`, and which would kill the target
/// if requeued.
///
/// Fails with [`Error::NoSuchProcess`] if the process terminates instead.
pub fn wait_for_attach_stop(pid: Pid) -> Result<()> {
    let mut deferred = vec![];

    loop {
        match wait_for_stop(pid)? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => break,
            WaitStatus::Stopped(_, signal) => {
                debug!(pid = pid.as_raw(), ?signal, "signal before attach-stop");

                if signal != Signal::SIGTRAP {
                    deferred.push(signal);
                }
            },
            status => {
                debug!(pid = pid.as_raw(), ?status, "stop before attach-stop");
            },
        }

        ptrace::cont(pid, None).for_tracee(pid)?;
    }

    for signal in deferred {
        kill(pid, signal).for_tracee(pid)?;
    }

    Ok(())
}

/// Block until `pid` reports a ptrace-stop of any kind, and return its wait status.
///
/// Fails with [`Error::NoSuchProcess`] if the process terminates instead.
pub fn wait_for_stop(pid: Pid) -> Result<WaitStatus> {
    loop {
        match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(status @ WaitStatus::Stopped(..)) |
            Ok(status @ WaitStatus::PtraceEvent(..)) |
            Ok(status @ WaitStatus::PtraceSyscall(..)) => {
                return Ok(status);
            },
            Ok(status @ WaitStatus::Exited(..)) |
            Ok(status @ WaitStatus::Signaled(..)) => {
                debug!(?status, "target terminated before stopping");
                return Err(Error::NoSuchProcess { pid, source: Errno::ESRCH });
            },
            Ok(status) => {
                debug!(?status, "ignoring non-stop wait status");
            },
            Err(Errno::EINTR) => {},
            Err(errno) => {
                return Err(Error::from_errno(pid, errno));
            },
        }
    }
}

/// Stop tracing `pid` and let it run freely. The target must be in a ptrace-stop.
pub fn detach(pid: Pid) -> Result<()> {
    info!(pid = pid.as_raw(), "detaching");
    ptrace::detach(pid, None).for_tracee(pid)
}

/// Set the ptrace options of a stopped tracee.
pub fn set_options(pid: Pid, options: Options) -> Result<()> {
    debug!(pid = pid.as_raw(), ?options, "setting options");
    ptrace::setoptions(pid, options).for_tracee(pid)
}

/// Resume a stopped tracee until its next syscall-stop, delivering `signal` if given.
///
/// Does not wait for the tracee to stop again.
pub fn continue_to_next_syscall(pid: Pid, signal: impl Into<Option<Signal>>) -> Result<()> {
    let signal = signal.into();
    debug!(pid = pid.as_raw(), ?signal, "continuing to next syscall");
    ptrace::syscall(pid, signal).for_tracee(pid)
}

/// Read the message attached to the last ptrace-event-stop of `pid`.
pub fn read_event_message(pid: Pid) -> Result<u64> {
    let msg = ptrace::getevent(pid).for_tracee(pid)?;

    // The kernel stores an `unsigned long`; undo the sign of nix's `c_long`.
    Ok(msg as libc::c_ulong as u64)
}

/// Read one word of the tracee's memory at `addr`.
pub fn read_data(pid: Pid, addr: u64) -> Result<u64> {
    let word = ptrace::read(pid, addr as usize as ptrace::AddressType).for_tracee(pid)?;
    Ok(word as libc::c_ulong as u64)
}

/// Read a `width_bits`-wide value at byte `offset` of the tracee's register image.
///
/// Returns [`REGISTER_READ_FAILED`] on any failure, including invalid arguments, which are
/// rejected without issuing a ptrace request. Callers that need to tell failures apart
/// should use [`regs::read()`](crate::regs::read) instead.
pub fn read_register(pid: Pid, offset: usize, width_bits: u32) -> i64 {
    let value = RegisterDescriptor::new(offset, width_bits)
        .and_then(|desc| regs::read(pid, desc));

    match value {
        Ok(value) => value as i64,
        Err(err) => {
            debug!(pid = pid.as_raw(), offset, width_bits, %err, "register read failed");
            REGISTER_READ_FAILED
        },
    }
}

/// Read the seccomp filter at `index` in the filter chain of the stopped tracee `pid`.
pub fn read_seccomp_filter(pid: Pid, index: usize) -> Result<SeccompProgram> {
    filter::read(pid, index)
}
