//! Tracing lifecycle of a single process: attach, wait, continue, detach.

use std::marker::PhantomData;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        wait::{self, WaitPidFlag, WaitStatus},
    },
};
use tracing::{debug, warn};

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::filter::{self, SeccompProgram};
use crate::raw;
use crate::regs::{self, RegisterDescriptor};
use crate::{Options, Pid, Signal};

/// Options for tracing a process and its descendants: distinct syscall stops, and
/// auto-attach to children from `clone()`, `fork()`, and `vfork()`.
pub const DEFAULT_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACESYSGOOD)
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK);

/// Lifecycle state of a [`TraceSession`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    // Not traced by us: never attached, or detached.
    Detached,

    // Attached or adopted, expecting an attach-stop that has not been waited on.
    Attaching,

    // In a ptrace-stop. The only state that accepts ptrace requests.
    Stopped,

    // Restarted, pending a `wait()`.
    Continuing,

    // Terminated while traced.
    Exited,
}

/// Kind of ptrace-event-stop, as enabled by [`Options`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    Fork,
    Vfork,
    Clone,
    Exec,
    VforkDone,
    Exit,
    Seccomp,
    Stop,
}

impl Event {
    fn from_raw(code: libc::c_int) -> Option<Self> {
        let event = match code {
            libc::PTRACE_EVENT_FORK => Event::Fork,
            libc::PTRACE_EVENT_VFORK => Event::Vfork,
            libc::PTRACE_EVENT_CLONE => Event::Clone,
            libc::PTRACE_EVENT_EXEC => Event::Exec,
            libc::PTRACE_EVENT_VFORK_DONE => Event::VforkDone,
            libc::PTRACE_EVENT_EXIT => Event::Exit,
            libc::PTRACE_EVENT_SECCOMP => Event::Seccomp,
            libc::PTRACE_EVENT_STOP => Event::Stop,
            _ => return None,
        };

        Some(event)
    }
}

/// What the tracee reported when it last changed state.
///
/// All variants but `Exited` and `Signaled` leave the session [`Stopped`](State::Stopped).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stop {
    // The `SIGSTOP` that follows `PTRACE_ATTACH` or `traceme_and_stop()`.
    Attach,

    // signal-delivery-stop
    SignalDelivery { signal: Signal },

    // group-stop
    Group { signal: Signal },

    // syscall-stops, reported as such only with `PTRACE_O_TRACESYSGOOD`
    SyscallEnter,
    SyscallExit,

    // ptrace-event-stop. Use `read_event_message()` for its payload.
    Event { event: Event },

    // Terminal.
    Exited { exit_code: i32 },
    Signaled { signal: Signal, core_dumped: bool },
}

impl Stop {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stop::Exited { .. } | Stop::Signaled { .. })
    }
}

/// Tracing session for one process.
///
/// Ptrace requests are only honored from the thread that became the tracer, so a session
/// is neither `Send` nor `Sync`.
///
/// A session dropped while [`Stopped`](State::Stopped) detaches from its tracee. One dropped
/// while [`Attaching`](State::Attaching) first blocks for the attach-stop, then detaches.
#[derive(Debug)]
pub struct TraceSession {
    pid: Pid,
    state: State,
    options: Option<Options>,
    last_stop: Option<Stop>,

    // Between a syscall-enter-stop and its syscall-exit-stop.
    in_syscall: bool,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl TraceSession {
    fn new(pid: Pid, state: State) -> Self {
        debug!(pid = pid.as_raw(), ?state, "new trace session");

        Self {
            pid,
            state,
            options: None,
            last_stop: None,
            in_syscall: false,
            _not_send: PhantomData,
        }
    }

    /// Attach to a running process.
    ///
    /// **Warning:** the session is [`Attaching`](State::Attaching) until the attach-stop has
    /// been seen via [`wait()`](Self::wait).
    pub fn attach(pid: Pid) -> Result<Self> {
        raw::attach(pid)?;
        Ok(Self::new(pid, State::Attaching))
    }

    /// Attach to a running process and wait until it is stopped.
    pub fn attach_and_wait(pid: Pid) -> Result<Self> {
        let mut session = Self::attach(pid)?;
        session.wait()?;
        Ok(session)
    }

    /// Take over a child that requested tracing with [`raw::traceme_and_stop()`].
    ///
    /// No ptrace request is made: the caller is already the tracer.
    pub fn adopt(pid: Pid) -> Result<Self> {
        Ok(Self::new(pid, State::Attaching))
    }

    /// Take over a child that requested tracing, and wait until it is stopped.
    pub fn adopt_and_wait(pid: Pid) -> Result<Self> {
        let mut session = Self::adopt(pid)?;
        session.wait()?;
        Ok(session)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Options most recently set via [`set_options()`](Self::set_options), if any.
    pub fn options(&self) -> Option<Options> {
        self.options
    }

    /// The stop observed by the last [`wait()`](Self::wait), while still stopped there.
    pub fn last_stop(&self) -> Option<Stop> {
        self.last_stop
    }

    /// Signal that the tracee would receive if restarted, as of the last signal-delivery-stop.
    ///
    /// Pass this to [`continue_to_next_syscall()`](Self::continue_to_next_syscall) to
    /// deliver it, or `None` to suppress it.
    pub fn pending_signal(&self) -> Option<Signal> {
        match self.last_stop {
            Some(Stop::SignalDelivery { signal }) => Some(signal),
            _ => None,
        }
    }

    /// Block until the tracee changes state, then classify the change.
    ///
    /// While [`Attaching`](State::Attaching), this waits specifically for the attach-stop,
    /// restarting the tracee through any stops that precede it.
    pub fn wait(&mut self) -> Result<Stop> {
        match self.state {
            State::Attaching => return self.wait_for_attach_stop(),
            State::Continuing => {},
            _ => return Err(self.misuse("wait on")),
        }

        let status = loop {
            match wait::waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Continued(_)) | Ok(WaitStatus::StillAlive) => {},
                Ok(status) => break status,
                Err(Errno::EINTR) => {},
                Err(errno) => {
                    if errno == Errno::ECHILD {
                        self.state = State::Exited;
                    }
                    return Err(Error::from_errno(self.pid, errno));
                },
            }
        };

        let classified = self.classify(status);
        self.record(classified)
    }

    // Update the lifecycle state for a stop reported by `waitpid()`.
    fn record(&mut self, classified: Result<Stop>) -> Result<Stop> {
        let stop = match classified {
            Ok(stop) => stop,
            Err(err) => {
                // The tracee reported a stop we could not classify, but is still stopped.
                self.state = if err.tracee_died() { State::Exited } else { State::Stopped };
                self.last_stop = None;
                return Err(err);
            },
        };

        self.state = if stop.is_terminal() { State::Exited } else { State::Stopped };
        self.last_stop = Some(stop);

        debug!(pid = self.pid.as_raw(), ?stop, state = ?self.state, "tracee changed state");

        Ok(stop)
    }

    fn wait_for_attach_stop(&mut self) -> Result<Stop> {
        if let Err(err) = raw::wait_for_attach_stop(self.pid) {
            if err.tracee_died() {
                self.state = State::Exited;
            }
            return Err(err);
        }

        self.state = State::Stopped;
        self.last_stop = Some(Stop::Attach);

        debug!(pid = self.pid.as_raw(), "tracee reached attach-stop");

        Ok(Stop::Attach)
    }

    fn classify(&mut self, status: WaitStatus) -> Result<Stop> {
        let stop = match status {
            WaitStatus::Exited(_, exit_code) => {
                Stop::Exited { exit_code }
            },
            WaitStatus::Signaled(_, signal, core_dumped) => {
                Stop::Signaled { signal, core_dumped }
            },
            WaitStatus::Stopped(_, signal) => {
                if is_group_stop(self.pid, signal)? {
                    Stop::Group { signal }
                } else {
                    Stop::SignalDelivery { signal }
                }
            },
            WaitStatus::PtraceEvent(_, _, code) => {
                let event = match Event::from_raw(code) {
                    Some(event) => event,
                    None => internal_error!("unexpected ptrace-event-stop code"),
                };

                // Both stops occur mid-syscall. The next syscall-stop is an exit, even
                // though a seccomp-stop may not be preceded by a syscall-enter-stop.
                if let Event::Exec | Event::Seccomp = event {
                    self.in_syscall = true;
                }

                Stop::Event { event }
            },
            WaitStatus::PtraceSyscall(_) => {
                self.in_syscall = !self.in_syscall;

                if self.in_syscall {
                    Stop::SyscallEnter
                } else {
                    Stop::SyscallExit
                }
            },
            WaitStatus::Continued(_) | WaitStatus::StillAlive => {
                internal_error!("unreachable `wait()` status")
            },
        };

        Ok(stop)
    }

    /// Resume the tracee until its next syscall-stop, delivering `signal` if given.
    ///
    /// Call [`wait()`](Self::wait) to observe the next stop.
    pub fn continue_to_next_syscall(&mut self, signal: impl Into<Option<Signal>>) -> Result<()> {
        self.require_stopped("continue")?;

        raw::continue_to_next_syscall(self.pid, signal)?;

        self.state = State::Continuing;
        self.last_stop = None;

        Ok(())
    }

    /// Set which trace events the tracee reports.
    ///
    /// Set at least `PTRACE_O_TRACESYSGOOD` before relying on [`Stop::SyscallEnter`] and
    /// [`Stop::SyscallExit`]; without it, syscall-stops look like `SIGTRAP` deliveries.
    pub fn set_options(&mut self, options: Options) -> Result<()> {
        self.require_stopped("set options of")?;

        if self.options == Some(options) {
            debug!(pid = self.pid.as_raw(), ?options, "re-applying unchanged options");
        }

        raw::set_options(self.pid, options)?;
        self.options = Some(options);

        Ok(())
    }

    /// Read the payload of the current ptrace-event-stop, such as the pid of a new child.
    pub fn read_event_message(&self) -> Result<u64> {
        self.require_stopped("read event message of")?;

        if !matches!(self.last_stop, Some(Stop::Event { .. })) {
            return Err(self.misuse("read event message outside ptrace-event-stop of"));
        }

        raw::read_event_message(self.pid)
    }

    /// Read a value from the tracee's register image.
    pub fn read_register(&self, desc: RegisterDescriptor) -> Result<u64> {
        self.require_stopped("read registers of")?;
        regs::read(self.pid, desc)
    }

    /// Read the seccomp filter at `index` of the tracee's filter chain.
    pub fn seccomp_filter(&self, index: usize) -> Result<SeccompProgram> {
        self.require_stopped("read seccomp filter of")?;
        filter::read(self.pid, index)
    }

    /// Read the tracee's installed seccomp filters, in installation order, up to `limit`.
    pub fn seccomp_filters(&self, limit: impl Into<Option<usize>>) -> Result<Vec<SeccompProgram>> {
        self.require_stopped("read seccomp filters of")?;
        filter::read_all(self.pid, limit)
    }

    /// Read one word of tracee memory.
    pub fn read_data(&self, addr: u64) -> Result<u64> {
        self.require_stopped("read memory of")?;
        raw::read_data(self.pid, addr)
    }

    /// Architecture of the tracee's executable.
    pub fn arch(&self) -> Result<Arch> {
        Arch::of_process(self.pid)
    }

    /// Stop tracing and let the tracee run freely.
    pub fn detach(mut self) -> Result<()> {
        self.require_stopped("detach from")?;

        // Never retry on drop, even if the request failed.
        self.state = State::Detached;

        raw::detach(self.pid)
    }

    fn require_stopped(&self, op: &'static str) -> Result<()> {
        if self.state == State::Stopped {
            Ok(())
        } else {
            Err(self.misuse(op))
        }
    }

    fn misuse(&self, op: &'static str) -> Error {
        Error::ProtocolMisuse { pid: self.pid, state: self.state, op }
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        let pid = self.pid.as_raw();

        match self.state {
            State::Stopped => {
                if let Err(err) = raw::detach(self.pid) {
                    warn!(pid, %err, "failed to detach dropped session");
                }
            },
            State::Attaching => {
                // The attach-stop is certain to arrive unless the tracee dies first.
                let detached = raw::wait_for_attach_stop(self.pid)
                    .and_then(|_| raw::detach(self.pid));

                if let Err(err) = detached {
                    if !err.tracee_died() {
                        warn!(pid, %err, "failed to detach dropped session");
                    }
                }
            },
            State::Continuing => {
                warn!(pid, "dropped running session; tracee remains traced");
            },
            State::Detached | State::Exited => {},
        }
    }
}

// Check if a wait stop with signal delivery is a group-stop.
//
// Assumes attach-stop has already been ruled out.
fn is_group_stop(pid: Pid, sig: Signal) -> Result<bool> {
    use Signal::*;

    match sig {
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
            // Possible group-stop. From the manual:
            //
            //     If PTRACE_GETSIGINFO fails with EINVAL, then it is definitely a
            //     group-stop.  (Other failure codes are possible, such as ESRCH
            //     ("no such process") if a SIGKILL killed the tracee.)
            //
            match ptrace::getsiginfo(pid) {
                Err(Errno::EINVAL) => Ok(true),
                Err(errno) => Err(Error::from_errno(pid, errno)),
                Ok(_) => Ok(false),
            }
        },
        _ => Ok(false),
    }
}
