#![allow(unused)]

use std::os::unix::io::RawFd;
use std::process::{Child, Command};

use anyhow::{bail, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{close, fork, pipe, read, ForkResult};
use secpeek::{raw, Error, Instruction, Pid, TraceSession};

/// `ld [0]`: load the syscall number.
pub const LD_NR: Instruction = Instruction::new(0x20, 0, 0, 0);

/// `ret ALLOW`
pub const RET_ALLOW: Instruction = Instruction::new(0x06, 0, 0, 0x7fff_0000);

pub const ALLOW_ALL_LONG: &[Instruction] = &[LD_NR, RET_ALLOW];
pub const ALLOW_ALL_SHORT: &[Instruction] = &[RET_ALLOW];

const SECCOMP_MODE_FILTER: libc::c_ulong = 2;

// Layout of `struct sock_fprog`.
#[repr(C)]
struct Fprog {
    len: libc::c_ushort,
    filter: *const Instruction,
}

/// How a fixture child makes itself available to the test.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Handoff {
    /// Call `traceme_and_stop()`: the test process is its tracer.
    TracemeAndStop,

    /// Signal readiness over a pipe and keep running untraced.
    Ready,
}

/// Fork a child that installs `filters` in order, hands itself off, then pauses forever.
pub fn fork_fixture(filters: &[&[Instruction]], handoff: Handoff) -> Result<Pid> {
    let (ready_r, ready_w) = pipe()?;

    // SAFETY: the child only makes async-signal-safe calls and never returns.
    match unsafe { fork()? } {
        ForkResult::Child => unsafe {
            fixture_main(filters, handoff, ready_w)
        },
        ForkResult::Parent { child } => {
            close(ready_w)?;

            if handoff == Handoff::Ready {
                let mut byte = [0u8; 1];
                let n = read(ready_r, &mut byte)?;
                if n != 1 {
                    close(ready_r)?;
                    bail!("fixture {} exited before becoming ready", child);
                }
            }

            close(ready_r)?;

            Ok(child)
        },
    }
}

unsafe fn fixture_main(filters: &[&[Instruction]], handoff: Handoff, ready_w: RawFd) -> ! {
    if !filters.is_empty() {
        let no_new_privs = libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong);
        if no_new_privs != 0 {
            libc::_exit(101);
        }

        for filter in filters {
            let prog = Fprog {
                len: filter.len() as libc::c_ushort,
                filter: filter.as_ptr(),
            };

            let res = libc::prctl(libc::PR_SET_SECCOMP, SECCOMP_MODE_FILTER, &prog as *const Fprog);
            if res != 0 {
                libc::_exit(102);
            }
        }
    }

    match handoff {
        Handoff::TracemeAndStop => {
            if raw::traceme_and_stop().is_err() {
                libc::_exit(103);
            }
        },
        Handoff::Ready => {
            let byte = [1u8];
            libc::write(ready_w, byte.as_ptr() as *const libc::c_void, 1);
        },
    }

    loop {
        libc::getppid();
        libc::pause();
    }
}

/// Spawn an untraced `sleep` for `secs` seconds.
pub fn spawn_sleep(secs: &str) -> Result<Child> {
    Ok(Command::new("sleep").arg(secs).spawn()?)
}

pub fn child_pid(child: &Child) -> Pid {
    Pid::from_raw(child.id() as i32)
}

/// Kill a fixture and reap it, whether or not it is still traced.
pub fn kill_and_reap(pid: Pid) -> Result<()> {
    kill(pid, Signal::SIGKILL)?;
    waitpid(pid, None)?;
    Ok(())
}

/// Kill the tracee of `session` and reap it.
///
/// The session is dropped after the kill, so its detach attempt cannot release the tracee.
pub fn kill_session(session: TraceSession) -> Result<()> {
    let pid = session.pid();

    kill(pid, Signal::SIGKILL)?;
    drop(session);
    waitpid(pid, Some(WaitPidFlag::__WALL))?;

    Ok(())
}

/// True if the kernel refused this test process access to seccomp filters, e.g. because
/// it lacks `CAP_SYS_ADMIN`, runs under seccomp itself, or the kernel lacks
/// `PTRACE_SECCOMP_GET_FILTER`.
pub fn filter_access_denied(err: &Error) -> bool {
    matches!(err, Error::PermissionOrOwnership { .. }) || err.errno() == Some(Errno::EIO)
}

/// Return early from a test if seccomp filters are not readable by this process.
macro_rules! skip_if_denied {
    ($res: expr, $pid: expr) => {
        match $res {
            Err(err) if support::filter_access_denied(&err) => {
                eprintln!("skipping: seccomp filters not readable: {err}");
                support::kill_and_reap($pid)?;
                return Ok(());
            },
            res => res,
        }
    };
}
