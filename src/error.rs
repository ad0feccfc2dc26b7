use std::io;

use nix::errno::Errno;

use crate::session::State;
use crate::Pid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Not permitted to trace process = {pid}")]
    PermissionOrOwnership {
        pid: Pid,
        source: Errno,
    },

    #[error("No such process = {pid}")]
    NoSuchProcess {
        pid: Pid,
        source: Errno,
    },

    #[error("No seccomp filter at index = {index} for process = {pid}")]
    NoSuchFilter {
        pid: Pid,
        index: usize,
        source: Errno,
    },

    #[error("Cannot {op} process = {pid} in state {state:?}")]
    ProtocolMisuse {
        pid: Pid,
        state: State,
        op: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported ELF machine = {:02x}{:02x} for process = {pid}", .machine[0], .machine[1])]
    UnsupportedArch {
        pid: Pid,
        machine: [u8; 2],
    },

    #[error("Kernel transferred {actual} {what} for process = {pid}, expected {expected}")]
    KernelTransferMismatch {
        pid: Pid,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify an `errno` returned by a ptrace request against `pid`.
    pub fn from_errno(pid: Pid, source: Errno) -> Self {
        match source {
            Errno::EPERM | Errno::EACCES =>
                Error::PermissionOrOwnership { pid, source },
            Errno::ESRCH | Errno::ECHILD =>
                Error::NoSuchProcess { pid, source },
            _ =>
                Error::OS(source),
        }
    }

    /// True if the error means the target process no longer exists, or is no
    /// longer in a ptrace-stop that we own.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::NoSuchProcess { .. })
    }

    /// The underlying `errno`, if the error came from the kernel.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::PermissionOrOwnership { source, .. } |
            Error::NoSuchProcess { source, .. } |
            Error::NoSuchFilter { source, .. } |
            Error::OS(source) => Some(*source),
            Error::IO(err) => err.raw_os_error().map(Errno::from_i32),
            _ => None,
        }
    }
}

pub(crate) trait ResultExt<T> {
    fn for_tracee(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn for_tracee(self, pid: Pid) -> Result<T> {
        self.map_err(|errno| Error::from_errno(pid, errno))
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}
