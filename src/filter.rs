//! Retrieval of installed seccomp BPF programs via `PTRACE_SECCOMP_GET_FILTER`.
//!
//! The kernel does not report a program's length up front, so each read is two requests:
//! one with no buffer, which returns the instruction count, and one with a buffer of
//! exactly that many instructions.
//!
//! Filters are indexed in the order they were installed: index 0 is the first filter the
//! process (or an ancestor) installed, and the highest valid index is the most recent.

use std::ptr;

use nix::errno::Errno;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::Pid;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Request = libc::c_uint;

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Request = libc::c_int;

/// Linux constant defined in `include/uapi/linux/ptrace.h`.
const PTRACE_SECCOMP_GET_FILTER: Request = 0x420c;

/// A classic BPF instruction, laid out exactly as `struct sock_filter`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Instruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl Instruction {
    /// Size of one instruction in the kernel's representation.
    pub const SIZE: usize = 8;

    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }

    /// Raw bytes of the instruction, in native byte order.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.code.to_ne_bytes());
        bytes[2] = self.jt;
        bytes[3] = self.jf;
        bytes[4..8].copy_from_slice(&self.k.to_ne_bytes());
        bytes
    }
}

/// An installed seccomp filter, as read from the kernel.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SeccompProgram {
    index: usize,
    instructions: Vec<Instruction>,
}

impl SeccompProgram {
    /// Position of this filter in the process's filter chain.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// The program as raw bytes, the format consumed by BPF disassemblers.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.instructions
            .iter()
            .flat_map(|insn| insn.to_bytes())
            .collect()
    }

    pub fn into_instructions(self) -> Vec<Instruction> {
        self.instructions
    }
}

impl AsRef<[Instruction]> for SeccompProgram {
    fn as_ref(&self) -> &[Instruction] {
        &self.instructions
    }
}

/// Read the seccomp filter at `index` from the stopped tracee `pid`.
///
/// Fails with [`Error::NoSuchFilter`] if there is no filter at `index`, including when the
/// process has no filters at all. Reading filters requires `CAP_SYS_ADMIN`, and that the
/// caller is not itself running under seccomp; otherwise the kernel refuses with
/// [`Error::PermissionOrOwnership`].
pub fn read(pid: Pid, index: usize) -> Result<SeccompProgram> {
    read_with(pid, index, |buf| get_filter(pid, index, buf))
}

// Two-phase read over `fetch`, which has the contract of `get_filter()` for a fixed index.
fn read_with<F>(pid: Pid, index: usize, mut fetch: F) -> Result<SeccompProgram>
where
    F: FnMut(Option<&mut [Instruction]>) -> Result<usize>,
{
    let count = fetch(None)?;
    trace!(pid = pid.as_raw(), index, count, "queried seccomp filter length");

    let mut instructions = vec![Instruction::default(); count];
    let written = fetch(Some(&mut instructions))?;

    if written != count {
        return Err(Error::KernelTransferMismatch {
            pid,
            what: "seccomp filter instructions",
            expected: count,
            actual: written,
        });
    }

    debug!(pid = pid.as_raw(), index, len = count, "read seccomp filter");

    Ok(SeccompProgram { index, instructions })
}

/// Read consecutive filters starting at index 0, until there are no more or `limit`
/// filters have been read.
pub fn read_all(pid: Pid, limit: impl Into<Option<usize>>) -> Result<Vec<SeccompProgram>> {
    let limit = limit.into();
    let mut programs = vec![];

    for index in 0.. {
        if Some(index) == limit {
            break;
        }

        match read(pid, index) {
            Ok(program) => programs.push(program),
            Err(Error::NoSuchFilter { .. }) => break,
            Err(err) => return Err(err),
        }
    }

    Ok(programs)
}

// Issue one `PTRACE_SECCOMP_GET_FILTER` request. With no buffer, the kernel returns the
// length of the filter at `index`. With a buffer, it copies the filter in and returns the
// number of instructions copied.
fn get_filter(pid: Pid, index: usize, buf: Option<&mut [Instruction]>) -> Result<usize> {
    let data = match buf {
        Some(buf) => buf.as_mut_ptr() as *mut libc::c_void,
        None => ptr::null_mut(),
    };

    // SAFETY: with a null `data`, the kernel writes nothing. Otherwise, `data` points to a
    // buffer sized by a preceding length query for the same `index`. Installed filters are
    // immutable, and the tracee is held in ptrace-stop, so the kernel writes that many
    // `struct sock_filter` records, which `Instruction` is layout-compatible with.
    let res = unsafe {
        libc::ptrace(
            PTRACE_SECCOMP_GET_FILTER,
            pid.as_raw(),
            index as *mut libc::c_void,
            data,
        )
    };

    match Errno::result(res) {
        Ok(count) => Ok(count as usize),
        Err(source @ (Errno::ENOENT | Errno::EINVAL)) => {
            Err(Error::NoSuchFilter { pid, index, source })
        },
        Err(errno) => Err(Error::from_errno(pid, errno)),
    }
}
