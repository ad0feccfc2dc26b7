//! Reading words out of a stopped tracee's general-purpose register image.
//!
//! Every read goes through `PTRACE_GETREGSET` with `NT_PRSTATUS`, which all Linux
//! architectures support, including those without `PTRACE_PEEKUSER`. Only the prefix of
//! the register image that covers the requested word is transferred.

use std::convert::TryFrom;
use std::mem;

use nix::errno::Errno;
use tracing::trace;

use crate::error::{Error, Result, ResultExt};
use crate::Pid;

/// Upper bound on the size of any register image we will address.
///
/// Not the size of any real architecture's image: reads past the real end fail with
/// [`Error::KernelTransferMismatch`].
pub const REGISTER_IMAGE_CEILING: usize = 4096;

/// Linux constant defined in `include/uapi/linux/elf.h`.
const NT_PRSTATUS: usize = 0x1;

/// The kernel only accepts regset transfers that are a multiple of the register size.
const REGISTER_WORD: usize = mem::size_of::<libc::c_ulong>();

/// Width of a register read.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Width {
    W32,
    W64,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }
}

impl TryFrom<u32> for Width {
    type Error = Error;

    fn try_from(bits: u32) -> Result<Self> {
        match bits {
            32 => Ok(Width::W32),
            64 => Ok(Width::W64),
            _ => Err(Error::InvalidArgument(format!("register width = {bits}, expected 32 or 64"))),
        }
    }
}

/// Location of a value in the register image: a byte offset and a width.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RegisterDescriptor {
    offset: usize,
    width: Width,
}

impl RegisterDescriptor {
    /// Describe a `width_bits`-wide value at byte `offset`.
    ///
    /// Fails with [`Error::InvalidArgument`] if the width is not 32 or 64, or if the value
    /// would extend past [`REGISTER_IMAGE_CEILING`].
    pub fn new(offset: usize, width_bits: u32) -> Result<Self> {
        let width = Width::try_from(width_bits)?;
        Self::with_width(offset, width)
    }

    pub fn with_width(offset: usize, width: Width) -> Result<Self> {
        let end = offset.checked_add(width.bytes());

        match end {
            Some(end) if end <= REGISTER_IMAGE_CEILING => Ok(Self { offset, width }),
            _ => Err(Error::InvalidArgument(format!(
                "register offset = {offset} with width = {} exceeds {REGISTER_IMAGE_CEILING} bytes",
                width.bits(),
            ))),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn width(&self) -> Width {
        self.width
    }

    /// Byte offset just past the described value.
    pub fn end(&self) -> usize {
        self.offset + self.width.bytes()
    }

    // Length of the register image prefix to request. Never more than the ceiling, since
    // the ceiling is itself a multiple of the word size.
    fn transfer_len(&self) -> usize {
        let end = self.end();
        (end + REGISTER_WORD - 1) / REGISTER_WORD * REGISTER_WORD
    }

    // Decode the described value from a register image prefix, in native byte order.
    fn decode(&self, image: &[u8]) -> Result<u64> {
        let bytes = match image.get(self.offset..self.end()) {
            Some(bytes) => bytes,
            None => internal_error!("register image shorter than descriptor"),
        };

        let value = match self.width {
            Width::W32 => {
                let word = <[u8; 4]>::try_from(bytes)
                    .map_err(|_| Error::Internal("bad 32-bit register slice".into()))?;
                u64::from(u32::from_ne_bytes(word))
            },
            Width::W64 => {
                let word = <[u8; 8]>::try_from(bytes)
                    .map_err(|_| Error::Internal("bad 64-bit register slice".into()))?;
                u64::from_ne_bytes(word)
            },
        };

        Ok(value)
    }
}

/// Read the value described by `desc` from the register image of the stopped tracee `pid`.
///
/// 32-bit values are zero-extended.
pub fn read(pid: Pid, desc: RegisterDescriptor) -> Result<u64> {
    let mut image = vec![0u8; desc.transfer_len()];
    let copied = get_regset_prefix(pid, &mut image)?;

    trace!(pid = pid.as_raw(), requested = image.len(), copied, "read register image prefix");

    if copied < desc.end() {
        return Err(Error::KernelTransferMismatch {
            pid,
            what: "register image bytes",
            expected: desc.end(),
            actual: copied,
        });
    }

    desc.decode(&image)
}

// Copy up to `buf.len()` bytes of the `NT_PRSTATUS` register set into `buf`, returning the
// number of bytes the kernel actually wrote.
fn get_regset_prefix(pid: Pid, buf: &mut [u8]) -> Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    // SAFETY: the kernel writes at most `iov.iov_len` bytes to `iov.iov_base`, which points
    // to `buf`, exclusively borrowed for the duration of the call. It then stores the number
    // of bytes written back into `iov.iov_len`.
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            NT_PRSTATUS as *mut libc::c_void,
            &mut iov as *mut libc::iovec as *mut libc::c_void,
        )
    };

    Errno::result(res).for_tracee(pid)?;

    Ok(iov.iov_len)
}
