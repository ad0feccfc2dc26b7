use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::error::{Error, Result};
use crate::regs::Width;
use crate::Pid;

/// Offset of `e_machine` in an ELF header.
const E_MACHINE_OFFSET: u64 = 18;

/// Architectures whose register layouts callers are known to address.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Arch {
    I386,
    Amd64,
    Aarch64,
    S390x,
}

impl Arch {
    /// Identify an architecture from the raw `e_machine` bytes of an ELF header.
    ///
    /// The bytes are in the file's own byte order, so big-endian targets read differently.
    pub fn from_machine(e_machine: [u8; 2]) -> Option<Self> {
        match e_machine {
            [0x03, 0x00] => Some(Arch::I386),
            [0x3e, 0x00] => Some(Arch::Amd64),
            [0xb7, 0x00] => Some(Arch::Aarch64),
            [0x00, 0x16] => Some(Arch::S390x),
            _ => None,
        }
    }

    /// Architecture of the executable image of `pid`.
    pub fn of_process(pid: Pid) -> Result<Self> {
        let exe = File::open(format!("/proc/{}/exe", pid.as_raw()))?;

        let mut e_machine = [0u8; 2];
        exe.read_exact_at(&mut e_machine, E_MACHINE_OFFSET)?;

        Self::identify(pid, e_machine)
    }

    fn identify(pid: Pid, e_machine: [u8; 2]) -> Result<Self> {
        Self::from_machine(e_machine).ok_or(Error::UnsupportedArch { pid, machine: e_machine })
    }

    /// Native register width.
    pub fn word_width(self) -> Width {
        match self {
            Arch::I386 => Width::W32,
            Arch::Amd64 | Arch::Aarch64 | Arch::S390x => Width::W64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_machine() {
        assert_eq!(Arch::from_machine([0x03, 0x00]), Some(Arch::I386));
        assert_eq!(Arch::from_machine([0x3e, 0x00]), Some(Arch::Amd64));
        assert_eq!(Arch::from_machine([0xb7, 0x00]), Some(Arch::Aarch64));
        assert_eq!(Arch::from_machine([0x00, 0x16]), Some(Arch::S390x));
        assert_eq!(Arch::from_machine([0x16, 0x00]), None);
    }

    #[test]
    fn test_unknown_machine_is_unsupported() {
        let pid = Pid::from_raw(1234);

        let err = Arch::identify(pid, [0xf3, 0x00]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedArch { machine: [0xf3, 0x00], .. }));
        assert_eq!(err.to_string(), "Unsupported ELF machine = f300 for process = 1234");

        assert_eq!(Arch::identify(pid, [0x3e, 0x00]).unwrap(), Arch::Amd64);
    }

    #[test]
    fn test_word_width() {
        assert_eq!(Arch::I386.word_width(), Width::W32);
        assert_eq!(Arch::Amd64.word_width(), Width::W64);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_own_arch() {
        let pid = nix::unistd::getpid();
        assert_eq!(Arch::of_process(pid).unwrap(), Arch::Amd64);
    }
}
