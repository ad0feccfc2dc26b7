//! Inspect traced Linux processes: register words and installed seccomp filters.

#[macro_use]
pub mod error;

pub mod arch;
pub mod dump;
pub mod filter;
pub mod raw;
pub mod regs;
pub mod session;

pub use arch::Arch;
pub use dump::dump_filters;
pub use error::{Error, Result};
pub use filter::{Instruction, SeccompProgram};
pub use regs::{RegisterDescriptor, Width, REGISTER_IMAGE_CEILING};
pub use session::{Event, State, Stop, TraceSession, DEFAULT_OPTIONS};

pub use nix::sys::ptrace::Options;
pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;
