use tracing::info;

use crate::error::Result;
use crate::filter::SeccompProgram;
use crate::session::TraceSession;
use crate::Pid;

/// Dump the seccomp filters installed in a running process, in installation order.
///
/// Attaches to `pid`, reads up to `limit` filters (all of them if `None`), and detaches
/// again, whether or not the reads succeeded. A process without filters yields an empty
/// list.
pub fn dump_filters(pid: Pid, limit: impl Into<Option<usize>>) -> Result<Vec<SeccompProgram>> {
    let session = TraceSession::attach_and_wait(pid)?;

    let programs = session.seccomp_filters(limit);
    let detached = session.detach();

    let programs = programs?;
    detached?;

    info!(pid = pid.as_raw(), count = programs.len(), "dumped seccomp filters");

    Ok(programs)
}
