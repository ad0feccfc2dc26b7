use std::io::{self, Write};

use secpeek::Pid;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[derive(StructOpt)]
#[structopt(about = "Dump the seccomp filters installed in a running process")]
struct Opt {
    /// Process to attach to.
    #[structopt(short, long)]
    pid: i32,

    /// Maximum number of filters to dump. Dumps all if unset.
    #[structopt(short, long)]
    limit: Option<usize>,

    /// Write raw filter bytes to stdout instead of a listing.
    #[structopt(long)]
    raw: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let opt = Opt::from_args();
    let pid = Pid::from_raw(opt.pid);

    let programs = secpeek::dump_filters(pid, opt.limit)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    for program in &programs {
        if opt.raw {
            out.write_all(&program.to_bytes())?;
            continue;
        }

        writeln!(out, "filter {} ({} instructions)", program.index(), program.len())?;

        for (line, insn) in program.instructions().iter().enumerate() {
            writeln!(
                out,
                " {:04}: 0x{:02x} 0x{:02x} 0x{:02x} 0x{:08x}",
                line, insn.code, insn.jt, insn.jf, insn.k,
            )?;
        }
    }

    Ok(())
}
