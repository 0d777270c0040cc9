//! Launches a group of PEs on the local host.
//!
//! ```bash
//! distmm_run -N 4                          # four PEs of the sibling distmm binary
//! distmm_run -N 2 --timeout 600 -- --dim 1024 --chunk-sizes 128,256
//! distmm_run -N 2 --program ./my_bench -- --flag
//! ```
//!
//! Exits with the status of the first PE to fail, or 124 when the timeout expires.

use anyhow::{Context, Result};
use clap::Parser;
use distmm::{LaunchOutcome, Launcher};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "distmm_run")]
#[command(about = "Launch N PEs of a distmm program on the local host")]
#[command(version)]
struct Args {
    /// Number of PEs to launch
    #[arg(short = 'N', long = "num-pes", default_value_t = 1)]
    num_pes: usize,

    /// Base TCP port, PE i listens on port + i [default: DISTMM_PORT or 17000]
    #[arg(long)]
    port: Option<u16>,

    /// Kill the whole group after this many seconds
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<f64>,

    /// Program to launch [default: the distmm binary next to this one]
    #[arg(long)]
    program: Option<PathBuf>,

    /// Arguments passed to every PE
    #[arg(last = true)]
    args: Vec<OsString>,
}

fn default_program() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("unable to locate distmm_run")?;
    Ok(exe.with_file_name(format!("distmm{}", std::env::consts::EXE_SUFFIX)))
}

fn run(args: Args) -> Result<LaunchOutcome> {
    let program = match args.program {
        Some(program) => program,
        None => default_program()?,
    };
    let timeout = match args.timeout {
        Some(secs) => Some(
            Duration::try_from_secs_f64(secs)
                .with_context(|| format!("invalid timeout: {}", secs))?,
        ),
        None => None,
    };
    let mut launcher = Launcher::new(program, args.num_pes)
        .args(args.args)
        .timeout(timeout);
    if let Some(port) = args.port {
        launcher = launcher.port(port);
    }
    Ok(launcher.run()?)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    match run(args) {
        Ok(LaunchOutcome::Success) => ExitCode::SUCCESS,
        Ok(outcome) => ExitCode::from(
            u8::try_from(outcome.exit_code())
                .ok()
                .filter(|code| *code != 0)
                .unwrap_or(1),
        ),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
