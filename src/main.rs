//! One PE of the distributed matrix multiplication benchmark.
//!
//! Run directly for a single PE, or through `distmm_run` to launch a group:
//!
//! ```bash
//! distmm --dim 1024 --chunk-sizes 64,128 --verify
//! distmm_run -N 4 -- --dim 2048
//! ```
//!
//! The coordinator's report is the only thing written to stdout, diagnostics go to
//! stderr and are filtered with `RUST_LOG` (default `warn`).

use anyhow::{Context, Result};
use clap::Parser;
use distmm::{BenchmarkDriver, ProcessGroupBuilder, StdoutReporter, SweepConfiguration};
use std::process::ExitCode;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "distmm")]
#[command(about = "One PE of the distributed matrix multiplication benchmark")]
#[command(version)]
struct Args {
    /// Dimension of both square operands, overrides DISTMM_MATRIX_DIM
    #[arg(long)]
    dim: Option<usize>,

    /// Comma separated rows per PE to test in order, overrides DISTMM_CHUNK_SIZES
    #[arg(long, value_delimiter = ',')]
    chunk_sizes: Option<Vec<usize>>,

    /// Seed for the random operands, overrides DISTMM_SEED
    #[arg(long)]
    seed: Option<u64>,

    /// Check every gathered result against a reference product
    #[arg(long)]
    verify: bool,
}

impl Args {
    fn sweep(self) -> SweepConfiguration {
        let mut sweep = SweepConfiguration::from_config();
        if let Some(dim) = self.dim {
            sweep.dim = dim;
        }
        if let Some(chunk_sizes) = self.chunk_sizes {
            sweep.chunk_sizes = chunk_sizes;
        }
        if let Some(seed) = self.seed {
            sweep.seed = Some(seed);
        }
        sweep.verify |= self.verify;
        sweep
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args) -> Result<()> {
    let sweep = args.sweep();
    let group = ProcessGroupBuilder::new()
        .build()
        .context("unable to join the process group")?;
    let mut reporter = StdoutReporter::stdout();
    let report = BenchmarkDriver::new(&group, sweep)
        .run(&mut reporter)
        .with_context(|| format!("benchmark aborted on pe {}", group.rank()))?;
    debug!(
        "[{:?}] {} chunk sizes run, {} skipped, {:.3} MB sent",
        group.rank(),
        report.completed().count(),
        report.skipped().count(),
        group.MB_sent()
    );
    group
        .finalize()
        .context("unable to leave the process group")?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
