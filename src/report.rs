//! Text rendering of a sweep on the coordinator's stdout.
//!
//! Downstream tooling scrapes these lines: every completed chunk produces
//! `Scatter Latency`, `Compute Time` and `Gather Latency` followed by a colon and the
//! duration in seconds with six decimals, preceded by a line naming the chunk size.

use crate::driver::{PhaseTiming, SweepConfiguration, SweepObserver, SweepReport};
use crate::error::ConfigurationError;

use std::io::{self, Write};
use std::time::Duration;

const RULE: &str = "-----------------------------------------------";

/// A [SweepObserver] printing each phase as soon as it completes, flushing after every event
pub struct StdoutReporter<W: Write> {
    out: W,
}

impl StdoutReporter<io::Stdout> {
    pub fn stdout() -> StdoutReporter<io::Stdout> {
        StdoutReporter { out: io::stdout() }
    }
}

impl<W: Write> StdoutReporter<W> {
    pub fn new(out: W) -> StdoutReporter<W> {
        StdoutReporter { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> SweepObserver for StdoutReporter<W> {
    fn on_start(&mut self, num_pes: usize, sweep: &SweepConfiguration) -> io::Result<()> {
        writeln!(self.out, "=== Parallel Matrix Multiplication ===")?;
        writeln!(self.out, "Number of processes: {}", num_pes)?;
        writeln!(self.out, "Matrix size: {} x {}", sweep.dim, sweep.dim)?;
        writeln!(self.out, "{}", RULE)?;
        self.out.flush()
    }

    fn on_broadcast(&mut self, latency: Duration) -> io::Result<()> {
        writeln!(
            self.out,
            "Broadcast Latency (B): {:.6} seconds",
            latency.as_secs_f64()
        )?;
        self.out.flush()
    }

    fn on_chunk_start(&mut self, chunk: usize) -> io::Result<()> {
        writeln!(self.out)?;
        writeln!(self.out, ">>> Testing chunk size: {} rows per process", chunk)?;
        self.out.flush()
    }

    fn on_chunk_skipped(&mut self, _chunk: usize, reason: &ConfigurationError) -> io::Result<()> {
        writeln!(self.out, "Chunk too large for the number of processes: {}", reason)?;
        self.out.flush()
    }

    fn on_chunk_complete(
        &mut self,
        chunk: usize,
        timing: &PhaseTiming,
        max_abs_error: Option<f64>,
    ) -> io::Result<()> {
        writeln!(self.out, "Chunk {} done.", chunk)?;
        writeln!(self.out, "  Scatter Latency   : {:.6} seconds", timing.scatter_secs())?;
        writeln!(self.out, "  Compute Time      : {:.6} seconds", timing.compute_secs())?;
        writeln!(self.out, "  Gather Latency    : {:.6} seconds", timing.gather_secs())?;
        if let Some(err) = max_abs_error {
            writeln!(self.out, "  Max Abs Error     : {:e}", err)?;
        }
        self.out.flush()
    }

    fn on_finish(&mut self, report: &SweepReport) -> io::Result<()> {
        writeln!(self.out)?;
        writeln!(self.out, "{}", RULE)?;
        writeln!(
            self.out,
            "Sweep complete: {} of {} chunk sizes run",
            report.completed().count(),
            report.chunks.len()
        )?;
        self.out.flush()
    }
}
