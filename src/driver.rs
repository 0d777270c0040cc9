//! The benchmark sweep: broadcast the right operand once, then for every chunk size
//! scatter a prefix of the left operand, multiply locally and gather the result,
//! timing each phase between barriers.

use crate::collectives::CollectiveOps;
use crate::config;
use crate::error::{ConfigurationError, Error, Result};
use crate::kernel;
use crate::matrix::Matrix;
use crate::partition::Partition;
use crate::process_group::{ProcessGroup, COORDINATOR};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default dimension of both (square) operands
pub const DEFAULT_MATRIX_DIM: usize = 4096;
/// Default rows per PE tested by a sweep, in order
pub const DEFAULT_CHUNK_SIZES: [usize; 3] = [256, 512, 1024];

/// What a run measures, identical on every PE once the run has started
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SweepConfiguration {
    pub dim: usize,
    pub chunk_sizes: Vec<usize>,
    /// Fixed seed for the operands, `None` draws one from the OS
    pub seed: Option<u64>,
    /// Compare every gathered result against a reference product on the coordinator
    pub verify: bool,
}

impl Default for SweepConfiguration {
    fn default() -> Self {
        SweepConfiguration {
            dim: DEFAULT_MATRIX_DIM,
            chunk_sizes: DEFAULT_CHUNK_SIZES.to_vec(),
            seed: None,
            verify: false,
        }
    }
}

impl SweepConfiguration {
    pub fn new(dim: usize, chunk_sizes: Vec<usize>) -> SweepConfiguration {
        SweepConfiguration {
            dim,
            chunk_sizes,
            ..Default::default()
        }
    }

    /// The sweep described by the `DISTMM_*` environment variables
    pub fn from_config() -> SweepConfiguration {
        let config = config();
        SweepConfiguration {
            dim: config.matrix_dim,
            chunk_sizes: config.chunk_sizes.clone(),
            seed: config.seed,
            verify: config.verify,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> SweepConfiguration {
        self.seed = Some(seed);
        self
    }

    pub fn with_verify(mut self, verify: bool) -> SweepConfiguration {
        self.verify = verify;
        self
    }
}

/// Phase durations of one chunk size iteration.
///
/// The broadcast latency is measured once per run and repeated in every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseTiming {
    pub broadcast_latency: Duration,
    pub scatter_latency: Duration,
    pub compute_time: Duration,
    pub gather_latency: Duration,
}

impl PhaseTiming {
    pub fn broadcast_secs(&self) -> f64 {
        self.broadcast_latency.as_secs_f64()
    }
    pub fn scatter_secs(&self) -> f64 {
        self.scatter_latency.as_secs_f64()
    }
    pub fn compute_secs(&self) -> f64 {
        self.compute_time.as_secs_f64()
    }
    pub fn gather_secs(&self) -> f64 {
        self.gather_latency.as_secs_f64()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Completed {
        timing: PhaseTiming,
        /// The gathered `chunk * num_pes` x `dim` product, coordinator only and only when retained
        result: Option<Matrix>,
        /// Largest deviation from the reference product, coordinator only and only when verifying
        max_abs_error: Option<f64>,
    },
    /// Every PE skipped this chunk size
    Skipped(ConfigurationError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReport {
    pub chunk: usize,
    pub outcome: ChunkOutcome,
}

impl ChunkReport {
    pub fn timing(&self) -> Option<&PhaseTiming> {
        match &self.outcome {
            ChunkOutcome::Completed { timing, .. } => Some(timing),
            ChunkOutcome::Skipped(_) => None,
        }
    }

    pub fn result(&self) -> Option<&Matrix> {
        match &self.outcome {
            ChunkOutcome::Completed { result, .. } => result.as_ref(),
            ChunkOutcome::Skipped(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, ChunkOutcome::Skipped(_))
    }
}

/// Everything a PE measured during one run.
///
/// Timings are those observed locally, the coordinator's are the ones reported.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub num_pes: usize,
    pub sweep: SweepConfiguration,
    pub broadcast_latency: Duration,
    pub chunks: Vec<ChunkReport>,
}

impl SweepReport {
    pub fn completed(&self) -> impl Iterator<Item = &ChunkReport> + '_ {
        self.chunks.iter().filter(|c| !c.is_skipped())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ChunkReport> + '_ {
        self.chunks.iter().filter(|c| c.is_skipped())
    }
}

/// Receives the progress of a sweep as it happens, on the coordinator only.
///
/// Every callback fires as soon as its phase is over, so output produced before a
/// fatal error is never lost.
pub trait SweepObserver {
    fn on_start(&mut self, _num_pes: usize, _sweep: &SweepConfiguration) -> io::Result<()> {
        Ok(())
    }
    fn on_broadcast(&mut self, _latency: Duration) -> io::Result<()> {
        Ok(())
    }
    fn on_chunk_start(&mut self, _chunk: usize) -> io::Result<()> {
        Ok(())
    }
    fn on_chunk_skipped(&mut self, _chunk: usize, _reason: &ConfigurationError) -> io::Result<()> {
        Ok(())
    }
    fn on_chunk_complete(
        &mut self,
        _chunk: usize,
        _timing: &PhaseTiming,
        _max_abs_error: Option<f64>,
    ) -> io::Result<()> {
        Ok(())
    }
    /// Only called when the whole sweep ran
    fn on_finish(&mut self, _report: &SweepReport) -> io::Result<()> {
        Ok(())
    }
}

impl SweepObserver for () {}

/// Runs a [SweepConfiguration] over a [ProcessGroup].
///
/// Every PE of the group must call [run][BenchmarkDriver::run].
///
/// # Examples
///
///```no_run
/// use distmm::{BenchmarkDriver, ProcessGroupBuilder, StdoutReporter, SweepConfiguration};
///
/// let group = ProcessGroupBuilder::new().build()?;
/// let report = BenchmarkDriver::new(&group, SweepConfiguration::new(1024, vec![128, 256]))
///     .run(&mut StdoutReporter::stdout())?;
/// group.finalize()?;
/// # Ok::<(), distmm::Error>(())
///```
pub struct BenchmarkDriver<'a> {
    group: &'a ProcessGroup,
    sweep: SweepConfiguration,
    keep_results: bool,
}

impl<'a> BenchmarkDriver<'a> {
    pub fn new(group: &'a ProcessGroup, sweep: SweepConfiguration) -> BenchmarkDriver<'a> {
        BenchmarkDriver {
            group,
            sweep,
            keep_results: false,
        }
    }

    /// Keep every gathered result in the coordinator's [SweepReport]
    pub fn keep_results(mut self, keep: bool) -> BenchmarkDriver<'a> {
        self.keep_results = keep;
        self
    }

    // coordinator's sweep wins, so every pe evaluates the skip condition on the same values
    fn agree_on_sweep(&self) -> Result<SweepConfiguration> {
        let root_value = if self.group.is_coordinator() {
            Some(self.sweep.clone())
        } else {
            None
        };
        let agreed: SweepConfiguration = self.group.broadcast(root_value, COORDINATOR)?;
        if agreed != self.sweep {
            warn!(
                "[{:?}] local sweep {:?} differs from the coordinator's {:?}, using the coordinator's",
                self.group.rank(),
                self.sweep,
                agreed
            );
        }
        Ok(agreed)
    }

    fn timed<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<(T, Duration)> {
        self.group.barrier()?;
        let start = Instant::now();
        let res = f()?;
        Ok((res, start.elapsed()))
    }

    #[tracing::instrument(skip_all, fields(pe = self.group.rank()))]
    pub fn run(&self, observer: &mut dyn SweepObserver) -> Result<SweepReport> {
        let group = self.group;
        let coordinator = group.is_coordinator();
        let sweep = self.agree_on_sweep()?;
        if coordinator {
            observer.on_start(group.size(), &sweep)?;
        }

        let (a, b) = if coordinator {
            let mut rng = match sweep.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let a = Matrix::random(sweep.dim, sweep.dim, &mut rng);
            let b = Matrix::random(sweep.dim, sweep.dim, &mut rng);
            (Some(a), Some(b))
        } else {
            (None, None)
        };

        let (b, broadcast_latency) = self.timed(|| group.broadcast(b, COORDINATOR))?;
        debug!("[{:?}] right operand received in {:?}", group.rank(), broadcast_latency);
        if coordinator {
            observer.on_broadcast(broadcast_latency)?;
        }

        let mut chunks = Vec::with_capacity(sweep.chunk_sizes.len());
        for &chunk in sweep.chunk_sizes.iter() {
            group.barrier()?;
            if coordinator {
                observer.on_chunk_start(chunk)?;
            }
            let partition = match Partition::plan(sweep.dim, group.size(), chunk) {
                Ok(partition) => partition,
                Err(reason) => {
                    debug!("[{:?}] skipping chunk {:?}: {}", group.rank(), chunk, reason);
                    if coordinator {
                        observer.on_chunk_skipped(chunk, &reason)?;
                    }
                    chunks.push(ChunkReport {
                        chunk,
                        outcome: ChunkOutcome::Skipped(reason),
                    });
                    continue;
                }
            };
            let a_used = match &a {
                Some(a) => Some(a.head_rows(partition.total_rows())?),
                None => None,
            };

            let (slice, scatter_latency) =
                self.timed(|| group.scatter(a_used.as_ref(), partition.chunk(), COORDINATOR))?;
            debug!("[{:?}] rows {:?} scattered", group.rank(), slice.row_range());
            let (local, compute_time) = self.timed(|| kernel::multiply(&slice, &b))?;
            let (gathered, gather_latency) =
                self.timed(|| group.gather(&local, COORDINATOR))?;

            let max_abs_error = match (&a_used, &gathered) {
                (Some(a_used), Some(gathered)) if sweep.verify => {
                    let expected = kernel::reference_multiply(a_used, &b)?;
                    let err = gathered.max_abs_diff(&expected).ok_or_else(|| {
                        Error::Shape(format!(
                            "gathered {:?} result, expected {:?}",
                            gathered.shape(),
                            partition.result_shape()
                        ))
                    })?;
                    Some(err)
                }
                _ => None,
            };

            let timing = PhaseTiming {
                broadcast_latency,
                scatter_latency,
                compute_time,
                gather_latency,
            };
            if coordinator {
                observer.on_chunk_complete(chunk, &timing, max_abs_error)?;
            }
            chunks.push(ChunkReport {
                chunk,
                outcome: ChunkOutcome::Completed {
                    timing,
                    result: gathered.filter(|_| self.keep_results),
                    max_abs_error,
                },
            });
        }

        let report = SweepReport {
            num_pes: group.size(),
            sweep,
            broadcast_latency,
            chunks,
        };
        if coordinator {
            observer.on_finish(&report)?;
        }
        Ok(report)
    }
}
