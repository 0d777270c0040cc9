//! distmm benchmarks distributed dense matrix multiplication across a fixed group of PEs
//! (processing elements), measuring how long each communication phase takes compared to
//! the local computation, for several ways of chunking the rows of the left operand.
//!
//! PEs exchange data through network providers called Lamellae. Three exist: one for a single
//! process ("local"), one running every PE as a thread of one process ("threads"), used to
//! exercise the collectives without launching processes, and a TCP mesh with one process per
//! PE ("sockets").
//!
//! EXAMPLES
//! --------
//!
//! # Joining a process group and running the default sweep
//! ```no_run
//! use distmm::{BenchmarkDriver, ProcessGroupBuilder, StdoutReporter, SweepConfiguration};
//!
//! fn main() -> Result<(), distmm::Error> {
//!     let group = ProcessGroupBuilder::new().build()?; // backend selected by DISTMM_BACKEND
//!     BenchmarkDriver::new(&group, SweepConfiguration::from_config())
//!         .run(&mut StdoutReporter::stdout())?; // only the coordinator prints
//!     group.finalize()
//! }
//! ```
//!
//! # Using the collectives directly
//! ```no_run
//! use distmm::{CollectiveOps, Matrix, ProcessGroupBuilder, COORDINATOR};
//!
//! fn main() -> Result<(), distmm::Error> {
//!     let group = ProcessGroupBuilder::new().build()?;
//!     let full = if group.is_coordinator() {
//!         Some(Matrix::zeros(2 * group.size(), 4))
//!     } else {
//!         None
//!     };
//!     let mine = group.scatter(full.as_ref(), 2, COORDINATOR)?; // 2 rows each
//!     let all = group.gather(&mine, COORDINATOR)?; // Some(..) on the coordinator only
//!     group.barrier()?;
//!     group.finalize()
//! }
//! ```
//!
//! Launching `N` PEs on the local host is done with the `distmm_run` binary:
//!
//! `distmm_run -N 4 -- --dim 2048 --chunk-sizes 128,256`

mod barrier;
pub mod collectives;
mod driver;
mod env_var;
mod error;
pub mod kernel;
mod lamellae;
mod launcher;
mod matrix;
mod partition;
mod process_group;
mod report;

pub use crate::collectives::{CollectiveOp, CollectiveOps};
pub use crate::driver::{
    BenchmarkDriver, ChunkOutcome, ChunkReport, PhaseTiming, SweepConfiguration, SweepObserver,
    SweepReport, DEFAULT_CHUNK_SIZES, DEFAULT_MATRIX_DIM,
};
pub use crate::env_var::{config, Config};
pub use crate::error::{ConfigurationError, Error, Result, TransportError};
pub use crate::lamellae::{Backend, SocketsArch};
pub use crate::launcher::{LaunchOutcome, Launcher};
pub use crate::matrix::{Matrix, RowSlice};
pub use crate::partition::Partition;
pub use crate::process_group::{ProcessGroup, ProcessGroupBuilder, COORDINATOR};
pub use crate::report::StdoutReporter;
