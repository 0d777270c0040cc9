use crate::barrier::Barrier;
use crate::config;
use crate::error::{Error, Result};
use crate::lamellae::thread_lamellae::create_fabric;
use crate::lamellae::{create_lamellae, Backend, Lamellae, LamellaeComm, LamellaeInit, SocketsArch};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Rank of the PE that owns the full operands, prints the report and receives gathered results
pub const COORDINATOR: usize = 0;

/// All the PEs (processing elements) taking part in one run.
///
/// Membership is fixed once the group is built, every PE observes the same `size()`
/// and a distinct `rank()` in `0..size()`.
///
/// Collectives are provided through [CollectiveOps][crate::CollectiveOps].
#[derive(Debug)]
pub struct ProcessGroup {
    rank: usize,
    size: usize,
    lamellae: Arc<Lamellae>,
    pub(crate) barrier: Barrier,
    collective_cnt: AtomicU64,
    finalized: AtomicBool,
}

impl ProcessGroup {
    fn new(lamellae: Lamellae) -> ProcessGroup {
        let rank = lamellae.my_pe();
        let size = lamellae.num_pes();
        ProcessGroup {
            rank,
            size,
            lamellae: Arc::new(lamellae),
            barrier: Barrier::new(rank, size, config().barrier_dissemination_factor),
            collective_cnt: AtomicU64::new(0),
            finalized: AtomicBool::new(false),
        }
    }

    /// Returns the id of this PE
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns the number of PEs in the group
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == COORDINATOR
    }

    pub fn backend(&self) -> Backend {
        self.lamellae.backend()
    }

    #[doc(hidden)]
    #[allow(non_snake_case)]
    pub fn MB_sent(&self) -> f64 {
        self.lamellae.MB_sent()
    }

    pub(crate) fn lamellae(&self) -> &Lamellae {
        &self.lamellae
    }

    // every pe issues collectives in the same order, so the counters stay in lockstep
    pub(crate) fn next_seq(&self) -> u64 {
        self.collective_cnt.fetch_add(1, Ordering::SeqCst)
    }

    /// Leave the group once every PE has reached this point
    #[tracing::instrument(skip_all, fields(pe = self.rank))]
    pub fn finalize(self) -> Result<()> {
        let res = self.barrier.barrier(&self.lamellae);
        self.finalized.store(true, Ordering::SeqCst);
        self.lamellae.shutdown();
        debug!("[{:?}] left process group", self.rank);
        res
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if !self.finalized.swap(true, Ordering::SeqCst) {
            self.lamellae.shutdown();
        }
    }
}

/// Builder used to join a [ProcessGroup].
///
/// The backend defaults to the `DISTMM_BACKEND` environment variable.
///
/// # Examples
///
///```no_run
/// use distmm::{Backend, ProcessGroupBuilder};
///
/// let group = ProcessGroupBuilder::new()
///                 .with_lamellae(Backend::Sockets)
///                 .build()?;
/// # Ok::<(), distmm::Error>(())
///```
#[derive(Debug, Clone, Default)]
pub struct ProcessGroupBuilder {
    backend: Backend,
    sockets_arch: Option<SocketsArch>,
}

impl ProcessGroupBuilder {
    pub fn new() -> ProcessGroupBuilder {
        ProcessGroupBuilder {
            backend: Default::default(),
            sockets_arch: None,
        }
    }

    /// Specify the lamellae backend to use for this execution
    pub fn with_lamellae(mut self, backend: Backend) -> ProcessGroupBuilder {
        self.backend = backend;
        self
    }

    /// Use an explicit layout for the sockets backend instead of reading it from the environment
    pub fn with_sockets_arch(mut self, arch: SocketsArch) -> ProcessGroupBuilder {
        self.backend = Backend::Sockets;
        self.sockets_arch = Some(arch);
        self
    }

    /// Join the group, returning only once every PE has joined
    #[tracing::instrument(skip_all)]
    pub fn build(self) -> Result<ProcessGroup> {
        let mut lamellae_builder = create_lamellae(self.backend, self.sockets_arch)?;
        let (my_pe, num_pes) = lamellae_builder.init_fabric();
        debug!("[{:?}] joining group of {:?} pes over {}", my_pe, num_pes, self.backend);
        let group = ProcessGroup::new(lamellae_builder.init_lamellae()?);
        group
            .barrier
            .barrier(group.lamellae())
            .map_err(|e| Error::GroupJoin(format!("initial barrier failed: {}", e)))?;
        Ok(group)
    }

    /// Create every PE of an in-process group at once, in rank order.
    ///
    /// Each PE is expected to be driven by its own thread.
    pub fn build_threaded(num_pes: usize) -> Result<Vec<ProcessGroup>> {
        if num_pes == 0 {
            return Err(Error::GroupJoin(
                "a process group needs at least one pe".to_owned(),
            ));
        }
        Ok(create_fabric(num_pes)
            .into_iter()
            .map(|pe| ProcessGroup::new(Lamellae::Threads(pe)))
            .collect())
    }
}
