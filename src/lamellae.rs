use crate::config;
use crate::error::TransportError;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use enum_dispatch::enum_dispatch;
use std::time::Duration;
use tracing::warn;

pub(crate) mod local_lamellae;
use local_lamellae::Local;

pub(crate) mod sockets_lamellae;
pub use sockets_lamellae::SocketsArch;
use sockets_lamellae::{Sockets, SocketsBuilder};

pub(crate) mod thread_lamellae;
use thread_lamellae::Threads;

/// The list of available lamellae backends, used to specify how data is transfered between PEs
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy,
)]
pub enum Backend {
    /// The Local backend -- intended for single process environments
    Local,
    /// The Threads backend -- every PE is a thread of the current process, intended for testing
    Threads,
    /// The Sockets backend -- one process per PE connected by a tcp mesh
    Sockets,
}

impl Default for Backend {
    fn default() -> Self {
        match config().backend.as_str() {
            "sockets" => Backend::Sockets,
            "threads" => Backend::Threads,
            _ => Backend::Local,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Local => write!(f, "local"),
            Backend::Threads => write!(f, "threads"),
            Backend::Sockets => write!(f, "sockets"),
        }
    }
}

pub(crate) type TransportResult<T> = Result<T, TransportError>;

/// Point to point messaging between the PEs of a group.
///
/// Messages from a given source PE are delivered in the order they were sent,
/// no ordering exists between different sources.
#[enum_dispatch]
pub(crate) trait LamellaeComm: Send + Sync {
    fn my_pe(&self) -> usize;
    fn num_pes(&self) -> usize;
    fn backend(&self) -> Backend;
    fn send_to_pe(&self, pe: usize, data: Vec<u8>) -> TransportResult<()>;
    /// Blocks until the next message from `pe` arrives
    fn recv_from_pe(&self, pe: usize) -> TransportResult<Vec<u8>>;
    #[allow(non_snake_case)]
    fn MB_sent(&self) -> f64;
    fn shutdown(&self);
}

#[enum_dispatch(LamellaeComm)]
#[derive(Debug)]
pub(crate) enum Lamellae {
    Local,
    Threads,
    Sockets,
}

#[enum_dispatch]
pub(crate) trait LamellaeInit {
    fn init_fabric(&mut self) -> (usize, usize); //(my_pe,num_pes)
    fn init_lamellae(&mut self) -> crate::Result<Lamellae>;
}

#[enum_dispatch(LamellaeInit)]
pub(crate) enum LamellaeBuilder {
    Local,
    SocketsBuilder,
}

pub(crate) fn create_lamellae(
    backend: Backend,
    sockets_arch: Option<SocketsArch>,
) -> crate::Result<LamellaeBuilder> {
    match backend {
        Backend::Local => Ok(LamellaeBuilder::Local(Local::new()?)),
        Backend::Sockets => {
            let arch = match sockets_arch {
                Some(arch) => arch,
                None => SocketsArch::from_env()?,
            };
            Ok(LamellaeBuilder::SocketsBuilder(SocketsBuilder::new(arch)))
        }
        Backend::Threads => Err(crate::Error::GroupJoin(
            "the threads backend creates every pe at once, use ProcessGroupBuilder::build_threaded"
                .to_owned(),
        )),
    }
}

pub(crate) fn check_pe(pe: usize, num_pes: usize) -> TransportResult<()> {
    if pe < num_pes {
        Ok(())
    } else {
        Err(TransportError::InvalidPe(pe))
    }
}

/// Receive the next message from `src_pe`, warning periodically while nothing arrives.
///
/// There is no internal timeout, a receive only fails when the source has gone away.
pub(crate) fn recv_or_warn(
    rx: &Receiver<Vec<u8>>,
    my_pe: usize,
    src_pe: usize,
) -> TransportResult<Vec<u8>> {
    let timeout = Duration::from_secs_f64(config().deadlock_timeout.max(0.001));
    loop {
        match rx.recv_timeout(timeout) {
            Ok(data) => return Ok(data),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "[{:?}] potential deadlock detected, still waiting on pe {:?} after {} seconds. \
                     Every collective must be entered by all pes of the group in the same order. \
                     The deadlock timeout can be set via the DISTMM_DEADLOCK_TIMEOUT environment variable",
                    my_pe,
                    src_pe,
                    config().deadlock_timeout
                );
            }
            Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected(src_pe)),
        }
    }
}
