//! Broadcast, scatter, gather and barrier across every PE of a [ProcessGroup].
//!
//! Every operation is a synchronization point: each PE of the group must call the same
//! sequence of collectives, in the same order, with the same root.

use crate::error::{ConfigurationError, Error, Result, TransportError};
use crate::lamellae::{Lamellae, LamellaeComm};
use crate::matrix::{Matrix, RowSlice};
use crate::process_group::ProcessGroup;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// The collective a message belongs to
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectiveOp {
    Broadcast,
    Scatter,
    Gather,
    Barrier,
}

impl std::fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectiveOp::Broadcast => write!(f, "broadcast"),
            CollectiveOp::Scatter => write!(f, "scatter"),
            CollectiveOp::Gather => write!(f, "gather"),
            CollectiveOp::Barrier => write!(f, "barrier"),
        }
    }
}

/// Prefix of every message, lets the receiver check it is part of the collective it is executing
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) op: CollectiveOp,
    pub(crate) seq: u64,
    pub(crate) round: u32,
}

impl Header {
    pub(crate) fn new(op: CollectiveOp, seq: u64) -> Header {
        Header { op, seq, round: 0 }
    }
    pub(crate) fn with_round(self, round: u32) -> Header {
        Header { round, ..self }
    }
}

pub(crate) fn encode<T: Serialize + ?Sized>(header: Header, value: &T) -> std::result::Result<Vec<u8>, TransportError> {
    Ok(bincode::serialize(&(header, value))?)
}

pub(crate) fn send_msg<T: Serialize + ?Sized>(
    lamellae: &Lamellae,
    header: Header,
    pe: usize,
    value: &T,
) -> Result<()> {
    let my_pe = lamellae.my_pe();
    let data = encode(header, value).map_err(|e| Error::collective(header.op, my_pe, e))?;
    lamellae
        .send_to_pe(pe, data)
        .map_err(|e| Error::collective(header.op, my_pe, e))
}

pub(crate) fn recv_msg<T: DeserializeOwned>(
    lamellae: &Lamellae,
    expected: Header,
    pe: usize,
) -> Result<T> {
    let my_pe = lamellae.my_pe();
    let fail = |e: TransportError| Error::collective(expected.op, my_pe, e);
    let data = lamellae.recv_from_pe(pe).map_err(fail)?;
    // bincode's default decoding ignores trailing bytes, so the header can be checked on its own
    let header: Header = bincode::deserialize(&data).map_err(|e| fail(e.into()))?;
    if header != expected {
        return Err(fail(TransportError::Unexpected {
            src: pe,
            expected: format!("{:?}", expected),
            found: format!("{:?}", header),
        }));
    }
    let (_, value): (Header, T) = bincode::deserialize(&data).map_err(|e| fail(e.into()))?;
    Ok(value)
}

/// The collective operations available on a process group
pub trait CollectiveOps {
    /// Blocks until every PE of the group has entered the barrier
    fn barrier(&self) -> Result<()>;

    /// Delivers `root`'s value to every PE, including `root` itself.
    ///
    /// Only `root` supplies `Some(value)`, every other PE passes `None`.
    fn broadcast<T>(&self, value: Option<T>, root: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned;

    /// Splits `root`'s matrix into `size()` blocks of `rows_per_pe` contiguous rows,
    /// block `k` is delivered to PE `k`.
    ///
    /// `full` must hold exactly `rows_per_pe * size()` rows on `root` and be `None` elsewhere.
    fn scatter(&self, full: Option<&Matrix>, rows_per_pe: usize, root: usize) -> Result<RowSlice>;

    /// Concatenates every PE's `local` matrix in rank order on `root`, other PEs receive `None`
    fn gather(&self, local: &Matrix, root: usize) -> Result<Option<Matrix>>;
}

impl ProcessGroup {
    fn check_root(&self, op: CollectiveOp, root: usize) -> Result<()> {
        if root < self.size() {
            Ok(())
        } else {
            Err(Error::collective(op, self.rank(), TransportError::InvalidPe(root)))
        }
    }
}

impl CollectiveOps for ProcessGroup {
    #[tracing::instrument(skip_all, fields(pe = self.rank()))]
    fn barrier(&self) -> Result<()> {
        self.barrier.barrier(self.lamellae())
    }

    #[tracing::instrument(skip_all, fields(pe = self.rank(), root = root))]
    fn broadcast<T>(&self, value: Option<T>, root: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let op = CollectiveOp::Broadcast;
        self.check_root(op, root)?;
        let header = Header::new(op, self.next_seq());
        if self.rank() == root {
            let value = value.ok_or(ConfigurationError::MissingRootValue { op })?;
            if self.size() > 1 {
                let data = encode(header, &value).map_err(|e| Error::collective(op, root, e))?;
                for pe in (0..self.size()).filter(|pe| *pe != root) {
                    self.lamellae()
                        .send_to_pe(pe, data.clone())
                        .map_err(|e| Error::collective(op, root, e))?;
                }
            }
            Ok(value)
        } else {
            recv_msg(self.lamellae(), header, root)
        }
    }

    #[tracing::instrument(skip_all, fields(pe = self.rank(), rows_per_pe = rows_per_pe, root = root))]
    fn scatter(&self, full: Option<&Matrix>, rows_per_pe: usize, root: usize) -> Result<RowSlice> {
        let op = CollectiveOp::Scatter;
        self.check_root(op, root)?;
        let header = Header::new(op, self.next_seq());
        let first_row = self.rank() * rows_per_pe;
        if self.rank() == root {
            let full = full.ok_or(ConfigurationError::MissingRootValue { op })?;
            if full.rows() != rows_per_pe * self.size() {
                return Err(ConfigurationError::ScatterShape {
                    rows: full.rows(),
                    rows_per_pe,
                    num_pes: self.size(),
                }
                .into());
            }
            let mut mine = None;
            for pe in 0..self.size() {
                let block = full.row_block(pe * rows_per_pe, rows_per_pe)?;
                if pe == root {
                    mine = Some(block.to_matrix());
                } else {
                    trace!("scatter rows {:?} to pe {:?}", pe * rows_per_pe, pe);
                    send_msg(self.lamellae(), header, pe, &block)?;
                }
            }
            let mine = mine.unwrap_or_else(|| Matrix::zeros(rows_per_pe, full.cols()));
            Ok(RowSlice::new(first_row, mine))
        } else {
            if full.is_some() {
                tracing::warn!(
                    "[{:?}] ignoring scatter buffer supplied by non-root pe",
                    self.rank()
                );
            }
            let block: Matrix = recv_msg(self.lamellae(), header, root)?;
            if block.rows() != rows_per_pe {
                return Err(Error::collective(
                    op,
                    self.rank(),
                    TransportError::Unexpected {
                        src: root,
                        expected: format!("{} rows", rows_per_pe),
                        found: format!("{} rows", block.rows()),
                    },
                ));
            }
            Ok(RowSlice::new(first_row, block))
        }
    }

    #[tracing::instrument(skip_all, fields(pe = self.rank(), root = root))]
    fn gather(&self, local: &Matrix, root: usize) -> Result<Option<Matrix>> {
        let op = CollectiveOp::Gather;
        self.check_root(op, root)?;
        let header = Header::new(op, self.next_seq());
        if self.rank() == root {
            let mut blocks = Vec::with_capacity(self.size());
            for pe in 0..self.size() {
                if pe == root {
                    blocks.push(None);
                } else {
                    blocks.push(Some(recv_msg::<Matrix>(self.lamellae(), header, pe)?));
                }
            }
            let gathered = Matrix::vstack(
                blocks
                    .iter()
                    .map(|block| block.as_ref().unwrap_or(local)),
            )?;
            Ok(Some(gathered))
        } else {
            send_msg(self.lamellae(), header, root, local)?;
            Ok(None)
        }
    }
}
