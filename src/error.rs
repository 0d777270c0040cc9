use crate::collectives::CollectiveOp;

use thiserror::Error;

/// Result type used throughout distmm
pub type Result<T> = std::result::Result<T, Error>;

/// Errors caused by a sweep configuration that cannot be executed as requested.
///
/// When produced by the partitioner the iteration is skipped and the sweep continues,
/// everywhere else it is fatal to the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A chunk size of zero rows per PE was requested
    #[error("chunk size must be at least one row per pe")]
    ZeroChunk,

    /// `chunk * num_pes` rows do not fit in the left operand
    #[error("chunk {chunk} too large for {num_pes} pes ({total_rows} rows > {dim})")]
    ChunkTooLarge {
        chunk: usize,
        num_pes: usize,
        total_rows: usize,
        dim: usize,
    },

    /// The root buffer passed to scatter is not `rows_per_pe * num_pes` rows long
    #[error("scatter buffer has {rows} rows, expected {rows_per_pe} rows for each of {num_pes} pes")]
    ScatterShape {
        rows: usize,
        rows_per_pe: usize,
        num_pes: usize,
    },

    /// The root of a collective did not supply the value it is distributing
    #[error("root pe must supply a value for {op}")]
    MissingRootValue { op: CollectiveOp },
}

/// Failures of the point to point layer underneath the collectives
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer closed its connection or exited
    #[error("pe {0} disconnected")]
    Disconnected(usize),

    /// A pe id outside of `0..num_pes`
    #[error("pe {0} is not part of the process group")]
    InvalidPe(usize),

    /// A message arrived that does not belong to the collective in progress
    #[error("unexpected message from pe {src}: expected {expected}, found {found}")]
    Unexpected {
        src: usize,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top level error type
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The process group could not be established, no partial group is ever formed
    #[error("failed to join process group: {0}")]
    GroupJoin(String),

    /// A collective failed part way, the whole group must be considered failed
    #[error("{op} failed on pe {pe}")]
    Collective {
        op: CollectiveOp,
        pe: usize,
        #[source]
        source: TransportError,
    },

    /// Operands with incompatible dimensions
    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn collective(op: CollectiveOp, pe: usize, source: impl Into<TransportError>) -> Error {
        Error::Collective {
            op,
            pe,
            source: source.into(),
        }
    }
}
