use crate::error::ConfigurationError;

use std::ops::Range;

/// Static row distribution of the left operand for one chunk size.
///
/// Computed purely from `(dim, num_pes, chunk)`, values every PE already agrees on,
/// so all PEs reach the same accept/skip decision without communicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    dim: usize,
    num_pes: usize,
    chunk: usize,
    total_rows: usize,
}

impl Partition {
    /// Accepts `chunk` rows per PE if `chunk * num_pes` rows fit in a `dim x dim` operand
    pub fn plan(dim: usize, num_pes: usize, chunk: usize) -> Result<Partition, ConfigurationError> {
        if chunk == 0 {
            return Err(ConfigurationError::ZeroChunk);
        }
        let total_rows = chunk.saturating_mul(num_pes);
        if total_rows > dim {
            return Err(ConfigurationError::ChunkTooLarge {
                chunk,
                num_pes,
                total_rows,
                dim,
            });
        }
        Ok(Partition {
            dim,
            num_pes,
            chunk,
            total_rows,
        })
    }

    pub fn chunk(&self) -> usize {
        self.chunk
    }

    pub fn num_pes(&self) -> usize {
        self.num_pes
    }

    /// Rows of the left operand taking part in this iteration, always a prefix of it
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    /// The rows of the left operand delivered to `pe`
    pub fn row_range(&self, pe: usize) -> Range<usize> {
        let start = pe * self.chunk;
        start..start + self.chunk
    }

    /// Shape of each PE's slice and of its local product
    pub fn slice_shape(&self) -> (usize, usize) {
        (self.chunk, self.dim)
    }

    /// Shape of the gathered result on the coordinator
    pub fn result_shape(&self) -> (usize, usize) {
        (self.total_rows, self.dim)
    }
}
