use crate::error::{Error, Result};

use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, Range};

/// A dense row-major matrix of `f64`, always holding exactly `rows * cols` values
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(try_from = "RawMatrix")]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

// decoded fields of a matrix before its shape has been checked against its data
#[derive(Deserialize)]
struct RawMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl TryFrom<RawMatrix> for Matrix {
    type Error = Error;
    fn try_from(raw: RawMatrix) -> Result<Matrix> {
        Matrix::from_vec(raw.rows, raw.cols, raw.data)
    }
}

/// A borrowed block of contiguous rows, serializes exactly like the owned [Matrix] it was cut from
#[derive(Serialize, Debug, Clone, Copy)]
pub(crate) struct MatrixView<'a> {
    rows: usize,
    cols: usize,
    data: &'a [f64],
}

impl<'a> MatrixView<'a> {
    pub(crate) fn to_matrix(&self) -> Matrix {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.to_vec(),
        }
    }
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Matrix {
        Matrix {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Matrix> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(Error::Shape(format!(
                "{} values cannot form a {}x{} matrix",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Matrix { rows, cols, data })
    }

    /// Uniformly distributed values in `[0, 1)`
    pub fn random<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Matrix {
        let dist = Uniform::new(0.0f64, 1.0f64);
        let data = (0..rows * cols).map(|_| dist.sample(rng)).collect();
        Matrix { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    /// Copy of the first `n` rows
    pub fn head_rows(&self, n: usize) -> Result<Matrix> {
        Ok(self.row_block(0, n)?.to_matrix())
    }

    pub(crate) fn row_block(&self, start: usize, count: usize) -> Result<MatrixView<'_>> {
        if start + count > self.rows {
            return Err(Error::Shape(format!(
                "rows {}..{} out of range for a matrix with {} rows",
                start,
                start + count,
                self.rows
            )));
        }
        Ok(MatrixView {
            rows: count,
            cols: self.cols,
            data: &self.data[start * self.cols..(start + count) * self.cols],
        })
    }

    /// Stack matrices with equal column counts on top of each other, in order
    pub fn vstack<'a, I>(blocks: I) -> Result<Matrix>
    where
        I: IntoIterator<Item = &'a Matrix>,
    {
        let mut rows = 0;
        let mut cols = None;
        let mut data = Vec::new();
        for block in blocks {
            match cols {
                None => cols = Some(block.cols),
                Some(c) if c != block.cols => {
                    return Err(Error::Shape(format!(
                        "cannot stack a block with {} columns under blocks with {} columns",
                        block.cols, c
                    )))
                }
                Some(_) => {}
            }
            rows += block.rows;
            data.extend_from_slice(&block.data);
        }
        Ok(Matrix {
            rows,
            cols: cols.unwrap_or(0),
            data,
        })
    }

    /// Largest absolute elementwise difference, `None` if the shapes differ
    pub fn max_abs_diff(&self, other: &Matrix) -> Option<f64> {
        if self.shape() != other.shape() {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max),
        )
    }
}

/// The contiguous rows of the left operand owned by one PE for one iteration
#[derive(Clone, Debug, PartialEq)]
pub struct RowSlice {
    first_row: usize,
    rows: Matrix,
}

impl RowSlice {
    pub(crate) fn new(first_row: usize, rows: Matrix) -> RowSlice {
        RowSlice { first_row, rows }
    }

    /// Index of this slice's first row within the scattered matrix
    pub fn first_row(&self) -> usize {
        self.first_row
    }

    pub fn row_range(&self) -> Range<usize> {
        self.first_row..self.first_row + self.rows.rows()
    }

    pub fn into_matrix(self) -> Matrix {
        self.rows
    }
}

impl Deref for RowSlice {
    type Target = Matrix;
    fn deref(&self) -> &Matrix {
        &self.rows
    }
}
