//! Local dense multiply of a PE's row slice against the full right operand.

use crate::error::{Error, Result};
use crate::matrix::Matrix;

use matrixmultiply::dgemm;

fn check_inner_dims(a: &Matrix, b: &Matrix) -> Result<()> {
    for m in [a, b] {
        if m.rows().checked_mul(m.cols()) != Some(m.as_slice().len()) {
            return Err(Error::Shape(format!(
                "{}x{} matrix holds {} values",
                m.rows(),
                m.cols(),
                m.as_slice().len()
            )));
        }
    }
    if a.cols() != b.rows() {
        return Err(Error::Shape(format!(
            "cannot multiply a {}x{} matrix by a {}x{} matrix",
            a.rows(),
            a.cols(),
            b.rows(),
            b.cols()
        )));
    }
    Ok(())
}

/// `a * b` computed with the blocked `dgemm` kernel
pub fn multiply(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    check_inner_dims(a, b)?;
    let m = a.rows();
    let k = a.cols();
    let n = b.cols();
    let mut c = Matrix::zeros(m, n);
    // row-major: row stride is the column count, column stride is 1
    unsafe {
        dgemm(
            m,
            k,
            n,
            1.0,
            a.as_slice().as_ptr(),
            k as isize,
            1,
            b.as_slice().as_ptr(),
            n as isize,
            1,
            0.0,
            c.as_mut_slice().as_mut_ptr(),
            n as isize,
            1,
        );
    }
    Ok(c)
}

/// Straightforward triple loop, used to check [multiply] and the distributed result
pub fn reference_multiply(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    check_inner_dims(a, b)?;
    let n = b.cols();
    let mut c = Matrix::zeros(a.rows(), n);
    let out = c.as_mut_slice();
    for i in 0..a.rows() {
        let a_row = a.row(i);
        let c_row = &mut out[i * n..(i + 1) * n];
        for (p, a_ip) in a_row.iter().enumerate() {
            for (c_ij, b_pj) in c_row.iter_mut().zip(b.row(p)) {
                *c_ij += a_ip * b_pj;
            }
        }
    }
    Ok(c)
}
