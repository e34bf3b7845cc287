//! The local multiply primitive each participant runs on its row block.

use thiserror::Error;

use crate::error::{MatMulError, Result};
use crate::matrix::{Matrix, RowBlock};

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("cannot multiply {a_rows}x{a_cols} by {b_rows}x{b_cols}")]
    ShapeMismatch {
        a_rows: usize,
        a_cols: usize,
        b_rows: usize,
        b_cols: usize,
    },
    #[error("failed to allocate {0} result elements")]
    Allocation(usize),
}

/// Computes `block x b` for a row block of the left operand.
///
/// Implementations must be side-effect free: the same inputs always give the same
/// product, and neither operand is modified.
pub trait Kernel: Send + Sync {
    fn multiply(&self, a: RowBlock<'_>, b: &Matrix) -> std::result::Result<Matrix, KernelError>;
}

/// Straightforward row-major i-k-j product.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaiveKernel;

impl Kernel for NaiveKernel {
    fn multiply(&self, a: RowBlock<'_>, b: &Matrix) -> std::result::Result<Matrix, KernelError> {
        if a.cols() != b.rows() {
            return Err(KernelError::ShapeMismatch {
                a_rows: a.rows(),
                a_cols: a.cols(),
                b_rows: b.rows(),
                b_cols: b.cols(),
            });
        }

        let (m, n) = (a.rows(), b.cols());
        let len = m
            .checked_mul(n)
            .ok_or(KernelError::Allocation(usize::MAX))?;
        let mut out: Vec<f64> = Vec::new();
        out.try_reserve_exact(len)
            .map_err(|_| KernelError::Allocation(len))?;
        out.resize(len, 0.0);

        for i in 0..m {
            let a_row = a.row(i);
            let c_row = &mut out[i * n..(i + 1) * n];
            for (k, &a_ik) in a_row.iter().enumerate() {
                for (c, &b_kj) in c_row.iter_mut().zip(b.row(k)) {
                    *c += a_ik * b_kj;
                }
            }
        }

        Matrix::from_vec(m, n, out).map_err(|_| KernelError::Allocation(len))
    }
}

/// Single-process reference product `a x b`.
pub fn multiply(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    if a.cols() != b.rows() {
        return Err(MatMulError::DimensionMismatch {
            a_rows: a.rows(),
            a_cols: a.cols(),
            b_rows: b.rows(),
            b_cols: b.cols(),
        });
    }
    NaiveKernel
        .multiply(a.view(), b)
        .map_err(|e| MatMulError::ComputeFailure {
            worker: 0,
            reason: e.to_string(),
        })
}
