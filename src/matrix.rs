//! Dense row-major `f64` matrices and borrowed row-block views.
//!
//! A [`RowBlock`] is a contiguous range of rows borrowed from a [`Matrix`]. Taking one
//! never copies; call [`RowBlock::to_matrix`] to materialize it. Assembly of a result goes
//! the other way through [`Matrix::write_block`], which overwrites a row range in place.

use rand::Rng;

use crate::error::{MatMulError, Result};

/// A dense, row-major matrix with fixed dimensions.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Allocate a zero-filled `rows x cols` matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Wrap row-major storage. Fails if `data.len() != rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        let expected = rows * cols;
        if data.len() != expected {
            return Err(MatMulError::InvalidShape {
                rows,
                cols,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Build a matrix from nested rows. All rows must have the same length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let n = rows.len();
        let cols = rows.first().map_or(0, |row| row.len());
        if rows.iter().any(|row| row.len() != cols) {
            return Err(MatMulError::InvalidShape {
                rows: n,
                cols,
                expected: n * cols,
                actual: rows.iter().map(Vec::len).sum(),
            });
        }
        Self::from_vec(n, cols, rows.concat())
    }

    /// Fill a `rows x cols` matrix with samples uniform in `[0, 1)`.
    pub fn random<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Self {
        let data = (0..rows * cols).map(|_| rng.gen::<f64>()).collect();
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.cols + j]
    }

    /// A view over every row.
    pub fn view(&self) -> RowBlock<'_> {
        RowBlock {
            offset: 0,
            rows: self.rows,
            cols: self.cols,
            data: &self.data,
        }
    }

    /// Borrow rows `[offset, offset + count)` without copying.
    pub fn row_block(&self, offset: usize, count: usize) -> Result<RowBlock<'_>> {
        self.check_range(offset, count)?;
        let start = offset * self.cols;
        let end = (offset + count) * self.cols;
        Ok(RowBlock {
            offset,
            rows: count,
            cols: self.cols,
            data: &self.data[start..end],
        })
    }

    /// Overwrite rows `[offset, offset + block.rows())` with `block`.
    ///
    /// Rows outside that range are never touched, so writing the same block twice
    /// leaves the matrix exactly as writing it once.
    pub fn write_block(&mut self, offset: usize, block: RowBlock<'_>) -> Result<()> {
        if block.cols != self.cols {
            return Err(MatMulError::InvalidShape {
                rows: block.rows,
                cols: self.cols,
                expected: block.rows * self.cols,
                actual: block.data.len(),
            });
        }
        self.check_range(offset, block.rows)?;
        let start = offset * self.cols;
        self.data[start..start + block.data.len()].copy_from_slice(block.data);
        Ok(())
    }

    /// Largest element-wise absolute difference, or `None` if the shapes differ.
    pub fn max_abs_diff(&self, other: &Matrix) -> Option<f64> {
        if self.rows != other.rows || self.cols != other.cols {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max),
        )
    }

    pub fn approx_eq(&self, other: &Matrix, tolerance: f64) -> bool {
        self.max_abs_diff(other).is_some_and(|d| d <= tolerance)
    }

    fn check_range(&self, offset: usize, count: usize) -> Result<()> {
        match offset.checked_add(count) {
            Some(end) if end <= self.rows => Ok(()),
            _ => Err(MatMulError::BlockOutOfBounds {
                offset,
                rows: count,
                total: self.rows,
            }),
        }
    }
}

/// A borrowed, contiguous range of rows of a [`Matrix`].
#[derive(Clone, Copy, Debug)]
pub struct RowBlock<'a> {
    offset: usize,
    rows: usize,
    cols: usize,
    data: &'a [f64],
}

impl<'a> RowBlock<'a> {
    /// Row index of the first row in the parent matrix.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn as_slice(&self) -> &'a [f64] {
        self.data
    }

    pub fn row(&self, i: usize) -> &'a [f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Copy the viewed rows into an owned matrix.
    pub fn to_matrix(&self) -> Matrix {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting(rows: usize, cols: usize) -> Matrix {
        let data = (0..rows * cols).map(|v| v as f64).collect();
        Matrix::from_vec(rows, cols, data).unwrap()
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = Matrix::from_vec(2, 3, vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, MatMulError::InvalidShape { expected: 6, actual: 5, .. }));
    }

    #[test]
    fn from_rows_rejects_ragged_input() {
        let err = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0], vec![4.0, 5.0]]).unwrap_err();
        assert!(matches!(
            err,
            MatMulError::InvalidShape { rows: 3, cols: 2, expected: 6, actual: 5 }
        ));
        let m = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(m.get(1, 0), 3.0);
    }

    #[test]
    fn row_block_borrows_the_requested_rows() {
        let m = counting(5, 3);
        let block = m.row_block(1, 2).unwrap();
        assert_eq!(block.offset(), 1);
        assert_eq!(block.rows(), 2);
        assert_eq!(block.row(0), &[3.0, 4.0, 5.0]);
        assert_eq!(block.row(1), &[6.0, 7.0, 8.0]);
        // Same storage, no copy.
        assert!(std::ptr::eq(block.as_slice().as_ptr(), &m.as_slice()[3]));
    }

    #[test]
    fn row_block_out_of_bounds() {
        let m = counting(4, 2);
        assert!(m.row_block(3, 2).is_err());
        assert!(m.row_block(usize::MAX, 2).is_err());
        assert_eq!(m.row_block(4, 0).unwrap().rows(), 0);
    }

    #[test]
    fn write_block_is_confined_to_its_rows() {
        let mut target = Matrix::from_vec(5, 2, vec![-1.0; 10]).unwrap();
        let block = Matrix::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();

        target.write_block(2, block.view()).unwrap();
        let once = target.clone();
        // Duplicate delivery of the same partial result.
        target.write_block(2, block.view()).unwrap();

        assert_eq!(target, once);
        assert_eq!(target.row(1), &[-1.0, -1.0]);
        assert_eq!(target.row(2), &[1.0, 2.0]);
        assert_eq!(target.row(3), &[3.0, 4.0]);
        assert_eq!(target.row(4), &[-1.0, -1.0]);
    }

    #[test]
    fn write_block_rejects_mismatched_blocks() {
        let mut target = Matrix::zeros(3, 2);
        let wide = Matrix::zeros(1, 3);
        assert!(target.write_block(0, wide.view()).is_err());
        let tall = Matrix::zeros(2, 2);
        assert!(matches!(
            target.write_block(2, tall.view()),
            Err(MatMulError::BlockOutOfBounds { offset: 2, rows: 2, total: 3 })
        ));
    }

    #[test]
    fn max_abs_diff_requires_same_shape() {
        let a = counting(2, 2);
        let mut b = a.clone();
        assert_eq!(a.max_abs_diff(&b), Some(0.0));
        b.data[3] += 0.5;
        assert_eq!(a.max_abs_diff(&b), Some(0.5));
        assert!(a.max_abs_diff(&Matrix::zeros(2, 3)).is_none());
    }
}
