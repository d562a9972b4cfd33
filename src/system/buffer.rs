//! Append-only coordinate storage for one partition of an equation system.

use nalgebra_sparse::{CooMatrix, CsrMatrix};

use super::{BUFFER_GROWTH_SLACK, INITIAL_BUFFER_CAPACITY};
use crate::error::{Result, TwoportError};

/// Growable list of `(row, col, value)` triples.
///
/// A buffer is cleared and refilled every simulation step. Clearing keeps the
/// allocation, so after the first few steps no reallocation happens at all.
#[derive(Debug, Clone)]
pub struct SparseEquationBuffer {
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
}

impl Default for SparseEquationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseEquationBuffer {
    /// Create an empty buffer pre-sized for [`INITIAL_BUFFER_CAPACITY`] non-zeros.
    pub fn new() -> Self {
        Self {
            rows: Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
            cols: Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
            values: Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Number of stored triples.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of triples the buffer can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.rows
            .capacity()
            .min(self.cols.capacity())
            .min(self.values.capacity())
    }

    /// Forget all triples, keeping the allocation.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.cols.clear();
        self.values.clear();
    }

    /// Append a single triple.
    pub fn push(&mut self, row: usize, col: usize, value: f64) {
        self.reserve_for(1);
        self.rows.push(row);
        self.cols.push(col);
        self.values.push(value);
    }

    /// Append the non-zero entries of a dense row.
    pub fn extend_from_row(&mut self, row: usize, values: &[f64]) {
        let non_zeros = values.iter().filter(|v| **v != 0.0).count();
        self.reserve_for(non_zeros);
        for (col, &value) in values.iter().enumerate() {
            if value != 0.0 {
                self.rows.push(row);
                self.cols.push(col);
                self.values.push(value);
            }
        }
    }

    /// Append triples whose rows are relative to `row_offset`.
    pub fn extend_from_triplets(&mut self, row_offset: usize, triplets: &[(usize, usize, f64)]) {
        self.reserve_for(triplets.len());
        for &(row, col, value) in triplets {
            self.rows.push(row + row_offset);
            self.cols.push(col);
            self.values.push(value);
        }
    }

    /// Iterate over the stored triples in insertion order.
    pub fn triplets(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.rows
            .iter()
            .zip(&self.cols)
            .zip(&self.values)
            .map(|((&r, &c), &v)| (r, c, v))
    }

    /// Concatenate the buffers in order and materialize one CSR matrix.
    ///
    /// Duplicate coordinates are summed.
    pub fn merge<'a>(
        buffers: impl IntoIterator<Item = &'a SparseEquationBuffer>,
        nrows: usize,
        ncols: usize,
    ) -> Result<CsrMatrix<f64>> {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut values = Vec::new();
        for buffer in buffers {
            rows.extend_from_slice(&buffer.rows);
            cols.extend_from_slice(&buffer.cols);
            values.extend_from_slice(&buffer.values);
        }

        let coo = CooMatrix::try_from_triplets(nrows, ncols, rows, cols, values).map_err(|e| {
            TwoportError::misuse(format!("cannot assemble {}x{} matrix: {}", nrows, ncols, e))
        })?;
        Ok(CsrMatrix::from(&coo))
    }

    /// Grow so that `additional` more triples fit: double plus a fixed slack.
    fn reserve_for(&mut self, additional: usize) {
        let needed = self.len() + additional;
        let capacity = self.capacity();
        if needed <= capacity {
            return;
        }
        let target = (2 * capacity).max(needed) + BUFFER_GROWTH_SLACK;
        let len = self.len();
        self.rows.reserve_exact(target - len);
        self.cols.reserve_exact(target - len);
        self.values.reserve_exact(target - len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn dense(matrix: &CsrMatrix<f64>) -> Vec<Vec<f64>> {
        let mut out = vec![vec![0.0; matrix.ncols()]; matrix.nrows()];
        for (r, c, v) in matrix.triplet_iter() {
            out[r][c] += *v;
        }
        out
    }

    #[test]
    fn test_initial_capacity() {
        let buffer = SparseEquationBuffer::new();
        assert!(buffer.capacity() >= INITIAL_BUFFER_CAPACITY);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_growth_doubles_plus_slack() {
        let mut buffer = SparseEquationBuffer::new();
        let before = buffer.capacity();
        for i in 0..=before {
            buffer.push(i, 0, 1.0);
        }
        assert_eq!(buffer.len(), before + 1);
        assert!(buffer.capacity() >= 2 * before + BUFFER_GROWTH_SLACK);
    }

    #[test]
    fn test_clear_keeps_allocation() {
        let mut buffer = SparseEquationBuffer::new();
        buffer.extend_from_row(0, &[1.0, 0.0, 2.0]);
        assert_eq!(buffer.len(), 2);
        let capacity = buffer.capacity();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), capacity);
    }

    #[test]
    fn test_merge_is_partition_transparent() {
        let triples = [
            (0, 0, 1.0),
            (0, 2, -3.0),
            (1, 1, 4.5),
            (2, 0, 2.0),
            (3, 3, -1.0),
            (3, 0, 0.25),
        ];

        let mut single = SparseEquationBuffer::new();
        for &(r, c, v) in &triples {
            single.push(r, c, v);
        }

        let mut first = SparseEquationBuffer::new();
        let mut second = SparseEquationBuffer::new();
        let mut third = SparseEquationBuffer::new();
        for &(r, c, v) in &triples[..2] {
            first.push(r, c, v);
        }
        second.extend_from_triplets(1, &[(0, 1, 4.5), (1, 0, 2.0)]);
        for &(r, c, v) in &triples[4..] {
            third.push(r, c, v);
        }

        let merged = SparseEquationBuffer::merge([&first, &second, &third], 4, 4).unwrap();
        let reference = SparseEquationBuffer::merge([&single], 4, 4).unwrap();
        let merged = dense(&merged);
        let reference = dense(&reference);
        for r in 0..4 {
            for c in 0..4 {
                assert_relative_eq!(merged[r][c], reference[r][c]);
            }
        }
    }

    #[test]
    fn test_merge_sums_duplicates() {
        let mut buffer = SparseEquationBuffer::new();
        buffer.push(0, 0, 1.0);
        buffer.push(0, 0, 2.0);
        let matrix = SparseEquationBuffer::merge([&buffer], 1, 1).unwrap();
        assert_relative_eq!(dense(&matrix)[0][0], 3.0);
    }

    #[test]
    fn test_merge_rejects_out_of_bounds() {
        let mut buffer = SparseEquationBuffer::new();
        buffer.push(5, 0, 1.0);
        assert!(SparseEquationBuffer::merge([&buffer], 2, 2).is_err());
    }
}
