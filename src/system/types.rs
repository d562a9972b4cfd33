//! Row-range bookkeeping shared by the equation systems and the boundary proxies.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A contiguous range of equation rows claimed by one subnetwork.
///
/// Stored as a first row plus a row count so that an empty span starting at
/// row 0 has no negative last row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EquationRowSpan {
    first_row: usize,
    row_count: usize,
}

impl EquationRowSpan {
    /// Create a span covering `first_row..first_row + row_count`.
    pub fn new(first_row: usize, row_count: usize) -> Self {
        Self {
            first_row,
            row_count,
        }
    }

    /// Build the span between the row counter before and after a registration pass.
    pub fn between(count_before: usize, count_after: usize) -> Self {
        Self::new(count_before, count_after.saturating_sub(count_before))
    }

    pub fn first_row(&self) -> usize {
        self.first_row
    }

    /// Last row of the span (inclusive), `None` if the span is empty.
    pub fn last_row(&self) -> Option<usize> {
        if self.row_count == 0 {
            None
        } else {
            Some(self.first_row + self.row_count - 1)
        }
    }

    /// One past the last row.
    pub fn end(&self) -> usize {
        self.first_row + self.row_count
    }

    pub fn len(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn contains(&self, row: usize) -> bool {
        row >= self.first_row && row < self.end()
    }
}

impl fmt::Display for EquationRowSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_row() {
            Some(last) => write!(f, "[{}..={}]", self.first_row, last),
            None => write!(f, "[empty@{}]", self.first_row),
        }
    }
}

/// The Dgl and Alg row spans captured by a boundary proxy during `set_system`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemCopyInfo {
    pub dgl: EquationRowSpan,
    pub alg: EquationRowSpan,
}

/// A block of equation rows in coordinate form, rows relative to the block start.
///
/// This is how a distributed worker ships its rows of the A matrix and the c
/// vector back to the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquationRows {
    pub row_count: usize,
    /// `(row, column, value)` entries of A
    pub a: Vec<(usize, usize, f64)>,
    /// `(row, value)` entries of c
    pub c: Vec<(usize, f64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_between_counts() {
        let span = EquationRowSpan::between(3, 7);
        assert_eq!(span.first_row(), 3);
        assert_eq!(span.last_row(), Some(6));
        assert_eq!(span.end(), 7);
        assert!(span.contains(6));
        assert!(!span.contains(7));
    }

    #[test]
    fn test_empty_span_at_zero() {
        let span = EquationRowSpan::between(0, 0);
        assert!(span.is_empty());
        assert_eq!(span.last_row(), None);
        assert!(!span.contains(0));
        assert_eq!(span.to_string(), "[empty@0]");
    }
}
