//! One partitioned equation system (Dgl or Alg).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use nalgebra::RowDVector;
use nalgebra_sparse::CsrMatrix;
use parking_lot::Mutex;

use super::{EquationRowSpan, EquationRows, SparseEquationBuffer};
use crate::error::{Result, TwoportError};

/// A and c buffers of one partition.
#[derive(Debug, Default)]
struct PartitionBuffers {
    a: SparseEquationBuffer,
    c: SparseEquationBuffer,
}

/// A contiguous row range with its own buffers.
#[derive(Debug)]
struct Partition {
    span: EquationRowSpan,
    buffers: Mutex<PartitionBuffers>,
}

impl Partition {
    fn new(start: usize, end: usize) -> Self {
        Self {
            span: EquationRowSpan::between(start, end),
            buffers: Mutex::new(PartitionBuffers::default()),
        }
    }
}

/// Merged snapshot of all partitions.
#[derive(Debug)]
struct Snapshot {
    a: Arc<CsrMatrix<f64>>,
    c: Arc<CsrMatrix<f64>>,
}

/// A sparse equation system `A·x + c` whose rows are split into partitions.
///
/// Writes go through `&self`: each partition has its own buffers, and the
/// work-cycle protocol guarantees that only the worker owning a partition
/// writes into it, so the per-partition locks are never contended. Reads merge
/// all partitions and are only issued once every writer has quiesced.
#[derive(Debug)]
pub struct StateSystem {
    name: &'static str,
    equation_count: usize,
    state_count: usize,
    initialized: bool,
    partitions: Vec<Partition>,
    lookup: Vec<usize>,
    stale: AtomicBool,
    snapshot: Mutex<Option<Snapshot>>,
}

impl StateSystem {
    /// Create an empty system in the registering phase.
    ///
    /// The name only shows up in errors and log output.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            equation_count: 0,
            state_count: 0,
            initialized: false,
            partitions: Vec::new(),
            lookup: Vec::new(),
            stale: AtomicBool::new(true),
            snapshot: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Allocate the next equation row.
    pub fn get_new_equation(&mut self) -> Result<usize> {
        if self.initialized {
            return Err(TwoportError::RegisterAfterInitialization { what: self.name });
        }
        self.equation_count += 1;
        Ok(self.equation_count - 1)
    }

    pub fn equation_count(&self) -> usize {
        self.equation_count
    }

    /// Number of state columns of A (without the constant column).
    pub fn state_count(&self) -> usize {
        self.state_count
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Freeze the row count and install a single partition covering every row.
    pub fn initialize(&mut self, state_count: usize) -> Result<()> {
        if self.initialized {
            return Err(TwoportError::AlreadyInitialized { what: self.name });
        }
        self.state_count = state_count;
        self.initialized = true;
        self.partitions = vec![Partition::new(0, self.equation_count)];
        self.lookup = vec![0; self.equation_count];
        self.stale.store(true, Ordering::Release);
        Ok(())
    }

    /// Split the rows into the given spans.
    ///
    /// Gaps between spans (and the tail after the last span) become unassigned
    /// partitions of their own. Empty spans get no partition. Spans must be
    /// ordered and non-overlapping.
    pub fn partition_system(&mut self, spans: &[EquationRowSpan]) -> Result<()> {
        if !self.initialized {
            return Err(TwoportError::NotInitialized { what: self.name });
        }

        let count = self.equation_count;
        let mut partitions = Vec::with_capacity(2 * spans.len() + 1);
        let mut offset = 0;
        for span in spans {
            if span.first_row() < offset {
                return Err(TwoportError::invalid_partition(
                    span.first_row(),
                    span.end(),
                    count,
                    "spans overlap or are not ordered",
                ));
            }
            if span.end() > count {
                return Err(TwoportError::invalid_partition(
                    span.first_row(),
                    span.end(),
                    count,
                    "span exceeds the equation count",
                ));
            }
            if span.is_empty() {
                continue;
            }
            if span.first_row() > offset {
                partitions.push(Partition::new(offset, span.first_row()));
            }
            partitions.push(Partition::new(span.first_row(), span.end()));
            offset = span.end();
        }
        if offset < count {
            partitions.push(Partition::new(offset, count));
        }

        let mut lookup = vec![0; count];
        for (index, partition) in partitions.iter().enumerate() {
            for row in partition.span.first_row()..partition.span.end() {
                lookup[row] = index;
            }
        }

        debug!(
            "{} system: {} rows in {} partitions",
            self.name,
            count,
            partitions.len()
        );
        self.partitions = partitions;
        self.lookup = lookup;
        self.stale.store(true, Ordering::Release);
        Ok(())
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Partition index that owns `row`.
    pub fn partition_of(&self, row: usize) -> Option<usize> {
        self.lookup.get(row).copied()
    }

    /// Row span of the given partition.
    pub fn partition_span(&self, partition: usize) -> Option<EquationRowSpan> {
        self.partitions.get(partition).map(|p| p.span)
    }

    /// Clear every partition buffer.
    pub fn reset_system(&self) {
        for partition in &self.partitions {
            let mut buffers = partition.buffers.lock();
            buffers.a.clear();
            buffers.c.clear();
        }
        self.stale.store(true, Ordering::Release);
    }

    /// Write one equation given as a linear form over the state vector.
    ///
    /// The form has `state_count + 1` entries; the last one is the constant term.
    pub fn add_equations(&self, row: usize, form: &RowDVector<f64>) -> Result<()> {
        let partition = self.route(row, 1)?;
        if form.len() != self.state_count + 1 {
            return Err(TwoportError::DimensionMismatch {
                context: "equation form",
                expected: self.state_count + 1,
                actual: form.len(),
            });
        }

        let values = form.as_slice();
        let mut buffers = partition.buffers.lock();
        buffers.a.extend_from_row(row, &values[..self.state_count]);
        let constant = values[self.state_count];
        if constant != 0.0 {
            buffers.c.push(row, 0, constant);
        }
        drop(buffers);
        self.stale.store(true, Ordering::Release);
        Ok(())
    }

    /// Write a block of rows starting at `first_row`, with A and c given separately.
    pub fn add_equation_rows(&self, first_row: usize, rows: &EquationRows) -> Result<()> {
        if rows.row_count == 0 {
            return Ok(());
        }
        let partition = self.route(first_row, rows.row_count)?;
        if let Some(&(row, _, _)) = rows.a.iter().find(|(row, _, _)| *row >= rows.row_count) {
            return Err(TwoportError::RowOutOfRange {
                row: first_row + row,
                count: self.equation_count,
            });
        }
        if let Some(&(_, col, _)) = rows.a.iter().find(|(_, col, _)| *col >= self.state_count) {
            return Err(TwoportError::DimensionMismatch {
                context: "equation block columns",
                expected: self.state_count,
                actual: col + 1,
            });
        }
        if let Some(&(row, _)) = rows.c.iter().find(|(row, _)| *row >= rows.row_count) {
            return Err(TwoportError::RowOutOfRange {
                row: first_row + row,
                count: self.equation_count,
            });
        }

        let mut buffers = partition.buffers.lock();
        buffers.a.extend_from_triplets(first_row, &rows.a);
        for &(row, value) in &rows.c {
            buffers.c.push(first_row + row, 0, value);
        }
        drop(buffers);
        self.stale.store(true, Ordering::Release);
        Ok(())
    }

    /// The merged A matrix (`equation_count x state_count`).
    pub fn equation_system_a_matrix(&self) -> Result<Arc<CsrMatrix<f64>>> {
        self.with_snapshot(|s| Arc::clone(&s.a))
    }

    /// The merged c vector as an `equation_count x 1` sparse matrix.
    pub fn equation_system_c_vector(&self) -> Result<Arc<CsrMatrix<f64>>> {
        self.with_snapshot(|s| Arc::clone(&s.c))
    }

    /// Copy the rows of `span` out of the merged system, relative to the span start.
    pub fn extract_rows(&self, span: EquationRowSpan) -> Result<EquationRows> {
        if span.end() > self.equation_count {
            return Err(TwoportError::RowOutOfRange {
                row: span.end() - 1,
                count: self.equation_count,
            });
        }
        let a = self.equation_system_a_matrix()?;
        let c = self.equation_system_c_vector()?;

        let mut rows = EquationRows {
            row_count: span.len(),
            ..EquationRows::default()
        };
        for row in span.first_row()..span.end() {
            let relative = row - span.first_row();
            let a_row = a.row(row);
            for (&col, &value) in a_row.col_indices().iter().zip(a_row.values()) {
                rows.a.push((relative, col, value));
            }
            for &value in c.row(row).values() {
                rows.c.push((relative, value));
            }
        }
        Ok(rows)
    }

    /// Look up the partition for `row_count` rows starting at `row`.
    fn route(&self, row: usize, row_count: usize) -> Result<&Partition> {
        if !self.initialized {
            return Err(TwoportError::NotInitialized { what: self.name });
        }
        let last = row
            .checked_add(row_count.saturating_sub(1))
            .ok_or(TwoportError::RowOutOfRange {
                row,
                count: self.equation_count,
            })?;
        let index = self
            .lookup
            .get(row)
            .copied()
            .ok_or(TwoportError::RowOutOfRange {
                row,
                count: self.equation_count,
            })?;
        let last_index = self
            .lookup
            .get(last)
            .copied()
            .ok_or(TwoportError::RowOutOfRange {
                row: last,
                count: self.equation_count,
            })?;
        if index != last_index {
            return Err(TwoportError::PartitionBoundaryCrossed {
                first_row: row,
                last_row: last,
            });
        }
        self.partitions
            .get(index)
            .ok_or(TwoportError::RowOutOfRange {
                row,
                count: self.equation_count,
            })
    }

    fn with_snapshot<T>(&self, read: impl FnOnce(&Snapshot) -> T) -> Result<T> {
        if !self.initialized {
            return Err(TwoportError::NotInitialized { what: self.name });
        }
        let mut snapshot = self.snapshot.lock();
        if self.stale.swap(false, Ordering::AcqRel) || snapshot.is_none() {
            let guards: Vec<_> = self.partitions.iter().map(|p| p.buffers.lock()).collect();
            let a = SparseEquationBuffer::merge(
                guards.iter().map(|g| &g.a),
                self.equation_count,
                self.state_count,
            )?;
            let c = SparseEquationBuffer::merge(guards.iter().map(|g| &g.c), self.equation_count, 1)?;
            *snapshot = Some(Snapshot {
                a: Arc::new(a),
                c: Arc::new(c),
            });
        }
        match snapshot.as_ref() {
            Some(s) => Ok(read(s)),
            None => Err(TwoportError::NotInitialized { what: self.name }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn registered(rows: usize) -> StateSystem {
        let mut system = StateSystem::new("Dgl");
        for _ in 0..rows {
            system.get_new_equation().unwrap();
        }
        system
    }

    fn value(matrix: &CsrMatrix<f64>, row: usize, col: usize) -> f64 {
        matrix
            .triplet_iter()
            .filter(|(r, c, _)| *r == row && *c == col)
            .map(|(_, _, v)| *v)
            .sum()
    }

    #[test]
    fn test_register_after_initialize_fails() {
        let mut system = registered(3);
        system.initialize(3).unwrap();
        let err = system.get_new_equation().unwrap_err();
        assert!(matches!(err, TwoportError::RegisterAfterInitialization { .. }));
        assert_eq!(system.equation_count(), 3);
    }

    #[test]
    fn test_double_initialize_fails() {
        let mut system = registered(2);
        system.initialize(2).unwrap();
        assert!(matches!(
            system.initialize(2),
            Err(TwoportError::AlreadyInitialized { .. })
        ));
    }

    #[test]
    fn test_add_before_initialize_rejected() {
        let system = registered(2);
        let form = RowDVector::from_row_slice(&[1.0, 0.0, 0.0]);
        assert!(matches!(
            system.add_equations(0, &form),
            Err(TwoportError::NotInitialized { .. })
        ));
    }

    #[test]
    fn test_partition_before_initialize_rejected() {
        let mut system = registered(2);
        assert!(system.partition_system(&[EquationRowSpan::new(0, 1)]).is_err());
    }

    #[test]
    fn test_partitions_fill_gaps() {
        let mut system = registered(10);
        system.initialize(10).unwrap();
        system
            .partition_system(&[EquationRowSpan::new(2, 3), EquationRowSpan::new(5, 0), EquationRowSpan::new(6, 2)])
            .unwrap();

        // [0,2) gap, [2,5), [5,6) gap, [6,8), [8,10) tail
        assert_eq!(system.partition_count(), 5);
        assert_eq!(system.partition_of(0), Some(0));
        assert_eq!(system.partition_of(4), Some(1));
        assert_eq!(system.partition_of(5), Some(2));
        assert_eq!(system.partition_of(7), Some(3));
        assert_eq!(system.partition_of(9), Some(4));
        assert_eq!(system.partition_of(10), None);
    }

    #[test]
    fn test_overlapping_spans_rejected() {
        let mut system = registered(6);
        system.initialize(6).unwrap();
        let result = system.partition_system(&[EquationRowSpan::new(0, 4), EquationRowSpan::new(3, 2)]);
        assert!(matches!(result, Err(TwoportError::InvalidPartition { .. })));
    }

    #[test]
    fn test_row_out_of_range() {
        let mut system = registered(2);
        system.initialize(2).unwrap();
        let form = RowDVector::from_row_slice(&[1.0, 0.0, 0.0]);
        assert!(matches!(
            system.add_equations(2, &form),
            Err(TwoportError::RowOutOfRange { row: 2, count: 2 })
        ));
    }

    #[test]
    fn test_block_past_address_space_rejected() {
        let mut system = registered(2);
        system.initialize(2).unwrap();
        let rows = EquationRows {
            row_count: 2,
            a: vec![(0, 0, 1.0)],
            c: Vec::new(),
        };
        assert!(matches!(
            system.add_equation_rows(usize::MAX, &rows),
            Err(TwoportError::RowOutOfRange { row: usize::MAX, count: 2 })
        ));
    }

    #[test]
    fn test_add_and_read_back() {
        let mut system = registered(3);
        system.initialize(3).unwrap();
        system.partition_system(&[EquationRowSpan::new(1, 1)]).unwrap();

        system
            .add_equations(0, &RowDVector::from_row_slice(&[2.0, 0.0, 0.0, 1.5]))
            .unwrap();
        system
            .add_equations(1, &RowDVector::from_row_slice(&[0.0, -1.0, 3.0, 0.0]))
            .unwrap();

        let a = system.equation_system_a_matrix().unwrap();
        let c = system.equation_system_c_vector().unwrap();
        assert_eq!(a.nrows(), 3);
        assert_eq!(a.ncols(), 3);
        assert_relative_eq!(value(&a, 0, 0), 2.0);
        assert_relative_eq!(value(&a, 1, 1), -1.0);
        assert_relative_eq!(value(&a, 1, 2), 3.0);
        assert_relative_eq!(value(&c, 0, 0), 1.5);
        assert_eq!(c.nnz(), 1);
    }

    #[test]
    fn test_snapshot_memoized_until_write() {
        let mut system = registered(2);
        system.initialize(2).unwrap();
        system
            .add_equations(0, &RowDVector::from_row_slice(&[1.0, 0.0, 0.0]))
            .unwrap();

        let first = system.equation_system_a_matrix().unwrap();
        let second = system.equation_system_a_matrix().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        system
            .add_equations(1, &RowDVector::from_row_slice(&[0.0, 1.0, 0.0]))
            .unwrap();
        let third = system.equation_system_a_matrix().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.nnz(), 2);
    }

    #[test]
    fn test_reset_clears_buffers() {
        let mut system = registered(1);
        system.initialize(1).unwrap();
        system
            .add_equations(0, &RowDVector::from_row_slice(&[1.0, 1.0]))
            .unwrap();
        system.reset_system();
        assert_eq!(system.equation_system_a_matrix().unwrap().nnz(), 0);
        assert_eq!(system.equation_system_c_vector().unwrap().nnz(), 0);
    }

    #[test]
    fn test_block_write_cannot_cross_partitions() {
        let mut system = registered(4);
        system.initialize(4).unwrap();
        system.partition_system(&[EquationRowSpan::new(0, 2)]).unwrap();
        let rows = EquationRows {
            row_count: 3,
            a: vec![(0, 0, 1.0)],
            c: Vec::new(),
        };
        assert!(matches!(
            system.add_equation_rows(0, &rows),
            Err(TwoportError::PartitionBoundaryCrossed { .. })
        ));
    }

    #[test]
    fn test_extract_rows_round_trips_through_offset() {
        let mut source = registered(4);
        source.initialize(4).unwrap();
        source
            .add_equations(2, &RowDVector::from_row_slice(&[0.0, 5.0, 0.0, 1.0, -2.0]))
            .unwrap();
        source
            .add_equations(3, &RowDVector::from_row_slice(&[1.0, 0.0, 0.0, 0.0, 0.0]))
            .unwrap();

        let rows = source.extract_rows(EquationRowSpan::new(2, 2)).unwrap();
        assert_eq!(rows.row_count, 2);
        assert_eq!(rows.a.len(), 3);
        assert_eq!(rows.c, vec![(0, -2.0)]);

        let mut target = registered(4);
        target.initialize(4).unwrap();
        target.partition_system(&[EquationRowSpan::new(2, 2)]).unwrap();
        target.add_equation_rows(2, &rows).unwrap();
        let a = target.equation_system_a_matrix().unwrap();
        assert_relative_eq!(value(&a, 2, 1), 5.0);
        assert_relative_eq!(value(&a, 2, 3), 1.0);
        assert_relative_eq!(value(&a, 3, 0), 1.0);
        let c = target.equation_system_c_vector().unwrap();
        assert_relative_eq!(value(&c, 2, 0), -2.0);
    }
}
