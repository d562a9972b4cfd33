//! Partitioned sparse equation systems.
//!
//! Every element of the network writes its equations into one of two twin
//! systems of the form `A·x + c`:
//!
//! - the **Dgl** system holds differential equations (`dx/dt = A·x + c`)
//! - the **Alg** system holds algebraic constraints (`0 = A·x + c`)
//!
//! Both systems go through the same lifecycle:
//!
//! ```text
//! registering --initialize--> initialized --partition_system--> steady state
//!   (rows are allocated)        (row count frozen)             (reset / add / read)
//! ```
//!
//! Rows are split into partitions. Each partition owns a [`SparseEquationBuffer`]
//! pair (A and c) so workers that own disjoint partitions can append their
//! triples concurrently. Reading the matrix merges all buffers once and memoizes
//! the result until the next write.

mod buffer;
mod group;
mod state_system;
mod types;

pub use buffer::SparseEquationBuffer;
pub use group::StateSystemGroup;
pub use state_system::StateSystem;
pub use types::{EquationRowSpan, EquationRows, SystemCopyInfo};

/// Number of non-zeros a fresh buffer is sized for.
pub const INITIAL_BUFFER_CAPACITY: usize = 1000;

/// Fixed slack added on top of the doubled capacity whenever a buffer grows.
pub const BUFFER_GROWTH_SLACK: usize = 500;
