//! Element trees and their partitioning.
//!
//! A network is a tree of [`Twoport`]s: ohmic resistances and capacitances as
//! leaves, serial and parallel connections as composites. Every element
//! describes its current and voltage as linear forms over the state vector
//! and writes its differential or algebraic equations into a
//! [`StateSystemGroup`](crate::system::StateSystemGroup).
//!
//! For parallel evaluation the [`NetworkPartitioner`] cuts the tree into
//! subnetworks of similar size and replaces each one by a [`BoundaryProxy`].

mod builder;
mod elements;
mod partitioner;
mod proxy;
mod twoport;

pub use builder::{battery_pack, CellParameters};
pub use elements::{Capacitance, Composite, CompositeKind, Resistor};
pub use partitioner::{NetworkPartitioner, PartitionedNetwork};
pub use proxy::BoundaryProxy;
pub use twoport::{ElectricalState, TreePath, Twoport};
