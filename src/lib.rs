//! # Twoport Core
//!
//! Parallel equation assembly for electrical networks described as trees of
//! two-port elements.
//!
//! This library provides:
//! - An element tree whose elements write differential (Dgl) and algebraic
//!   (Alg) equations as linear forms over a shared state vector
//! - A partitioner that cuts the tree into subnetworks of similar size
//! - Row-partitioned sparse equation systems that several workers can fill
//!   at once
//! - A work-cycle protocol with shared-memory and distributed transports
//!
//! ## Architecture
//!
//! - [`network`] - Element tree, boundary proxies and the partitioner
//! - [`system`] - Partitioned sparse Dgl/Alg equation systems
//! - [`threading`] - Tasks, task groups, worker negotiation and transports
//! - [`simulation`] - Configuration and the coordinator-side driver
//!
//! ## Usage
//!
//! ```no_run
//! use nalgebra::DVector;
//! use twoport_core::network::{battery_pack, CellParameters};
//! use twoport_core::{Simulation, SimulationConfig, Transport};
//!
//! let network = battery_pack(4, 12, &CellParameters::default());
//! let config = SimulationConfig::new()
//!     .with_transport(Transport::Threads(4))
//!     .with_initial_current(20.0);
//! let mut simulation = Simulation::new(config, network)?;
//!
//! let state = DVector::zeros(simulation.state_count() + 1);
//! let report = simulation.step(state)?;
//! println!("U = {} V, {} non-zeros", report.root_voltage, report.dgl_nnz + report.alg_nnz);
//! # Ok::<(), twoport_core::TwoportError>(())
//! ```
//!
//! ## Work Cycle
//!
//! Each step the coordinator evaluates the current flowing into every
//! subnetwork and dispatches it. Each worker assembles the equations of its
//! subnetwork into its own row partition, then signals ready. Once all
//! workers are ready the coordinator finishes the cycle, collects the
//! results and writes the top-level equations that connect the subnetworks.

pub mod error;
pub mod network;
pub mod simulation;
pub mod system;
pub mod threading;

// Re-export main types for convenience
pub use error::{Result, TwoportError};
pub use network::{BoundaryProxy, NetworkPartitioner, Twoport};
pub use simulation::{Simulation, SimulationConfig, StepReport, Transport};
pub use system::{SparseEquationBuffer, StateSystem, StateSystemGroup};
pub use threading::{Task, TaskGroup, WorkerPool};

/// Default time step in seconds
pub const DEFAULT_TIME_STEP: f64 = 1e-3;
