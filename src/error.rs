//! Error types for the partitioned two-port simulation core.
//!
//! This module provides a unified error type [`TwoportError`] covering lifecycle
//! misuse, worker budget negotiation, out-of-range accesses and transport failures.
//! None of these are retried; they are propagated to the caller.

use thiserror::Error;

/// Result type alias using [`TwoportError`].
pub type Result<T> = std::result::Result<T, TwoportError>;

/// Unified error type for all two-port core operations.
#[derive(Error, Debug)]
pub enum TwoportError {
    // ============ Misuse Errors ============
    /// A setup step was repeated
    #[error("{what} is already initialized")]
    AlreadyInitialized { what: &'static str },

    /// An operation needs a setup step that has not happened yet
    #[error("{what} is not initialized")]
    NotInitialized { what: &'static str },

    /// New equation rows were requested after the row count was frozen
    #[error("Cannot register a new equation in {what} after initialization")]
    RegisterAfterInitialization { what: &'static str },

    /// Tasks can only be added before the group is initialized
    #[error("Cannot add task '{task}' to an initialized task group")]
    TaskGroupAlreadyInitialized { task: String },

    /// The worker pool was already started
    #[error("Workers are already running")]
    WorkersAlreadyRunning,

    /// Partitioning needs at least one subnetwork
    #[error("Invalid split count {requested}: at least one subnetwork is required")]
    InvalidSplitCount { requested: usize },

    /// Partition spans overlap, are unordered, or exceed the row count
    #[error("Invalid partition span [{start}, {end}) for {count} equations: {message}")]
    InvalidPartition {
        start: usize,
        end: usize,
        count: usize,
        message: String,
    },

    /// Any other lifecycle violation
    #[error("Misuse: {message}")]
    Misuse { message: String },

    // ============ Resource Budget Errors ============
    /// Worker budget is below the aggregate minimum
    #[error("{available} workers available but task groups need at least {required}")]
    TooFewWorkers { available: usize, required: usize },

    /// Worker budget exceeds the aggregate maximum
    #[error("{available} workers available but task groups accept at most {maximum}")]
    TooManyWorkers { available: usize, maximum: usize },

    // ============ Out-of-Range Errors ============
    /// Row index does not belong to any partition
    #[error("Equation row {row} is out of range ({count} equations)")]
    RowOutOfRange { row: usize, count: usize },

    /// A multi-row write would span two partitions
    #[error("Equation rows {first_row}..={last_row} cross a partition boundary")]
    PartitionBoundaryCrossed { first_row: usize, last_row: usize },

    /// Worker id without a matching subnetwork or slot
    #[error("Unknown worker {worker} ({count} workers assigned)")]
    UnknownWorker { worker: usize, count: usize },

    /// A dense vector or linear form has the wrong length
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    // ============ Transport Errors ============
    /// Failure of the underlying send/receive or payload encoding
    #[error("ErrorPassThrough in {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// A worker failed during its mandatory phase
    #[error("Worker {worker} of group {group} failed: {message}")]
    WorkerFailed {
        group: usize,
        worker: usize,
        message: String,
    },

    /// A task cannot be replicated into an isolated worker context
    #[error("Task '{task}' cannot be replicated for a distributed worker")]
    NotReplicable { task: String },

    // ============ Configuration Errors ============
    /// Invalid configuration value
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl TwoportError {
    /// Create a generic misuse error
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse {
            message: message.into(),
        }
    }

    /// Wrap a transport failure, keeping the original message
    pub fn transport(operation: &'static str, source: impl std::fmt::Display) -> Self {
        Self::Transport {
            operation,
            message: source.to_string(),
        }
    }

    /// Create an invalid partition error
    pub fn invalid_partition(start: usize, end: usize, count: usize, message: impl Into<String>) -> Self {
        Self::InvalidPartition {
            start,
            end,
            count,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
