//! Repeating work cycles over a pool of workers.
//!
//! A [`Task`] is split into a mandatory phase that every participating worker
//! runs once per cycle and an optional phase that fills the time until the
//! coordinator finishes the cycle. Tasks sharing workers form a [`TaskGroup`];
//! the [`WorkerPool`] splits the worker budget over the groups and drives the
//! cycles through a [`Communicator`].
//!
//! ```text
//! coordinator                         worker
//! -----------                         ------
//! send_data_to_workers  ──dispatch──▶ do_necessary_work
//!                       ◀──ready───── set_ready
//! (own work)                          do_optional_work ...
//! receive_data_from_workers ─finish─▶ (optional work stops)
//!                       ◀──collect─── outputs
//! use_data_from_workers
//! ```

pub mod communicator;
mod pool;
mod task;
mod task_group;
pub mod tasks;

pub use communicator::{
    Communicator, CycleControl, CycleHandler, ProcessCommunicator, SerialCommunicator, ThreadCommunicator,
    WorkerAssignment,
};
pub use pool::{assign_workers, WorkerPool};
pub use task::{Task, TaskData, TransferMode, WorkerLimits};
pub use task_group::{TaskGroup, TaskGroupData};
pub use tasks::{DaeMonitor, DaeTask, SampleReport, SampleTask};
