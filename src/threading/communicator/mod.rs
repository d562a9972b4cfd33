//! Transports for the work-cycle protocol.
//!
//! Every transport runs the same loop on each worker:
//!
//! 1. await the dispatch of this cycle's input
//! 2. leave the loop if the dispatch carries a stop request
//! 3. run the group's cycle handler (mandatory work, [`CycleControl::set_ready`],
//!    optional work until [`CycleControl::is_cycle_finished`])
//! 4. publish the result and go back to 1
//!
//! The coordinator drives the other side: [`Communicator::dispatch`], poll
//! [`Communicator::is_ready`], [`Communicator::finish_cycle`] and
//! [`Communicator::collect`].
//!
//! Three transports are provided:
//!
//! - [`SerialCommunicator`]: one worker run inline on the coordinator
//! - [`ThreadCommunicator`]: OS threads sharing memory, synchronized by barriers
//! - [`ProcessCommunicator`]: isolated worker ranks exchanging serialized frames

mod distributed;
mod serial;
mod shared;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::warn;

pub use distributed::ProcessCommunicator;
pub use serial::SerialCommunicator;
pub use shared::ThreadCommunicator;

use super::{TaskGroupData, TransferMode};
use crate::error::{Result, TwoportError};

/// Worker-side view of the cycle state.
pub trait CycleControl {
    /// Report that the mandatory phase is done.
    fn set_ready(&mut self) -> Result<()>;

    /// True once every worker is ready and the coordinator asked to finish.
    ///
    /// Stays true until the next dispatch.
    fn is_cycle_finished(&mut self) -> bool;
}

/// Runs one cycle of a task group on one worker: `(worker, input, control) -> output`.
pub type CycleHandler = Arc<dyn Fn(usize, TaskGroupData, &mut dyn CycleControl) -> TaskGroupData + Send + Sync>;

/// One worker slot: the group it serves, its index inside that group, and the
/// handler that runs its cycles.
#[derive(Clone)]
pub struct WorkerAssignment {
    pub group: usize,
    pub worker: usize,
    pub handler: CycleHandler,
}

impl std::fmt::Debug for WorkerAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAssignment")
            .field("group", &self.group)
            .field("worker", &self.worker)
            .finish()
    }
}

/// Coordinator side of a transport.
pub trait Communicator: Send {
    /// Number of workers this transport provides.
    fn worker_count(&self) -> usize;

    /// Whether workers can mutate task state in place.
    fn transfer_mode(&self) -> TransferMode;

    /// Start one worker per assignment for `group_count` task groups.
    ///
    /// Groups without an assignment still take part in the dispatch layout.
    fn run_workers(&mut self, group_count: usize, assignments: Vec<WorkerAssignment>) -> Result<()>;

    /// Send this cycle's inputs, indexed `[group][worker]`.
    fn dispatch(&mut self, data: Vec<Vec<TaskGroupData>>) -> Result<()>;

    /// True once every worker finished its mandatory phase.
    fn is_ready(&mut self) -> Result<bool>;

    /// Ask the workers to stop optional work and publish their results.
    fn finish_cycle(&mut self) -> Result<()>;

    /// Gather this cycle's outputs, indexed `[group][worker]`.
    fn collect(&mut self) -> Result<Vec<Vec<TaskGroupData>>>;

    /// Stop all workers and wait for them to exit. Idempotent.
    fn request_stop(&mut self) -> Result<()>;

    fn is_stop_requested(&self) -> bool;
}

/// Remembers whether the handler already signalled ready.
struct TrackedControl<'a> {
    inner: &'a mut dyn CycleControl,
    ready: bool,
}

impl CycleControl for TrackedControl<'_> {
    fn set_ready(&mut self) -> Result<()> {
        self.ready = true;
        self.inner.set_ready()
    }

    fn is_cycle_finished(&mut self) -> bool {
        self.inner.is_cycle_finished()
    }
}

/// Run one cycle of `assignment`, turning a panic into a reported failure.
///
/// A handler that panics before signalling ready is marked ready here, so the
/// coordinator never waits on it.
pub(crate) fn run_handler(
    assignment: &WorkerAssignment,
    input: TaskGroupData,
    control: &mut dyn CycleControl,
) -> TaskGroupData {
    let mut tracked = TrackedControl {
        inner: control,
        ready: false,
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        (assignment.handler)(assignment.worker, input, &mut tracked)
    }));
    match outcome {
        Ok(output) => output,
        Err(payload) => {
            if !tracked.ready {
                if let Err(e) = tracked.inner.set_ready() {
                    warn!("Worker {} could not signal ready: {}", assignment.worker, e);
                }
            }
            TaskGroupData {
                failure: Some(format!("worker panicked: {}", panic_message(payload.as_ref()))),
                ..TaskGroupData::default()
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Worker counts of `group_count` groups from a list of assignments.
pub(crate) fn group_sizes(group_count: usize, assignments: &[WorkerAssignment]) -> Result<Vec<usize>> {
    let mut sizes = vec![0; group_count];
    for assignment in assignments {
        let size = sizes.get_mut(assignment.group).ok_or_else(|| {
            TwoportError::misuse(format!(
                "assignment for group {} but only {} groups",
                assignment.group, group_count
            ))
        })?;
        *size = (*size).max(assignment.worker + 1);
    }
    Ok(sizes)
}

/// Check that dispatch data has one entry per assigned worker.
pub(crate) fn check_layout(sizes: &[usize], data: &[Vec<TaskGroupData>]) -> Result<()> {
    if data.len() != sizes.len() {
        return Err(TwoportError::DimensionMismatch {
            context: "dispatch groups",
            expected: sizes.len(),
            actual: data.len(),
        });
    }
    for (group, size) in data.iter().zip(sizes) {
        if group.len() != *size {
            return Err(TwoportError::DimensionMismatch {
                context: "dispatch workers",
                expected: *size,
                actual: group.len(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(group: usize, worker: usize) -> WorkerAssignment {
        WorkerAssignment {
            group,
            worker,
            handler: Arc::new(|_: usize, input: TaskGroupData, _: &mut dyn CycleControl| input),
        }
    }

    #[test]
    fn test_group_sizes_keep_groups_without_workers() {
        let sizes = group_sizes(3, &[assignment(0, 0), assignment(0, 1)]).unwrap();
        assert_eq!(sizes, vec![2, 0, 0]);
        let data = vec![vec![TaskGroupData::default(); 2], Vec::new(), Vec::new()];
        assert!(check_layout(&sizes, &data).is_ok());
    }

    #[derive(Default)]
    struct CountingControl {
        ready: usize,
    }

    impl CycleControl for CountingControl {
        fn set_ready(&mut self) -> Result<()> {
            self.ready += 1;
            Ok(())
        }

        fn is_cycle_finished(&mut self) -> bool {
            self.ready > 0
        }
    }

    #[test]
    fn test_panicking_handler_still_signals_ready() {
        let panicking = WorkerAssignment {
            group: 0,
            worker: 0,
            handler: Arc::new(|_: usize, _: TaskGroupData, _: &mut dyn CycleControl| -> TaskGroupData {
                panic!("boom")
            }),
        };
        let mut control = CountingControl::default();
        let output = run_handler(&panicking, TaskGroupData::default(), &mut control);
        assert_eq!(control.ready, 1);
        assert_eq!(output.failure.as_deref(), Some("worker panicked: boom"));
    }

    #[test]
    fn test_ready_is_signalled_once() {
        let late_panic = WorkerAssignment {
            group: 0,
            worker: 0,
            handler: Arc::new(|_: usize, _: TaskGroupData, control: &mut dyn CycleControl| -> TaskGroupData {
                control.set_ready().ok();
                panic!("{} after ready", "late")
            }),
        };
        let mut control = CountingControl::default();
        let output = run_handler(&late_panic, TaskGroupData::default(), &mut control);
        assert_eq!(control.ready, 1);
        assert_eq!(output.failure.as_deref(), Some("worker panicked: late after ready"));
    }

    #[test]
    fn test_group_sizes_reject_unknown_group() {
        assert!(matches!(
            group_sizes(1, &[assignment(1, 0)]),
            Err(TwoportError::Misuse { .. })
        ));
    }
}
