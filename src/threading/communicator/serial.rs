//! Single-worker transport without threads.

use log::debug;

use super::{check_layout, group_sizes, run_handler, Communicator, CycleControl, WorkerAssignment};
use crate::error::{Result, TwoportError};
use crate::threading::{TaskGroupData, TransferMode};

/// The coordinator finishes right after the mandatory phase, so optional work is skipped.
#[derive(Debug, Default)]
struct InlineControl {
    ready: bool,
}

impl CycleControl for InlineControl {
    fn set_ready(&mut self) -> Result<()> {
        self.ready = true;
        Ok(())
    }

    fn is_cycle_finished(&mut self) -> bool {
        self.ready
    }
}

/// Runs the single worker inline during [`Communicator::dispatch`].
#[derive(Debug, Default)]
pub struct SerialCommunicator {
    assignment: Option<WorkerAssignment>,
    layout: Vec<usize>,
    outputs: Option<Vec<Vec<TaskGroupData>>>,
    started: bool,
    stopped: bool,
}

impl SerialCommunicator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Communicator for SerialCommunicator {
    fn worker_count(&self) -> usize {
        1
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::InPlace
    }

    fn run_workers(&mut self, group_count: usize, mut assignments: Vec<WorkerAssignment>) -> Result<()> {
        if self.started {
            return Err(TwoportError::WorkersAlreadyRunning);
        }
        if assignments.len() > 1 {
            return Err(TwoportError::TooManyWorkers {
                available: assignments.len(),
                maximum: 1,
            });
        }
        self.layout = group_sizes(group_count, &assignments)?;
        self.assignment = assignments.pop();
        self.started = true;
        Ok(())
    }

    fn dispatch(&mut self, data: Vec<Vec<TaskGroupData>>) -> Result<()> {
        if !self.started {
            return Err(TwoportError::NotInitialized { what: "serial worker" });
        }
        if self.stopped {
            return Err(TwoportError::misuse("dispatch after the worker was stopped"));
        }
        check_layout(&self.layout, &data)?;

        let mut outputs: Vec<Vec<TaskGroupData>> = data;
        if let Some(assignment) = &self.assignment {
            let input = std::mem::take(&mut outputs[assignment.group][assignment.worker]);
            let mut control = InlineControl::default();
            outputs[assignment.group][assignment.worker] = run_handler(assignment, input, &mut control);
        }
        debug!("Ran serial cycle");
        self.outputs = Some(outputs);
        Ok(())
    }

    fn is_ready(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn finish_cycle(&mut self) -> Result<()> {
        Ok(())
    }

    fn collect(&mut self) -> Result<Vec<Vec<TaskGroupData>>> {
        self.outputs
            .take()
            .ok_or_else(|| TwoportError::misuse("collect without a dispatched cycle"))
    }

    fn request_stop(&mut self) -> Result<()> {
        self.stopped = true;
        self.assignment = None;
        Ok(())
    }

    fn is_stop_requested(&self) -> bool {
        self.stopped
    }
}
