//! Shared-memory transport: one OS thread per worker, two reusable barriers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::{check_layout, group_sizes, run_handler, Communicator, CycleControl, WorkerAssignment};
use crate::error::{Result, TwoportError};
use crate::threading::{TaskGroupData, TransferMode};

#[derive(Debug, Default)]
struct Slot {
    input: Option<TaskGroupData>,
    output: Option<TaskGroupData>,
}

/// State shared by the coordinator and every worker thread.
#[derive(Debug)]
struct CycleState {
    total: usize,
    ready: AtomicUsize,
    finish: AtomicBool,
    stop: AtomicBool,
    dispatch: Barrier,
    collect: Barrier,
    slots: Vec<Mutex<Slot>>,
}

impl CycleState {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) == self.total
    }
}

struct SharedControl<'a> {
    state: &'a CycleState,
}

impl CycleControl for SharedControl<'_> {
    fn set_ready(&mut self) -> Result<()> {
        self.state.ready.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn is_cycle_finished(&mut self) -> bool {
        self.state.finish.load(Ordering::Acquire) && self.state.is_ready()
    }
}

/// Worker threads that mutate task state in place.
///
/// Inputs and outputs travel through per-worker slots without copying; the
/// dispatch and collect barriers order every access.
#[derive(Debug)]
pub struct ThreadCommunicator {
    worker_count: usize,
    state: Option<Arc<CycleState>>,
    handles: Vec<JoinHandle<()>>,
    layout: Vec<usize>,
    /// Slot index per `[group][worker]`
    slot_of: Vec<Vec<usize>>,
    in_cycle: bool,
    stopped: bool,
}

impl ThreadCommunicator {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            state: None,
            handles: Vec::new(),
            layout: Vec::new(),
            slot_of: Vec::new(),
            in_cycle: false,
            stopped: false,
        }
    }

    fn state(&self) -> Result<&Arc<CycleState>> {
        self.state.as_ref().ok_or(TwoportError::NotInitialized {
            what: "worker threads",
        })
    }
}

impl Communicator for ThreadCommunicator {
    fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::InPlace
    }

    fn run_workers(&mut self, group_count: usize, assignments: Vec<WorkerAssignment>) -> Result<()> {
        if self.state.is_some() || self.stopped {
            return Err(TwoportError::WorkersAlreadyRunning);
        }
        if assignments.len() > self.worker_count {
            return Err(TwoportError::TooManyWorkers {
                available: assignments.len(),
                maximum: self.worker_count,
            });
        }

        let total = assignments.len();
        let state = Arc::new(CycleState {
            total,
            ready: AtomicUsize::new(0),
            finish: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            dispatch: Barrier::new(total + 1),
            collect: Barrier::new(total + 1),
            slots: (0..total).map(|_| Mutex::new(Slot::default())).collect(),
        });

        self.layout = group_sizes(group_count, &assignments)?;
        self.slot_of = self.layout.iter().map(|&n| vec![0; n]).collect();
        for (slot, assignment) in assignments.iter().enumerate() {
            self.slot_of[assignment.group][assignment.worker] = slot;
        }

        let mut starts = Vec::with_capacity(total);
        for (slot, assignment) in assignments.into_iter().enumerate() {
            match spawn_worker(Arc::clone(&state), slot, assignment) {
                Ok((handle, start)) => {
                    self.handles.push(handle);
                    starts.push(start);
                }
                Err(e) => {
                    // Dropping the start senders lets the spawned threads exit
                    drop(starts);
                    for handle in self.handles.drain(..) {
                        if handle.join().is_err() {
                            warn!("Worker thread panicked before starting");
                        }
                    }
                    return Err(e);
                }
            }
        }
        for start in &starts {
            start
                .send(())
                .map_err(|e| TwoportError::transport("start worker thread", e))?;
        }

        info!("Started {} worker threads", total);
        self.state = Some(state);
        Ok(())
    }

    fn dispatch(&mut self, data: Vec<Vec<TaskGroupData>>) -> Result<()> {
        check_layout(&self.layout, &data)?;
        let state = Arc::clone(self.state()?);
        if self.stopped {
            return Err(TwoportError::misuse("dispatch after the workers were stopped"));
        }
        if self.in_cycle {
            return Err(TwoportError::misuse("dispatch before the previous cycle was collected"));
        }
        for (group, inputs) in data.into_iter().enumerate() {
            for (worker, input) in inputs.into_iter().enumerate() {
                state.slots[self.slot_of[group][worker]].lock().input = Some(input);
            }
        }
        self.in_cycle = true;
        state.dispatch.wait();
        Ok(())
    }

    fn is_ready(&mut self) -> Result<bool> {
        Ok(self.state()?.is_ready())
    }

    fn finish_cycle(&mut self) -> Result<()> {
        self.state()?.finish.store(true, Ordering::Release);
        Ok(())
    }

    fn collect(&mut self) -> Result<Vec<Vec<TaskGroupData>>> {
        let state = Arc::clone(self.state()?);
        if !self.in_cycle {
            return Err(TwoportError::misuse("collect without a dispatched cycle"));
        }
        state.collect.wait();
        self.in_cycle = false;
        state.ready.store(0, Ordering::Release);
        state.finish.store(false, Ordering::Release);

        let outputs = self
            .slot_of
            .iter()
            .map(|slots| {
                slots
                    .iter()
                    .map(|&slot| state.slots[slot].lock().output.take().unwrap_or_default())
                    .collect()
            })
            .collect();
        debug!("Collected cycle results from {} workers", state.total);
        Ok(outputs)
    }

    fn request_stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let Some(state) = self.state.clone() else {
            return Ok(());
        };

        if self.in_cycle {
            self.finish_cycle()?;
            self.collect()?;
        }
        state.stop.store(true, Ordering::Release);
        state.dispatch.wait();

        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(TwoportError::transport(
                "join worker threads",
                format!("{} worker threads panicked", panicked),
            ));
        }
        info!("Stopped {} worker threads", state.total);
        Ok(())
    }

    fn is_stop_requested(&self) -> bool {
        self.stopped
    }
}

impl Drop for ThreadCommunicator {
    fn drop(&mut self) {
        if let Err(e) = self.request_stop() {
            warn!("Stopping worker threads failed: {}", e);
        }
    }
}

/// Spawn a worker thread that enters its loop once the returned sender fires.
///
/// If the sender is dropped instead, the thread exits without touching the barriers.
fn spawn_worker(
    state: Arc<CycleState>,
    slot: usize,
    assignment: WorkerAssignment,
) -> Result<(JoinHandle<()>, Sender<()>)> {
    let (start_tx, start_rx) = bounded::<()>(1);
    let handle = thread::Builder::new()
        .name(format!("twoport-g{}-w{}", assignment.group, assignment.worker))
        .spawn(move || {
            if start_rx.recv().is_ok() {
                worker_loop(&state, slot, assignment);
            }
        })
        .map_err(|e| TwoportError::transport("spawn worker thread", e))?;
    Ok((handle, start_tx))
}

fn worker_loop(state: &CycleState, slot: usize, assignment: WorkerAssignment) {
    loop {
        state.dispatch.wait();
        if state.stop.load(Ordering::Acquire) {
            break;
        }

        let input = state.slots[slot].lock().input.take().unwrap_or_default();
        let mut control = SharedControl { state };
        let output = run_handler(&assignment, input, &mut control);
        state.slots[slot].lock().output = Some(output);

        state.collect.wait();
    }
    debug!("Worker {} of group {} exits", assignment.worker, assignment.group);
}
