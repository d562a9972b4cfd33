//! Worker negotiation and cycle driving.

use std::sync::Arc;

use crossbeam::utils::Backoff;
use log::{debug, info, warn};

use super::communicator::{Communicator, WorkerAssignment};
use super::task_group::cycle_handler;
use super::{TaskGroup, TransferMode, WorkerLimits};
use crate::error::{Result, TwoportError};

/// Split `total` workers over groups with the given limits.
///
/// Minimums are satisfied first, round-robin; the remaining workers are then
/// handed out round-robin up to each maximum. Fails when the budget is below
/// the summed minimums, or above the summed maximums when those are bounded.
pub fn assign_workers(total: usize, limits: &[WorkerLimits]) -> Result<Vec<usize>> {
    let required = limits.iter().fold(0usize, |acc, l| acc.saturating_add(l.minimal));
    if total < required {
        return Err(TwoportError::TooFewWorkers {
            available: total,
            required,
        });
    }
    let maximum = limits.iter().fold(0usize, |acc, l| acc.saturating_add(l.maximal));
    if maximum != 0 && maximum != usize::MAX && total > maximum {
        return Err(TwoportError::TooManyWorkers {
            available: total,
            maximum,
        });
    }

    let mut assigned = vec![0usize; limits.len()];
    let mut left = total;
    for pass in [Pass::Minimal, Pass::Maximal] {
        let bound = |l: &WorkerLimits| match pass {
            Pass::Minimal => l.minimal,
            Pass::Maximal => l.maximal,
        };
        while left > 0 && assigned.iter().zip(limits).any(|(a, l)| *a < bound(l)) {
            for (count, limit) in assigned.iter_mut().zip(limits) {
                if left == 0 {
                    break;
                }
                if *count < bound(limit) {
                    *count += 1;
                    left -= 1;
                }
            }
        }
    }
    if left > 0 {
        debug!("{} workers left unassigned", left);
    }
    Ok(assigned)
}

#[derive(Clone, Copy)]
enum Pass {
    Minimal,
    Maximal,
}

/// Owns the task groups and the transport that runs them.
///
/// Dropping the pool stops the workers.
pub struct WorkerPool {
    communicator: Box<dyn Communicator>,
    pending: Vec<TaskGroup>,
    groups: Vec<Arc<TaskGroup>>,
    arrangement: Vec<usize>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.communicator.worker_count())
            .field("pending", &self.pending)
            .field("groups", &self.groups)
            .field("arrangement", &self.arrangement)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(communicator: Box<dyn Communicator>) -> Self {
        Self {
            communicator,
            pending: Vec::new(),
            groups: Vec::new(),
            arrangement: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.groups.is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.communicator.worker_count()
    }

    /// Workers assigned per group, empty until the workers run.
    pub fn arrangement(&self) -> &[usize] {
        &self.arrangement
    }

    pub fn task_groups(&self) -> &[Arc<TaskGroup>] {
        &self.groups
    }

    pub fn add_task_group(&mut self, group: TaskGroup) -> Result<()> {
        if self.is_running() {
            return Err(TwoportError::WorkersAlreadyRunning);
        }
        self.pending.push(group);
        Ok(())
    }

    /// Negotiate the worker split, initialize every group and start the workers.
    pub fn create_and_run_workers(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(TwoportError::WorkersAlreadyRunning);
        }
        if self.pending.is_empty() {
            return Err(TwoportError::misuse("no task groups to run"));
        }

        let limits: Vec<WorkerLimits> = self
            .pending
            .iter()
            .map(|g| WorkerLimits::new(g.minimal_workers(), g.maximal_workers()))
            .collect();
        let arrangement = assign_workers(self.communicator.worker_count(), &limits)?;
        info!("Worker arrangement: {:?}", arrangement);

        let transfer = self.communicator.transfer_mode();
        let mut groups = Vec::with_capacity(self.pending.len());
        let mut assignments = Vec::new();
        for (index, (mut group, &count)) in self.pending.drain(..).zip(&arrangement).enumerate() {
            group.init(index, count, transfer)?;
            let group = Arc::new(group);
            for worker in 0..count {
                let handler = match transfer {
                    TransferMode::InPlace => cycle_handler(Arc::clone(&group)),
                    TransferMode::Serialized => cycle_handler(Arc::new(group.replicate()?)),
                };
                assignments.push(WorkerAssignment {
                    group: index,
                    worker,
                    handler,
                });
            }
            groups.push(group);
        }

        self.communicator.run_workers(groups.len(), assignments)?;
        self.groups = groups;
        self.arrangement = arrangement;
        Ok(())
    }

    /// Dispatch the next cycle.
    pub fn send_data_to_workers(&mut self) -> Result<()> {
        let data = self
            .groups
            .iter()
            .map(|g| g.prepare_data())
            .collect::<Result<Vec<_>>>()?;
        self.communicator.dispatch(data)
    }

    /// Non-blocking: true once every worker left its mandatory phase.
    pub fn is_ready_for_receive(&mut self) -> Result<bool> {
        self.communicator.is_ready()
    }

    /// Spin, then yield, until [`WorkerPool::is_ready_for_receive`] holds.
    pub fn wait_until_ready(&mut self) -> Result<()> {
        let backoff = Backoff::new();
        while !self.is_ready_for_receive()? {
            backoff.snooze();
        }
        Ok(())
    }

    /// Finish the cycle, gather the outputs and hand them to the groups.
    pub fn receive_data_from_workers(&mut self) -> Result<()> {
        self.communicator.finish_cycle()?;
        let outputs = self.communicator.collect()?;
        for (group, data) in self.groups.iter().zip(outputs) {
            group.use_data(data)?;
        }
        Ok(())
    }

    /// One full cycle without any coordinator work in between.
    pub fn run_cycle(&mut self) -> Result<()> {
        self.send_data_to_workers()?;
        self.wait_until_ready()?;
        self.receive_data_from_workers()
    }

    /// Stop the workers. Safe to call more than once.
    pub fn stop(&mut self) -> Result<()> {
        self.communicator.request_stop()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(e) = self.communicator.request_stop() {
            warn!("Stopping workers failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threading::{ProcessCommunicator, SerialCommunicator, Task, TaskData, ThreadCommunicator};
    use parking_lot::Mutex;

    fn limits(pairs: &[(usize, usize)]) -> Vec<WorkerLimits> {
        pairs.iter().map(|&(min, max)| WorkerLimits::new(min, max)).collect()
    }

    #[test]
    fn test_assign_exact_minimums() {
        let assigned = assign_workers(5, &limits(&[(2, 2), (3, 3)])).unwrap();
        assert_eq!(assigned, vec![2, 3]);
    }

    #[test]
    fn test_assign_below_minimum_fails() {
        let result = assign_workers(4, &limits(&[(2, 2), (3, 3)]));
        assert!(matches!(
            result,
            Err(TwoportError::TooFewWorkers {
                available: 4,
                required: 5
            })
        ));
    }

    #[test]
    fn test_assign_above_bounded_maximum_fails() {
        let result = assign_workers(7, &limits(&[(1, 2), (1, 3)]));
        assert!(matches!(result, Err(TwoportError::TooManyWorkers { maximum: 5, .. })));
    }

    #[test]
    fn test_assign_round_robin_up_to_maximum() {
        let assigned = assign_workers(6, &limits(&[(1, 2), (1, usize::MAX), (1, usize::MAX)])).unwrap();
        assert_eq!(assigned, vec![2, 2, 2]);

        let assigned = assign_workers(8, &limits(&[(1, 2), (1, usize::MAX), (1, usize::MAX)])).unwrap();
        assert_eq!(assigned, vec![2, 3, 3]);
    }

    #[test]
    fn test_assign_unbounded_takes_everything() {
        let assigned = assign_workers(16, &limits(&[(1, usize::MAX)])).unwrap();
        assert_eq!(assigned, vec![16]);
    }

    /// Adds one to its input and records what it saw.
    struct Increment {
        workers: usize,
        limits: WorkerLimits,
        seen: Mutex<Vec<usize>>,
    }

    impl Increment {
        fn new() -> Self {
            Self {
                workers: 0,
                limits: WorkerLimits::default(),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn idle() -> Self {
            Self {
                limits: WorkerLimits::new(0, 0),
                ..Self::new()
            }
        }
    }

    impl Task for Increment {
        fn name(&self) -> &str {
            "increment"
        }

        fn limits(&self) -> WorkerLimits {
            self.limits
        }

        fn init(&mut self, worker_count: usize, _transfer: TransferMode) -> Result<()> {
            self.workers = worker_count;
            Ok(())
        }

        fn worker_count(&self) -> usize {
            self.workers
        }

        fn prepare_data_for_workers(&self) -> Result<Vec<TaskData>> {
            (0..self.workers).map(|w| TaskData::encode(&(w * 100))).collect()
        }

        fn do_necessary_work(&self, _worker: usize, input: TaskData) -> Result<TaskData> {
            let value: usize = input.decode()?;
            TaskData::encode(&(value + 1))
        }

        fn use_data_from_workers(&self, outputs: Vec<TaskData>) -> Result<()> {
            let mut seen = self.seen.lock();
            seen.clear();
            for output in outputs {
                seen.push(output.decode()?);
            }
            Ok(())
        }

        fn replicate(&self) -> Result<Box<dyn Task>> {
            Ok(Box::new(Increment {
                limits: self.limits,
                ..Increment::new()
            }))
        }
    }

    fn run_pool(communicator: Box<dyn Communicator>) -> WorkerPool {
        let mut pool = WorkerPool::new(communicator);
        pool.add_task_group(TaskGroup::new().with_task(Increment::new()).unwrap())
            .unwrap();
        pool.create_and_run_workers().unwrap();
        for _ in 0..3 {
            pool.run_cycle().unwrap();
        }
        pool
    }

    #[test]
    fn test_pool_runs_serial_cycles() {
        let pool = run_pool(Box::new(SerialCommunicator::new()));
        assert_eq!(pool.arrangement(), &[1]);
    }

    #[test]
    fn test_pool_runs_thread_cycles() {
        let pool = run_pool(Box::new(ThreadCommunicator::new(3)));
        assert_eq!(pool.arrangement(), &[3]);
    }

    #[test]
    fn test_pool_runs_process_cycles() {
        let mut pool = run_pool(Box::new(ProcessCommunicator::new(2)));
        assert_eq!(pool.arrangement(), &[2]);
        pool.stop().unwrap();
        pool.stop().unwrap();
    }

    #[test]
    fn test_trailing_group_without_workers_is_dispatched() {
        let communicators: Vec<Box<dyn Communicator>> = vec![
            Box::new(SerialCommunicator::new()),
            Box::new(ThreadCommunicator::new(2)),
            Box::new(ProcessCommunicator::new(2)),
        ];
        for communicator in communicators {
            let workers = communicator.worker_count();
            let mut pool = WorkerPool::new(communicator);
            pool.add_task_group(TaskGroup::new().with_task(Increment::new()).unwrap())
                .unwrap();
            pool.add_task_group(TaskGroup::new().with_task(Increment::idle()).unwrap())
                .unwrap();
            pool.create_and_run_workers().unwrap();
            assert_eq!(pool.arrangement(), &[workers, 0]);
            for _ in 0..2 {
                pool.run_cycle().unwrap();
            }
            pool.stop().unwrap();
        }
    }

    #[test]
    fn test_add_group_while_running_fails() {
        let mut pool = run_pool(Box::new(ThreadCommunicator::new(2)));
        let result = pool.add_task_group(TaskGroup::new());
        assert!(matches!(result, Err(TwoportError::WorkersAlreadyRunning)));
        assert!(matches!(
            pool.create_and_run_workers(),
            Err(TwoportError::WorkersAlreadyRunning)
        ));
    }

    /// Fails on worker 1 every cycle.
    struct FailOnOne(usize);

    impl Task for FailOnOne {
        fn name(&self) -> &str {
            "fail-on-one"
        }

        fn init(&mut self, worker_count: usize, _transfer: TransferMode) -> Result<()> {
            self.0 = worker_count;
            Ok(())
        }

        fn worker_count(&self) -> usize {
            self.0
        }

        fn prepare_data_for_workers(&self) -> Result<Vec<TaskData>> {
            Ok(vec![TaskData::empty(); self.0])
        }

        fn do_necessary_work(&self, worker: usize, input: TaskData) -> Result<TaskData> {
            if worker == 1 {
                return Err(TwoportError::misuse("worker one refuses"));
            }
            Ok(input)
        }

        fn use_data_from_workers(&self, _outputs: Vec<TaskData>) -> Result<()> {
            Ok(())
        }

        fn replicate(&self) -> Result<Box<dyn Task>> {
            Ok(Box::new(FailOnOne(0)))
        }
    }

    #[test]
    fn test_worker_failure_surfaces_without_deadlock() {
        let communicators: Vec<Box<dyn Communicator>> =
            vec![Box::new(ThreadCommunicator::new(2)), Box::new(ProcessCommunicator::new(2))];
        for communicator in communicators {
            let mut pool = WorkerPool::new(communicator);
            pool.add_task_group(TaskGroup::new().with_task(FailOnOne(0)).unwrap())
                .unwrap();
            pool.create_and_run_workers().unwrap();
            for _ in 0..2 {
                let result = pool.run_cycle();
                match result {
                    Err(TwoportError::WorkerFailed { group, worker, message }) => {
                        assert_eq!((group, worker), (0, 1));
                        assert!(message.contains("refuses"));
                    }
                    other => panic!("expected a worker failure, got {:?}", other),
                }
            }
            pool.stop().unwrap();
        }
    }

    #[test]
    fn test_cycle_after_stop_fails() {
        let mut pool = run_pool(Box::new(ThreadCommunicator::new(2)));
        pool.stop().unwrap();
        assert!(pool.run_cycle().is_err());
    }

    #[test]
    fn test_not_replicable_task_rejected_for_processes() {
        struct Local;
        impl Task for Local {
            fn name(&self) -> &str {
                "local"
            }
            fn init(&mut self, _: usize, _: TransferMode) -> Result<()> {
                Ok(())
            }
            fn worker_count(&self) -> usize {
                1
            }
            fn prepare_data_for_workers(&self) -> Result<Vec<TaskData>> {
                Ok(vec![TaskData::empty()])
            }
            fn do_necessary_work(&self, _: usize, input: TaskData) -> Result<TaskData> {
                Ok(input)
            }
            fn use_data_from_workers(&self, _: Vec<TaskData>) -> Result<()> {
                Ok(())
            }
        }

        let mut pool = WorkerPool::new(Box::new(ProcessCommunicator::new(1)));
        pool.add_task_group(TaskGroup::new().with_task(Local).unwrap()).unwrap();
        assert!(matches!(
            pool.create_and_run_workers(),
            Err(TwoportError::NotReplicable { .. })
        ));
    }
}
