//! Tasks sharing one worker allocation.

use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::communicator::{CycleControl, CycleHandler};
use super::{Task, TaskData, TransferMode};
use crate::error::{Result, TwoportError};

/// Everything one worker of a group receives or returns in one cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGroupData {
    /// Set on the final dispatch; the worker exits instead of working.
    pub stop: bool,
    /// One payload per task of the group.
    pub tasks: Vec<TaskData>,
    /// Mandatory-phase failure of this worker, reported instead of results.
    pub failure: Option<String>,
}

impl TaskGroupData {
    pub fn stop() -> Self {
        Self {
            stop: true,
            ..Self::default()
        }
    }
}

/// An ordered list of tasks served by the same workers.
#[derive(Default)]
pub struct TaskGroup {
    tasks: Vec<Box<dyn Task>>,
    index: usize,
    worker_count: usize,
    initialized: bool,
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("tasks", &self.tasks.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("index", &self.index)
            .field("worker_count", &self.worker_count)
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. The group takes ownership of it.
    pub fn add_task(&mut self, task: Box<dyn Task>) -> Result<()> {
        if self.initialized {
            return Err(TwoportError::TaskGroupAlreadyInitialized {
                task: task.name().to_string(),
            });
        }
        self.tasks.push(task);
        Ok(())
    }

    /// Builder-style [`TaskGroup::add_task`].
    pub fn with_task(mut self, task: impl Task + 'static) -> Result<Self> {
        self.add_task(Box::new(task))?;
        Ok(self)
    }

    pub fn tasks(&self) -> &[Box<dyn Task>] {
        &self.tasks
    }

    /// Largest minimum over the tasks: the tasks share the workers.
    pub fn minimal_workers(&self) -> usize {
        self.tasks.iter().map(|t| t.limits().minimal).max().unwrap_or(0)
    }

    /// Largest maximum over the tasks.
    pub fn maximal_workers(&self) -> usize {
        self.tasks.iter().map(|t| t.limits().maximal).max().unwrap_or(0)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Assign `worker_count` workers and initialize every task with its share.
    pub fn init(&mut self, index: usize, worker_count: usize, transfer: TransferMode) -> Result<()> {
        if self.initialized {
            return Err(TwoportError::AlreadyInitialized { what: "task group" });
        }
        for task in &mut self.tasks {
            let assigned = worker_count.min(task.limits().maximal);
            task.init(assigned, transfer)?;
            debug!(
                "Task '{}' of group {}: {} assigned, {} used",
                task.name(),
                index,
                assigned,
                task.worker_count()
            );
        }
        self.index = index;
        self.worker_count = worker_count;
        self.initialized = true;
        info!("Task group {} runs {} tasks on {} workers", index, self.tasks.len(), worker_count);
        Ok(())
    }

    /// An independent, initialized copy for an isolated worker context.
    pub fn replicate(&self) -> Result<TaskGroup> {
        let mut replica = TaskGroup::new();
        for task in &self.tasks {
            replica.add_task(task.replicate()?)?;
        }
        replica.init(self.index, self.worker_count, TransferMode::Serialized)?;
        Ok(replica)
    }

    /// Collect every task's inputs into one payload per worker.
    pub fn prepare_data(&self) -> Result<Vec<TaskGroupData>> {
        let mut data: Vec<TaskGroupData> = (0..self.worker_count)
            .map(|_| TaskGroupData {
                tasks: vec![TaskData::empty(); self.tasks.len()],
                ..TaskGroupData::default()
            })
            .collect();

        for (slot, task) in self.tasks.iter().enumerate() {
            let inputs = task.prepare_data_for_workers()?;
            if inputs.len() != task.worker_count() {
                return Err(TwoportError::DimensionMismatch {
                    context: "task inputs",
                    expected: task.worker_count(),
                    actual: inputs.len(),
                });
            }
            for (worker, input) in inputs.into_iter().enumerate() {
                let target = data.get_mut(worker).ok_or(TwoportError::UnknownWorker {
                    worker,
                    count: self.worker_count,
                })?;
                target.tasks[slot] = input;
            }
        }
        Ok(data)
    }

    /// Run one cycle as `worker`: mandatory work, ready, optional work.
    ///
    /// Never fails: a mandatory-phase error is carried in the returned data so
    /// that the worker still signals ready and the cycle completes.
    pub fn run_cycle(&self, worker: usize, mut input: TaskGroupData, control: &mut dyn CycleControl) -> TaskGroupData {
        input.tasks.resize(self.tasks.len(), TaskData::empty());

        let mut pending = Vec::with_capacity(self.tasks.len());
        let mut failure = None;
        for (slot, task) in self.tasks.iter().enumerate() {
            if worker >= task.worker_count() {
                continue;
            }
            let data = std::mem::take(&mut input.tasks[slot]);
            match task.do_necessary_work(worker, data) {
                Ok(output) => input.tasks[slot] = output,
                Err(e) => {
                    failure = Some(format!("task '{}': {}", task.name(), e));
                    break;
                }
            }
            pending.push(slot);
        }

        if let Err(e) = control.set_ready() {
            failure.get_or_insert_with(|| e.to_string());
        }

        if failure.is_none() {
            let mut cursor = 0;
            while !pending.is_empty() && !control.is_cycle_finished() {
                cursor %= pending.len();
                if self.tasks[pending[cursor]].do_optional_work(worker) {
                    pending.remove(cursor);
                } else {
                    cursor += 1;
                }
            }
        }

        input.failure = failure;
        input
    }

    /// Hand the workers' outputs back to the tasks.
    pub fn use_data(&self, outputs: Vec<TaskGroupData>) -> Result<()> {
        if let Some((worker, message)) = outputs
            .iter()
            .enumerate()
            .find_map(|(w, o)| o.failure.as_ref().map(|m| (w, m.clone())))
        {
            return Err(TwoportError::WorkerFailed {
                group: self.index,
                worker,
                message,
            });
        }

        let mut per_task: Vec<Vec<TaskData>> = vec![Vec::new(); self.tasks.len()];
        for output in outputs {
            for (slot, data) in output.tasks.into_iter().enumerate().take(self.tasks.len()) {
                per_task[slot].push(data);
            }
        }
        for (task, mut data) in self.tasks.iter().zip(per_task) {
            data.truncate(task.worker_count());
            task.use_data_from_workers(data)?;
        }
        Ok(())
    }
}

/// Cycle handler running `group` on whichever worker calls it.
pub(crate) fn cycle_handler(group: Arc<TaskGroup>) -> CycleHandler {
    Arc::new(move |worker, input, control| group.run_cycle(worker, input, control))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threading::WorkerLimits;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        limits: WorkerLimits,
        workers: usize,
        optional_rounds: usize,
        optional_calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl Counting {
        fn new(name: &'static str, minimal: usize, maximal: usize) -> Self {
            Self {
                name,
                limits: WorkerLimits::new(minimal, maximal),
                workers: 0,
                optional_rounds: 2,
                optional_calls: AtomicUsize::new(0),
                fail_on: None,
            }
        }
    }

    impl Task for Counting {
        fn name(&self) -> &str {
            self.name
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
            (0..self.workers).map(|w| TaskData::encode(&w)).collect()
        }

        fn do_necessary_work(&self, worker: usize, input: TaskData) -> Result<TaskData> {
            if self.fail_on == Some(worker) {
                return Err(TwoportError::misuse("boom"));
            }
            let value: usize = input.decode()?;
            TaskData::encode(&(value * 10))
        }

        fn do_optional_work(&self, _worker: usize) -> bool {
            let calls = self.optional_calls.fetch_add(1, Ordering::SeqCst) + 1;
            calls >= self.optional_rounds
        }

        fn use_data_from_workers(&self, outputs: Vec<TaskData>) -> Result<()> {
            assert_eq!(outputs.len(), self.workers);
            Ok(())
        }
    }

    struct AlwaysReady {
        ready: bool,
        finished: bool,
    }

    impl CycleControl for AlwaysReady {
        fn set_ready(&mut self) -> Result<()> {
            self.ready = true;
            Ok(())
        }

        fn is_cycle_finished(&mut self) -> bool {
            self.finished
        }
    }

    #[test]
    fn test_aggregates_are_max_not_sum() {
        let group = TaskGroup::new()
            .with_task(Counting::new("a", 2, 4))
            .unwrap()
            .with_task(Counting::new("b", 3, 3))
            .unwrap();
        assert_eq!(group.minimal_workers(), 3);
        assert_eq!(group.maximal_workers(), 4);
    }

    #[test]
    fn test_add_after_init_fails() {
        let mut group = TaskGroup::new().with_task(Counting::new("a", 1, 2)).unwrap();
        group.init(0, 2, TransferMode::InPlace).unwrap();
        let result = group.add_task(Box::new(Counting::new("b", 1, 1)));
        assert!(matches!(result, Err(TwoportError::TaskGroupAlreadyInitialized { .. })));
    }

    #[test]
    fn test_init_clamps_to_task_maximum() {
        let mut group = TaskGroup::new()
            .with_task(Counting::new("wide", 1, 8))
            .unwrap()
            .with_task(Counting::new("narrow", 1, 2))
            .unwrap();
        group.init(0, 5, TransferMode::InPlace).unwrap();
        assert_eq!(group.tasks()[0].worker_count(), 5);
        assert_eq!(group.tasks()[1].worker_count(), 2);

        let data = group.prepare_data().unwrap();
        assert_eq!(data.len(), 5);
        assert!(!data[4].tasks[0].is_empty());
        assert!(data[4].tasks[1].is_empty());
    }

    #[test]
    fn test_run_cycle_skips_tasks_without_worker_slot() {
        let mut group = TaskGroup::new()
            .with_task(Counting::new("wide", 1, 3))
            .unwrap()
            .with_task(Counting::new("narrow", 1, 1))
            .unwrap();
        group.init(0, 3, TransferMode::InPlace).unwrap();
        let input = group.prepare_data().unwrap().remove(2);

        let mut control = AlwaysReady {
            ready: false,
            finished: false,
        };
        let output = group.run_cycle(2, input, &mut control);
        assert!(control.ready);
        assert!(output.failure.is_none());
        let value: usize = output.tasks[0].clone().decode().unwrap();
        assert_eq!(value, 20);
        assert!(output.tasks[1].is_empty());
    }

    #[test]
    fn test_optional_work_stops_when_finished() {
        let mut task = Counting::new("a", 1, 1);
        task.optional_rounds = usize::MAX;
        let mut group = TaskGroup::new().with_task(task).unwrap();
        group.init(0, 1, TransferMode::InPlace).unwrap();
        let input = group.prepare_data().unwrap().remove(0);

        let mut control = AlwaysReady {
            ready: false,
            finished: true,
        };
        group.run_cycle(0, input, &mut control);
        assert!(control.ready);
    }

    #[test]
    fn test_failure_still_signals_ready() {
        let mut task = Counting::new("a", 1, 2);
        task.fail_on = Some(1);
        let mut group = TaskGroup::new().with_task(task).unwrap();
        group.init(0, 2, TransferMode::InPlace).unwrap();
        let mut inputs = group.prepare_data().unwrap();

        let mut control = AlwaysReady {
            ready: false,
            finished: false,
        };
        let output = group.run_cycle(1, inputs.remove(1), &mut control);
        assert!(control.ready);
        assert!(output.failure.as_deref().unwrap_or("").contains("boom"));

        let ok = group.run_cycle(0, inputs.remove(0), &mut control);
        let result = group.use_data(vec![ok, output]);
        assert!(matches!(result, Err(TwoportError::WorkerFailed { worker: 1, .. })));
    }
}
