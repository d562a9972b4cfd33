//! Units of repeating work and the payloads they exchange.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TwoportError};

/// How task data reaches the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Workers share memory with the coordinator and mutate task state in place.
    InPlace,
    /// Workers are isolated; everything crosses the boundary as a serialized payload.
    Serialized,
}

/// Opaque per-worker payload of one task for one cycle.
///
/// In-place tasks pass [`TaskData::empty`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskData(serde_json::Value);

impl TaskData {
    pub fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    /// Serialize `value` into a payload.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Self)
            .map_err(|e| TwoportError::transport("encode task data", e))
    }

    /// Deserialize the payload.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        serde_json::from_value(self.0).map_err(|e| TwoportError::transport("decode task data", e))
    }
}

/// Worker range a task can make use of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLimits {
    pub minimal: usize,
    pub maximal: usize,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            minimal: 1,
            maximal: usize::MAX,
        }
    }
}

impl WorkerLimits {
    pub fn new(minimal: usize, maximal: usize) -> Self {
        Self { minimal, maximal }
    }
}

/// A logical unit of work repeated every cycle.
///
/// The coordinator calls [`Task::prepare_data_for_workers`] before and
/// [`Task::use_data_from_workers`] after each cycle. Workers call
/// [`Task::do_necessary_work`] exactly once per cycle and then
/// [`Task::do_optional_work`] until the task reports completion or the
/// coordinator finishes the cycle.
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn limits(&self) -> WorkerLimits {
        WorkerLimits::default()
    }

    /// Set the task up for `worker_count` workers.
    fn init(&mut self, worker_count: usize, transfer: TransferMode) -> Result<()>;

    /// Number of workers that actually take part, at most the assigned count.
    fn worker_count(&self) -> usize;

    /// One input payload per participating worker.
    fn prepare_data_for_workers(&self) -> Result<Vec<TaskData>>;

    fn do_necessary_work(&self, worker: usize, input: TaskData) -> Result<TaskData>;

    /// Fill idle time; returns `true` once there is nothing left to do this cycle.
    fn do_optional_work(&self, _worker: usize) -> bool {
        true
    }

    /// Consume one output payload per participating worker.
    fn use_data_from_workers(&self, outputs: Vec<TaskData>) -> Result<()>;

    /// An independent, uninitialized copy for an isolated worker context.
    fn replicate(&self) -> Result<Box<dyn Task>> {
        Err(TwoportError::NotReplicable {
            task: self.name().to_string(),
        })
    }
}
