//! A task that measures how much optional time each worker gets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TwoportError};
use crate::threading::{Task, TaskData, TransferMode, WorkerLimits};

/// Optional-phase measurement of one worker for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SampleReport {
    pub worker: usize,
    pub rounds: usize,
    pub optional_time: Duration,
}

#[derive(Debug, Default)]
struct Timing {
    first: Option<Instant>,
    last: Option<Instant>,
    rounds: usize,
}

impl Timing {
    fn record(&mut self) {
        let now = Instant::now();
        self.first.get_or_insert(now);
        self.last = Some(now);
        self.rounds += 1;
    }

    /// Report and start over.
    fn take(&mut self, worker: usize) -> SampleReport {
        let optional_time = match (self.first, self.last) {
            (Some(first), Some(last)) => last.duration_since(first),
            _ => Duration::ZERO,
        };
        let report = SampleReport {
            worker,
            rounds: self.rounds,
            optional_time,
        };
        *self = Timing::default();
        report
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SampleOutput {
    echo: f64,
    report: SampleReport,
}

/// Its optional work never completes, so it runs until the cycle is finished.
///
/// With isolated workers the report travels with the mandatory output and
/// therefore describes the previous cycle.
#[derive(Debug)]
pub struct SampleTask {
    limits: WorkerLimits,
    workers: usize,
    transfer: TransferMode,
    timings: Vec<Mutex<Timing>>,
    reports: Arc<Mutex<Vec<SampleReport>>>,
}

impl Default for SampleTask {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleTask {
    pub fn new() -> Self {
        Self {
            limits: WorkerLimits::default(),
            workers: 0,
            transfer: TransferMode::InPlace,
            timings: Vec::new(),
            reports: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_limits(mut self, limits: WorkerLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Reports of the last received cycle, one per worker.
    pub fn last_reports(&self) -> Vec<SampleReport> {
        self.reports.lock().clone()
    }

    /// Shared handle on the reports, readable after the task moved into a pool.
    pub fn reports(&self) -> Arc<Mutex<Vec<SampleReport>>> {
        Arc::clone(&self.reports)
    }

    fn timing(&self, worker: usize) -> Result<&Mutex<Timing>> {
        self.timings.get(worker).ok_or(TwoportError::UnknownWorker {
            worker,
            count: self.workers,
        })
    }
}

impl Task for SampleTask {
    fn name(&self) -> &str {
        "sample"
    }

    fn limits(&self) -> WorkerLimits {
        self.limits
    }

    fn init(&mut self, worker_count: usize, transfer: TransferMode) -> Result<()> {
        self.workers = worker_count;
        self.transfer = transfer;
        self.timings = (0..worker_count).map(|_| Mutex::new(Timing::default())).collect();
        Ok(())
    }

    fn worker_count(&self) -> usize {
        self.workers
    }

    fn prepare_data_for_workers(&self) -> Result<Vec<TaskData>> {
        match self.transfer {
            TransferMode::InPlace => Ok(vec![TaskData::empty(); self.workers]),
            TransferMode::Serialized => (0..self.workers).map(|w| TaskData::encode(&(w as f64 * 2.13))).collect(),
        }
    }

    fn do_necessary_work(&self, worker: usize, input: TaskData) -> Result<TaskData> {
        let timing = self.timing(worker)?;
        match self.transfer {
            TransferMode::InPlace => {
                *timing.lock() = Timing::default();
                Ok(TaskData::empty())
            }
            TransferMode::Serialized => {
                let value: f64 = input.decode()?;
                let report = timing.lock().take(worker);
                TaskData::encode(&SampleOutput {
                    echo: value * 1.1,
                    report,
                })
            }
        }
    }

    fn do_optional_work(&self, worker: usize) -> bool {
        if let Some(timing) = self.timings.get(worker) {
            timing.lock().record();
        }
        false
    }

    fn use_data_from_workers(&self, outputs: Vec<TaskData>) -> Result<()> {
        let reports = match self.transfer {
            TransferMode::InPlace => self
                .timings
                .iter()
                .enumerate()
                .map(|(worker, timing)| timing.lock().take(worker))
                .collect(),
            TransferMode::Serialized => outputs
                .into_iter()
                .map(|data| data.decode::<SampleOutput>().map(|o| o.report))
                .collect::<Result<Vec<_>>>()?,
        };
        for report in &reports {
            info!(
                "Worker {}: {} optional rounds in {:?}",
                report.worker, report.rounds, report.optional_time
            );
        }
        *self.reports.lock() = reports;
        Ok(())
    }

    fn replicate(&self) -> Result<Box<dyn Task>> {
        Ok(Box::new(SampleTask::new().with_limits(self.limits)))
    }
}
