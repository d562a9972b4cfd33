//! Coordinator side of a simulation: configuration and the per-step cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;

use crate::error::{Result, TwoportError};
use crate::network::Twoport;
use crate::threading::{
    Communicator, DaeMonitor, DaeTask, ProcessCommunicator, SerialCommunicator, TaskGroup, ThreadCommunicator,
    WorkerPool,
};
use crate::DEFAULT_TIME_STEP;

/// Which transport runs the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// A single worker run inline on the coordinator.
    #[default]
    Serial,
    /// Shared-memory worker threads.
    Threads(usize),
    /// Isolated worker ranks exchanging serialized frames.
    Processes(usize),
}

impl Transport {
    pub fn worker_count(&self) -> usize {
        match self {
            Transport::Serial => 1,
            Transport::Threads(n) | Transport::Processes(n) => *n,
        }
    }

    /// One worker per available CPU.
    pub fn threads_per_cpu() -> Self {
        Transport::Threads(num_cpus::get())
    }

    /// Build the communicator for this transport.
    pub fn communicator(&self) -> Result<Box<dyn Communicator>> {
        if self.worker_count() == 0 {
            return Err(TwoportError::invalid_config("at least one worker is required"));
        }
        Ok(match *self {
            Transport::Serial => Box::new(SerialCommunicator::new()),
            Transport::Threads(n) => Box::new(ThreadCommunicator::new(n)),
            Transport::Processes(n) => Box::new(ProcessCommunicator::new(n)),
        })
    }
}

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub transport: Transport,
    /// Time step handed to the workers (seconds).
    pub dt: f64,
    /// Constant current drawn from the network root (amperes).
    pub initial_current: f64,
    /// Number of steps the CLI runs.
    pub steps: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Serial,
            dt: DEFAULT_TIME_STEP,
            initial_current: 0.0,
            steps: 1,
        }
    }
}

impl SimulationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    pub fn with_initial_current(mut self, current: f64) -> Self {
        self.initial_current = current;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(TwoportError::invalid_config(format!("time step must be positive, got {}", self.dt)));
        }
        if !self.initial_current.is_finite() {
            return Err(TwoportError::invalid_config("current must be finite"));
        }
        if self.transport.worker_count() == 0 {
            return Err(TwoportError::invalid_config("at least one worker is required"));
        }
        Ok(())
    }
}

/// What one step produced.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: usize,
    pub root_voltage: f64,
    pub root_power: f64,
    pub dgl_nnz: usize,
    pub alg_nnz: usize,
    pub elapsed: Duration,
}

/// Merged equation systems after a step.
#[derive(Debug, Clone)]
pub struct AssembledSystems {
    pub dgl_a: Arc<CsrMatrix<f64>>,
    pub dgl_c: Arc<CsrMatrix<f64>>,
    pub alg_a: Arc<CsrMatrix<f64>>,
    pub alg_c: Arc<CsrMatrix<f64>>,
}

/// A network under assembly by a worker pool.
///
/// Dropping the simulation stops its workers.
#[derive(Debug)]
pub struct Simulation {
    pool: WorkerPool,
    monitor: DaeMonitor,
    config: SimulationConfig,
    steps_done: usize,
}

impl Simulation {
    /// Partition `network` over the configured workers and start them.
    pub fn new(config: SimulationConfig, network: Twoport) -> Result<Self> {
        config.validate()?;
        let task = DaeTask::new(network, config.initial_current)?.with_dt(config.dt);
        let monitor = task.monitor();

        let mut pool = WorkerPool::new(config.transport.communicator()?);
        pool.add_task_group(TaskGroup::new().with_task(task)?)?;
        pool.create_and_run_workers()?;
        info!(
            "Simulation ready: {:?}, {} states",
            config.transport,
            monitor.systems().read().state_count()
        );

        Ok(Self {
            pool,
            monitor,
            config,
            steps_done: 0,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn state_count(&self) -> usize {
        self.monitor.systems().read().state_count()
    }

    /// The state vector the next step would use if none is given.
    pub fn state_vector(&self) -> DVector<f64> {
        self.monitor.systems().read().state_vector().clone()
    }

    /// Run one cycle at `state`: send, wait for ready, finish, receive.
    pub fn step(&mut self, state: DVector<f64>) -> Result<StepReport> {
        let started = Instant::now();
        self.monitor.systems().write().set_state_vector(state)?;

        self.pool.send_data_to_workers()?;
        self.pool.wait_until_ready()?;
        self.pool.receive_data_from_workers()?;

        let systems = self.assembled()?;
        let report = StepReport {
            step: self.steps_done,
            root_voltage: self.root_voltage()?,
            root_power: self.monitor.root_power().unwrap_or_default(),
            dgl_nnz: systems.dgl_a.nnz() + systems.dgl_c.nnz(),
            alg_nnz: systems.alg_a.nnz() + systems.alg_c.nnz(),
            elapsed: started.elapsed(),
        };
        debug!("Step {} took {:?}", report.step, report.elapsed);
        self.steps_done += 1;
        Ok(report)
    }

    /// Merged Dgl/Alg matrices of the last step.
    pub fn assembled(&self) -> Result<AssembledSystems> {
        let systems = self.monitor.systems().read();
        Ok(AssembledSystems {
            dgl_a: systems.dgl.equation_system_a_matrix()?,
            dgl_c: systems.dgl.equation_system_c_vector()?,
            alg_a: systems.alg.equation_system_a_matrix()?,
            alg_c: systems.alg.equation_system_c_vector()?,
        })
    }

    pub fn root_voltage(&self) -> Result<f64> {
        self.monitor
            .root_voltage()
            .ok_or(TwoportError::NotInitialized { what: "network root" })
    }

    /// Leaf elements per worker subnetwork.
    pub fn workload(&self) -> Vec<usize> {
        self.monitor.workload_indices()
    }
}
