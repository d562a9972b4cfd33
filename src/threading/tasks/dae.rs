//! Equation assembly of a partitioned network as a cycle task.
//!
//! Every cycle the coordinator evaluates each subnetwork's current at the
//! present state, the workers write their subnetworks' equations, and the
//! coordinator adds the top-level equations and evaluates the whole tree.

use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::{DVector, RowDVector};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TwoportError};
use crate::network::{BoundaryProxy, NetworkPartitioner, PartitionedNetwork, Twoport};
use crate::system::{EquationRows, StateSystemGroup};
use crate::threading::{Task, TaskData, TransferMode, WorkerLimits};

/// Input of one worker in serialized mode.
#[derive(Debug, Serialize, Deserialize)]
struct SubnetworkInput {
    current: f64,
    state_vector: Vec<f64>,
    dt: f64,
}

/// Output of one worker in serialized mode.
#[derive(Debug, Serialize, Deserialize)]
struct SubnetworkOutput {
    voltage: Vec<f64>,
    dgl: EquationRows,
    alg: EquationRows,
    observables: Vec<f64>,
}

/// Read access to the network and systems of a [`DaeTask`] after it moved into a pool.
#[derive(Debug, Clone)]
pub struct DaeMonitor {
    systems: Arc<RwLock<StateSystemGroup>>,
    root: Arc<Mutex<Option<Twoport>>>,
    workload: Arc<Mutex<Vec<usize>>>,
}

impl DaeMonitor {
    pub fn systems(&self) -> &Arc<RwLock<StateSystemGroup>> {
        &self.systems
    }

    /// Run `read` against the partitioned root, if the task is initialized.
    pub fn with_root<T>(&self, read: impl FnOnce(&Twoport) -> T) -> Option<T> {
        self.root.lock().as_ref().map(read)
    }

    pub fn root_voltage(&self) -> Option<f64> {
        self.with_root(Twoport::voltage_value)
    }

    pub fn root_power(&self) -> Option<f64> {
        self.with_root(Twoport::power_value)
    }

    /// Leaf element count per subnetwork, empty before initialization.
    pub fn workload_indices(&self) -> Vec<usize> {
        self.workload.lock().clone()
    }
}

/// Assembles the Dgl/Alg equations of a network, one subnetwork per worker.
pub struct DaeTask {
    /// Unpartitioned network, serialized; replicas are rebuilt from it.
    blueprint: Vec<u8>,
    initial_current: f64,
    limits: WorkerLimits,
    pending: Option<Twoport>,
    root: Arc<Mutex<Option<Twoport>>>,
    proxies: Vec<BoundaryProxy>,
    workload: Arc<Mutex<Vec<usize>>>,
    systems: Arc<RwLock<StateSystemGroup>>,
    transfer: TransferMode,
    worker_count: usize,
}

impl std::fmt::Debug for DaeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaeTask")
            .field("initial_current", &self.initial_current)
            .field("limits", &self.limits)
            .field("transfer", &self.transfer)
            .field("worker_count", &self.worker_count)
            .field("proxies", &self.proxies.len())
            .finish()
    }
}

impl DaeTask {
    /// Take ownership of `network`; it is partitioned on [`Task::init`].
    pub fn new(network: Twoport, initial_current: f64) -> Result<Self> {
        let blueprint =
            serde_json::to_vec(&network).map_err(|e| TwoportError::transport("serialize network", e))?;
        Ok(Self {
            blueprint,
            initial_current,
            limits: WorkerLimits::default(),
            pending: Some(network),
            root: Arc::new(Mutex::new(None)),
            proxies: Vec::new(),
            workload: Arc::new(Mutex::new(Vec::new())),
            systems: Arc::new(RwLock::new(StateSystemGroup::new())),
            transfer: TransferMode::InPlace,
            worker_count: 0,
        })
    }

    fn from_blueprint(blueprint: &[u8], initial_current: f64, limits: WorkerLimits) -> Result<Self> {
        let network: Twoport =
            serde_json::from_slice(blueprint).map_err(|e| TwoportError::transport("deserialize network", e))?;
        Ok(Self::new(network, initial_current)?.with_limits(limits))
    }

    pub fn with_limits(mut self, limits: WorkerLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Time step handed to the workers with every cycle.
    pub fn with_dt(self, dt: f64) -> Self {
        self.systems.write().set_dt(dt);
        self
    }

    pub fn monitor(&self) -> DaeMonitor {
        DaeMonitor {
            systems: Arc::clone(&self.systems),
            root: Arc::clone(&self.root),
            workload: Arc::clone(&self.workload),
        }
    }

    pub fn proxies(&self) -> &[BoundaryProxy] {
        &self.proxies
    }

    /// Leaf element count per subnetwork.
    pub fn workload_indices(&self) -> Vec<usize> {
        self.workload.lock().clone()
    }

    fn proxy(&self, worker: usize) -> Result<&BoundaryProxy> {
        self.proxies.get(worker).ok_or(TwoportError::UnknownWorker {
            worker,
            count: self.proxies.len(),
        })
    }

    /// Mandatory work on shared state: the subnetwork writes straight into its partitions.
    fn assemble_in_place(&self, worker: usize) -> Result<TaskData> {
        let proxy = self.proxy(worker)?;
        let systems = self.systems.read();
        proxy.calculate_state_dependent_values_of_subnetwork(systems.state_vector());
        proxy.apply_cached_current();
        proxy.calc_subnetwork_voltage(&systems)?;
        Ok(TaskData::empty())
    }

    /// Mandatory work on a replica: assemble locally and ship the rows back.
    fn assemble_serialized(&self, worker: usize, input: TaskData) -> Result<TaskData> {
        let proxy = self.proxy(worker)?;
        let input: SubnetworkInput = input.decode()?;
        {
            let mut systems = self.systems.write();
            systems.set_state_vector(DVector::from_vec(input.state_vector))?;
            systems.set_dt(input.dt);
            systems.reset_system();
        }

        let systems = self.systems.read();
        proxy.calculate_state_dependent_values_of_subnetwork(systems.state_vector());
        let mut observables = Vec::new();
        proxy.save_observable_data(&mut observables);
        proxy.set_subnetwork_current(input.current);
        let voltage = proxy.subnetwork_voltage(&systems)?;

        let info = proxy.system_copy_info();
        TaskData::encode(&SubnetworkOutput {
            voltage: voltage.iter().copied().collect(),
            dgl: systems.dgl.extract_rows(info.dgl)?,
            alg: systems.alg.extract_rows(info.alg)?,
            observables,
        })
    }

    /// Merge the rows and observable values a replica sent back.
    fn merge_worker_output(&self, systems: &StateSystemGroup, proxy: &BoundaryProxy, data: TaskData) -> Result<()> {
        let output: SubnetworkOutput = data.decode()?;
        let info = proxy.system_copy_info();
        systems.dgl.add_equation_rows(info.dgl.first_row(), &output.dgl)?;
        systems.alg.add_equation_rows(info.alg.first_row(), &output.alg)?;

        if output.voltage.len() != systems.form_len() {
            return Err(TwoportError::DimensionMismatch {
                context: "subnetwork voltage",
                expected: systems.form_len(),
                actual: output.voltage.len(),
            });
        }
        proxy.set_voltage(RowDVector::from_vec(output.voltage));

        let mut observables = output.observables;
        proxy.load_observable_data(&mut observables)
    }
}

impl Task for DaeTask {
    fn name(&self) -> &str {
        "dae"
    }

    fn limits(&self) -> WorkerLimits {
        self.limits
    }

    fn init(&mut self, worker_count: usize, transfer: TransferMode) -> Result<()> {
        let network = self.pending.take().ok_or(TwoportError::AlreadyInitialized { what: "dae task" })?;
        if worker_count == 0 {
            return Err(TwoportError::InvalidSplitCount { requested: 0 });
        }

        let partitioned = NetworkPartitioner::partition(network, worker_count)?;
        *self.workload.lock() = partitioned.workload();
        let PartitionedNetwork { mut root, proxies, .. } = partitioned;
        if proxies.len() < worker_count {
            warn!(
                "Task 'dae' uses {} of {} assigned workers",
                proxies.len(),
                worker_count
            );
        }

        {
            let mut systems = self.systems.write();
            root.set_system(&mut systems)?;
            systems.initialize()?;
            if transfer == TransferMode::InPlace {
                let dgl: Vec<_> = proxies.iter().map(|p| p.system_copy_info().dgl).collect();
                let alg: Vec<_> = proxies.iter().map(|p| p.system_copy_info().alg).collect();
                systems.dgl.partition_system(&dgl)?;
                systems.alg.partition_system(&alg)?;
            }
            root.set_initial_current(self.initial_current, &systems)?;
            root.update_state_system_group(&systems)?;

            info!(
                "Task 'dae': {} states ({} Dgl, {} Alg) over {} subnetworks",
                systems.state_count(),
                systems.dgl.equation_count(),
                systems.alg.equation_count(),
                proxies.len()
            );
        }

        self.transfer = transfer;
        self.worker_count = proxies.len();
        self.proxies = proxies;
        *self.root.lock() = Some(root);
        debug!("Subnetwork workload: {:?}", self.workload.lock());
        Ok(())
    }

    fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn prepare_data_for_workers(&self) -> Result<Vec<TaskData>> {
        let systems = self.systems.read();
        systems.reset_system();
        for proxy in &self.proxies {
            proxy.refresh_current(systems.state_vector());
        }

        match self.transfer {
            TransferMode::InPlace => Ok(vec![TaskData::empty(); self.proxies.len()]),
            TransferMode::Serialized => {
                let state_vector: Vec<f64> = systems.state_vector().iter().copied().collect();
                self.proxies
                    .iter()
                    .map(|proxy| {
                        TaskData::encode(&SubnetworkInput {
                            current: proxy.cached_current(),
                            state_vector: state_vector.clone(),
                            dt: systems.dt(),
                        })
                    })
                    .collect()
            }
        }
    }

    fn do_necessary_work(&self, worker: usize, input: TaskData) -> Result<TaskData> {
        match self.transfer {
            TransferMode::InPlace => self.assemble_in_place(worker),
            TransferMode::Serialized => self.assemble_serialized(worker, input),
        }
    }

    fn use_data_from_workers(&self, outputs: Vec<TaskData>) -> Result<()> {
        let systems = self.systems.read();
        if self.transfer == TransferMode::Serialized {
            if outputs.len() != self.proxies.len() {
                return Err(TwoportError::DimensionMismatch {
                    context: "dae worker outputs",
                    expected: self.proxies.len(),
                    actual: outputs.len(),
                });
            }
            for (proxy, data) in self.proxies.iter().zip(outputs) {
                self.merge_worker_output(&systems, proxy, data)?;
            }
        }

        let mut root = self.root.lock();
        let root = root.as_mut().ok_or(TwoportError::NotInitialized { what: "dae task" })?;
        root.update_state_system_group(&systems)?;
        root.calculate_state_dependent_values(systems.state_vector());
        Ok(())
    }

    fn replicate(&self) -> Result<Box<dyn Task>> {
        let replica = Self::from_blueprint(&self.blueprint, self.initial_current, self.limits)?;
        replica.systems.write().set_dt(self.systems.read().dt());
        Ok(Box::new(replica))
    }
}
