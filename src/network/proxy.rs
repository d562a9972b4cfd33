//! Boundary proxies: a partitioned subnetwork seen as a single element.

use std::sync::Arc;

use nalgebra::{DVector, RowDVector};
use parking_lot::Mutex;

use super::{ElectricalState, TreePath, Twoport};
use crate::error::{Result, TwoportError};
use crate::system::{EquationRowSpan, StateSystemGroup, SystemCopyInfo};

#[derive(Debug)]
struct ProxyInner {
    subnetwork: Twoport,
    copy_info: SystemCopyInfo,
    cached_current: f64,
    observable: bool,
    observable_paths: Vec<TreePath>,
    state: ElectricalState,
}

/// Stand-in for a subnetwork at its parent's level.
///
/// The parent tree and the worker that evaluates the subnetwork hold clones of
/// the same handle. The protocol guarantees that only one side touches it at a
/// time: the worker during the mandatory phase, the coordinator outside of it.
#[derive(Debug, Clone)]
pub struct BoundaryProxy {
    inner: Arc<Mutex<ProxyInner>>,
}

impl BoundaryProxy {
    /// Wrap `subnetwork`. The proxy takes ownership of it.
    pub fn new(subnetwork: Twoport) -> Self {
        let observable_paths = subnetwork.observable_paths();
        Self {
            inner: Arc::new(Mutex::new(ProxyInner {
                subnetwork,
                copy_info: SystemCopyInfo::default(),
                cached_current: 0.0,
                observable: false,
                observable_paths,
                state: ElectricalState::default(),
            })),
        }
    }

    pub fn is_observable(&self) -> bool {
        self.inner.lock().observable
    }

    pub fn set_observable(&self, observable: bool) {
        self.inner.lock().observable = observable;
    }

    /// Number of leaf elements in the subnetwork.
    pub fn element_count(&self) -> usize {
        self.inner.lock().subnetwork.element_count()
    }

    /// Number of observable elements inside the subnetwork.
    pub fn observable_count(&self) -> usize {
        self.inner.lock().observable_paths.len()
    }

    /// Run `read` against the wrapped subnetwork.
    pub fn with_subnetwork<T>(&self, read: impl FnOnce(&Twoport) -> T) -> T {
        read(&self.inner.lock().subnetwork)
    }

    /// Forward registration and record the rows the subnetwork claimed.
    pub fn set_system(&self, systems: &mut StateSystemGroup) -> Result<()> {
        let mut inner = self.inner.lock();
        let dgl_before = systems.dgl.equation_count();
        let alg_before = systems.alg.equation_count();

        inner.subnetwork.set_system(systems)?;

        inner.copy_info = SystemCopyInfo {
            dgl: EquationRowSpan::between(dgl_before, systems.dgl.equation_count()),
            alg: EquationRowSpan::between(alg_before, systems.alg.equation_count()),
        };
        Ok(())
    }

    /// The Dgl/Alg rows owned by the subnetwork.
    pub fn system_copy_info(&self) -> SystemCopyInfo {
        self.inner.lock().copy_info
    }

    /// Forward the current form and compute the initial voltage.
    pub fn set_current(&self, current: RowDVector<f64>, systems: &StateSystemGroup) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.subnetwork.set_current(current.clone(), systems)?;
        inner.state.current = current;
        inner.state.voltage = inner.subnetwork.voltage(systems)?;
        Ok(())
    }

    /// Cached voltage form of the subnetwork.
    pub fn voltage(&self) -> RowDVector<f64> {
        self.inner.lock().state.voltage.clone()
    }

    /// Store a voltage form computed elsewhere.
    pub fn set_voltage(&self, voltage: RowDVector<f64>) {
        self.inner.lock().state.voltage = voltage;
    }

    /// Evaluate the proxy's own current and voltage, leaving the subnetwork alone.
    pub fn calculate_state_dependent_values(&self, state: &DVector<f64>) {
        self.inner.lock().state.evaluate(state);
    }

    /// Evaluate the whole subnetwork; the proxy's power is the subnetwork's power.
    pub fn calculate_state_dependent_values_of_subnetwork(&self, state: &DVector<f64>) {
        let mut inner = self.inner.lock();
        inner.subnetwork.calculate_state_dependent_values(state);
        inner.state.evaluate(state);
        inner.state.power_value = inner.subnetwork.power_value();
    }

    /// Remember the scalar current for the next cycle.
    pub fn cache_current(&self, value: f64) {
        self.inner.lock().cached_current = value;
    }

    /// Evaluate the proxy's current form at `state` and cache the result.
    pub fn refresh_current(&self, state: &DVector<f64>) -> f64 {
        let mut inner = self.inner.lock();
        inner.state.evaluate(state);
        inner.cached_current = inner.state.current_value;
        inner.cached_current
    }

    pub fn cached_current(&self) -> f64 {
        self.inner.lock().cached_current
    }

    /// Cache `value` and hand it to the subnetwork root.
    pub fn set_subnetwork_current(&self, value: f64) {
        let mut inner = self.inner.lock();
        inner.cached_current = value;
        inner.subnetwork.set_current_value(value);
    }

    /// Hand the cached current to the subnetwork root.
    pub fn apply_cached_current(&self) {
        let mut inner = self.inner.lock();
        let value = inner.cached_current;
        inner.subnetwork.set_current_value(value);
    }

    /// Evaluate the subnetwork voltage, writing its equations, and cache it.
    pub fn calc_subnetwork_voltage(&self, systems: &StateSystemGroup) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.voltage = inner.subnetwork.voltage(systems)?;
        Ok(())
    }

    /// Evaluate and return the subnetwork voltage.
    pub fn subnetwork_voltage(&self, systems: &StateSystemGroup) -> Result<RowDVector<f64>> {
        self.calc_subnetwork_voltage(systems)?;
        Ok(self.voltage())
    }

    /// Push the scalar state of every observable element, then the proxy's own.
    pub fn save_observable_data(&self, buffer: &mut Vec<f64>) {
        let inner = self.inner.lock();
        for path in &inner.observable_paths {
            if let Some(element) = inner.subnetwork.element_at(path) {
                element.save_internal_data(buffer);
            }
        }
        inner.state.save(buffer);
    }

    /// Restore what [`BoundaryProxy::save_observable_data`] pushed, in reverse.
    pub fn load_observable_data(&self, buffer: &mut Vec<f64>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.load(buffer)?;
        let ProxyInner {
            subnetwork,
            observable_paths,
            ..
        } = &mut *inner;
        for path in observable_paths.iter().rev() {
            let element = subnetwork
                .element_at_mut(path)
                .ok_or_else(|| TwoportError::misuse(format!("observable path {:?} vanished", path)))?;
            element.load_internal_data(buffer)?;
        }
        Ok(())
    }

    pub(crate) fn load_own_data(&self, buffer: &mut Vec<f64>) -> Result<()> {
        self.inner.lock().state.load(buffer)
    }

    pub(crate) fn with_state<T>(&self, read: impl FnOnce(&ElectricalState) -> T) -> T {
        read(&self.inner.lock().state)
    }
}
