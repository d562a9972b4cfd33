//! The element tree.

use nalgebra::{DVector, RowDVector};
use serde::{Deserialize, Serialize};

use super::{BoundaryProxy, Capacitance, Composite, CompositeKind, Resistor};
use crate::error::{Result, TwoportError};
use crate::system::StateSystemGroup;

/// Position of an element below some root, as child indices from the top.
pub type TreePath = Vec<usize>;

/// Current/voltage of one element as linear forms over the state vector, plus
/// the scalar values they evaluate to.
#[derive(Debug, Clone)]
pub struct ElectricalState {
    pub current: RowDVector<f64>,
    pub voltage: RowDVector<f64>,
    pub current_value: f64,
    pub voltage_value: f64,
    pub power_value: f64,
}

impl Default for ElectricalState {
    fn default() -> Self {
        Self {
            current: RowDVector::zeros(0),
            voltage: RowDVector::zeros(0),
            current_value: 0.0,
            voltage_value: 0.0,
            power_value: 0.0,
        }
    }
}

impl ElectricalState {
    /// Evaluate the current and voltage forms at `state`.
    pub fn evaluate(&mut self, state: &DVector<f64>) {
        self.current_value = dot(&self.current, state);
        self.voltage_value = dot(&self.voltage, state);
    }

    /// Push `(current, voltage, power)`.
    pub fn save(&self, buffer: &mut Vec<f64>) {
        buffer.push(self.current_value);
        buffer.push(self.voltage_value);
        buffer.push(self.power_value);
    }

    /// Pop `(power, voltage, current)`, the reverse of [`ElectricalState::save`].
    pub fn load(&mut self, buffer: &mut Vec<f64>) -> Result<()> {
        if buffer.len() < 3 {
            return Err(TwoportError::DimensionMismatch {
                context: "internal data buffer",
                expected: 3,
                actual: buffer.len(),
            });
        }
        self.power_value = buffer.pop().unwrap_or_default();
        self.voltage_value = buffer.pop().unwrap_or_default();
        self.current_value = buffer.pop().unwrap_or_default();
        Ok(())
    }
}

/// Dot product of a form with a state vector; mismatched or empty forms give 0.
fn dot(form: &RowDVector<f64>, state: &DVector<f64>) -> f64 {
    if form.len() != state.len() {
        return 0.0;
    }
    form.iter().zip(state.iter()).map(|(a, b)| a * b).sum()
}

/// A node of the circuit tree.
///
/// Composites own their children. A proxy stands in for a whole subnetwork
/// that is evaluated by a worker.
#[derive(Debug, Serialize, Deserialize)]
pub enum Twoport {
    Resistor(Resistor),
    Capacitance(Capacitance),
    Composite(Composite),
    #[serde(skip)]
    Proxy(BoundaryProxy),
}

impl Twoport {
    pub fn resistor(resistance: f64) -> Self {
        Twoport::Resistor(Resistor::new(resistance))
    }

    pub fn capacitance(capacitance: f64) -> Self {
        Twoport::Capacitance(Capacitance::new(capacitance))
    }

    /// Serial connection. Takes ownership of `children`.
    pub fn serial(children: Vec<Twoport>) -> Self {
        Twoport::Composite(Composite::new(CompositeKind::Serial, children))
    }

    /// Parallel connection. Takes ownership of `children`.
    pub fn parallel(children: Vec<Twoport>) -> Self {
        Twoport::Composite(Composite::new(CompositeKind::Parallel, children))
    }

    /// Composite of the given kind and observability.
    pub fn composite(kind: CompositeKind, children: Vec<Twoport>, observable: bool) -> Self {
        let mut composite = Composite::new(kind, children);
        composite.observable = observable;
        Twoport::Composite(composite)
    }

    /// Builder-style observability flag.
    pub fn observed(mut self) -> Self {
        self.set_observable(true);
        self
    }

    pub fn is_observable(&self) -> bool {
        match self {
            Twoport::Resistor(r) => r.observable,
            Twoport::Capacitance(c) => c.observable,
            Twoport::Composite(c) => c.observable,
            Twoport::Proxy(p) => p.is_observable(),
        }
    }

    pub fn set_observable(&mut self, observable: bool) {
        match self {
            Twoport::Resistor(r) => r.observable = observable,
            Twoport::Capacitance(c) => c.observable = observable,
            Twoport::Composite(c) => c.observable = observable,
            Twoport::Proxy(p) => p.set_observable(observable),
        }
    }

    /// Proxies and non-empty composites have children.
    pub fn has_children(&self) -> bool {
        match self {
            Twoport::Composite(c) => !c.children.is_empty(),
            Twoport::Proxy(_) => true,
            Twoport::Resistor(_) | Twoport::Capacitance(_) => false,
        }
    }

    /// Direct children of a composite. Proxies hide their subnetwork.
    pub fn children(&self) -> &[Twoport] {
        match self {
            Twoport::Composite(c) => &c.children,
            _ => &[],
        }
    }

    /// Number of leaf elements below (and including) this node.
    pub fn element_count(&self) -> usize {
        match self {
            Twoport::Resistor(_) | Twoport::Capacitance(_) => 1,
            Twoport::Composite(c) => c.children.iter().map(Twoport::element_count).sum(),
            Twoport::Proxy(p) => p.element_count(),
        }
    }

    pub fn as_proxy(&self) -> Option<&BoundaryProxy> {
        match self {
            Twoport::Proxy(p) => Some(p),
            _ => None,
        }
    }

    /// Register this element's equations.
    pub fn set_system(&mut self, systems: &mut StateSystemGroup) -> Result<()> {
        match self {
            Twoport::Resistor(_) => Ok(()),
            Twoport::Capacitance(c) => c.set_system(systems),
            Twoport::Composite(c) => c.set_system(systems),
            Twoport::Proxy(p) => p.set_system(systems),
        }
    }

    /// Hand the current form down the tree.
    pub fn set_current(&mut self, current: RowDVector<f64>, systems: &StateSystemGroup) -> Result<()> {
        match self {
            Twoport::Resistor(r) => {
                r.state.current = current;
                Ok(())
            }
            Twoport::Capacitance(c) => {
                c.state.current = current;
                Ok(())
            }
            Twoport::Composite(c) => c.set_current(current, systems),
            Twoport::Proxy(p) => p.set_current(current, systems),
        }
    }

    /// Set only the scalar current value of this node.
    pub fn set_current_value(&mut self, value: f64) {
        match self {
            Twoport::Proxy(p) => p.cache_current(value),
            _ => {
                if let Some(state) = self.state_mut() {
                    state.current_value = value;
                }
            }
        }
    }

    /// Compute the voltage form and write this element's equations.
    ///
    /// A proxy returns the voltage cached by its worker.
    pub fn voltage(&mut self, systems: &StateSystemGroup) -> Result<RowDVector<f64>> {
        match self {
            Twoport::Resistor(r) => Ok(r.voltage()),
            Twoport::Capacitance(c) => c.voltage(systems),
            Twoport::Composite(c) => c.voltage(systems),
            Twoport::Proxy(p) => Ok(p.voltage()),
        }
    }

    /// Evaluate current, voltage and power at `state`.
    ///
    /// Stops at proxies: their subnetworks are evaluated by the workers.
    pub fn calculate_state_dependent_values(&mut self, state: &DVector<f64>) {
        match self {
            Twoport::Resistor(r) => r.calculate_state_dependent_values(state),
            Twoport::Capacitance(c) => c.calculate_state_dependent_values(state),
            Twoport::Composite(c) => c.calculate_state_dependent_values(state),
            Twoport::Proxy(p) => p.calculate_state_dependent_values(state),
        }
    }

    pub fn current_value(&self) -> f64 {
        self.with_state(|s| s.current_value)
    }

    pub fn voltage_value(&self) -> f64 {
        self.with_state(|s| s.voltage_value)
    }

    pub fn power_value(&self) -> f64 {
        self.with_state(|s| s.power_value)
    }

    /// Current form, cloned.
    pub fn current_form(&self) -> RowDVector<f64> {
        self.with_state(|s| s.current.clone())
    }

    /// Push `(current, voltage, power)` of this node.
    pub fn save_internal_data(&self, buffer: &mut Vec<f64>) {
        self.with_state(|s| s.save(buffer))
    }

    /// Pop the values pushed by [`Twoport::save_internal_data`].
    pub fn load_internal_data(&mut self, buffer: &mut Vec<f64>) -> Result<()> {
        match self {
            Twoport::Proxy(p) => p.load_own_data(buffer),
            _ => match self.state_mut() {
                Some(state) => state.load(buffer),
                None => Ok(()),
            },
        }
    }

    /// Build a constant current form of `value` and propagate it.
    ///
    /// Used on the root: the root is always observable.
    pub fn set_initial_current(&mut self, value: f64, systems: &StateSystemGroup) -> Result<()> {
        let len = systems.form_len();
        let mut current = RowDVector::zeros(len);
        current[len - 1] = value;
        self.set_observable(true);
        self.set_current(current, systems)
    }

    /// Re-evaluate the voltage of the whole tree, refreshing every equation.
    pub fn update_state_system_group(&mut self, systems: &StateSystemGroup) -> Result<()> {
        self.voltage(systems).map(|_| ())
    }

    /// Paths of observable elements in depth-first pre-order, not descending into proxies.
    pub fn observable_paths(&self) -> Vec<TreePath> {
        let mut paths = Vec::new();
        let mut prefix = Vec::new();
        self.collect_observable_paths(&mut prefix, &mut paths);
        paths
    }

    fn collect_observable_paths(&self, prefix: &mut TreePath, out: &mut Vec<TreePath>) {
        if self.is_observable() {
            out.push(prefix.clone());
        }
        for (index, child) in self.children().iter().enumerate() {
            prefix.push(index);
            child.collect_observable_paths(prefix, out);
            prefix.pop();
        }
    }

    /// Element at `path` below this node.
    pub fn element_at(&self, path: &[usize]) -> Option<&Twoport> {
        match path.split_first() {
            None => Some(self),
            Some((&index, rest)) => self.children().get(index)?.element_at(rest),
        }
    }

    pub fn element_at_mut(&mut self, path: &[usize]) -> Option<&mut Twoport> {
        match path.split_first() {
            None => Some(self),
            Some((&index, rest)) => match self {
                Twoport::Composite(c) => c.children.get_mut(index)?.element_at_mut(rest),
                _ => None,
            },
        }
    }

    /// Split a composite into its parts, handing the node back otherwise.
    pub(crate) fn into_composite(self) -> std::result::Result<(CompositeKind, bool, Vec<Twoport>), Twoport> {
        match self {
            Twoport::Composite(c) => Ok((c.kind, c.observable, c.children)),
            other => Err(other),
        }
    }

    fn state_mut(&mut self) -> Option<&mut ElectricalState> {
        match self {
            Twoport::Resistor(r) => Some(&mut r.state),
            Twoport::Capacitance(c) => Some(&mut c.state),
            Twoport::Composite(c) => Some(&mut c.state),
            Twoport::Proxy(_) => None,
        }
    }

    fn with_state<T>(&self, read: impl FnOnce(&ElectricalState) -> T) -> T {
        match self {
            Twoport::Resistor(r) => read(&r.state),
            Twoport::Capacitance(c) => read(&c.state),
            Twoport::Composite(c) => read(&c.state),
            Twoport::Proxy(p) => p.with_state(read),
        }
    }
}
