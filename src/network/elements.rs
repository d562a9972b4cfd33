//! Leaf and composite element models.
//!
//! These are deliberately minimal: an ohmic resistance, an ideal capacitance
//! and the serial/parallel connectors that build trees out of them.

use nalgebra::{DVector, RowDVector};
use serde::{Deserialize, Serialize};

use super::{ElectricalState, Twoport};
use crate::error::{Result, TwoportError};
use crate::system::StateSystemGroup;

/// An ohmic resistance: `U = R·I`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resistor {
    pub resistance: f64,
    #[serde(default)]
    pub observable: bool,
    #[serde(skip)]
    pub(crate) state: ElectricalState,
}

impl Resistor {
    pub fn new(resistance: f64) -> Self {
        Self {
            resistance,
            observable: false,
            state: ElectricalState::default(),
        }
    }

    pub(crate) fn voltage(&mut self) -> RowDVector<f64> {
        self.state.voltage = &self.state.current * self.resistance;
        self.state.voltage.clone()
    }

    pub(crate) fn calculate_state_dependent_values(&mut self, state: &DVector<f64>) {
        self.state.evaluate(state);
        self.state.power_value = self.state.current_value * self.state.current_value * self.resistance;
    }
}

/// An ideal capacitance contributing one differential equation `dU/dt = I/C`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capacitance {
    pub capacitance: f64,
    #[serde(default)]
    pub observable: bool,
    #[serde(skip)]
    row: Option<usize>,
    #[serde(skip)]
    pub(crate) state: ElectricalState,
}

impl Capacitance {
    pub fn new(capacitance: f64) -> Self {
        Self {
            capacitance,
            observable: false,
            row: None,
            state: ElectricalState::default(),
        }
    }

    /// Dgl row (and state column) of the capacitor voltage, once registered.
    pub fn row(&self) -> Option<usize> {
        self.row
    }

    pub(crate) fn set_system(&mut self, systems: &mut StateSystemGroup) -> Result<()> {
        self.row = Some(systems.dgl.get_new_equation()?);
        Ok(())
    }

    pub(crate) fn voltage(&mut self, systems: &StateSystemGroup) -> Result<RowDVector<f64>> {
        let row = self.row.ok_or(TwoportError::NotInitialized {
            what: "capacitance equation",
        })?;
        let derivative = &self.state.current / self.capacitance;
        systems.dgl.add_equations(row, &derivative)?;

        let mut voltage = RowDVector::zeros(systems.form_len());
        voltage[row] = 1.0;
        self.state.voltage = voltage;
        Ok(self.state.voltage.clone())
    }

    pub(crate) fn calculate_state_dependent_values(&mut self, state: &DVector<f64>) {
        self.state.evaluate(state);
        self.state.power_value = self.state.current_value * self.state.voltage_value;
    }
}

/// How the children of a composite are connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeKind {
    Serial,
    Parallel,
}

/// A serial or parallel connection of child elements.
///
/// A parallel connection of `k` children owns `k - 1` algebraic equations.
/// The branch currents of children `1..k` are Alg states, child 0 carries
/// the remainder, and every branch is forced to the voltage of the last one.
#[derive(Debug, Serialize, Deserialize)]
pub struct Composite {
    pub kind: CompositeKind,
    pub children: Vec<Twoport>,
    #[serde(default)]
    pub observable: bool,
    #[serde(skip)]
    alg_rows: Vec<usize>,
    #[serde(skip)]
    pub(crate) state: ElectricalState,
}

impl Composite {
    /// Create a composite. The composite takes ownership of `children`.
    pub fn new(kind: CompositeKind, children: Vec<Twoport>) -> Self {
        Self {
            kind,
            children,
            observable: false,
            alg_rows: Vec::new(),
            state: ElectricalState::default(),
        }
    }

    pub(crate) fn set_system(&mut self, systems: &mut StateSystemGroup) -> Result<()> {
        for child in &mut self.children {
            child.set_system(systems)?;
        }
        if self.kind == CompositeKind::Parallel {
            let branches = self.children.len().saturating_sub(1);
            self.alg_rows = (0..branches)
                .map(|_| systems.alg.get_new_equation())
                .collect::<Result<_>>()?;
        }
        Ok(())
    }

    pub(crate) fn set_current(&mut self, current: RowDVector<f64>, systems: &StateSystemGroup) -> Result<()> {
        match self.kind {
            CompositeKind::Serial => {
                for child in &mut self.children {
                    child.set_current(current.clone(), systems)?;
                }
            }
            CompositeKind::Parallel => {
                let mut remainder = current.clone();
                let mut branch_currents = Vec::with_capacity(self.alg_rows.len());
                for &row in &self.alg_rows {
                    let column = systems.alg_state_column(row);
                    check_column(column, current.len())?;
                    let mut branch = RowDVector::zeros(current.len());
                    branch[column] = 1.0;
                    remainder[column] -= 1.0;
                    branch_currents.push(branch);
                }

                let mut children = self.children.iter_mut();
                if let Some(first) = children.next() {
                    first.set_current(remainder, systems)?;
                }
                for (child, branch) in children.zip(branch_currents) {
                    child.set_current(branch, systems)?;
                }
            }
        }
        self.state.current = current;
        Ok(())
    }

    pub(crate) fn voltage(&mut self, systems: &StateSystemGroup) -> Result<RowDVector<f64>> {
        let mut voltages = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            voltages.push(child.voltage(systems)?);
        }

        self.state.voltage = match self.kind {
            CompositeKind::Serial => voltages
                .iter()
                .fold(RowDVector::zeros(systems.form_len()), |sum, v| sum + v),
            CompositeKind::Parallel => match voltages.last() {
                Some(last) => {
                    for (row, voltage) in self.alg_rows.iter().zip(&voltages) {
                        systems.alg.add_equations(*row, &(last - voltage))?;
                    }
                    last.clone()
                }
                None => RowDVector::zeros(systems.form_len()),
            },
        };
        Ok(self.state.voltage.clone())
    }

    pub(crate) fn calculate_state_dependent_values(&mut self, state: &DVector<f64>) {
        let mut power = 0.0;
        for child in &mut self.children {
            child.calculate_state_dependent_values(state);
            power += child.power_value();
        }
        self.state.evaluate(state);
        self.state.power_value = power;
    }
}

fn check_column(column: usize, len: usize) -> Result<()> {
    if column + 1 >= len {
        return Err(TwoportError::DimensionMismatch {
            context: "parallel branch current",
            expected: column + 2,
            actual: len,
        });
    }
    Ok(())
}
