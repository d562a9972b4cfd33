//! The Dgl/Alg twin systems together with the state they are evaluated at.

use nalgebra::DVector;

use super::StateSystem;
use crate::error::{Result, TwoportError};

/// Differential and algebraic equation systems plus the shared state vector.
///
/// The state vector holds all Dgl states first, then all Alg states, then a
/// constant `1` so that a linear form `f` evaluates as `f · state`.
#[derive(Debug)]
pub struct StateSystemGroup {
    pub dgl: StateSystem,
    pub alg: StateSystem,
    state_vector: DVector<f64>,
    dt: f64,
    initialized: bool,
}

impl Default for StateSystemGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSystemGroup {
    pub fn new() -> Self {
        Self {
            dgl: StateSystem::new("Dgl"),
            alg: StateSystem::new("Alg"),
            state_vector: DVector::from_element(1, 1.0),
            dt: 0.0,
            initialized: false,
        }
    }

    /// Freeze both systems and size the state vector.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Err(TwoportError::AlreadyInitialized {
                what: "state system group",
            });
        }
        let state_count = self.state_count();
        self.dgl.initialize(state_count)?;
        self.alg.initialize(state_count)?;
        self.state_vector = DVector::zeros(state_count + 1);
        self.state_vector[state_count] = 1.0;
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of states: Dgl equations plus Alg equations.
    pub fn state_count(&self) -> usize {
        self.dgl.equation_count() + self.alg.equation_count()
    }

    /// Length of a linear form over the state vector.
    pub fn form_len(&self) -> usize {
        self.state_count() + 1
    }

    /// Column of the state that belongs to Alg equation `row`.
    pub fn alg_state_column(&self, row: usize) -> usize {
        self.dgl.equation_count() + row
    }

    pub fn state_vector(&self) -> &DVector<f64> {
        &self.state_vector
    }

    /// Replace the state vector. The trailing constant is forced back to `1`.
    pub fn set_state_vector(&mut self, mut state: DVector<f64>) -> Result<()> {
        let expected = self.form_len();
        if state.len() != expected {
            return Err(TwoportError::DimensionMismatch {
                context: "state vector",
                expected,
                actual: state.len(),
            });
        }
        state[expected - 1] = 1.0;
        self.state_vector = state;
        Ok(())
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn set_dt(&mut self, dt: f64) {
        self.dt = dt;
    }

    /// Clear the buffers of both systems.
    pub fn reset_system(&self) {
        self.dgl.reset_system();
        self.alg.reset_system();
    }
}
