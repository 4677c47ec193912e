use crate::error::{ConfigError, EvaluationError};
use crate::model::{ModelEvaluator, ModelRuntime};
use crate::solvers::newton::NewtonSettings;
use std::sync::Arc;
use tracing::debug;

/// Relative comparison used to decide whether a value was modified.
fn fuzzy_equal(a: f64, b: f64) -> bool {
    (a - b).abs() * 1e12 <= a.abs().min(b.abs()) || a == b
}

/// Current values of a model's variables, together with the initial values
/// they can be reset to.
pub struct SimulationData {
    evaluator: ModelEvaluator,
    starting_point: f64,
    rates: Vec<f64>,
    states: Vec<f64>,
    algebraic: Vec<f64>,
    initial_constants: Vec<f64>,
    initial_states: Vec<f64>,
}

impl SimulationData {
    /// Creates the data and computes the model's initial values at
    /// `starting_point`.
    pub fn new(
        runtime: Arc<ModelRuntime>,
        nla: Option<NewtonSettings>,
        starting_point: f64,
    ) -> Result<Self, EvaluationError> {
        let mut data = Self {
            rates: vec![0.0; runtime.state_count()],
            states: vec![0.0; runtime.state_count()],
            algebraic: vec![0.0; runtime.algebraic_count()],
            initial_constants: vec![0.0; runtime.constant_count()],
            initial_states: vec![0.0; runtime.state_count()],
            evaluator: ModelEvaluator::new(runtime, nla),
            starting_point,
        };
        data.reset(true)?;
        Ok(data)
    }

    pub fn runtime(&self) -> &Arc<ModelRuntime> {
        self.evaluator.runtime()
    }

    pub fn evaluator(&self) -> &ModelEvaluator {
        &self.evaluator
    }

    pub fn set_nla(&mut self, settings: NewtonSettings) {
        self.evaluator.set_nla(settings);
    }

    pub fn starting_point(&self) -> f64 {
        self.starting_point
    }

    pub fn set_starting_point(&mut self, starting_point: f64) {
        self.starting_point = starting_point;
    }

    pub fn constants(&self) -> &[f64] {
        self.evaluator.constants()
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn states(&self) -> &[f64] {
        &self.states
    }

    pub fn algebraic(&self) -> &[f64] {
        &self.algebraic
    }

    pub fn initial_constants(&self) -> &[f64] {
        &self.initial_constants
    }

    pub fn initial_states(&self) -> &[f64] {
        &self.initial_states
    }

    /// Reinitializes the model. Constants set by the user are kept unless
    /// `all` is set, in which case every value returns to the model's own.
    pub fn reset(&mut self, all: bool) -> Result<(), EvaluationError> {
        let kept = (!all).then(|| self.evaluator.constants().to_vec());
        let voi = self.starting_point;

        self.algebraic.fill(0.0);
        self.evaluator.reset_algebraic();
        self.evaluator
            .initialize(voi, &mut self.rates, &mut self.states)?;
        self.recompute_variables(voi)?;
        self.initial_constants.copy_from_slice(self.evaluator.constants());
        self.initial_states.copy_from_slice(&self.states);

        if let Some(constants) = kept {
            self.evaluator.constants_mut().copy_from_slice(&constants);
            self.recompute_computed_constants_and_variables(voi)?;
        }
        debug!(all, modified = self.is_modified(), "simulation data reset");
        Ok(())
    }

    pub fn set_constant(&mut self, index: usize, value: f64) -> Result<(), ConfigError> {
        let slot = self
            .evaluator
            .constants_mut()
            .get_mut(index)
            .ok_or_else(|| ConfigError::UnknownVariable {
                category: "constant".to_string(),
                index,
            })?;
        *slot = value;
        Ok(())
    }

    pub fn set_state(&mut self, index: usize, value: f64) -> Result<(), ConfigError> {
        let slot = self
            .states
            .get_mut(index)
            .ok_or_else(|| ConfigError::UnknownVariable {
                category: "state".to_string(),
                index,
            })?;
        *slot = value;
        Ok(())
    }

    /// Whether a state or constant differs from its initial value.
    pub fn is_modified(&self) -> bool {
        let differs = |current: &[f64], initial: &[f64]| {
            current
                .iter()
                .zip(initial)
                .any(|(&a, &b)| !fuzzy_equal(a, b))
        };
        differs(&self.states, &self.initial_states)
            || differs(self.evaluator.constants(), &self.initial_constants)
    }

    /// Recomputes the computed constants, then the rates and algebraic
    /// variables, at `voi`.
    pub fn recompute_computed_constants_and_variables(&mut self, voi: f64) -> Result<(), EvaluationError> {
        self.evaluator
            .compute_computed_constants(voi, &self.rates, &self.states)?;
        self.recompute_variables(voi)
    }

    /// Recomputes the rates and algebraic variables at `voi`.
    pub fn recompute_variables(&mut self, voi: f64) -> Result<(), EvaluationError> {
        self.evaluator
            .variables(voi, &self.states, &mut self.rates, &mut self.algebraic)
    }

    pub(crate) fn set_states(&mut self, states: &[f64]) {
        self.states.copy_from_slice(states);
    }

    /// Writes the row for `voi` in column order.
    pub fn fill_row(&self, voi: f64, row: &mut Vec<f64>) {
        row.clear();
        row.push(voi);
        row.extend_from_slice(self.evaluator.constants());
        row.extend_from_slice(&self.rates);
        row.extend_from_slice(&self.states);
        row.extend_from_slice(&self.algebraic);
    }
}
