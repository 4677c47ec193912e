use crate::error::ConfigError;
use crate::model::ModelRuntime;
use crate::results::ResultsStore;
use crate::solvers::{plan_solvers, SolverKind, SolverPlan, SolverSetup};
use serde::{Deserialize, Serialize};

/// Rounding slack so that the last point lands exactly on the ending point.
const SIZE_TOLERANCE: f64 = 1e-9;

/// What a user asks for: the time span and the solvers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub starting_point: f64,
    pub ending_point: f64,
    pub point_interval: f64,
    pub ode: Option<SolverSetup>,
    /// Only used when the model has algebraic unknowns or the ODE solver
    /// is the DAE solver.
    pub nla: Option<SolverSetup>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            starting_point: 0.0,
            ending_point: 1000.0,
            point_interval: 1.0,
            ode: Some(SolverSetup::new(SolverKind::Sdirk)),
            nla: Some(SolverSetup::new(SolverKind::Newton)),
        }
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::InvalidRun {
        message: message.to_string(),
    }
}

pub fn validate_points(starting_point: f64, ending_point: f64, point_interval: f64) -> Result<(), ConfigError> {
    if !(starting_point.is_finite() && ending_point.is_finite() && point_interval.is_finite()) {
        return Err(invalid(
            "the starting point, ending point and point interval must be finite numbers",
        ));
    }
    if starting_point == ending_point {
        return Err(invalid("the starting and ending points cannot have the same value"));
    }
    if point_interval == 0.0 {
        return Err(invalid("the point interval cannot be equal to zero"));
    }
    if ending_point > starting_point && point_interval < 0.0 {
        return Err(invalid(
            "the ending point is greater than the starting point, so the point interval should be greater than zero",
        ));
    }
    if ending_point < starting_point && point_interval > 0.0 {
        return Err(invalid(
            "the ending point is smaller than the starting point, so the point interval should be smaller than zero",
        ));
    }
    Ok(())
}

/// Number of points from `starting_point` to `ending_point`, both included.
/// Expects validated points.
pub fn run_size(starting_point: f64, ending_point: f64, point_interval: f64) -> usize {
    let intervals = ((ending_point - starting_point) / point_interval - SIZE_TOLERANCE).ceil();
    (intervals.max(0.0) as usize).saturating_add(1)
}

/// Snapshot of everything a run needs, taken before the worker starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRun {
    pub starting_point: f64,
    pub ending_point: f64,
    pub point_interval: f64,
    pub plan: SolverPlan,
    pub initial_states: Vec<f64>,
    pub initial_constants: Vec<f64>,
}

impl SimulationRun {
    /// Validates `settings` against `runtime` without touching solver memory.
    pub fn new(
        settings: &SimulationSettings,
        runtime: &ModelRuntime,
        states: &[f64],
        constants: &[f64],
    ) -> Result<Self, ConfigError> {
        validate_points(
            settings.starting_point,
            settings.ending_point,
            settings.point_interval,
        )?;
        let plan = plan_solvers(
            runtime.state_count(),
            runtime.nla_unknowns().len(),
            settings.ode.as_ref(),
            settings.nla.as_ref(),
        )?;
        Ok(Self {
            starting_point: settings.starting_point,
            ending_point: settings.ending_point,
            point_interval: settings.point_interval,
            plan,
            initial_states: states.to_vec(),
            initial_constants: constants.to_vec(),
        })
    }

    pub fn size(&self) -> usize {
        run_size(self.starting_point, self.ending_point, self.point_interval)
    }

    /// The `k`-th output point; the last one is exactly the ending point.
    pub fn point(&self, k: usize) -> f64 {
        if k + 1 >= self.size() {
            self.ending_point
        } else {
            self.starting_point + k as f64 * self.point_interval
        }
    }

    pub fn workspace_bytes(&self, runtime: &ModelRuntime) -> u64 {
        self.plan
            .workspace_bytes(runtime.state_count(), runtime.nla_unknowns().len())
    }

    /// Bytes for every row of the run plus the solver workspace.
    pub fn required_memory(&self, runtime: &ModelRuntime) -> u64 {
        ResultsStore::estimate_bytes(self.size(), runtime.layout().len())
            .saturating_add(self.workspace_bytes(runtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::test_models;
    use proptest::prelude::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, ConfigError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = err.to_string();
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn settings(starting_point: f64, ending_point: f64, point_interval: f64) -> SimulationSettings {
        SimulationSettings {
            starting_point,
            ending_point,
            point_interval,
            ode: Some(SolverSetup::new(SolverKind::FourthOrderRungeKutta)),
            nla: None,
        }
    }

    #[test]
    fn points_are_validated_with_readable_messages() {
        assert_err_contains(validate_points(1.0, 1.0, 1.0), "cannot have the same value");
        assert_err_contains(validate_points(0.0, 1.0, 0.0), "cannot be equal to zero");
        assert_err_contains(
            validate_points(0.0, 1.0, -0.1),
            "so the point interval should be greater than zero",
        );
        assert_err_contains(
            validate_points(1.0, 0.0, 0.1),
            "so the point interval should be smaller than zero",
        );
        assert_err_contains(validate_points(0.0, f64::INFINITY, 1.0), "finite numbers");
        assert!(validate_points(1.0, 0.0, -0.1).is_ok());
    }

    #[test]
    fn the_last_point_is_the_ending_point() {
        assert_eq!(run_size(0.0, 10.0, 1.0), 11);
        assert_eq!(run_size(0.0, 10.0, 3.0), 5);
        assert_eq!(run_size(0.0, 1.0, 0.1), 11);
        assert_eq!(run_size(10.0, 0.0, -2.5), 5);

        let runtime = ModelRuntime::compile(test_models::decay(), &EngineConfig::default()).expect("compile");
        let run = SimulationRun::new(&settings(0.0, 10.0, 3.0), &runtime, &[1.0], &[1.0]).expect("run");
        let points: Vec<f64> = (0..run.size()).map(|k| run.point(k)).collect();
        assert_eq!(points, vec![0.0, 3.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn required_memory_counts_rows_and_workspace() {
        let runtime = ModelRuntime::compile(test_models::decay(), &EngineConfig::default()).expect("compile");
        let run = SimulationRun::new(&settings(0.0, 10.0, 1.0), &runtime, &[1.0], &[1.0]).expect("run");
        // voi, k, x', x
        let rows = 11 * 4 * 8;
        assert_eq!(run.required_memory(&runtime), rows + run.workspace_bytes(&runtime));
        assert!(run.workspace_bytes(&runtime) > 0);
    }

    #[test]
    fn solver_pairing_is_checked() {
        let runtime = ModelRuntime::compile(test_models::algebraic(), &EngineConfig::default()).expect("compile");
        assert_err_contains(
            SimulationRun::new(&settings(0.0, 1.0, 0.1), &runtime, &[2.0], &[]),
            "the model needs both an ODE and an NLA solver, but no NLA solver is available",
        );
    }

    proptest! {
        #[test]
        fn equal_points_or_zero_interval_are_rejected(
            start in -1e6f64..1e6,
            end in -1e6f64..1e6,
            interval in -1e3f64..1e3,
        ) {
            prop_assert!(validate_points(start, start, interval).is_err());
            prop_assert!(validate_points(start, end, 0.0).is_err());
        }

        #[test]
        fn valid_runs_end_on_the_ending_point(
            start in -1e3f64..1e3,
            span in 1e-3f64..1e3,
            steps in 1usize..500,
            backwards in any::<bool>(),
        ) {
            let (end, interval) = if backwards {
                (start - span, -span / steps as f64)
            } else {
                (start + span, span / steps as f64)
            };
            prop_assume!(end != start);
            prop_assert!(validate_points(start, end, interval).is_ok());
            let size = run_size(start, end, interval);
            prop_assert!(size >= 2);
            prop_assert!(size <= steps + 2);
        }
    }
}
