//! Backward Euler for semi-explicit DAEs.
//!
//! Each step solves `[y - y_k - h f(t, y, z); g(t, y, z)] = 0` for `(y, z)`
//! with the paired Newton solver.

use super::newton::{NewtonSettings, NewtonSolver};
use crate::error::EvaluationError;
use crate::traits::{DifferentialAlgebraicSystem, NonlinearSystem};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DaeSettings {
    /// Largest step magnitude; 0 means one step per output point.
    pub max_step: f64,
    /// Most substeps allowed between two output points.
    pub max_steps: usize,
}

impl Default for DaeSettings {
    fn default() -> Self {
        Self {
            max_step: 0.0,
            max_steps: 10_000,
        }
    }
}

struct StepSystem<'a, S: ?Sized> {
    system: &'a S,
    t: f64,
    h: f64,
    previous: &'a [f64],
    rates: Vec<f64>,
}

impl<S> NonlinearSystem for StepSystem<'_, S>
where
    S: DifferentialAlgebraicSystem + ?Sized,
{
    fn dimension(&self) -> usize {
        self.previous.len() + self.system.algebraic_dimension()
    }

    fn residual(&mut self, w: &[f64], out: &mut [f64]) -> Result<(), EvaluationError> {
        let n = self.previous.len();
        let (y, z) = w.split_at(n);
        self.system.rates(self.t, y, z, &mut self.rates)?;
        for i in 0..n {
            out[i] = y[i] - self.previous[i] - self.h * self.rates[i];
        }
        self.system.constraints(self.t, y, z, &mut out[n..])
    }
}

pub struct BackwardEulerDae {
    settings: DaeSettings,
    newton: NewtonSolver,
    t: f64,
    y: Vec<f64>,
    z: Vec<f64>,
    unknowns: Vec<f64>,
}

impl BackwardEulerDae {
    pub fn new(settings: DaeSettings, newton: NewtonSettings, t0: f64, y0: &[f64], z0: &[f64]) -> Self {
        Self {
            settings,
            newton: NewtonSolver::new(newton),
            t: t0,
            y: y0.to_vec(),
            z: z0.to_vec(),
            unknowns: Vec::with_capacity(y0.len() + z0.len()),
        }
    }

    pub fn workspace_bytes(n: usize, m: usize) -> u64 {
        NewtonSolver::workspace_bytes(n + m) + ((3 * n + 2 * m) * std::mem::size_of::<f64>()) as u64
    }

    pub fn time(&self) -> f64 {
        self.t
    }

    pub fn states(&self) -> &[f64] {
        &self.y
    }

    pub fn algebraic(&self) -> &[f64] {
        &self.z
    }

    pub fn reinitialize(&mut self, t: f64, y: &[f64], z: &[f64]) {
        self.t = t;
        self.y.copy_from_slice(y);
        self.z.copy_from_slice(z);
    }

    pub fn advance<S>(&mut self, system: &S, target: f64) -> Result<f64>
    where
        S: DifferentialAlgebraicSystem + ?Sized,
    {
        let span = target - self.t;
        if span == 0.0 {
            return Ok(target);
        }
        let substeps = if self.settings.max_step > 0.0 {
            let needed = (span.abs() / self.settings.max_step).ceil();
            if needed > self.settings.max_steps as f64 {
                bail!(
                    "Reaching t = {} with a maximum step of {} takes more than the maximum number of steps ({}).",
                    target,
                    self.settings.max_step,
                    self.settings.max_steps
                );
            }
            (needed as usize).max(1)
        } else {
            1
        };
        let h = span / substeps as f64;
        let n = self.y.len();

        for k in 1..=substeps {
            let t_new = if k == substeps {
                target
            } else {
                self.t + h
            };
            self.unknowns.clear();
            self.unknowns.extend_from_slice(&self.y);
            self.unknowns.extend_from_slice(&self.z);

            let mut step = StepSystem {
                system,
                t: t_new,
                h: t_new - self.t,
                previous: &self.y,
                rates: vec![0.0; n],
            };
            let report = self.newton.solve(&mut step, &mut self.unknowns)?;
            trace!(t = t_new, iterations = report.iterations, "dae step accepted");

            let (y, z) = self.unknowns.split_at(n);
            self.y.copy_from_slice(y);
            self.z.copy_from_slice(z);
            self.t = t_new;
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `y' = -z`, `0 = z - y`, so `y = e^{-t}`.
    struct Coupled;

    impl DifferentialAlgebraicSystem for Coupled {
        fn state_dimension(&self) -> usize {
            1
        }

        fn algebraic_dimension(&self) -> usize {
            1
        }

        fn rates(&self, _t: f64, _y: &[f64], z: &[f64], out: &mut [f64]) -> Result<(), EvaluationError> {
            out[0] = -z[0];
            Ok(())
        }

        fn constraints(
            &self,
            _t: f64,
            y: &[f64],
            z: &[f64],
            out: &mut [f64],
        ) -> Result<(), EvaluationError> {
            out[0] = z[0] - y[0];
            Ok(())
        }
    }

    /// `y' = -z`, `0 = z³ - y`.
    struct Cubic;

    impl DifferentialAlgebraicSystem for Cubic {
        fn state_dimension(&self) -> usize {
            1
        }

        fn algebraic_dimension(&self) -> usize {
            1
        }

        fn rates(&self, _t: f64, _y: &[f64], z: &[f64], out: &mut [f64]) -> Result<(), EvaluationError> {
            out[0] = -z[0];
            Ok(())
        }

        fn constraints(
            &self,
            _t: f64,
            y: &[f64],
            z: &[f64],
            out: &mut [f64],
        ) -> Result<(), EvaluationError> {
            out[0] = z[0] * z[0] * z[0] - y[0];
            Ok(())
        }
    }

    #[test]
    fn one_step_per_point_is_backward_euler() {
        let mut dae = BackwardEulerDae::new(DaeSettings::default(), NewtonSettings::default(), 0.0, &[1.0], &[1.0]);
        dae.advance(&Coupled, 0.5).expect("advance");
        assert!((dae.states()[0] - 1.0 / 1.5).abs() < 1e-9);
        assert!((dae.algebraic()[0] - dae.states()[0]).abs() < 1e-9);
        assert_eq!(dae.time(), 0.5);
    }

    #[test]
    fn maximum_step_subdivides_the_interval() {
        let mut dae = BackwardEulerDae::new(
            DaeSettings {
                max_step: 0.001,
                ..DaeSettings::default()
            },
            NewtonSettings::default(),
            0.0,
            &[1.0],
            &[1.0],
        );
        dae.advance(&Coupled, 1.0).expect("advance");
        assert!((dae.states()[0] - (-1.0f64).exp()).abs() < 1e-3);
    }

    #[test]
    fn tiny_maximum_steps_are_bounded() {
        let mut dae = BackwardEulerDae::new(
            DaeSettings {
                max_step: 1e-300,
                max_steps: 100,
            },
            NewtonSettings::default(),
            0.0,
            &[1.0],
            &[1.0],
        );
        let err = dae.advance(&Coupled, 1.0).expect_err("too many substeps");
        assert!(err.to_string().contains("maximum number of steps (100)"));
        assert_eq!(dae.time(), 0.0);
        assert_eq!(dae.states(), &[1.0]);

        let mut dae = BackwardEulerDae::new(
            DaeSettings {
                max_step: 0.01,
                max_steps: 100,
            },
            NewtonSettings::default(),
            0.0,
            &[1.0],
            &[1.0],
        );
        dae.advance(&Coupled, 1.0).expect("exactly at the limit");
        assert_eq!(dae.time(), 1.0);
    }

    #[test]
    fn newton_failures_are_reported() {
        let mut dae = BackwardEulerDae::new(
            DaeSettings::default(),
            NewtonSettings {
                max_iterations: 1,
                ..NewtonSettings::default()
            },
            0.0,
            &[1.0],
            &[0.5],
        );
        let err = dae.advance(&Cubic, 1.0).expect_err("cannot converge in one iteration");
        assert!(err.to_string().starts_with("Newton solver failed to converge"));
    }
}
