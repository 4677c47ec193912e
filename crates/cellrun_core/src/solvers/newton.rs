use super::linalg::{finite_difference_jacobian, l2_norm, LinearSolver};
use crate::traits::NonlinearSystem;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub damping: f64,
    pub linear_solver: LinearSolver,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-10,
            damping: 1.0,
            linear_solver: LinearSolver::Dense,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonReport {
    pub iterations: usize,
    pub residual_norm: f64,
}

/// Damped Newton iteration with a finite-difference Jacobian.
///
/// Buffers are kept between solves, so a solver nested in a right-hand side
/// does not allocate per evaluation once its dimension is stable.
#[derive(Debug, Clone)]
pub struct NewtonSolver {
    settings: NewtonSettings,
    residual: Vec<f64>,
    jacobian: Vec<f64>,
}

impl NewtonSolver {
    pub fn new(settings: NewtonSettings) -> Self {
        Self {
            settings,
            residual: Vec::new(),
            jacobian: Vec::new(),
        }
    }

    pub fn settings(&self) -> &NewtonSettings {
        &self.settings
    }

    pub fn workspace_bytes(dim: usize) -> u64 {
        ((dim * dim + 3 * dim) * std::mem::size_of::<f64>()) as u64
    }

    /// Solves `system(x) = 0`, starting from and updating `x` in place.
    pub fn solve<S>(&mut self, system: &mut S, x: &mut [f64]) -> Result<NewtonReport>
    where
        S: NonlinearSystem + ?Sized,
    {
        let dim = system.dimension();
        if x.len() != dim {
            bail!(
                "Initial guess dimension mismatch. Expected {}, got {}.",
                dim,
                x.len()
            );
        }
        if dim == 0 {
            return Ok(NewtonReport {
                iterations: 0,
                residual_norm: 0.0,
            });
        }

        let settings = self.settings;
        self.residual.resize(dim, 0.0);
        self.jacobian.resize(dim * dim, 0.0);

        system.residual(x, &mut self.residual)?;
        let mut residual_norm = l2_norm(&self.residual);
        let mut iterations = 0usize;

        loop {
            if residual_norm <= settings.tolerance {
                break;
            }
            if !residual_norm.is_finite() {
                bail!("Newton iteration produced a non-finite residual.");
            }
            if iterations >= settings.max_iterations {
                bail!(
                    "Newton solver failed to converge in {} iterations (‖f(x)‖ = {:e}).",
                    settings.max_iterations,
                    residual_norm
                );
            }

            finite_difference_jacobian(
                |v, out| system.residual(v, out),
                x,
                &self.residual,
                &mut self.jacobian,
            )?;
            settings.linear_solver.mask(dim, &mut self.jacobian);
            let delta = settings
                .linear_solver
                .solve(dim, &self.jacobian, &self.residual)
                .context("Failed to solve linear system during Newton iteration.")?;

            for i in 0..dim {
                x[i] -= settings.damping * delta[i];
            }
            iterations += 1;

            system.residual(x, &mut self.residual)?;
            residual_norm = l2_norm(&self.residual);

            // Stagnation at machine precision counts as convergence.
            let step = settings.damping * l2_norm(&delta);
            if step <= f64::EPSILON * l2_norm(x).max(1.0) && residual_norm.is_finite() {
                break;
            }
        }

        Ok(NewtonReport {
            iterations,
            residual_norm,
        })
    }
}
