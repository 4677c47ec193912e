//! Two-stage, L-stable, singly diagonally implicit Runge-Kutta integrator
//! with adaptive step control.
//!
//! Stages `K = f(t + c h, y + h Σ a K)` with `a = [[γ, 0], [1 - γ, γ]]` and
//! `γ = 1 - √2/2`. The method is stiffly accurate, so the second stage is
//! also the slope at the new point, which the dense output reuses. The local
//! error is estimated from `γ h (K2 - K1)`.

use super::linalg::{finite_difference_jacobian, LinearSolver};
use crate::error::EvaluationError;
use crate::traits::DynamicalSystem;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

const GAMMA: f64 = 1.0 - std::f64::consts::FRAC_1_SQRT_2;
const MAX_NEWTON_ITERATIONS: usize = 7;
const MAX_FUNCTIONAL_ITERATIONS: usize = 25;
const STAGE_TOLERANCE: f64 = 0.03;
const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationType {
    Newton,
    Functional,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SdirkSettings {
    /// Largest step magnitude; 0 means unbounded.
    pub max_step: f64,
    /// Step attempts allowed per call to [`Sdirk::advance`].
    pub max_steps: usize,
    pub iteration: IterationType,
    pub linear_solver: LinearSolver,
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
    pub interpolate: bool,
}

impl Default for SdirkSettings {
    fn default() -> Self {
        Self {
            max_step: 0.0,
            max_steps: 500,
            iteration: IterationType::Newton,
            linear_solver: LinearSolver::Dense,
            relative_tolerance: 1e-7,
            absolute_tolerance: 1e-7,
            interpolate: true,
        }
    }
}

/// End points of the last accepted step, kept for dense output.
#[derive(Debug, Clone)]
struct LastStep {
    t0: f64,
    y0: Vec<f64>,
    f0: Vec<f64>,
    t1: f64,
    y1: Vec<f64>,
    f1: Vec<f64>,
}

impl LastStep {
    fn contains(&self, time: f64) -> bool {
        let (lo, hi) = if self.t0 <= self.t1 {
            (self.t0, self.t1)
        } else {
            (self.t1, self.t0)
        };
        time >= lo && time <= hi
    }

    fn hermite(&self, time: f64, out: &mut [f64]) {
        let h = self.t1 - self.t0;
        let theta = (time - self.t0) / h;
        let theta2 = theta * theta;
        let theta3 = theta2 * theta;
        let h00 = 2.0 * theta3 - 3.0 * theta2 + 1.0;
        let h10 = theta3 - 2.0 * theta2 + theta;
        let h01 = -2.0 * theta3 + 3.0 * theta2;
        let h11 = theta3 - theta2;
        for i in 0..out.len() {
            out[i] = h00 * self.y0[i]
                + h10 * h * self.f0[i]
                + h01 * self.y1[i]
                + h11 * h * self.f1[i];
        }
    }
}

pub struct Sdirk {
    settings: SdirkSettings,
    t: f64,
    y: Vec<f64>,
    /// `f(t, y)`, valid when `has_slope`.
    f: Vec<f64>,
    has_slope: bool,
    h: Option<f64>,
    last: Option<LastStep>,
    output_time: f64,
    output: Vec<f64>,
    k1: Vec<f64>,
    k2: Vec<f64>,
    base: Vec<f64>,
    stage_state: Vec<f64>,
    stage_rhs: Vec<f64>,
    y_new: Vec<f64>,
    weights: Vec<f64>,
    jacobian: Vec<f64>,
    iteration_matrix: Vec<f64>,
}

impl Sdirk {
    pub fn new(settings: SdirkSettings, t0: f64, states: &[f64]) -> Self {
        let n = states.len();
        let (jacobian, iteration_matrix) = match settings.iteration {
            IterationType::Newton => (vec![0.0; n * n], vec![0.0; n * n]),
            IterationType::Functional => (Vec::new(), Vec::new()),
        };
        Self {
            settings,
            t: t0,
            y: states.to_vec(),
            f: vec![0.0; n],
            has_slope: false,
            h: None,
            last: None,
            output_time: t0,
            output: states.to_vec(),
            k1: vec![0.0; n],
            k2: vec![0.0; n],
            base: vec![0.0; n],
            stage_state: vec![0.0; n],
            stage_rhs: vec![0.0; n],
            y_new: vec![0.0; n],
            weights: vec![0.0; n],
            jacobian,
            iteration_matrix,
        }
    }

    pub fn workspace_bytes(settings: &SdirkSettings, n: usize) -> u64 {
        let vectors = 16 * n;
        let matrices = match settings.iteration {
            IterationType::Newton => 2 * n * n,
            IterationType::Functional => 0,
        };
        ((vectors + matrices) * std::mem::size_of::<f64>()) as u64
    }

    pub fn settings(&self) -> &SdirkSettings {
        &self.settings
    }

    /// Time of the values returned by [`states`](Self::states).
    pub fn time(&self) -> f64 {
        self.output_time
    }

    pub fn states(&self) -> &[f64] {
        &self.output
    }

    /// Restarts the integration from `(t, states)`, discarding the step
    /// size history.
    pub fn reinitialize(&mut self, t: f64, states: &[f64]) {
        self.t = t;
        self.y.copy_from_slice(states);
        self.output_time = t;
        self.output.copy_from_slice(states);
        self.has_slope = false;
        self.h = None;
        self.last = None;
    }

    /// Dense output within the last accepted step.
    pub fn interpolate(&self, time: f64, out: &mut [f64]) -> Result<()> {
        if time == self.t {
            out.copy_from_slice(&self.y);
            return Ok(());
        }
        match &self.last {
            Some(last) if last.contains(time) => {
                last.hermite(time, out);
                Ok(())
            }
            _ => bail!(
                "Cannot interpolate at t = {} outside of the last step.",
                time
            ),
        }
    }

    /// Integrates up to `target` and returns the time of the new output.
    pub fn advance<S>(&mut self, system: &S, target: f64) -> Result<f64>
    where
        S: DynamicalSystem<f64> + ?Sized,
    {
        if target == self.output_time {
            return Ok(target);
        }
        let direction = (target - self.output_time).signum();

        if self.settings.interpolate {
            if let Some(last) = &self.last {
                if last.contains(target) {
                    last.hermite(target, &mut self.output);
                    self.output_time = target;
                    return Ok(target);
                }
            }
        }

        if !self.has_slope {
            system.apply(self.t, &self.y, &mut self.f)?;
            self.has_slope = true;
        }

        let mut attempts = 0usize;
        while (target - self.t) * direction > 0.0 {
            let remaining = target - self.t;
            let min_step = 16.0 * f64::EPSILON * self.t.abs().max(1.0);
            if remaining.abs() <= min_step {
                self.t = target;
                break;
            }
            if attempts >= self.settings.max_steps {
                bail!(
                    "The maximum number of steps ({}) was taken before reaching t = {}.",
                    self.settings.max_steps,
                    target
                );
            }
            attempts += 1;
            self.update_weights();

            let mut proposed = match self.h {
                Some(h) => h.abs(),
                None => self.initial_step(remaining).abs(),
            };
            if self.settings.max_step > 0.0 {
                proposed = proposed.min(self.settings.max_step);
            }
            if proposed < min_step {
                bail!("The step size became too small at t = {}.", self.t);
            }
            let clipped = !self.settings.interpolate && proposed >= remaining.abs();
            let h = if clipped { remaining } else { proposed * direction };

            match self.attempt(system, h)? {
                Some(error) if error <= 1.0 => {
                    let t_new = if clipped { target } else { self.t + h };
                    self.accept(t_new);
                    trace!(t = t_new, h, error, "sdirk step accepted");
                    // A clipped step says little about the next one.
                    self.h = Some(if clipped {
                        proposed
                    } else {
                        proposed * step_factor(error)
                    });
                }
                Some(error) => {
                    self.h = Some(h.abs() * step_factor(error).min(1.0));
                }
                None => {
                    self.h = Some(h.abs() * 0.25);
                }
            }
        }

        if self.settings.interpolate && self.t != target {
            if let Some(last) = &self.last {
                last.hermite(target, &mut self.output);
            }
        } else {
            self.output.copy_from_slice(&self.y);
        }
        self.output_time = target;
        Ok(target)
    }

    fn update_weights(&mut self) {
        for i in 0..self.y.len() {
            let w = self.settings.absolute_tolerance
                + self.settings.relative_tolerance * self.y[i].abs();
            self.weights[i] = w.max(f64::MIN_POSITIVE);
        }
    }

    fn weighted_rms(&self, v: &[f64]) -> f64 {
        if v.is_empty() {
            return 0.0;
        }
        let sum: f64 = v
            .iter()
            .zip(&self.weights)
            .map(|(value, w)| (value / w).powi(2))
            .sum();
        (sum / v.len() as f64).sqrt()
    }

    fn initial_step(&self, remaining: f64) -> f64 {
        let d0 = self.weighted_rms(&self.y);
        let d1 = self.weighted_rms(&self.f);
        let h = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };
        h.min(remaining.abs()) * remaining.signum()
    }

    /// Tries one step of size `h`. Returns the weighted error norm, or `None`
    /// when a stage iteration failed to converge.
    fn attempt<S>(&mut self, system: &S, h: f64) -> Result<Option<f64>>
    where
        S: DynamicalSystem<f64> + ?Sized,
    {
        let n = self.y.len();
        let gh = GAMMA * h;

        if self.settings.iteration == IterationType::Newton {
            let t = self.t;
            finite_difference_jacobian(
                |x, out| system.apply(t, x, out),
                &self.y,
                &self.f,
                &mut self.jacobian,
            )?;
            for i in 0..n {
                for j in 0..n {
                    let identity = if i == j { 1.0 } else { 0.0 };
                    self.iteration_matrix[i * n + j] = identity - gh * self.jacobian[i * n + j];
                }
            }
            self.settings.linear_solver.mask(n, &mut self.iteration_matrix);
        }

        // Stage 1 from y.
        self.base.copy_from_slice(&self.y);
        self.k1.copy_from_slice(&self.f);
        let mut k = std::mem::take(&mut self.k1);
        let converged = self.solve_stage(system, self.t + gh, gh, &mut k);
        self.k1 = k;
        if !converged? {
            return Ok(None);
        }

        // Stage 2 from y + (1 - γ) h K1.
        for i in 0..n {
            self.base[i] = self.y[i] + (1.0 - GAMMA) * h * self.k1[i];
        }
        self.k2.copy_from_slice(&self.k1);
        let mut k = std::mem::take(&mut self.k2);
        let converged = self.solve_stage(system, self.t + h, gh, &mut k);
        self.k2 = k;
        if !converged? {
            return Ok(None);
        }

        for i in 0..n {
            self.y_new[i] = self.y[i] + h * ((1.0 - GAMMA) * self.k1[i] + GAMMA * self.k2[i]);
            self.stage_rhs[i] = gh * (self.k2[i] - self.k1[i]);
        }
        if self.y_new.iter().any(|v| !v.is_finite()) {
            return Ok(None);
        }
        Ok(Some(self.weighted_rms(&self.stage_rhs)))
    }

    /// Solves `K = f(t, base + γ h K)` in place. `Ok(false)` means the
    /// iteration did not converge.
    fn solve_stage<S>(&mut self, system: &S, t: f64, gh: f64, k: &mut [f64]) -> Result<bool>
    where
        S: DynamicalSystem<f64> + ?Sized,
    {
        let n = k.len();
        let iterations = match self.settings.iteration {
            IterationType::Newton => MAX_NEWTON_ITERATIONS,
            IterationType::Functional => MAX_FUNCTIONAL_ITERATIONS,
        };

        for _ in 0..iterations {
            for i in 0..n {
                self.stage_state[i] = self.base[i] + gh * k[i];
            }
            if let Err(error) = system.apply(t, &self.stage_state, &mut self.stage_rhs) {
                return match error {
                    EvaluationError::Nonlinear { .. } => Ok(false),
                    other => Err(other.into()),
                };
            }

            let correction = match self.settings.iteration {
                IterationType::Functional => {
                    let mut delta = vec![0.0; n];
                    for i in 0..n {
                        delta[i] = self.stage_rhs[i] - k[i];
                    }
                    delta
                }
                IterationType::Newton => {
                    let residual: Vec<f64> = (0..n).map(|i| self.stage_rhs[i] - k[i]).collect();
                    match self.settings.linear_solver.solve(n, &self.iteration_matrix, &residual) {
                        Ok(delta) => delta,
                        Err(_) => return Ok(false),
                    }
                }
            };

            for i in 0..n {
                k[i] += correction[i];
            }
            let scaled: Vec<f64> = correction.iter().map(|c| gh * c).collect();
            let norm = self.weighted_rms(&scaled);
            if !norm.is_finite() {
                return Ok(false);
            }
            if norm <= STAGE_TOLERANCE {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn accept(&mut self, t_new: f64) {
        let last = LastStep {
            t0: self.t,
            y0: self.y.clone(),
            f0: self.f.clone(),
            t1: t_new,
            y1: self.y_new.clone(),
            f1: self.k2.clone(),
        };
        self.t = t_new;
        self.y.copy_from_slice(&self.y_new);
        self.f.copy_from_slice(&self.k2);
        self.last = Some(last);
    }
}

fn step_factor(error: f64) -> f64 {
    if error <= 0.0 {
        return MAX_FACTOR;
    }
    (SAFETY * error.powf(-0.5)).clamp(MIN_FACTOR, MAX_FACTOR)
}
