use crate::error::EvaluationError;
use anyhow::{anyhow, bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// How the Newton corrections of the implicit solvers are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearSolver {
    Dense,
    /// The Jacobian is restricted to the given half-bandwidths.
    Banded { upper: usize, lower: usize },
    /// Only the diagonal of the Jacobian is kept.
    Diagonal,
}

impl LinearSolver {
    /// Zeroes the entries of a row-major `dim × dim` matrix outside the
    /// structure this solver assumes.
    pub fn mask(&self, dim: usize, matrix: &mut [f64]) {
        match *self {
            LinearSolver::Dense => {}
            LinearSolver::Banded { upper, lower } => {
                for i in 0..dim {
                    for j in 0..dim {
                        if j > i + upper || i > j + lower {
                            matrix[i * dim + j] = 0.0;
                        }
                    }
                }
            }
            LinearSolver::Diagonal => {
                for i in 0..dim {
                    for j in 0..dim {
                        if i != j {
                            matrix[i * dim + j] = 0.0;
                        }
                    }
                }
            }
        }
    }

    /// Solves `matrix · x = rhs`.
    pub fn solve(&self, dim: usize, matrix: &[f64], rhs: &[f64]) -> Result<Vec<f64>> {
        match self {
            LinearSolver::Diagonal => (0..dim)
                .map(|i| {
                    let pivot = matrix[i * dim + i];
                    if pivot == 0.0 || !pivot.is_finite() {
                        bail!("Jacobian is singular.");
                    }
                    Ok(rhs[i] / pivot)
                })
                .collect(),
            _ => solve_dense(dim, matrix, rhs),
        }
    }
}

pub(crate) fn solve_dense(dim: usize, matrix: &[f64], rhs: &[f64]) -> Result<Vec<f64>> {
    if matrix.iter().any(|v| !v.is_finite()) {
        bail!("Jacobian has non-finite entries.");
    }
    let m = DMatrix::from_row_slice(dim, dim, matrix);
    let rhs = DVector::from_column_slice(rhs);
    m.lu()
        .solve(&rhs)
        .map(|v| v.iter().cloned().collect())
        .ok_or_else(|| anyhow!("Jacobian is singular."))
}

/// Forward-difference Jacobian of `f` at `x`, row-major into `out`.
///
/// `fx` must hold `f(x)`.
pub(crate) fn finite_difference_jacobian<F>(
    mut f: F,
    x: &[f64],
    fx: &[f64],
    out: &mut [f64],
) -> Result<(), EvaluationError>
where
    F: FnMut(&[f64], &mut [f64]) -> Result<(), EvaluationError>,
{
    let rows = fx.len();
    let cols = x.len();
    let sqrt_eps = f64::EPSILON.sqrt();
    let mut perturbed = x.to_vec();
    let mut column = vec![0.0; rows];

    for j in 0..cols {
        let delta = sqrt_eps * x[j].abs().max(1.0);
        perturbed[j] = x[j] + delta;
        let delta = perturbed[j] - x[j];
        f(&perturbed, &mut column)?;
        for i in 0..rows {
            out[i * cols + j] = (column[i] - fx[i]) / delta;
        }
        perturbed[j] = x[j];
    }
    Ok(())
}

pub(crate) fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_mask_keeps_the_requested_diagonals() {
        let mut m = vec![1.0; 16];
        LinearSolver::Banded { upper: 1, lower: 0 }.mask(4, &mut m);
        assert_eq!(
            m,
            vec![
                1.0, 1.0, 0.0, 0.0, //
                0.0, 1.0, 1.0, 0.0, //
                0.0, 0.0, 1.0, 1.0, //
                0.0, 0.0, 0.0, 1.0,
            ]
        );
    }

    #[test]
    fn dense_and_diagonal_solves() {
        let m = [4.0, 1.0, 2.0, 3.0];
        let x = LinearSolver::Dense.solve(2, &m, &[1.0, 2.0]).expect("solve");
        assert!((4.0 * x[0] + x[1] - 1.0).abs() < 1e-12);
        assert!((2.0 * x[0] + 3.0 * x[1] - 2.0).abs() < 1e-12);

        let x = LinearSolver::Diagonal
            .solve(2, &[2.0, 0.0, 0.0, 4.0], &[1.0, 1.0])
            .expect("solve");
        assert_eq!(x, vec![0.5, 0.25]);
    }

    #[test]
    fn singular_matrices_are_reported() {
        let err = LinearSolver::Dense
            .solve(2, &[1.0, 2.0, 2.0, 4.0], &[1.0, 1.0])
            .expect_err("singular");
        assert_eq!(err.to_string(), "Jacobian is singular.");
        assert!(LinearSolver::Diagonal
            .solve(1, &[0.0], &[1.0])
            .is_err());
    }

    #[test]
    fn finite_differences_match_the_analytic_jacobian() {
        let f = |x: &[f64], out: &mut [f64]| {
            out[0] = x[0] * x[0] + x[1];
            out[1] = x[0].sin() * x[1];
            Ok(())
        };
        let x = [1.5, -2.0];
        let mut fx = [0.0; 2];
        f(&x, &mut fx).expect("f");
        let mut jac = [0.0; 4];
        finite_difference_jacobian(f, &x, &fx, &mut jac).expect("jacobian");
        let expected = [3.0, 1.0, 1.5f64.cos() * -2.0, 1.5f64.sin()];
        for (a, b) in jac.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }
}
