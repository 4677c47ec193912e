use crate::error::EvaluationError;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the integrators.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {
    /// Converts a coefficient, falling back to NaN when it is not representable.
    fn constant(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }
}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A right-hand side `dy/dt = f(t, y)`.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field at `(t, x)` into `out`.
    fn apply(&self, t: T, x: &[T], out: &mut [T]) -> Result<(), EvaluationError>;
}

/// A square system `f(x) = 0` handed to the nonlinear solver.
pub trait NonlinearSystem {
    fn dimension(&self) -> usize;

    fn residual(&mut self, x: &[f64], out: &mut [f64]) -> Result<(), EvaluationError>;
}

/// A trait for fixed-step integrators.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    fn step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> Result<(), EvaluationError>;
}

/// A semi-explicit index-1 system `y' = f(t, y, z)`, `0 = g(t, y, z)`.
pub trait DifferentialAlgebraicSystem {
    fn state_dimension(&self) -> usize;

    fn algebraic_dimension(&self) -> usize;

    fn rates(&self, t: f64, y: &[f64], z: &[f64], out: &mut [f64]) -> Result<(), EvaluationError>;

    fn constraints(
        &self,
        t: f64,
        y: &[f64],
        z: &[f64],
        out: &mut [f64],
    ) -> Result<(), EvaluationError>;
}
