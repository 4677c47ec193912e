use crate::error::EvaluationError;
use crate::traits::{DynamicalSystem, Scalar, Steppable};

/// Butcher tableau of an explicit Runge-Kutta method.
#[derive(Debug)]
pub struct Tableau {
    pub c: &'static [f64],
    /// Strictly lower-triangular rows; row `i` has `i` entries.
    pub a: &'static [&'static [f64]],
    pub b: &'static [f64],
}

impl Tableau {
    pub fn stages(&self) -> usize {
        self.b.len()
    }
}

// Tableaus are statics; identity is equality.
impl PartialEq for Tableau {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

pub static FORWARD_EULER: Tableau = Tableau {
    c: &[0.0],
    a: &[&[]],
    b: &[1.0],
};

pub static HEUN: Tableau = Tableau {
    c: &[0.0, 1.0],
    a: &[&[], &[1.0]],
    b: &[0.5, 0.5],
};

/// Explicit midpoint method.
pub static SECOND_ORDER: Tableau = Tableau {
    c: &[0.0, 0.5],
    a: &[&[], &[0.5]],
    b: &[0.0, 1.0],
};

pub static FOURTH_ORDER: Tableau = Tableau {
    c: &[0.0, 0.5, 0.5, 1.0],
    a: &[&[], &[0.5], &[0.0, 0.5], &[0.0, 0.0, 1.0]],
    b: &[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
};

/// Tsitouras 5/4 used at a fixed step; the FSAL stage only feeds the error
/// estimate, so the update needs six stages.
pub static TSITOURAS5: Tableau = Tableau {
    c: &[0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0],
    a: &[
        &[],
        &[0.161],
        &[-0.008480655492356989, 0.335480655492357],
        &[2.898, -6.359447987781783, 4.361447987781783],
        &[
            5.325864858437957,
            -11.748883564062828,
            7.495539342889693,
            -0.09249506636030195,
        ],
        &[
            5.86145544294642,
            -12.92096931784711,
            8.159367898576159,
            -0.071584973281401,
            -0.02826857949054663,
        ],
    ],
    b: &[
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436099,
        2.324710524099774,
    ],
};

/// Fixed-step explicit Runge-Kutta integrator over any [`Scalar`].
pub struct ExplicitRungeKutta<T: Scalar> {
    tableau: &'static Tableau,
    k: Vec<Vec<T>>,
    tmp: Vec<T>,
}

impl<T: Scalar> ExplicitRungeKutta<T> {
    pub fn new(tableau: &'static Tableau, dim: usize) -> Self {
        Self {
            tableau,
            k: vec![vec![T::zero(); dim]; tableau.stages()],
            tmp: vec![T::zero(); dim],
        }
    }

    pub fn workspace_bytes(tableau: &Tableau, dim: usize) -> u64 {
        ((tableau.stages() + 1) * dim * std::mem::size_of::<T>()) as u64
    }
}

impl<T: Scalar> Steppable<T> for ExplicitRungeKutta<T> {
    fn step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> Result<(), EvaluationError> {
        let t0 = *t;
        let tableau = self.tableau;

        for stage in 0..tableau.stages() {
            for i in 0..state.len() {
                let mut increment = T::zero();
                for (j, &a) in tableau.a[stage].iter().enumerate() {
                    increment = increment + T::constant(a) * self.k[j][i];
                }
                self.tmp[i] = state[i] + dt * increment;
            }
            let stage_time = t0 + T::constant(tableau.c[stage]) * dt;
            system.apply(stage_time, &self.tmp, &mut self.k[stage])?;
        }

        for i in 0..state.len() {
            let mut increment = T::zero();
            for (stage, &b) in tableau.b.iter().enumerate() {
                increment = increment + T::constant(b) * self.k[stage][i];
            }
            state[i] = state[i] + dt * increment;
        }

        *t = t0 + dt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay;

    impl<T: Scalar> DynamicalSystem<T> for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: T, x: &[T], out: &mut [T]) -> Result<(), EvaluationError> {
            out[0] = -x[0];
            Ok(())
        }
    }

    struct Oscillator;

    impl DynamicalSystem<f64> for Oscillator {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) -> Result<(), EvaluationError> {
            out[0] = x[1];
            out[1] = -x[0];
            Ok(())
        }
    }

    fn integrate(tableau: &'static Tableau, steps: usize) -> f64 {
        let mut stepper = ExplicitRungeKutta::new(tableau, 1);
        let mut t = 0.0;
        let mut x = [1.0];
        let dt = 1.0 / steps as f64;
        for _ in 0..steps {
            stepper.step(&Decay, &mut t, &mut x, dt).expect("step");
        }
        assert!((t - 1.0f64).abs() < 1e-12);
        x[0]
    }

    #[test]
    fn consistent_tableaus() {
        for tableau in [&FORWARD_EULER, &HEUN, &SECOND_ORDER, &FOURTH_ORDER, &TSITOURAS5] {
            assert_eq!(tableau.c.len(), tableau.stages());
            assert_eq!(tableau.a.len(), tableau.stages());
            assert!((tableau.b.iter().sum::<f64>() - 1.0).abs() < 1e-9);
            for (i, row) in tableau.a.iter().enumerate() {
                assert_eq!(row.len(), i);
                assert!((row.iter().sum::<f64>() - tableau.c[i]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn convergence_orders() {
        let exact = (-1.0f64).exp();
        let order = |tableau: &'static Tableau| {
            let coarse = (integrate(tableau, 10) - exact).abs();
            let fine = (integrate(tableau, 20) - exact).abs();
            (coarse / fine).log2()
        };
        assert!((order(&FORWARD_EULER) - 1.0).abs() < 0.2);
        assert!((order(&HEUN) - 2.0).abs() < 0.2);
        assert!((order(&SECOND_ORDER) - 2.0).abs() < 0.2);
        assert!((order(&FOURTH_ORDER) - 4.0).abs() < 0.3);
        assert!((integrate(&TSITOURAS5, 10) - exact).abs() < 1e-6);
    }

    #[test]
    fn works_on_single_precision() {
        let mut stepper = ExplicitRungeKutta::<f32>::new(&FOURTH_ORDER, 1);
        let mut t = 0.0f32;
        let mut x = [1.0f32];
        for _ in 0..10 {
            stepper.step(&Decay, &mut t, &mut x, 0.1).expect("step");
        }
        assert!((x[0] - (-1.0f32).exp()).abs() < 1e-5);
    }

    #[test]
    fn rk4_keeps_an_oscillator_on_its_orbit() {
        let mut stepper = ExplicitRungeKutta::new(&FOURTH_ORDER, 2);
        let mut t = 0.0;
        let mut x = [1.0, 0.0];
        for _ in 0..1000 {
            stepper.step(&Oscillator, &mut t, &mut x, 0.01).expect("step");
        }
        assert!((x[0] - 10f64.cos()).abs() < 1e-6);
        assert!((x[1] + 10f64.sin()).abs() < 1e-6);
    }
}
