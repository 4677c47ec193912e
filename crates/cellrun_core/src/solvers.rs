//! Solver adapters.
//!
//! The solvers form a closed set ([`SolverKind`]) split into three families:
//! ODE integrators, the DAE integrator and the NLA root-finder. A
//! [`SolverSetup`] (kind plus loosely typed properties) is validated into a
//! [`SolverConfig`] before a run starts; [`plan_solvers`] pairs the ODE/DAE
//! solver with the NLA solver a model needs. During a run an [`Integrator`]
//! dispatches to the selected implementation by `match`.

pub mod dae;
pub mod explicit;
pub mod linalg;
pub mod newton;
pub mod properties;
pub mod sdirk;

use crate::error::{ConfigError, StepError};
use crate::traits::{DifferentialAlgebraicSystem, DynamicalSystem, Steppable};
use dae::{BackwardEulerDae, DaeSettings};
use explicit::{ExplicitRungeKutta, Tableau};
use linalg::LinearSolver;
use newton::{NewtonSettings, NewtonSolver};
use properties::*;
use sdirk::{IterationType, Sdirk, SdirkSettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    ForwardEuler,
    Heun,
    SecondOrderRungeKutta,
    FourthOrderRungeKutta,
    Tsitouras5,
    Sdirk,
    BackwardEulerDae,
    Newton,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolverFamily {
    Ode,
    Dae,
    Nla,
}

impl fmt::Display for SolverFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SolverFamily::Ode => "an ODE",
            SolverFamily::Dae => "a DAE",
            SolverFamily::Nla => "an NLA",
        })
    }
}

impl SolverKind {
    pub const ALL: [SolverKind; 8] = [
        SolverKind::ForwardEuler,
        SolverKind::Heun,
        SolverKind::SecondOrderRungeKutta,
        SolverKind::FourthOrderRungeKutta,
        SolverKind::Tsitouras5,
        SolverKind::Sdirk,
        SolverKind::BackwardEulerDae,
        SolverKind::Newton,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SolverKind::ForwardEuler => "forward Euler",
            SolverKind::Heun => "Heun",
            SolverKind::SecondOrderRungeKutta => "second-order Runge-Kutta",
            SolverKind::FourthOrderRungeKutta => "fourth-order Runge-Kutta",
            SolverKind::Tsitouras5 => "Tsitouras 5",
            SolverKind::Sdirk => "SDIRK",
            SolverKind::BackwardEulerDae => "backward Euler DAE",
            SolverKind::Newton => "Newton",
        }
    }

    pub fn family(self) -> SolverFamily {
        match self {
            SolverKind::BackwardEulerDae => SolverFamily::Dae,
            SolverKind::Newton => SolverFamily::Nla,
            _ => SolverFamily::Ode,
        }
    }

    fn tableau(self) -> Option<&'static Tableau> {
        match self {
            SolverKind::ForwardEuler => Some(&explicit::FORWARD_EULER),
            SolverKind::Heun => Some(&explicit::HEUN),
            SolverKind::SecondOrderRungeKutta => Some(&explicit::SECOND_ORDER),
            SolverKind::FourthOrderRungeKutta => Some(&explicit::FOURTH_ORDER),
            SolverKind::Tsitouras5 => Some(&explicit::TSITOURAS5),
            _ => None,
        }
    }

    /// Property schema of this solver.
    pub fn properties(self) -> &'static [PropertyDescriptor] {
        match self {
            SolverKind::Sdirk => SDIRK_PROPERTIES,
            SolverKind::BackwardEulerDae => DAE_PROPERTIES,
            SolverKind::Newton => NEWTON_PROPERTIES,
            _ => &[],
        }
    }

    /// Validates `properties` for a system of `dimension` unknowns.
    pub fn configure(
        self,
        properties: &SolverProperties,
        dimension: usize,
    ) -> Result<SolverConfig, ConfigError> {
        let resolved = resolve(self.name(), self.properties(), properties, dimension)?;

        if let Some(tableau) = self.tableau() {
            return Ok(SolverConfig::Explicit {
                kind: self,
                tableau,
            });
        }

        let config = match self {
            SolverKind::Sdirk => SolverConfig::Sdirk(SdirkSettings {
                max_step: resolved.double(MAXIMUM_STEP)?,
                max_steps: resolved.count(MAXIMUM_NUMBER_OF_STEPS)?,
                iteration: match resolved.item(ITERATION_TYPE)? {
                    FUNCTIONAL_ITERATION => IterationType::Functional,
                    _ => IterationType::Newton,
                },
                linear_solver: linear_solver(&resolved)?,
                relative_tolerance: resolved.double(RELATIVE_TOLERANCE)?,
                absolute_tolerance: resolved.double(ABSOLUTE_TOLERANCE)?,
                interpolate: resolved.boolean(INTERPOLATE_SOLUTION)?,
            }),
            SolverKind::BackwardEulerDae => SolverConfig::Dae(DaeSettings {
                max_step: resolved.double(MAXIMUM_STEP)?,
                max_steps: resolved.count(MAXIMUM_NUMBER_OF_STEPS)?,
            }),
            _ => SolverConfig::Newton(NewtonSettings {
                max_iterations: resolved.count(MAXIMUM_NUMBER_OF_ITERATIONS)?,
                tolerance: resolved.double(TOLERANCE)?,
                damping: resolved.double(DAMPING_FACTOR)?,
                linear_solver: linear_solver(&resolved)?,
            }),
        };
        Ok(config)
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn linear_solver(resolved: &ResolvedProperties) -> Result<LinearSolver, ConfigError> {
    Ok(match resolved.item(LINEAR_SOLVER)? {
        BANDED => LinearSolver::Banded {
            upper: resolved.count(UPPER_HALF_BANDWIDTH)?,
            lower: resolved.count(LOWER_HALF_BANDWIDTH)?,
        },
        DIAGONAL => LinearSolver::Diagonal,
        _ => LinearSolver::Dense,
    })
}

/// A solver selection as a user states it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSetup {
    pub kind: SolverKind,
    #[serde(default)]
    pub properties: SolverProperties,
}

impl SolverSetup {
    pub fn new(kind: SolverKind) -> Self {
        Self {
            kind,
            properties: SolverProperties::new(),
        }
    }

    pub fn with(mut self, id: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(id.to_string(), value.into());
        self
    }
}

/// A validated solver configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SolverConfig {
    Explicit {
        kind: SolverKind,
        tableau: &'static Tableau,
    },
    Sdirk(SdirkSettings),
    Dae(DaeSettings),
    Newton(NewtonSettings),
}

impl SolverConfig {
    pub fn kind(&self) -> SolverKind {
        match self {
            SolverConfig::Explicit { kind, .. } => *kind,
            SolverConfig::Sdirk(_) => SolverKind::Sdirk,
            SolverConfig::Dae(_) => SolverKind::BackwardEulerDae,
            SolverConfig::Newton(_) => SolverKind::Newton,
        }
    }

    /// Memory the solver needs for `states` state variables and `unknowns`
    /// algebraic unknowns.
    pub fn workspace_bytes(&self, states: usize, unknowns: usize) -> u64 {
        match self {
            SolverConfig::Explicit { tableau, .. } => {
                ExplicitRungeKutta::<f64>::workspace_bytes(tableau, states)
            }
            SolverConfig::Sdirk(settings) => Sdirk::workspace_bytes(settings, states),
            SolverConfig::Dae(_) => BackwardEulerDae::workspace_bytes(states, unknowns),
            SolverConfig::Newton(_) => NewtonSolver::workspace_bytes(unknowns),
        }
    }
}

/// The solvers of one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverPlan {
    pub ode: SolverConfig,
    pub nla: Option<NewtonSettings>,
}

impl SolverPlan {
    pub fn workspace_bytes(&self, states: usize, unknowns: usize) -> u64 {
        let nla = self.nla.map_or(0, |_| NewtonSolver::workspace_bytes(unknowns));
        self.ode.workspace_bytes(states, unknowns) + nla
    }
}

/// Pairs the selected solvers with what the model needs.
///
/// A model with algebraic unknowns needs an NLA solver next to its ODE
/// solver; the DAE solver always needs one.
pub fn plan_solvers(
    states: usize,
    unknowns: usize,
    ode: Option<&SolverSetup>,
    nla: Option<&SolverSetup>,
) -> Result<SolverPlan, ConfigError> {
    if let Some(setup) = ode {
        if setup.kind.family() == SolverFamily::Nla {
            return Err(wrong_family(setup.kind, "the ODE solver"));
        }
    }
    if let Some(setup) = nla {
        if setup.kind.family() != SolverFamily::Nla {
            return Err(wrong_family(setup.kind, "the NLA solver"));
        }
    }

    let dae = ode.is_some_and(|setup| setup.kind.family() == SolverFamily::Dae);
    let needs_nla = unknowns > 0 || dae;
    let integrator = if dae { "DAE" } else { "ODE" };

    let missing = |detail: String| ConfigError::MissingSolver { message: detail };
    let (ode, nla) = if needs_nla {
        let needs = format!(
            "the model needs both {} and an NLA solver",
            if dae { "a DAE" } else { "an ODE" }
        );
        match (ode, nla) {
            (Some(ode), Some(nla)) => (ode, Some(nla)),
            (Some(_), None) => {
                return Err(missing(format!("{needs}, but no NLA solver is available")))
            }
            (None, Some(_)) => {
                return Err(missing(format!(
                    "{needs}, but no {integrator} solver is available"
                )))
            }
            (None, None) => return Err(missing(format!("{needs}, but none are available"))),
        }
    } else {
        match ode {
            Some(ode) => {
                if nla.is_some() {
                    debug!("the model has no algebraic unknowns, ignoring the NLA solver");
                }
                (ode, None)
            }
            None => {
                return Err(missing(
                    "the model needs an ODE solver, but none is available".to_string(),
                ))
            }
        }
    };

    let ode_config = ode.kind.configure(&ode.properties, states)?;
    let nla_config = match nla {
        Some(setup) => {
            let dimension = if dae { states + unknowns } else { unknowns };
            match setup.kind.configure(&setup.properties, dimension)? {
                SolverConfig::Newton(settings) => Some(settings),
                _ => return Err(wrong_family(setup.kind, "the NLA solver")),
            }
        }
        None => None,
    };

    debug!(
        ode = ode_config.kind().name(),
        nla = nla_config.is_some(),
        "solvers planned"
    );
    Ok(SolverPlan {
        ode: ode_config,
        nla: nla_config,
    })
}

fn wrong_family(kind: SolverKind, slot: &str) -> ConfigError {
    ConfigError::WrongFamily {
        solver: kind.name().to_string(),
        family: kind.family().to_string(),
        slot: slot.to_string(),
    }
}

/// A running integrator.
pub enum Integrator {
    Explicit {
        kind: SolverKind,
        stepper: ExplicitRungeKutta<f64>,
        t: f64,
        states: Vec<f64>,
    },
    Sdirk(Box<Sdirk>),
    Dae(BackwardEulerDae),
}

impl Integrator {
    /// Creates the integrator of `plan` at `(t0, states)`; `unknowns` seeds
    /// the algebraic part of the DAE solver.
    pub fn initialize(
        plan: &SolverPlan,
        t0: f64,
        states: &[f64],
        unknowns: &[f64],
    ) -> Result<Self, ConfigError> {
        let integrator = match plan.ode {
            SolverConfig::Explicit { kind, tableau } => Integrator::Explicit {
                kind,
                stepper: ExplicitRungeKutta::new(tableau, states.len()),
                t: t0,
                states: states.to_vec(),
            },
            SolverConfig::Sdirk(settings) => {
                Integrator::Sdirk(Box::new(Sdirk::new(settings, t0, states)))
            }
            SolverConfig::Dae(settings) => {
                let newton = plan.nla.ok_or_else(|| ConfigError::MissingSolver {
                    message: "the model needs both a DAE and an NLA solver, but no NLA solver is available"
                        .to_string(),
                })?;
                Integrator::Dae(BackwardEulerDae::new(settings, newton, t0, states, unknowns))
            }
            SolverConfig::Newton(_) => {
                return Err(wrong_family(SolverKind::Newton, "the ODE solver"))
            }
        };
        debug!(solver = integrator.kind().name(), t0, "integrator initialized");
        Ok(integrator)
    }

    pub fn kind(&self) -> SolverKind {
        match self {
            Integrator::Explicit { kind, .. } => *kind,
            Integrator::Sdirk(_) => SolverKind::Sdirk,
            Integrator::Dae(_) => SolverKind::BackwardEulerDae,
        }
    }

    pub fn time(&self) -> f64 {
        match self {
            Integrator::Explicit { t, .. } => *t,
            Integrator::Sdirk(sdirk) => sdirk.time(),
            Integrator::Dae(dae) => dae.time(),
        }
    }

    pub fn states(&self) -> &[f64] {
        match self {
            Integrator::Explicit { states, .. } => states,
            Integrator::Sdirk(sdirk) => sdirk.states(),
            Integrator::Dae(dae) => dae.states(),
        }
    }

    /// Advances to `target` and returns the time of the new states.
    pub fn step<S>(&mut self, system: &S, target: f64) -> Result<f64, StepError>
    where
        S: DynamicalSystem<f64> + DifferentialAlgebraicSystem,
    {
        let name = self.kind().name();
        let start = self.time();
        let failed = |e: anyhow::Error| StepError::new(name, start, format!("{e:#}"));
        match self {
            Integrator::Explicit {
                stepper, t, states, ..
            } => {
                let dt = target - *t;
                stepper
                    .step(system, t, states, dt)
                    .map_err(|e| StepError::new(name, start, e))?;
                *t = target;
                Ok(target)
            }
            Integrator::Sdirk(sdirk) => sdirk.advance(system, target).map_err(failed),
            Integrator::Dae(dae) => dae.advance(system, target).map_err(failed),
        }
    }

    pub fn supports_dense_output(&self) -> bool {
        matches!(self, Integrator::Sdirk(sdirk) if sdirk.settings().interpolate)
    }

    pub fn interpolate(&self, time: f64, out: &mut [f64]) -> Result<(), StepError> {
        match self {
            Integrator::Sdirk(sdirk) => sdirk
                .interpolate(time, out)
                .map_err(|e| StepError::new(self.kind().name(), time, format!("{e:#}"))),
            _ => Err(StepError::new(
                self.kind().name(),
                time,
                "Dense output is not supported.",
            )),
        }
    }

    /// Restarts from new values, keeping the configuration.
    pub fn reinitialize(&mut self, t0: f64, states: &[f64], unknowns: &[f64]) {
        match self {
            Integrator::Explicit {
                t, states: current, ..
            } => {
                *t = t0;
                current.copy_from_slice(states);
            }
            Integrator::Sdirk(sdirk) => sdirk.reinitialize(t0, states),
            Integrator::Dae(dae) => dae.reinitialize(t0, states, unknowns),
        }
    }

    pub fn dispose(self) {
        debug!(solver = self.kind().name(), t = self.time(), "integrator disposed");
    }
}
