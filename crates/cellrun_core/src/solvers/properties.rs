//! Solver property schemas and their validation.
//!
//! Properties arrive as a loosely typed map (usually deserialized from a
//! user's settings) and are checked against the solver's schema before any
//! run starts. A missing property takes its default; anything else that does
//! not fit the schema is an error naming the property.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAXIMUM_STEP: &str = "MaximumStep";
pub const MAXIMUM_NUMBER_OF_STEPS: &str = "MaximumNumberOfSteps";
pub const ITERATION_TYPE: &str = "IterationType";
pub const LINEAR_SOLVER: &str = "LinearSolver";
pub const UPPER_HALF_BANDWIDTH: &str = "UpperHalfBandwidth";
pub const LOWER_HALF_BANDWIDTH: &str = "LowerHalfBandwidth";
pub const RELATIVE_TOLERANCE: &str = "RelativeTolerance";
pub const ABSOLUTE_TOLERANCE: &str = "AbsoluteTolerance";
pub const INTERPOLATE_SOLUTION: &str = "InterpolateSolution";
pub const MAXIMUM_NUMBER_OF_ITERATIONS: &str = "MaximumNumberOfIterations";
pub const TOLERANCE: &str = "Tolerance";
pub const DAMPING_FACTOR: &str = "DampingFactor";

pub const NEWTON_ITERATION: &str = "Newton";
pub const FUNCTIONAL_ITERATION: &str = "Functional";
pub const DENSE: &str = "Dense";
pub const BANDED: &str = "Banded";
pub const DIAGONAL: &str = "Diagonal";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Text(String),
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

/// Property values keyed by property id.
pub type SolverProperties = BTreeMap<String, PropertyValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    None,
    NonNegative,
    Positive,
    /// `(0, 1]`
    UnitInterval,
}

impl Bound {
    fn admits(self, value: f64) -> bool {
        match self {
            Bound::None => true,
            Bound::NonNegative => value >= 0.0,
            Bound::Positive => value > 0.0,
            Bound::UnitInterval => value > 0.0 && value <= 1.0,
        }
    }

    fn requirement(self) -> &'static str {
        match self {
            Bound::None => "must have a value",
            Bound::NonNegative => "must have a value greater than or equal to 0",
            Bound::Positive => "must have a value greater than 0",
            Bound::UnitInterval => {
                "must have a value greater than 0 and smaller than or equal to 1"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyKind {
    Boolean,
    Integer(Bound),
    Double(Bound),
    List(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Item(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertyDescriptor {
    pub id: &'static str,
    /// Lower-case name used in messages.
    pub description: &'static str,
    pub kind: PropertyKind,
    pub default: DefaultValue,
    /// The value is expressed in the unit of the variable of integration.
    pub has_voi_unit: bool,
}

const LINEAR_SOLVERS: &[&str] = &[DENSE, BANDED, DIAGONAL];
const NEWTON_LINEAR_SOLVERS: &[&str] = &[DENSE, BANDED];

const fn bandwidth(id: &'static str, description: &'static str) -> PropertyDescriptor {
    PropertyDescriptor {
        id,
        description,
        kind: PropertyKind::Integer(Bound::NonNegative),
        default: DefaultValue::Integer(0),
        has_voi_unit: false,
    }
}

pub static SDIRK_PROPERTIES: &[PropertyDescriptor] = &[
    PropertyDescriptor {
        id: MAXIMUM_STEP,
        description: "maximum step",
        kind: PropertyKind::Double(Bound::NonNegative),
        default: DefaultValue::Double(0.0),
        has_voi_unit: true,
    },
    PropertyDescriptor {
        id: MAXIMUM_NUMBER_OF_STEPS,
        description: "maximum number of steps",
        kind: PropertyKind::Integer(Bound::Positive),
        default: DefaultValue::Integer(500),
        has_voi_unit: false,
    },
    PropertyDescriptor {
        id: ITERATION_TYPE,
        description: "iteration type",
        kind: PropertyKind::List(&[NEWTON_ITERATION, FUNCTIONAL_ITERATION]),
        default: DefaultValue::Item(NEWTON_ITERATION),
        has_voi_unit: false,
    },
    PropertyDescriptor {
        id: LINEAR_SOLVER,
        description: "linear solver",
        kind: PropertyKind::List(LINEAR_SOLVERS),
        default: DefaultValue::Item(DENSE),
        has_voi_unit: false,
    },
    bandwidth(UPPER_HALF_BANDWIDTH, "upper half-bandwidth"),
    bandwidth(LOWER_HALF_BANDWIDTH, "lower half-bandwidth"),
    PropertyDescriptor {
        id: RELATIVE_TOLERANCE,
        description: "relative tolerance",
        kind: PropertyKind::Double(Bound::NonNegative),
        default: DefaultValue::Double(1e-7),
        has_voi_unit: false,
    },
    PropertyDescriptor {
        id: ABSOLUTE_TOLERANCE,
        description: "absolute tolerance",
        kind: PropertyKind::Double(Bound::NonNegative),
        default: DefaultValue::Double(1e-7),
        has_voi_unit: false,
    },
    PropertyDescriptor {
        id: INTERPOLATE_SOLUTION,
        description: "interpolate solution",
        kind: PropertyKind::Boolean,
        default: DefaultValue::Boolean(true),
        has_voi_unit: false,
    },
];

pub static DAE_PROPERTIES: &[PropertyDescriptor] = &[
    PropertyDescriptor {
        id: MAXIMUM_STEP,
        description: "maximum step",
        kind: PropertyKind::Double(Bound::NonNegative),
        default: DefaultValue::Double(0.0),
        has_voi_unit: true,
    },
    PropertyDescriptor {
        id: MAXIMUM_NUMBER_OF_STEPS,
        description: "maximum number of steps",
        kind: PropertyKind::Integer(Bound::Positive),
        default: DefaultValue::Integer(10_000),
        has_voi_unit: false,
    },
];

pub static NEWTON_PROPERTIES: &[PropertyDescriptor] = &[
    PropertyDescriptor {
        id: MAXIMUM_NUMBER_OF_ITERATIONS,
        description: "maximum number of iterations",
        kind: PropertyKind::Integer(Bound::Positive),
        default: DefaultValue::Integer(200),
        has_voi_unit: false,
    },
    PropertyDescriptor {
        id: TOLERANCE,
        description: "tolerance",
        kind: PropertyKind::Double(Bound::Positive),
        default: DefaultValue::Double(1e-10),
        has_voi_unit: false,
    },
    PropertyDescriptor {
        id: DAMPING_FACTOR,
        description: "damping factor",
        kind: PropertyKind::Double(Bound::UnitInterval),
        default: DefaultValue::Double(1.0),
        has_voi_unit: false,
    },
    PropertyDescriptor {
        id: LINEAR_SOLVER,
        description: "linear solver",
        kind: PropertyKind::List(NEWTON_LINEAR_SOLVERS),
        default: DefaultValue::Item(DENSE),
        has_voi_unit: false,
    },
    bandwidth(UPPER_HALF_BANDWIDTH, "upper half-bandwidth"),
    bandwidth(LOWER_HALF_BANDWIDTH, "lower half-bandwidth"),
];

#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Item(&'static str),
}

/// Validated values for every property of a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProperties {
    values: BTreeMap<&'static str, (&'static str, Resolved)>,
}

impl ResolvedProperties {
    fn get(&self, id: &str, expected: &'static str) -> Result<&Resolved, ConfigError> {
        self.values
            .get(id)
            .map(|(_, value)| value)
            .ok_or_else(|| ConfigError::PropertyType {
                property: id.to_string(),
                expected,
            })
    }

    fn mismatch(&self, id: &str, expected: &'static str) -> ConfigError {
        let property = self
            .values
            .get(id)
            .map_or(id, |(description, _)| *description)
            .to_string();
        ConfigError::PropertyType { property, expected }
    }

    pub fn boolean(&self, id: &str) -> Result<bool, ConfigError> {
        match self.get(id, "a boolean")? {
            Resolved::Boolean(value) => Ok(*value),
            _ => Err(self.mismatch(id, "a boolean")),
        }
    }

    pub fn integer(&self, id: &str) -> Result<i64, ConfigError> {
        match self.get(id, "an integer")? {
            Resolved::Integer(value) => Ok(*value),
            _ => Err(self.mismatch(id, "an integer")),
        }
    }

    pub fn count(&self, id: &str) -> Result<usize, ConfigError> {
        let value = self.integer(id)?;
        usize::try_from(value).map_err(|_| self.mismatch(id, "a non-negative integer"))
    }

    pub fn double(&self, id: &str) -> Result<f64, ConfigError> {
        match self.get(id, "a double")? {
            Resolved::Double(value) => Ok(*value),
            _ => Err(self.mismatch(id, "a double")),
        }
    }

    pub fn item(&self, id: &str) -> Result<&'static str, ConfigError> {
        match self.get(id, "a text")? {
            Resolved::Item(value) => Ok(value),
            _ => Err(self.mismatch(id, "a text")),
        }
    }
}

/// Checks `properties` against `schema`, filling in defaults.
///
/// `state_count` bounds the half-bandwidths when the banded linear solver is
/// selected.
pub fn resolve(
    solver: &str,
    schema: &[PropertyDescriptor],
    properties: &SolverProperties,
    state_count: usize,
) -> Result<ResolvedProperties, ConfigError> {
    if let Some(unknown) = properties
        .keys()
        .find(|key| !schema.iter().any(|d| d.id == key.as_str()))
    {
        return Err(ConfigError::UnknownProperty {
            solver: solver.to_string(),
            property: unknown.clone(),
        });
    }

    let mut values = BTreeMap::new();
    for descriptor in schema {
        let value = match properties.get(descriptor.id) {
            Some(value) => check(descriptor, value)?,
            None => default_of(descriptor),
        };
        values.insert(descriptor.id, (descriptor.description, value));
    }
    let resolved = ResolvedProperties { values };

    let banded = schema.iter().any(|d| d.id == LINEAR_SOLVER)
        && resolved.item(LINEAR_SOLVER)? == BANDED;
    if banded {
        let last = state_count.saturating_sub(1);
        for descriptor in schema
            .iter()
            .filter(|d| d.id == UPPER_HALF_BANDWIDTH || d.id == LOWER_HALF_BANDWIDTH)
        {
            let value = resolved.integer(descriptor.id)?;
            if value < 0 || value as usize > last {
                return Err(ConfigError::PropertyBounds {
                    property: descriptor.description.to_string(),
                    requirement: format!("must have a value between 0 and {last}"),
                });
            }
        }
    }

    Ok(resolved)
}

fn default_of(descriptor: &PropertyDescriptor) -> Resolved {
    match descriptor.default {
        DefaultValue::Boolean(value) => Resolved::Boolean(value),
        DefaultValue::Integer(value) => Resolved::Integer(value),
        DefaultValue::Double(value) => Resolved::Double(value),
        DefaultValue::Item(value) => Resolved::Item(value),
    }
}

fn check(descriptor: &PropertyDescriptor, value: &PropertyValue) -> Result<Resolved, ConfigError> {
    let property = || descriptor.description.to_string();
    let wrong_type = |expected| ConfigError::PropertyType {
        property: property(),
        expected,
    };
    let out_of_bounds = |requirement: &str| ConfigError::PropertyBounds {
        property: property(),
        requirement: requirement.to_string(),
    };

    match (descriptor.kind, value) {
        (PropertyKind::Boolean, PropertyValue::Boolean(value)) => Ok(Resolved::Boolean(*value)),
        (PropertyKind::Boolean, _) => Err(wrong_type("a boolean")),

        (PropertyKind::Integer(bound), PropertyValue::Integer(value)) => {
            if bound.admits(*value as f64) {
                Ok(Resolved::Integer(*value))
            } else {
                Err(out_of_bounds(bound.requirement()))
            }
        }
        (PropertyKind::Integer(_), _) => Err(wrong_type("an integer")),

        (PropertyKind::Double(bound), PropertyValue::Double(_) | PropertyValue::Integer(_)) => {
            let value = match value {
                PropertyValue::Integer(value) => *value as f64,
                PropertyValue::Double(value) => *value,
                _ => f64::NAN,
            };
            if !value.is_finite() {
                Err(out_of_bounds("must have a finite value"))
            } else if bound.admits(value) {
                Ok(Resolved::Double(value))
            } else {
                Err(out_of_bounds(bound.requirement()))
            }
        }
        (PropertyKind::Double(_), _) => Err(wrong_type("a double")),

        (PropertyKind::List(items), PropertyValue::Text(text)) => items
            .iter()
            .copied()
            .find(|item| *item == text.as_str())
            .map(Resolved::Item)
            .ok_or_else(|| out_of_bounds(&format!("must be one of {}", items.join(", ")))),
        (PropertyKind::List(_), _) => Err(wrong_type("a text")),
    }
}
