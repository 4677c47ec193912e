//! Small models shared by the unit tests.

use crate::model::{EntryPoints, ModelDescription, VariableInfo};

fn variables(names: &[&str], unit: &str) -> Vec<VariableInfo> {
    names
        .iter()
        .map(|name| VariableInfo {
            unit: unit.to_string(),
            ..VariableInfo::new(name)
        })
        .collect()
}

fn describe(source: &str, states: &[&str], constants: &[&str], algebraic: &[&str]) -> ModelDescription {
    ModelDescription {
        source: source.to_string(),
        voi: VariableInfo {
            unit: "s".to_string(),
            ..VariableInfo::new("t")
        },
        states: variables(states, "m"),
        constants: variables(constants, ""),
        algebraic: variables(algebraic, ""),
        entry_points: EntryPoints::default(),
        nla_unknowns: Vec::new(),
    }
}

/// `x'' = -omega² x` with `x(0) = 1`, `y = x'`, and `energy` constant at 1.
pub fn oscillator() -> ModelDescription {
    describe(
        r#"
void initialize_constants(double *CONSTANTS, double *RATES, double *STATES)
{
    STATES[0] = 1.0;
    STATES[1] = 0.0;
    CONSTANTS[0] = 2.0;
}

void compute_computed_constants(double VOI, double *CONSTANTS, double *RATES, double *STATES, double *ALGEBRAIC)
{
    CONSTANTS[1] = CONSTANTS[0] * CONSTANTS[0];
}

void compute_rates(double VOI, double *CONSTANTS, double *RATES, double *STATES, double *ALGEBRAIC)
{
    RATES[0] = STATES[1];
    RATES[1] = -CONSTANTS[1] * STATES[0];
}

void compute_variables(double VOI, double *CONSTANTS, double *RATES, double *STATES, double *ALGEBRAIC)
{
    ALGEBRAIC[0] = STATES[0] * STATES[0] + STATES[1] * STATES[1] / CONSTANTS[1];
}
"#,
        &["x", "y"],
        &["omega", "omega2"],
        &["energy"],
    )
}

/// `x' = -k x` with `x(0) = 1` and `k = 1`.
pub fn decay() -> ModelDescription {
    describe(
        r#"
void initialize_constants(double *CONSTANTS, double *RATES, double *STATES)
{
    STATES[0] = 1.0;
    CONSTANTS[0] = 1.0;
}

void compute_rates(double VOI, double *CONSTANTS, double *RATES, double *STATES, double *ALGEBRAIC)
{
    RATES[0] = -CONSTANTS[0] * STATES[0];
}
"#,
        &["x"],
        &["k"],
        &[],
    )
}

/// `x' = -z` where `z³ + z - x = 0`, with `x(0) = 2`.
pub fn algebraic() -> ModelDescription {
    let mut description = describe(
        r#"
void initialize_constants(double *CONSTANTS, double *RATES, double *STATES)
{
    STATES[0] = 2.0;
}

void compute_rates(double VOI, double *CONSTANTS, double *RATES, double *STATES, double *ALGEBRAIC)
{
    RATES[0] = -ALGEBRAIC[0];
}

void compute_residuals(double VOI, double *CONSTANTS, double *RATES, double *STATES, double *ALGEBRAIC, double *RESIDUALS)
{
    RESIDUALS[0] = ALGEBRAIC[0] * ALGEBRAIC[0] * ALGEBRAIC[0] + ALGEBRAIC[0] - STATES[0];
}
"#,
        &["x"],
        &[],
        &["z"],
    );
    description.nla_unknowns = vec![0];
    description
}

/// Decay whose rates report error code 3 once `t` exceeds `threshold`.
pub fn failing(threshold: f64) -> ModelDescription {
    describe(
        &format!(
            r#"
void initialize_constants(double *CONSTANTS, double *RATES, double *STATES)
{{
    STATES[0] = 1.0;
}}

void compute_rates(double VOI, double *CONSTANTS, double *RATES, double *STATES, double *ALGEBRAIC)
{{
    RATES[0] = VOI > {threshold:?} ? report_error(3) : -STATES[0];
}}
"#
        ),
        &["x"],
        &[],
        &[],
    )
}
