//! Compiled models.
//!
//! A [`ModelDescription`] carries the generated source text and the metadata
//! of its variables. [`ModelRuntime::compile`] parses and compiles the source,
//! then binds and checks the entry points the simulation calls:
//!
//! ```text
//! void initialize_constants(double *constants, double *rates, double *states)
//! void compute_computed_constants(double voi, double *constants, double *rates, double *states, double *algebraic)
//! void compute_rates(double voi, double *constants, double *rates, double *states, double *algebraic)
//! void compute_variables(double voi, double *constants, double *rates, double *states, double *algebraic)
//! void compute_residuals(double voi, double *constants, double *rates, double *states, double *algebraic, double *residuals)
//! ```
//!
//! `initialize_constants` and `compute_rates` are required,
//! `compute_residuals` is required when the model has algebraic unknowns and
//! the others are optional.

use crate::codegen::{check_reported, CompilationContext, CompiledFunction};
use crate::config::EngineConfig;
use crate::equation_engine::ir::{IrFunction, ParameterKind, ReturnType};
use crate::equation_engine::{parse_module, IrModule};
use crate::error::{ConfigError, EngineError, EvaluationError, SymbolError};
use crate::solvers::newton::{NewtonSettings, NewtonSolver};
use crate::traits::{DifferentialAlgebraicSystem, DynamicalSystem, NonlinearSystem};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub component: String,
}

impl VariableInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            unit: String::new(),
            component: String::new(),
        }
    }
}

/// Names of the functions the simulation calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryPoints {
    pub initialize_constants: String,
    pub compute_computed_constants: String,
    pub compute_rates: String,
    pub compute_variables: String,
    pub compute_residuals: String,
}

impl Default for EntryPoints {
    fn default() -> Self {
        Self {
            initialize_constants: "initialize_constants".to_string(),
            compute_computed_constants: "compute_computed_constants".to_string(),
            compute_rates: "compute_rates".to_string(),
            compute_variables: "compute_variables".to_string(),
            compute_residuals: "compute_residuals".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub source: String,
    pub voi: VariableInfo,
    #[serde(default)]
    pub states: Vec<VariableInfo>,
    #[serde(default)]
    pub constants: Vec<VariableInfo>,
    #[serde(default)]
    pub algebraic: Vec<VariableInfo>,
    #[serde(default)]
    pub entry_points: EntryPoints,
    /// Indices into `algebraic` of the variables solved by the NLA system.
    #[serde(default)]
    pub nla_unknowns: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableCategory {
    Voi,
    Constant,
    Rate,
    State,
    Algebraic,
}

/// Stable index of a column of the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub unit: String,
    pub component: String,
    pub category: VariableCategory,
    /// Index within the category's array.
    pub index: usize,
}

/// Columns in the order voi, constants, rates, states, algebraic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnLayout {
    columns: Vec<Column>,
}

impl ColumnLayout {
    pub fn new(description: &ModelDescription) -> Self {
        let column = |info: &VariableInfo, category, index| Column {
            name: info.name.clone(),
            unit: info.unit.clone(),
            component: info.component.clone(),
            category,
            index,
        };

        let mut columns = vec![column(&description.voi, VariableCategory::Voi, 0)];
        columns.extend(
            description
                .constants
                .iter()
                .enumerate()
                .map(|(i, info)| column(info, VariableCategory::Constant, i)),
        );
        columns.extend(description.states.iter().enumerate().map(|(i, info)| {
            let unit = match (info.unit.is_empty(), description.voi.unit.is_empty()) {
                (false, false) => format!("{}/{}", info.unit, description.voi.unit),
                (false, true) => info.unit.clone(),
                (true, false) => format!("1/{}", description.voi.unit),
                (true, true) => String::new(),
            };
            Column {
                name: format!("{}'", info.name),
                unit,
                component: info.component.clone(),
                category: VariableCategory::Rate,
                index: i,
            }
        }));
        columns.extend(
            description
                .states
                .iter()
                .enumerate()
                .map(|(i, info)| column(info, VariableCategory::State, i)),
        );
        columns.extend(
            description
                .algebraic
                .iter()
                .enumerate()
                .map(|(i, info)| column(info, VariableCategory::Algebraic, i)),
        );
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, id: ColumnId) -> Option<&Column> {
        self.columns.get(id.0)
    }

    pub fn find(&self, category: VariableCategory, index: usize) -> Option<ColumnId> {
        self.columns
            .iter()
            .position(|c| c.category == category && c.index == index)
            .map(ColumnId)
    }

    pub fn by_name(&self, name: &str) -> Option<ColumnId> {
        self.columns.iter().position(|c| c.name == name).map(ColumnId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayRole {
    Constants,
    Rates,
    States,
    Algebraic,
    Residuals,
}

impl ArrayRole {
    fn label(self) -> &'static str {
        match self {
            ArrayRole::Constants => "constants",
            ArrayRole::Rates => "rates",
            ArrayRole::States => "states",
            ArrayRole::Algebraic => "algebraic",
            ArrayRole::Residuals => "residuals",
        }
    }

    fn len(self, description: &ModelDescription) -> usize {
        match self {
            ArrayRole::Constants => description.constants.len(),
            ArrayRole::Rates | ArrayRole::States => description.states.len(),
            ArrayRole::Algebraic => description.algebraic.len(),
            ArrayRole::Residuals => description.nla_unknowns.len(),
        }
    }
}

struct EntryPointRule {
    takes_voi: bool,
    arrays: &'static [ArrayRole],
    writes: &'static [ArrayRole],
}

const MODEL_ARRAYS: &[ArrayRole] = &[
    ArrayRole::Constants,
    ArrayRole::Rates,
    ArrayRole::States,
    ArrayRole::Algebraic,
];

const INITIALIZE_CONSTANTS: EntryPointRule = EntryPointRule {
    takes_voi: false,
    arrays: &[ArrayRole::Constants, ArrayRole::Rates, ArrayRole::States],
    writes: &[ArrayRole::Constants, ArrayRole::Rates, ArrayRole::States],
};

const COMPUTE_COMPUTED_CONSTANTS: EntryPointRule = EntryPointRule {
    takes_voi: true,
    arrays: MODEL_ARRAYS,
    writes: &[ArrayRole::Constants],
};

const COMPUTE_RATES: EntryPointRule = EntryPointRule {
    takes_voi: true,
    arrays: MODEL_ARRAYS,
    writes: &[ArrayRole::Rates, ArrayRole::Algebraic],
};

const COMPUTE_VARIABLES: EntryPointRule = EntryPointRule {
    takes_voi: true,
    arrays: MODEL_ARRAYS,
    writes: &[ArrayRole::Algebraic],
};

const COMPUTE_RESIDUALS: EntryPointRule = EntryPointRule {
    takes_voi: true,
    arrays: &[
        ArrayRole::Constants,
        ArrayRole::Rates,
        ArrayRole::States,
        ArrayRole::Algebraic,
        ArrayRole::Residuals,
    ],
    writes: &[ArrayRole::Residuals],
};

impl EntryPointRule {
    fn declaration(&self, name: &str) -> String {
        let mut parameters: Vec<String> = Vec::new();
        if self.takes_voi {
            parameters.push("double voi".to_string());
        }
        parameters.extend(self.arrays.iter().map(|role| format!("double *{}", role.label())));
        format!("void {name}({})", parameters.join(", "))
    }

    fn signature(&self) -> Vec<ParameterKind> {
        let mut kinds = Vec::new();
        if self.takes_voi {
            kinds.push(ParameterKind::Scalar);
        }
        kinds.extend(self.arrays.iter().map(|_| ParameterKind::Array));
        kinds
    }

    fn check(&self, function: &IrFunction, description: &ModelDescription) -> Result<(), SymbolError> {
        if function.return_type != ReturnType::Void || function.signature() != self.signature() {
            return Err(SymbolError::EntryPointSignature {
                name: function.name.clone(),
                expected: self.declaration(&function.name),
            });
        }

        for (ordinal, role) in self.arrays.iter().enumerate() {
            let usage = &function.array_usage[ordinal];
            let array = function
                .array_parameter(ordinal)
                .map_or_else(|| role.label().to_string(), |p| p.name.clone());

            if usage.is_written() && !self.writes.contains(role) {
                return Err(SymbolError::IllegalWrite {
                    function: function.name.clone(),
                    array,
                });
            }
            let len = role.len(description);
            if let Some(index) = usage.max_index() {
                if index >= len {
                    return Err(SymbolError::IndexOutOfBounds {
                        function: function.name.clone(),
                        array,
                        index,
                        len,
                    });
                }
            }
        }
        Ok(())
    }
}

fn bind(
    ir: &IrModule,
    name: &str,
    rule: &EntryPointRule,
    required: bool,
    description: &ModelDescription,
) -> Result<bool, SymbolError> {
    match ir.function(name) {
        Some(function) => rule.check(function, description).map(|()| true),
        None if required => Err(SymbolError::MissingEntryPoint {
            name: name.to_string(),
        }),
        None => Ok(false),
    }
}

/// The compiled entry points of one model. Immutable and shared by every
/// run through an `Arc`.
#[derive(Debug)]
pub struct ModelRuntime {
    description: ModelDescription,
    layout: ColumnLayout,
    initialize_constants: CompiledFunction,
    compute_computed_constants: Option<CompiledFunction>,
    compute_rates: CompiledFunction,
    compute_variables: Option<CompiledFunction>,
    compute_residuals: Option<CompiledFunction>,
}

impl ModelRuntime {
    pub fn compile(description: ModelDescription, config: &EngineConfig) -> Result<Self, EngineError> {
        if description.states.is_empty() {
            return Err(ConfigError::InvalidRun {
                message: "the model has no state variables, so it cannot be simulated".to_string(),
            }
            .into());
        }
        for (position, &index) in description.nla_unknowns.iter().enumerate() {
            let repeated = description.nla_unknowns[..position].contains(&index);
            if index >= description.algebraic.len() || repeated {
                return Err(ConfigError::UnknownVariable {
                    category: "distinct algebraic variable".to_string(),
                    index,
                }
                .into());
            }
        }

        let ir = parse_module(&description.source)?;
        let names = &description.entry_points;
        let needs_nla = !description.nla_unknowns.is_empty();
        bind(&ir, &names.initialize_constants, &INITIALIZE_CONSTANTS, true, &description)?;
        let computed = bind(
            &ir,
            &names.compute_computed_constants,
            &COMPUTE_COMPUTED_CONSTANTS,
            false,
            &description,
        )?;
        bind(&ir, &names.compute_rates, &COMPUTE_RATES, true, &description)?;
        let variables = bind(&ir, &names.compute_variables, &COMPUTE_VARIABLES, false, &description)?;
        let residuals = bind(
            &ir,
            &names.compute_residuals,
            &COMPUTE_RESIDUALS,
            needs_nla,
            &description,
        )?;
        debug!(functions = ir.functions.len(), "entry points checked");

        let module = CompilationContext::new(&config.jit)?.compile(&ir)?;
        let lookup = |name: &str| {
            module.function(name).cloned().ok_or_else(|| SymbolError::MissingEntryPoint {
                name: name.to_string(),
            })
        };
        let runtime = Self {
            layout: ColumnLayout::new(&description),
            initialize_constants: lookup(&names.initialize_constants)?,
            compute_computed_constants: computed
                .then(|| lookup(&names.compute_computed_constants))
                .transpose()?,
            compute_rates: lookup(&names.compute_rates)?,
            compute_variables: variables.then(|| lookup(&names.compute_variables)).transpose()?,
            compute_residuals: residuals.then(|| lookup(&names.compute_residuals)).transpose()?,
            description,
        };
        info!(
            states = runtime.state_count(),
            constants = runtime.constant_count(),
            algebraic = runtime.algebraic_count(),
            "model compiled"
        );
        Ok(runtime)
    }

    pub fn description(&self) -> &ModelDescription {
        &self.description
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    pub fn state_count(&self) -> usize {
        self.description.states.len()
    }

    pub fn constant_count(&self) -> usize {
        self.description.constants.len()
    }

    pub fn algebraic_count(&self) -> usize {
        self.description.algebraic.len()
    }

    pub fn nla_unknowns(&self) -> &[usize] {
        &self.description.nla_unknowns
    }

    pub fn needs_nla_solver(&self) -> bool {
        !self.description.nla_unknowns.is_empty()
    }

    fn expect_len(
        function: &CompiledFunction,
        role: ArrayRole,
        expected: usize,
        found: usize,
    ) -> Result<(), EvaluationError> {
        if expected == found {
            return Ok(());
        }
        Err(EvaluationError::Dimension {
            function: function.name().to_string(),
            array: role.label().to_string(),
            expected,
            found,
        })
    }

    fn check_model_arrays(
        &self,
        function: &CompiledFunction,
        constants: &[f64],
        rates: &[f64],
        states: &[f64],
        algebraic: &[f64],
    ) -> Result<(), EvaluationError> {
        Self::expect_len(function, ArrayRole::Constants, self.constant_count(), constants.len())?;
        Self::expect_len(function, ArrayRole::Rates, self.state_count(), rates.len())?;
        Self::expect_len(function, ArrayRole::States, self.state_count(), states.len())?;
        Self::expect_len(function, ArrayRole::Algebraic, self.algebraic_count(), algebraic.len())
    }

    /// Calls `function` and surfaces a code passed to `report_error`.
    ///
    /// # Safety
    ///
    /// `arrays` must match the entry point's array parameters, with lengths
    /// checked against the model's counts.
    unsafe fn call(
        function: &CompiledFunction,
        scalars: &[f64],
        arrays: &[*mut f64],
    ) -> Result<(), EvaluationError> {
        function.invoke(scalars, arrays);
        check_reported(function.name())
    }

    pub fn initialize_constants(
        &self,
        constants: &mut [f64],
        rates: &mut [f64],
        states: &mut [f64],
    ) -> Result<(), EvaluationError> {
        let function = &self.initialize_constants;
        Self::expect_len(function, ArrayRole::Constants, self.constant_count(), constants.len())?;
        Self::expect_len(function, ArrayRole::Rates, self.state_count(), rates.len())?;
        Self::expect_len(function, ArrayRole::States, self.state_count(), states.len())?;
        let arrays = [constants.as_mut_ptr(), rates.as_mut_ptr(), states.as_mut_ptr()];
        // SAFETY: lengths checked above, indices checked at load time.
        unsafe { Self::call(function, &[], &arrays) }
    }

    /// Does nothing when the model has no `compute_computed_constants`.
    pub fn compute_computed_constants(
        &self,
        voi: f64,
        constants: &mut [f64],
        rates: &[f64],
        states: &[f64],
        algebraic: &[f64],
    ) -> Result<(), EvaluationError> {
        let Some(function) = &self.compute_computed_constants else {
            return Ok(());
        };
        self.check_model_arrays(function, constants, rates, states, algebraic)?;
        // Read-only arrays are passed as `*mut` for the uniform calling
        // convention; load-time checks rule out stores into them.
        let arrays = [
            constants.as_mut_ptr(),
            rates.as_ptr() as *mut f64,
            states.as_ptr() as *mut f64,
            algebraic.as_ptr() as *mut f64,
        ];
        // SAFETY: lengths checked above, indices and writes checked at load time.
        unsafe { Self::call(function, &[voi], &arrays) }
    }

    pub fn compute_rates(
        &self,
        voi: f64,
        constants: &[f64],
        rates: &mut [f64],
        states: &[f64],
        algebraic: &mut [f64],
    ) -> Result<(), EvaluationError> {
        let function = &self.compute_rates;
        self.check_model_arrays(function, constants, rates, states, algebraic)?;
        let arrays = [
            constants.as_ptr() as *mut f64,
            rates.as_mut_ptr(),
            states.as_ptr() as *mut f64,
            algebraic.as_mut_ptr(),
        ];
        // SAFETY: lengths checked above, indices and writes checked at load time.
        unsafe { Self::call(function, &[voi], &arrays) }
    }

    /// Does nothing when the model has no `compute_variables`.
    pub fn compute_variables(
        &self,
        voi: f64,
        constants: &[f64],
        rates: &[f64],
        states: &[f64],
        algebraic: &mut [f64],
    ) -> Result<(), EvaluationError> {
        let Some(function) = &self.compute_variables else {
            return Ok(());
        };
        self.check_model_arrays(function, constants, rates, states, algebraic)?;
        let arrays = [
            constants.as_ptr() as *mut f64,
            rates.as_ptr() as *mut f64,
            states.as_ptr() as *mut f64,
            algebraic.as_mut_ptr(),
        ];
        // SAFETY: lengths checked above, indices and writes checked at load time.
        unsafe { Self::call(function, &[voi], &arrays) }
    }

    pub fn compute_residuals(
        &self,
        voi: f64,
        constants: &[f64],
        rates: &[f64],
        states: &[f64],
        algebraic: &[f64],
        residuals: &mut [f64],
    ) -> Result<(), EvaluationError> {
        let Some(function) = &self.compute_residuals else {
            // Without unknowns there is nothing to constrain.
            if residuals.is_empty() {
                return Ok(());
            }
            return Err(EvaluationError::Nonlinear {
                message: "the model has no residual function".to_string(),
            });
        };
        self.check_model_arrays(function, constants, rates, states, algebraic)?;
        Self::expect_len(
            function,
            ArrayRole::Residuals,
            self.description.nla_unknowns.len(),
            residuals.len(),
        )?;
        let arrays = [
            constants.as_ptr() as *mut f64,
            rates.as_ptr() as *mut f64,
            states.as_ptr() as *mut f64,
            algebraic.as_ptr() as *mut f64,
            residuals.as_mut_ptr(),
        ];
        // SAFETY: lengths checked above, indices and writes checked at load time.
        unsafe { Self::call(function, &[voi], &arrays) }
    }
}

/// The residual system `g(voi, states, algebraic) = 0` in the algebraic
/// unknowns, for fixed states.
pub struct AlgebraicSystem<'a> {
    runtime: &'a ModelRuntime,
    voi: f64,
    constants: &'a [f64],
    rates: &'a [f64],
    states: &'a [f64],
    algebraic: &'a mut [f64],
}

impl NonlinearSystem for AlgebraicSystem<'_> {
    fn dimension(&self) -> usize {
        self.runtime.nla_unknowns().len()
    }

    fn residual(&mut self, x: &[f64], out: &mut [f64]) -> Result<(), EvaluationError> {
        for (&index, &value) in self.runtime.nla_unknowns().iter().zip(x) {
            self.algebraic[index] = value;
        }
        self.runtime.compute_residuals(
            self.voi,
            self.constants,
            self.rates,
            self.states,
            self.algebraic,
            out,
        )
    }
}

#[derive(Debug)]
struct Scratch {
    algebraic: Vec<f64>,
    rates: Vec<f64>,
    unknowns: Vec<f64>,
}

/// Evaluates a model's right-hand side for the integrators.
///
/// Owns the current constants. For models with algebraic unknowns, every
/// evaluation first solves the residual system with its Newton solver,
/// starting from the previous solution.
pub struct ModelEvaluator {
    runtime: Arc<ModelRuntime>,
    constants: Vec<f64>,
    scratch: RefCell<Scratch>,
    newton: Option<RefCell<NewtonSolver>>,
}

impl ModelEvaluator {
    /// `nla` is ignored for models without algebraic unknowns; it defaults
    /// when one is needed.
    pub fn new(runtime: Arc<ModelRuntime>, nla: Option<NewtonSettings>) -> Self {
        let newton = runtime
            .needs_nla_solver()
            .then(|| RefCell::new(NewtonSolver::new(nla.unwrap_or_default())));
        let scratch = Scratch {
            algebraic: vec![0.0; runtime.algebraic_count()],
            rates: vec![0.0; runtime.state_count()],
            unknowns: vec![0.0; runtime.nla_unknowns().len()],
        };
        Self {
            constants: vec![0.0; runtime.constant_count()],
            scratch: RefCell::new(scratch),
            newton,
            runtime,
        }
    }

    pub fn runtime(&self) -> &Arc<ModelRuntime> {
        &self.runtime
    }

    pub fn set_nla(&mut self, settings: NewtonSettings) {
        if let Some(newton) = &mut self.newton {
            *newton.get_mut() = NewtonSolver::new(settings);
        }
    }

    pub fn constants(&self) -> &[f64] {
        &self.constants
    }

    pub fn constants_mut(&mut self) -> &mut [f64] {
        &mut self.constants
    }

    /// Current values of the algebraic unknowns, in `nla_unknowns` order.
    pub fn unknowns(&self) -> Vec<f64> {
        let scratch = self.scratch.borrow();
        self.runtime
            .nla_unknowns()
            .iter()
            .map(|&index| scratch.algebraic[index])
            .collect()
    }

    pub fn reset_algebraic(&mut self) {
        let scratch = self.scratch.get_mut();
        scratch.algebraic.fill(0.0);
        scratch.rates.fill(0.0);
    }

    /// Runs `initialize_constants` and `compute_computed_constants` at
    /// `voi`; states and rates are overwritten with their initial values.
    pub fn initialize(
        &mut self,
        voi: f64,
        rates: &mut [f64],
        states: &mut [f64],
    ) -> Result<(), EvaluationError> {
        self.constants.fill(0.0);
        rates.fill(0.0);
        states.fill(0.0);
        self.runtime
            .initialize_constants(&mut self.constants, rates, states)?;
        self.compute_computed_constants(voi, rates, states)
    }

    pub fn compute_computed_constants(
        &mut self,
        voi: f64,
        rates: &[f64],
        states: &[f64],
    ) -> Result<(), EvaluationError> {
        let scratch = self.scratch.get_mut();
        self.runtime.compute_computed_constants(
            voi,
            &mut self.constants,
            rates,
            states,
            &scratch.algebraic,
        )
    }

    /// Rates and algebraic variables at `(voi, states)`.
    pub fn variables(
        &self,
        voi: f64,
        states: &[f64],
        rates: &mut [f64],
        algebraic: &mut [f64],
    ) -> Result<(), EvaluationError> {
        self.apply(voi, states, rates)?;
        algebraic.copy_from_slice(&self.scratch.borrow().algebraic);
        self.runtime
            .compute_variables(voi, &self.constants, rates, states, algebraic)?;
        self.scratch.borrow_mut().algebraic.copy_from_slice(algebraic);
        Ok(())
    }

    fn solve_unknowns(
        &self,
        newton: &RefCell<NewtonSolver>,
        voi: f64,
        states: &[f64],
        scratch: &mut Scratch,
    ) -> Result<(), EvaluationError> {
        for (slot, &index) in scratch.unknowns.iter_mut().zip(self.runtime.nla_unknowns()) {
            *slot = scratch.algebraic[index];
        }
        let mut system = AlgebraicSystem {
            runtime: &self.runtime,
            voi,
            constants: &self.constants,
            rates: &scratch.rates,
            states,
            algebraic: &mut scratch.algebraic,
        };
        newton
            .borrow_mut()
            .solve(&mut system, &mut scratch.unknowns)
            .map_err(nonlinear)?;
        for (&value, &index) in scratch.unknowns.iter().zip(self.runtime.nla_unknowns()) {
            scratch.algebraic[index] = value;
        }
        Ok(())
    }

    fn set_unknowns(&self, scratch: &mut Scratch, z: &[f64]) {
        for (&index, &value) in self.runtime.nla_unknowns().iter().zip(z) {
            scratch.algebraic[index] = value;
        }
    }
}

fn nonlinear(error: anyhow::Error) -> EvaluationError {
    match error.downcast::<EvaluationError>() {
        Ok(error) => error,
        Err(error) => EvaluationError::Nonlinear {
            message: format!("{error:#}"),
        },
    }
}

impl DynamicalSystem<f64> for ModelEvaluator {
    fn dimension(&self) -> usize {
        self.runtime.state_count()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) -> Result<(), EvaluationError> {
        let mut guard = self.scratch.borrow_mut();
        let scratch = &mut *guard;
        if let Some(newton) = &self.newton {
            self.solve_unknowns(newton, t, x, scratch)?;
        }
        self.runtime
            .compute_rates(t, &self.constants, out, x, &mut scratch.algebraic)?;
        scratch.rates.copy_from_slice(out);
        Ok(())
    }
}

impl DifferentialAlgebraicSystem for ModelEvaluator {
    fn state_dimension(&self) -> usize {
        self.runtime.state_count()
    }

    fn algebraic_dimension(&self) -> usize {
        self.runtime.nla_unknowns().len()
    }

    fn rates(&self, t: f64, y: &[f64], z: &[f64], out: &mut [f64]) -> Result<(), EvaluationError> {
        let mut guard = self.scratch.borrow_mut();
        let scratch = &mut *guard;
        self.set_unknowns(scratch, z);
        self.runtime
            .compute_rates(t, &self.constants, out, y, &mut scratch.algebraic)?;
        scratch.rates.copy_from_slice(out);
        Ok(())
    }

    fn constraints(
        &self,
        t: f64,
        y: &[f64],
        z: &[f64],
        out: &mut [f64],
    ) -> Result<(), EvaluationError> {
        let mut guard = self.scratch.borrow_mut();
        let scratch = &mut *guard;
        self.set_unknowns(scratch, z);
        self.runtime.compute_residuals(
            t,
            &self.constants,
            &scratch.rates,
            y,
            &scratch.algebraic,
            out,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_models;

    fn assert_err_contains<T>(result: Result<T, EngineError>, needle: &str) {
        let Err(err) = result else {
            panic!("expected an error containing \"{needle}\"");
        };
        let message = err.to_string();
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn compile(description: ModelDescription) -> Result<ModelRuntime, EngineError> {
        ModelRuntime::compile(description, &EngineConfig::default())
    }

    #[test]
    fn layout_orders_columns_by_category() {
        let runtime = compile(test_models::oscillator()).expect("compile");
        let layout = runtime.layout();
        let names: Vec<&str> = layout.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["t", "omega", "omega2", "x'", "y'", "x", "y", "energy"]);
        assert_eq!(layout.find(VariableCategory::State, 1), Some(ColumnId(6)));
        assert_eq!(layout.by_name("energy"), Some(ColumnId(7)));
        assert_eq!(layout.column(ColumnId(3)).expect("rate").unit, "m/s");
    }

    #[test]
    fn entry_points_evaluate() {
        let runtime = Arc::new(compile(test_models::oscillator()).expect("compile"));
        let mut evaluator = ModelEvaluator::new(Arc::clone(&runtime), None);
        let mut rates = vec![0.0; 2];
        let mut states = vec![0.0; 2];
        evaluator.initialize(0.0, &mut rates, &mut states).expect("initialize");
        assert_eq!(states, vec![1.0, 0.0]);
        assert_eq!(evaluator.constants(), &[2.0, 4.0]);

        let mut algebraic = vec![0.0];
        evaluator
            .variables(0.0, &[0.5, 1.0], &mut rates, &mut algebraic)
            .expect("variables");
        assert_eq!(rates, vec![1.0, -2.0]);
        assert_eq!(algebraic, vec![0.25 + 0.25]);
    }

    #[test]
    fn missing_and_malformed_entry_points() {
        let mut description = test_models::oscillator();
        description.entry_points.compute_rates = "rates".to_string();
        assert_err_contains(compile(description), "the model has no function called `rates`");

        let mut description = test_models::oscillator();
        description.source = description.source.replace(
            "void compute_rates(double VOI,",
            "void compute_rates(double *VOI,",
        );
        assert_err_contains(
            compile(description),
            "function `compute_rates` must be declared as `void compute_rates(double voi, double *constants, double *rates, double *states, double *algebraic)`",
        );
    }

    #[test]
    fn writes_and_indices_are_checked_at_load() {
        let mut description = test_models::oscillator();
        description.source = description
            .source
            .replace("RATES[0] = STATES[1];", "RATES[0] = STATES[1]; STATES[0] = 0.0;");
        assert_err_contains(
            compile(description),
            "function `compute_rates` writes to `STATES`, which it is not allowed to modify",
        );

        let mut description = test_models::oscillator();
        description.source = description.source.replace("STATES[1] = 0.0;", "STATES[2] = 0.0;");
        assert_err_contains(
            compile(description),
            "function `initialize_constants` accesses `STATES[2]`, but `STATES` only has 2 element(s)",
        );
    }

    #[test]
    fn models_need_states_and_valid_unknowns() {
        let mut description = test_models::oscillator();
        description.states.clear();
        assert_err_contains(compile(description), "the model has no state variables");

        let mut description = test_models::algebraic();
        description.nla_unknowns = vec![3];
        assert_err_contains(compile(description), "there is no distinct algebraic variable with index 3");

        let mut description = test_models::algebraic();
        description.source = description.source.replace("void compute_residuals", "void residuals");
        assert_err_contains(compile(description), "no function called `compute_residuals`");
    }

    #[test]
    fn algebraic_unknowns_are_solved_before_the_rates() {
        let runtime = Arc::new(compile(test_models::algebraic()).expect("compile"));
        assert!(runtime.needs_nla_solver());
        let evaluator = ModelEvaluator::new(runtime, None);
        let mut rates = [0.0];
        evaluator.apply(0.0, &[2.0], &mut rates).expect("apply");
        // z³ + z = 2 has the root z = 1.
        assert!((rates[0] + 1.0).abs() < 1e-9);
        assert!((evaluator.unknowns()[0] - 1.0).abs() < 1e-9);

        let mut residual = [0.0];
        evaluator
            .constraints(0.0, &[2.0], &[1.0], &mut residual)
            .expect("constraints");
        assert!(residual[0].abs() < 1e-12);
    }

    #[test]
    fn reported_errors_surface_from_the_rates() {
        let runtime = Arc::new(compile(test_models::failing(1.0)).expect("compile"));
        let evaluator = ModelEvaluator::new(runtime, None);
        let mut rates = [0.0];
        evaluator.apply(0.5, &[1.0], &mut rates).expect("before the failure");
        let err = evaluator.apply(1.5, &[1.0], &mut rates).expect_err("after");
        assert_eq!(
            err,
            EvaluationError::Reported {
                function: "compute_rates".to_string(),
                code: 3.0
            }
        );
    }

    #[test]
    fn descriptions_deserialize_with_defaults() {
        let description: ModelDescription = toml::from_str(
            r#"
            source = "void initialize_constants(double *c, double *r, double *s) {}"
            voi = { name = "t", unit = "s" }
            states = [{ name = "x" }]
            "#,
        )
        .expect("toml");
        assert_eq!(description.entry_points, EntryPoints::default());
        assert!(description.nla_unknowns.is_empty());
        assert_eq!(description.states[0].unit, "");
    }
}
