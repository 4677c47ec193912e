//! Native code generation for parsed model functions.
//!
//! A [`CompilationContext`] owns one Cranelift JIT module. Compiling consumes
//! the context and yields a [`CompiledModule`]; the generated machine code
//! lives until the last [`CompiledFunction`] handle is dropped, at which
//! point the module's memory is released. Failed compilations release it
//! immediately.

pub mod math;
mod translate;

use crate::config::JitSettings;
use crate::equation_engine::ir::{ArrayUsage, IrModule, ParameterKind, ReturnType};
use crate::equation_engine::parse_module;
use crate::error::{BackendError, CompileStage, EngineError, EvaluationError};
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Linkage, Module};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace};

type EntryPoint = unsafe extern "C" fn(*const f64, *const *mut f64) -> f64;

/// Owner of a JIT module's executable memory.
struct JitUnit {
    module: Option<JITModule>,
}

// SAFETY: after finalization the module is only touched again by `drop`.
unsafe impl Send for JitUnit {}
unsafe impl Sync for JitUnit {}

impl Drop for JitUnit {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: every handle into this memory keeps the unit alive.
            unsafe { module.free_memory() };
        }
    }
}

pub struct CompilationContext {
    unit: JitUnit,
    primitives: Vec<(&'static str, usize)>,
}

impl CompilationContext {
    pub fn new(jit: &JitSettings) -> Result<Self, BackendError> {
        let mut flag_builder = settings::builder();
        let flags = [
            ("opt_level", jit.opt_level.as_flag()),
            ("enable_verifier", if jit.verify { "true" } else { "false" }),
            ("use_colocated_libcalls", "false"),
            ("is_pic", "false"),
        ];
        for (name, value) in flags {
            flag_builder
                .set(name, value)
                .map_err(|e| BackendError::new(CompileStage::Settings, format!("{name}: {e}")))?;
        }

        let isa_builder = cranelift_native::builder()
            .map_err(|msg| BackendError::new(CompileStage::TargetDetection, msg))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| BackendError::new(CompileStage::InstructionSet, e))?;

        let mut builder = JITBuilder::with_isa(isa, default_libcall_names());
        let mut registered = HashSet::new();
        let mut primitives = Vec::new();
        for primitive in math::primitives() {
            if primitive.address.is_null() {
                return Err(BackendError::new(
                    CompileStage::PrimitiveRegistration,
                    format!("`{}` has no address", primitive.symbol),
                ));
            }
            if !primitive.symbol.starts_with(math::SYMBOL_PREFIX)
                || !registered.insert(primitive.symbol)
            {
                return Err(BackendError::new(
                    CompileStage::PrimitiveRegistration,
                    format!("`{}` is not a unique primitive symbol", primitive.symbol),
                ));
            }
            builder.symbol(primitive.symbol, primitive.address);
            primitives.push((primitive.symbol, primitive.arity));
        }
        debug!(primitives = primitives.len(), opt_level = jit.opt_level.as_flag(), "jit context created");

        Ok(Self {
            unit: JitUnit {
                module: Some(JITModule::new(builder)),
            },
            primitives,
        })
    }

    /// Translates every function of `ir` and finalizes the machine code.
    pub fn compile(mut self, ir: &IrModule) -> Result<CompiledModule, BackendError> {
        let module = self.unit.module.as_mut().ok_or_else(|| {
            BackendError::new(CompileStage::Registration, "the module was already released")
        })?;
        debug!(functions = ir.functions.len(), "compiling module");

        let mut imports = HashMap::new();
        for (symbol, arity) in &self.primitives {
            let signature = translate::primitive_signature(module, *arity);
            let id = module
                .declare_function(symbol, Linkage::Import, &signature)
                .map_err(|e| BackendError::new(CompileStage::PrimitiveRegistration, e))?;
            imports.insert(*symbol, id);
        }

        let signature = translate::entry_signature(module);
        let mut ids = Vec::with_capacity(ir.functions.len());
        for function in &ir.functions {
            let id = module
                .declare_function(&function.name, Linkage::Export, &signature)
                .map_err(|e| {
                    BackendError::for_function(CompileStage::Declaration, &function.name, e)
                })?;
            ids.push(id);
        }

        let mut context = module.make_context();
        let mut builder_context = FunctionBuilderContext::new();
        for (function, id) in ir.functions.iter().zip(&ids) {
            translate::translate_function(
                module,
                &imports,
                function,
                &mut context.func,
                &mut builder_context,
            )
            .map_err(|e| BackendError::for_function(CompileStage::Translation, &function.name, e))?;
            module.define_function(*id, &mut context).map_err(|e| {
                BackendError::for_function(CompileStage::Translation, &function.name, e)
            })?;
            module.clear_context(&mut context);
            trace!(function = %function.name, "function translated");
        }

        module
            .finalize_definitions()
            .map_err(|e| BackendError::new(CompileStage::Registration, e))?;

        let mut addresses = Vec::with_capacity(ids.len());
        for (function, id) in ir.functions.iter().zip(&ids) {
            let address = module.get_finalized_function(*id);
            if address.is_null() {
                return Err(BackendError::for_function(
                    CompileStage::Retrieval,
                    &function.name,
                    "the address is null",
                ));
            }
            addresses.push(address);
        }

        let unit = Arc::new(self.unit);
        let functions = ir
            .functions
            .iter()
            .zip(addresses)
            .map(|(function, address)| CompiledFunction {
                name: function.name.clone(),
                return_type: function.return_type,
                parameters: function
                    .parameters
                    .iter()
                    .map(|p| (p.name.clone(), p.kind))
                    .collect(),
                array_usage: function.array_usage.clone(),
                address,
                _unit: Arc::clone(&unit),
            })
            .collect();

        info!(functions = ir.functions.len(), "module compiled");
        Ok(CompiledModule { functions })
    }
}

/// Parses and compiles `source` in a fresh context.
pub fn compile_source(source: &str, jit: &JitSettings) -> Result<CompiledModule, EngineError> {
    let ir = parse_module(source)?;
    let context = CompilationContext::new(jit)?;
    Ok(context.compile(&ir)?)
}

pub struct CompiledModule {
    functions: Vec<CompiledFunction>,
}

impl CompiledModule {
    pub fn function(&self, name: &str) -> Option<&CompiledFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn functions(&self) -> &[CompiledFunction] {
        &self.functions
    }
}

/// Callable native code for one model function.
///
/// Scalars are passed in declaration order through one buffer, arrays
/// through a buffer of base pointers. `void` functions return 0.
#[derive(Clone)]
pub struct CompiledFunction {
    name: String,
    return_type: ReturnType,
    parameters: Vec<(String, ParameterKind)>,
    array_usage: Vec<ArrayUsage>,
    address: *const u8,
    _unit: Arc<JitUnit>,
}

// SAFETY: the code behind `address` is immutable and owned by `_unit`.
unsafe impl Send for CompiledFunction {}
unsafe impl Sync for CompiledFunction {}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl CompiledFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn return_type(&self) -> ReturnType {
        self.return_type
    }

    pub fn signature(&self) -> Vec<ParameterKind> {
        self.parameters.iter().map(|(_, kind)| *kind).collect()
    }

    /// Name of the array parameter with the given ordinal.
    pub fn array_name(&self, ordinal: usize) -> Option<&str> {
        self.parameters
            .iter()
            .filter(|(_, kind)| *kind == ParameterKind::Array)
            .nth(ordinal)
            .map(|(name, _)| name.as_str())
    }

    pub fn array_usage(&self) -> &[ArrayUsage] {
        &self.array_usage
    }

    fn scalar_count(&self) -> usize {
        self.parameters
            .iter()
            .filter(|(_, kind)| *kind == ParameterKind::Scalar)
            .count()
    }

    /// Checked call: argument counts and array lengths are validated against
    /// the indices the function uses.
    pub fn call(&self, scalars: &[f64], arrays: &mut [&mut [f64]]) -> Result<f64, EvaluationError> {
        let dimension = |array: String, expected: usize, found: usize| EvaluationError::Dimension {
            function: self.name.clone(),
            array,
            expected,
            found,
        };

        if scalars.len() != self.scalar_count() {
            return Err(dimension(
                "scalar arguments".to_string(),
                self.scalar_count(),
                scalars.len(),
            ));
        }
        if arrays.len() != self.array_usage.len() {
            return Err(dimension(
                "array arguments".to_string(),
                self.array_usage.len(),
                arrays.len(),
            ));
        }
        for (ordinal, (array, usage)) in arrays.iter().zip(&self.array_usage).enumerate() {
            let required = usage.max_index().map_or(0, |i| i + 1);
            if array.len() < required {
                let name = self.array_name(ordinal).unwrap_or("array").to_string();
                return Err(dimension(name, required, array.len()));
            }
        }

        let pointers: Vec<*mut f64> = arrays.iter_mut().map(|a| a.as_mut_ptr()).collect();
        // SAFETY: counts and lengths were checked above.
        let result = unsafe { self.invoke(scalars, &pointers) };
        check_reported(&self.name)?;
        Ok(result)
    }

    /// # Safety
    ///
    /// `scalars` must hold one value per scalar parameter and `arrays` one
    /// pointer per array parameter, each valid for the indices recorded in
    /// [`array_usage`](Self::array_usage) and writable where the function
    /// writes.
    pub(crate) unsafe fn invoke(&self, scalars: &[f64], arrays: &[*mut f64]) -> f64 {
        let entry: EntryPoint = std::mem::transmute(self.address);
        entry(scalars.as_ptr(), arrays.as_ptr())
    }
}

/// Turns a code recorded by `report_error` into an evaluation failure.
pub(crate) fn check_reported(function: &str) -> Result<(), EvaluationError> {
    match math::take_reported_error() {
        Some(code) => Err(EvaluationError::Reported {
            function: function.to_string(),
            code,
        }),
        None => Ok(()),
    }
}
