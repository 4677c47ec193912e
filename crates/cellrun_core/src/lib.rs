//! The `cellrun_core` crate executes generated mathematical models.
//!
//! Model source text (a small C-like language of scalar and array
//! assignments) is parsed into an IR, compiled to native code with
//! Cranelift and driven through time by pluggable solvers on a worker
//! thread, with the results kept in an append-only store.
//!
//! Key components:
//! - **Equation Engine**: scanner, parser and IR of the model language.
//! - **Codegen**: JIT compilation of IR modules into callable functions.
//! - **Model**: binding and checking of a model's entry points.
//! - **Solvers**: explicit Runge-Kutta, SDIRK, backward Euler DAE and Newton.
//! - **Simulation**: run validation, controller state machine and worker.
//! - **Results**: chunked, memory-budgeted time series.
pub mod codegen;
pub mod config;
pub mod equation_engine;
pub mod error;
pub mod model;
pub mod results;
pub mod simulation;
pub mod solvers;
pub mod traits;

#[cfg(test)]
mod test_models;
