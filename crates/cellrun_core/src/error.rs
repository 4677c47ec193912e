//! Error taxonomy of the execution engine.
//!
//! Every failure surfaced to a caller is an [`EngineError`]. Its
//! [`ErrorCategory`] decides whether the model can still be simulated
//! ([`Severity::Recoverable`]) or has to be rebuilt ([`Severity::Fatal`]).

use crate::results::RunId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Syntax,
    Symbol,
    CompileBackend,
    Config,
    Step,
    Memory,
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Recoverable,
    Fatal,
}

impl ErrorCategory {
    pub fn severity(self) -> Severity {
        match self {
            ErrorCategory::Syntax
            | ErrorCategory::Symbol
            | ErrorCategory::CompileBackend
            | ErrorCategory::Thread => Severity::Fatal,
            ErrorCategory::Config | ErrorCategory::Step | ErrorCategory::Memory => {
                Severity::Recoverable
            }
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Syntax => "syntax error",
            ErrorCategory::Symbol => "symbol error",
            ErrorCategory::CompileBackend => "code generation error",
            ErrorCategory::Config => "configuration error",
            ErrorCategory::Step => "step error",
            ErrorCategory::Memory => "memory error",
            ErrorCategory::Thread => "thread error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    #[error(transparent)]
    CompileBackend(#[from] BackendError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Thread(#[from] ThreadError),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Syntax(_) => ErrorCategory::Syntax,
            EngineError::Symbol(_) => ErrorCategory::Symbol,
            EngineError::CompileBackend(_) => ErrorCategory::CompileBackend,
            EngineError::Config(_) => ErrorCategory::Config,
            EngineError::Step(_) => ErrorCategory::Step,
            EngineError::Memory(_) => ErrorCategory::Memory,
            EngineError::Thread(_) => ErrorCategory::Thread,
        }
    }

    pub fn severity(&self) -> Severity {
        self.category().severity()
    }
}

/// A parser failure, positioned on the offending token.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}, column {column}: {kind}")]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub kind: SyntaxErrorKind,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyntaxErrorKind {
    #[error("{expected} is expected, but {found} was found instead")]
    Expected { expected: String, found: String },
    #[error("the number `{literal}` is malformed: {reason}")]
    MalformedNumber { literal: String, reason: String },
    #[error("the number `{literal}` is out of range")]
    NumberOutOfRange { literal: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SymbolError {
    #[error("there is already a function called `{name}`")]
    DuplicateFunction { name: String },
    #[error("function `{function}` already has a parameter called `{name}`")]
    DuplicateParameter { function: String, name: String },
    #[error("line {line}, column {column}: `{name}` is already declared in function `{function}`")]
    DuplicateLocal {
        function: String,
        name: String,
        line: usize,
        column: usize,
    },
    #[error("line {line}, column {column}: `{name}` is not a parameter, a local variable or a known constant")]
    UnresolvedIdentifier {
        name: String,
        line: usize,
        column: usize,
    },
    #[error("line {line}, column {column}: `{name}` is not a known function")]
    UnknownFunction {
        name: String,
        line: usize,
        column: usize,
    },
    #[error("line {line}, column {column}: `{name}` expects {expected}, but {found} were given")]
    ArgumentCount {
        name: String,
        expected: String,
        found: usize,
        line: usize,
        column: usize,
    },
    #[error("line {line}, column {column}: `{name}` is not an array parameter and cannot be indexed")]
    NotAnArray {
        name: String,
        line: usize,
        column: usize,
    },
    #[error("line {line}, column {column}: `{name}` is an array parameter and must be indexed")]
    MissingIndex {
        name: String,
        line: usize,
        column: usize,
    },
    #[error("line {line}, column {column}: `{name}` is a built-in name and cannot be redefined")]
    ReservedName {
        name: String,
        line: usize,
        column: usize,
    },
    #[error("the model has no function called `{name}`")]
    MissingEntryPoint { name: String },
    #[error("function `{name}` must be declared as `{expected}`")]
    EntryPointSignature { name: String, expected: String },
    #[error("function `{function}` writes to `{array}`, which it is not allowed to modify")]
    IllegalWrite { function: String, array: String },
    #[error("function `{function}` accesses `{array}[{index}]`, but `{array}` only has {len} element(s)")]
    IndexOutOfBounds {
        function: String,
        array: String,
        index: usize,
        len: usize,
    },
}

/// Stages of the native code generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompileStage {
    TargetDetection,
    Settings,
    InstructionSet,
    PrimitiveRegistration,
    Declaration,
    Translation,
    Registration,
    Retrieval,
}

impl fmt::Display for CompileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            CompileStage::TargetDetection => "the native target could not be detected",
            CompileStage::Settings => "the code generation settings could not be applied",
            CompileStage::InstructionSet => "the instruction set could not be created",
            CompileStage::PrimitiveRegistration => {
                "the extra math primitives could not be registered"
            }
            CompileStage::Declaration => "a function could not be declared",
            CompileStage::Translation => "a function could not be translated",
            CompileStage::Registration => {
                "the translated unit could not be registered with the execution engine"
            }
            CompileStage::Retrieval => "an entry point could not be retrieved",
        };
        f.write_str(message)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{context}: {cause}")]
pub struct BackendError {
    pub stage: CompileStage,
    pub context: String,
    pub cause: String,
}

impl BackendError {
    pub fn new(stage: CompileStage, cause: impl fmt::Display) -> Self {
        Self {
            stage,
            context: stage.to_string(),
            cause: cause.to_string(),
        }
    }

    pub fn for_function(stage: CompileStage, function: &str, cause: impl fmt::Display) -> Self {
        let context = match stage {
            CompileStage::Declaration => format!("function `{function}` could not be declared"),
            CompileStage::Translation => format!("function `{function}` could not be translated"),
            CompileStage::Retrieval => {
                format!("the entry point of function `{function}` could not be retrieved")
            }
            other => other.to_string(),
        };
        Self {
            stage,
            context,
            cause: cause.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("the '{property}' property is not supported by the {solver} solver")]
    UnknownProperty { solver: String, property: String },
    #[error("the '{property}' property expects {expected} value")]
    PropertyType {
        property: String,
        expected: &'static str,
    },
    #[error("the '{property}' property {requirement}")]
    PropertyBounds {
        property: String,
        requirement: String,
    },
    #[error("{message}")]
    MissingSolver { message: String },
    #[error("the {solver} solver is {family} solver and cannot be used as {slot}")]
    WrongFamily {
        solver: String,
        family: String,
        slot: String,
    },
    #[error("{message}")]
    InvalidRun { message: String },
    #[error("invalid engine configuration: {message}")]
    InvalidEngineConfig { message: String },
    #[error("cannot {operation} while the simulation is {state}")]
    NotAllowedWhile { operation: String, state: String },
    #[error("there is no {category} with index {index}")]
    UnknownVariable { category: String, index: usize },
}

/// A solver failed to advance, or the model could not be evaluated at `time`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("the {solver} solver failed at t = {time}: {message}")]
pub struct StepError {
    pub solver: String,
    pub time: f64,
    pub message: String,
}

impl StepError {
    pub fn new(solver: impl Into<String>, time: f64, message: impl fmt::Display) -> Self {
        Self {
            solver: solver.into(),
            time,
            message: normalize_message(&message.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MemoryError {
    #[error(
        "the simulation requires {} of memory and only {} is available",
        size_as_string(*.required),
        size_as_string(*.available)
    )]
    Insufficient { required: u64, available: u64 },
    #[error(
        "the {} of memory required for the simulation could not be allocated",
        size_as_string(*.requested)
    )]
    AllocationFailed { requested: u64 },
    #[error("run {run} has reached its capacity of {capacity} rows")]
    CapacityExhausted { run: RunId, capacity: usize },
    #[error("there is no run {run} to append to")]
    UnknownRun { run: RunId },
    #[error("a row of run {run} must hold {expected} value(s), but {found} were given")]
    RowWidth {
        run: RunId,
        expected: usize,
        found: usize,
    },
    #[error("run {run} cannot go from t = {previous} to t = {time}")]
    TimeOrder { run: RunId, previous: f64, time: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThreadError {
    #[error("the simulation worker could not be started: {cause}")]
    Spawn { cause: String },
    #[error("the simulation worker terminated abnormally")]
    Panicked,
}

/// Failure while calling into compiled model code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("`{function}` reported error code {code}")]
    Reported { function: String, code: f64 },
    #[error("`{function}` expects `{array}` to hold {expected} value(s), but {found} were given")]
    Dimension {
        function: String,
        array: String,
        expected: usize,
        found: usize,
    },
    #[error("the algebraic system could not be solved: {message}")]
    Nonlinear { message: String },
}

/// Formats a byte count with a binary unit, rounded to one decimal.
pub fn size_as_string(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let exponent = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);
    let scaled = bytes as f64 / 1024f64.powi(exponent as i32);
    let rounded = (scaled * 10.0).round() / 10.0;

    format!("{rounded} {}", UNITS[exponent])
}

// Solver messages are embedded mid-sentence.
fn normalize_message(message: &str) -> String {
    let trimmed = message.trim();
    let trimmed = trimmed
        .strip_suffix("...")
        .or_else(|| trimmed.strip_suffix('.'))
        .unwrap_or(trimmed);

    if trimmed.starts_with("Newton") {
        return trimmed.to_string();
    }

    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
