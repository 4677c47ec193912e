//! Intermediate representation of a parsed model.
//!
//! Identifiers are resolved by the parser: scalar parameters and locals are
//! addressed by slot, array parameters by ordinal, so the code generator
//! never deals with names.

use std::f64::consts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    Void,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Scalar,
    Array,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    /// Scalar slot for scalar parameters, array ordinal for arrays.
    pub slot: usize,
}

/// Highest constant indices used on one array parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayUsage {
    pub max_read: Option<usize>,
    pub max_written: Option<usize>,
}

impl ArrayUsage {
    pub fn is_written(&self) -> bool {
        self.max_written.is_some()
    }

    pub fn max_index(&self) -> Option<usize> {
        match (self.max_read, self.max_written) {
            (Some(read), Some(written)) => Some(read.max(written)),
            (read, written) => read.or(written),
        }
    }

    pub(crate) fn record_read(&mut self, index: usize) {
        self.max_read = Some(self.max_read.map_or(index, |m| m.max(index)));
    }

    pub(crate) fn record_write(&mut self, index: usize) {
        self.max_written = Some(self.max_written.map_or(index, |m| m.max(index)));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrFunction {
    pub name: String,
    pub return_type: ReturnType,
    pub parameters: Vec<Parameter>,
    pub locals: Vec<String>,
    pub body: Vec<Assignment>,
    pub return_value: Option<Expr>,
    /// Indexed by array ordinal.
    pub array_usage: Vec<ArrayUsage>,
}

impl IrFunction {
    pub fn scalar_parameter_count(&self) -> usize {
        self.parameters
            .iter()
            .filter(|p| p.kind == ParameterKind::Scalar)
            .count()
    }

    pub fn array_parameter_count(&self) -> usize {
        self.parameters.len() - self.scalar_parameter_count()
    }

    /// Scalar parameters followed by locals.
    pub fn scalar_slot_count(&self) -> usize {
        self.scalar_parameter_count() + self.locals.len()
    }

    pub fn signature(&self) -> Vec<ParameterKind> {
        self.parameters.iter().map(|p| p.kind).collect()
    }

    pub fn array_parameter(&self, ordinal: usize) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.kind == ParameterKind::Array && p.slot == ordinal)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IrModule {
    pub functions: Vec<IrFunction>,
}

impl IrModule {
    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub target: Target,
    pub value: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Scalar(usize),
    Element { array: usize, index: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Constant(MathConstant),
    Scalar(usize),
    Element {
        array: usize,
        index: usize,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    Call {
        function: MathFunction,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathConstant {
    Pi,
    E,
    Infinity,
    NotANumber,
}

impl MathConstant {
    pub const ALL: [MathConstant; 4] = [
        MathConstant::Pi,
        MathConstant::E,
        MathConstant::Infinity,
        MathConstant::NotANumber,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MathConstant::Pi => "M_PI",
            MathConstant::E => "M_E",
            MathConstant::Infinity => "INFINITY",
            MathConstant::NotANumber => "NAN",
        }
    }

    pub fn value(self) -> f64 {
        match self {
            MathConstant::Pi => consts::PI,
            MathConstant::E => consts::E,
            MathConstant::Infinity => f64::INFINITY,
            MathConstant::NotANumber => f64::NAN,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exactly(n) => count == n,
            Arity::AtLeast(n) => count >= n,
        }
    }

    pub fn describe(self) -> String {
        match self {
            Arity::Exactly(1) => "1 argument".to_string(),
            Arity::Exactly(n) => format!("{n} arguments"),
            Arity::AtLeast(1) => "at least 1 argument".to_string(),
            Arity::AtLeast(n) => format!("at least {n} arguments"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFunction {
    Fabs,
    Exp,
    Log,
    Log10,
    Sqrt,
    Floor,
    Ceil,
    Factorial,
    Pow,
    Fmod,
    ArbitraryLog,
    Sin,
    Cos,
    Tan,
    Sec,
    Csc,
    Cot,
    Sinh,
    Cosh,
    Tanh,
    Sech,
    Csch,
    Coth,
    Asin,
    Acos,
    Atan,
    Asec,
    Acsc,
    Acot,
    Asinh,
    Acosh,
    Atanh,
    Asech,
    Acsch,
    Acoth,
    Min,
    Max,
    Gcd,
    Lcm,
    ReportError,
}

impl MathFunction {
    pub const ALL: [MathFunction; 40] = [
        MathFunction::Fabs,
        MathFunction::Exp,
        MathFunction::Log,
        MathFunction::Log10,
        MathFunction::Sqrt,
        MathFunction::Floor,
        MathFunction::Ceil,
        MathFunction::Factorial,
        MathFunction::Pow,
        MathFunction::Fmod,
        MathFunction::ArbitraryLog,
        MathFunction::Sin,
        MathFunction::Cos,
        MathFunction::Tan,
        MathFunction::Sec,
        MathFunction::Csc,
        MathFunction::Cot,
        MathFunction::Sinh,
        MathFunction::Cosh,
        MathFunction::Tanh,
        MathFunction::Sech,
        MathFunction::Csch,
        MathFunction::Coth,
        MathFunction::Asin,
        MathFunction::Acos,
        MathFunction::Atan,
        MathFunction::Asec,
        MathFunction::Acsc,
        MathFunction::Acot,
        MathFunction::Asinh,
        MathFunction::Acosh,
        MathFunction::Atanh,
        MathFunction::Asech,
        MathFunction::Acsch,
        MathFunction::Acoth,
        MathFunction::Min,
        MathFunction::Max,
        MathFunction::Gcd,
        MathFunction::Lcm,
        MathFunction::ReportError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MathFunction::Fabs => "fabs",
            MathFunction::Exp => "exp",
            MathFunction::Log => "log",
            MathFunction::Log10 => "log10",
            MathFunction::Sqrt => "sqrt",
            MathFunction::Floor => "floor",
            MathFunction::Ceil => "ceil",
            MathFunction::Factorial => "factorial",
            MathFunction::Pow => "pow",
            MathFunction::Fmod => "fmod",
            MathFunction::ArbitraryLog => "arbitrary_log",
            MathFunction::Sin => "sin",
            MathFunction::Cos => "cos",
            MathFunction::Tan => "tan",
            MathFunction::Sec => "sec",
            MathFunction::Csc => "csc",
            MathFunction::Cot => "cot",
            MathFunction::Sinh => "sinh",
            MathFunction::Cosh => "cosh",
            MathFunction::Tanh => "tanh",
            MathFunction::Sech => "sech",
            MathFunction::Csch => "csch",
            MathFunction::Coth => "coth",
            MathFunction::Asin => "asin",
            MathFunction::Acos => "acos",
            MathFunction::Atan => "atan",
            MathFunction::Asec => "asec",
            MathFunction::Acsc => "acsc",
            MathFunction::Acot => "acot",
            MathFunction::Asinh => "asinh",
            MathFunction::Acosh => "acosh",
            MathFunction::Atanh => "atanh",
            MathFunction::Asech => "asech",
            MathFunction::Acsch => "acsch",
            MathFunction::Acoth => "acoth",
            MathFunction::Min => "min",
            MathFunction::Max => "max",
            MathFunction::Gcd => "gcd",
            MathFunction::Lcm => "lcm",
            MathFunction::ReportError => "report_error",
        }
    }

    pub fn arity(self) -> Arity {
        match self {
            MathFunction::Pow | MathFunction::Fmod | MathFunction::ArbitraryLog => Arity::Exactly(2),
            MathFunction::Min | MathFunction::Max | MathFunction::Gcd | MathFunction::Lcm => {
                Arity::AtLeast(1)
            }
            _ => Arity::Exactly(1),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

/// Names that models may not redefine.
pub fn is_reserved_name(name: &str) -> bool {
    MathFunction::from_name(name).is_some() || MathConstant::from_name(name).is_some()
}
