//! Front end for model equation functions.
//!
//! The accepted language is a small C subset: `void`/`double` functions with
//! scalar (`double x`) and array (`double *x`) parameters, straight-line
//! assignments and a single trailing `return` in `double` functions.
//! [`parse_module`] resolves every identifier, so a returned [`IrModule`] is
//! ready for code generation.

pub mod ir;
mod parser;
mod scanner;

use crate::error::{EngineError, SymbolError, SyntaxError};
pub use ir::IrModule;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Symbol(#[from] SymbolError),
}

impl From<ParseError> for EngineError {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::Syntax(e) => EngineError::Syntax(e),
            ParseError::Symbol(e) => EngineError::Symbol(e),
        }
    }
}

/// Parses source text into an immutable IR module.
pub fn parse_module(source: &str) -> Result<IrModule, ParseError> {
    let tokens = scanner::tokenize(source)?;
    parser::Parser::new(tokens).module()
}

#[cfg(test)]
mod tests {
    use super::ir::{
        BinaryOp, Expr, MathConstant, MathFunction, ParameterKind, ReturnType, Target, UnaryOp,
    };
    use super::*;
    use crate::error::SyntaxErrorKind;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, ParseError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn empty_source_is_an_empty_module() {
        let module = parse_module("").expect("parse");
        assert!(module.functions.is_empty());
        let module = parse_module("  // nothing here\n").expect("parse");
        assert!(module.functions.is_empty());
    }

    #[test]
    fn parses_declared_functions_in_order() {
        let source = "
            void initialize(double *CONSTANTS, double *RATES, double *STATES)
            {
                STATES[0] = 1.0;
                CONSTANTS[1] = 2.5e-1;
            }

            double twice(double x)
            {
                y = 2*x;
                return y;
            }
        ";
        let module = parse_module(source).expect("parse");
        assert_eq!(module.function_names(), vec!["initialize", "twice"]);

        let initialize = module.function("initialize").expect("initialize");
        assert_eq!(initialize.return_type, ReturnType::Void);
        assert_eq!(
            initialize.signature(),
            vec![ParameterKind::Array, ParameterKind::Array, ParameterKind::Array]
        );
        assert_eq!(initialize.body.len(), 2);
        assert_eq!(initialize.array_usage[0].max_written, Some(1));
        assert!(!initialize.array_usage[1].is_written());
        assert_eq!(initialize.array_usage[2].max_written, Some(0));

        let twice = module.function("twice").expect("twice");
        assert_eq!(twice.return_type, ReturnType::Double);
        assert_eq!(twice.locals, vec!["y".to_string()]);
        assert_eq!(twice.body[0].target, Target::Scalar(1));
        assert_eq!(twice.return_value, Some(Expr::Scalar(1)));
    }

    #[test]
    fn void_function_may_be_empty_but_double_needs_return() {
        assert!(parse_module("void function() {}").is_ok());
        assert_err_contains(
            parse_module("double function() {}"),
            "an identifier or `return` is expected, but `}` was found instead",
        );
        assert_err_contains(
            parse_module("void function() { return 1; }"),
            "an identifier or `}` is expected, but `return` was found instead",
        );
    }

    #[test]
    fn syntax_errors_name_the_expected_class() {
        assert_err_contains(
            parse_module("void (double *a) {}"),
            "line 1, column 6: an identifier is expected, but `(` was found instead",
        );
        assert_err_contains(
            parse_module("void f(double *a) { a[x] = 1; }"),
            "a positive integer is expected, but `x` was found instead",
        );
        assert_err_contains(
            parse_module("double f(double a) { return *a; }"),
            "a number, an identifier or `(` is expected, but `*` was found instead",
        );
        assert_err_contains(parse_module("int f() {}"), "`void` or `double` is expected");
        assert_err_contains(
            parse_module("double f(double a) { return a"),
            "`;` is expected, but the end of the code was found instead",
        );
    }

    #[test]
    fn malformed_literals_are_syntax_errors() {
        let err = parse_module("double f() { return 3e; }").expect_err("malformed");
        match err {
            ParseError::Syntax(SyntaxError {
                kind: SyntaxErrorKind::MalformedNumber { literal, .. },
                ..
            }) => assert_eq!(literal, "3e"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_err_contains(
            parse_module("double f() { return 1.5e400; }"),
            "the number `1.5e400` is out of range",
        );
    }

    #[test]
    fn duplicate_declarations_are_symbol_errors() {
        assert_err_contains(
            parse_module("void f() {} void f() {}"),
            "there is already a function called `f`",
        );
        assert_err_contains(
            parse_module("void f(double a, double *a) {}"),
            "function `f` already has a parameter called `a`",
        );
        assert_err_contains(
            parse_module("double f(double a) { double a = 2; return a; }"),
            "`a` is already declared in function `f`",
        );
        assert_err_contains(
            parse_module("double f(double *v) { double v = 1; return v; }"),
            "`v` is already declared in function `f`",
        );
        assert_err_contains(
            parse_module("double f() { double t = 1; double t = 2; return t; }"),
            "line 1, column 35: `t` is already declared in function `f`",
        );
    }

    #[test]
    fn unresolved_symbols_are_named() {
        assert_err_contains(
            parse_module("double f(double a) { return a + b; }"),
            "`b` is not a parameter, a local variable or a known constant",
        );
        assert_err_contains(
            parse_module("double f(double a) { return hypot(a, a); }"),
            "`hypot` is not a known function",
        );
        assert_err_contains(
            parse_module("double f(double a) { b = b + 1; return b; }"),
            "`b` is not a parameter",
        );
        assert_err_contains(
            parse_module("double f(double a) { return pow(a); }"),
            "`pow` expects 2 arguments, but 1 were given",
        );
    }

    #[test]
    fn arrays_and_scalars_are_not_interchangeable() {
        assert_err_contains(
            parse_module("double f(double a) { return a[0]; }"),
            "`a` is not an array parameter",
        );
        assert_err_contains(
            parse_module("double f(double *a) { return a; }"),
            "`a` is an array parameter and must be indexed",
        );
        assert_err_contains(
            parse_module("void sin(double *a) {}"),
            "`sin` is a built-in name",
        );
        assert_err_contains(
            parse_module("void f(double *a) { M_PI = 3; }"),
            "`M_PI` is a built-in name",
        );
    }

    #[test]
    fn operators_follow_c_precedence() {
        let module = parse_module("double f(double a, double b) { return -a + b * 2 < 3 && !b; }")
            .expect("parse");
        let expr = module.functions[0].return_value.clone().expect("return");
        let Expr::Binary { op: BinaryOp::And, lhs, rhs } = expr else {
            panic!("expected && at the root");
        };
        assert!(matches!(*rhs, Expr::Unary { op: UnaryOp::Not, .. }));
        let Expr::Binary { op: BinaryOp::Lt, lhs: sum, .. } = *lhs else {
            panic!("expected < under &&");
        };
        let Expr::Binary { op: BinaryOp::Add, lhs: negated, rhs: product } = *sum else {
            panic!("expected + under <");
        };
        assert!(matches!(*negated, Expr::Unary { op: UnaryOp::Negate, .. }));
        assert!(matches!(*product, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn conditionals_constants_and_variadic_calls() {
        let module = parse_module(
            "double f(double a) { return a > 0 ? max(a, M_PI, 1) : gcd(4, 6) ^ NAN; }",
        )
        .expect("parse");
        let Some(Expr::Conditional { if_true, if_false, .. }) = &module.functions[0].return_value
        else {
            panic!("expected a conditional");
        };
        match if_true.as_ref() {
            Expr::Call { function, args } => {
                assert_eq!(*function, MathFunction::Max);
                assert_eq!(args[1], Expr::Constant(MathConstant::Pi));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(if_false.as_ref(), Expr::Binary { op: BinaryOp::Xor, .. }));
    }

    #[test]
    fn declared_locals_and_reassignment_share_a_slot() {
        let module = parse_module("double f(double a) { double t = a; t = t * 2; a = t; return a; }")
            .expect("parse");
        let function = &module.functions[0];
        assert_eq!(function.locals, vec!["t".to_string()]);
        assert_eq!(function.body[0].target, Target::Scalar(1));
        assert_eq!(function.body[1].target, Target::Scalar(1));
        assert_eq!(function.body[2].target, Target::Scalar(0));
    }
}
