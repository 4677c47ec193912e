//! Primitives that generated code calls for functions Cranelift has no
//! instruction for.

use crate::equation_engine::ir::MathFunction;
use std::cell::Cell;

thread_local! {
    static REPORTED_ERROR: Cell<Option<f64>> = const { Cell::new(None) };
}

/// Returns and clears the first code passed to `report_error` on this thread.
pub fn take_reported_error() -> Option<f64> {
    REPORTED_ERROR.with(|slot| slot.take())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NativeOp {
    Fabs,
    Floor,
    Ceil,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lowering {
    Instruction(NativeOp),
    Call(&'static str),
    /// Variadic function folded left over a binary primitive.
    Fold(&'static str),
}

pub(crate) const SYMBOL_PREFIX: &str = "cellrun_math_";

pub(crate) fn lowering(function: MathFunction) -> Lowering {
    use MathFunction as F;
    match function {
        F::Fabs => Lowering::Instruction(NativeOp::Fabs),
        F::Floor => Lowering::Instruction(NativeOp::Floor),
        F::Ceil => Lowering::Instruction(NativeOp::Ceil),
        F::Sqrt => Lowering::Instruction(NativeOp::Sqrt),
        F::Min => Lowering::Fold("cellrun_math_min"),
        F::Max => Lowering::Fold("cellrun_math_max"),
        F::Gcd => Lowering::Fold("cellrun_math_gcd"),
        F::Lcm => Lowering::Fold("cellrun_math_lcm"),
        F::Exp => Lowering::Call("cellrun_math_exp"),
        F::Log => Lowering::Call("cellrun_math_log"),
        F::Log10 => Lowering::Call("cellrun_math_log10"),
        F::Factorial => Lowering::Call("cellrun_math_factorial"),
        F::Pow => Lowering::Call("cellrun_math_pow"),
        F::Fmod => Lowering::Call("cellrun_math_fmod"),
        F::ArbitraryLog => Lowering::Call("cellrun_math_arbitrary_log"),
        F::Sin => Lowering::Call("cellrun_math_sin"),
        F::Cos => Lowering::Call("cellrun_math_cos"),
        F::Tan => Lowering::Call("cellrun_math_tan"),
        F::Sec => Lowering::Call("cellrun_math_sec"),
        F::Csc => Lowering::Call("cellrun_math_csc"),
        F::Cot => Lowering::Call("cellrun_math_cot"),
        F::Sinh => Lowering::Call("cellrun_math_sinh"),
        F::Cosh => Lowering::Call("cellrun_math_cosh"),
        F::Tanh => Lowering::Call("cellrun_math_tanh"),
        F::Sech => Lowering::Call("cellrun_math_sech"),
        F::Csch => Lowering::Call("cellrun_math_csch"),
        F::Coth => Lowering::Call("cellrun_math_coth"),
        F::Asin => Lowering::Call("cellrun_math_asin"),
        F::Acos => Lowering::Call("cellrun_math_acos"),
        F::Atan => Lowering::Call("cellrun_math_atan"),
        F::Asec => Lowering::Call("cellrun_math_asec"),
        F::Acsc => Lowering::Call("cellrun_math_acsc"),
        F::Acot => Lowering::Call("cellrun_math_acot"),
        F::Asinh => Lowering::Call("cellrun_math_asinh"),
        F::Acosh => Lowering::Call("cellrun_math_acosh"),
        F::Atanh => Lowering::Call("cellrun_math_atanh"),
        F::Asech => Lowering::Call("cellrun_math_asech"),
        F::Acsch => Lowering::Call("cellrun_math_acsch"),
        F::Acoth => Lowering::Call("cellrun_math_acoth"),
        F::ReportError => Lowering::Call("cellrun_math_report_error"),
    }
}

/// A registered primitive: symbol name, parameter count and address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Primitive {
    pub symbol: &'static str,
    pub arity: usize,
    pub address: *const u8,
}

type Unary = extern "C" fn(f64) -> f64;
type Binary = extern "C" fn(f64, f64) -> f64;

fn unary(symbol: &'static str, f: Unary) -> Primitive {
    Primitive {
        symbol,
        arity: 1,
        address: f as *const u8,
    }
}

fn binary(symbol: &'static str, f: Binary) -> Primitive {
    Primitive {
        symbol,
        arity: 2,
        address: f as *const u8,
    }
}

pub(crate) fn primitives() -> Vec<Primitive> {
    vec![
        unary("cellrun_math_exp", exp),
        unary("cellrun_math_log", log),
        unary("cellrun_math_log10", log10),
        unary("cellrun_math_factorial", factorial),
        binary("cellrun_math_pow", pow),
        binary("cellrun_math_fmod", fmod),
        binary("cellrun_math_arbitrary_log", arbitrary_log),
        unary("cellrun_math_sin", sin),
        unary("cellrun_math_cos", cos),
        unary("cellrun_math_tan", tan),
        unary("cellrun_math_sec", sec),
        unary("cellrun_math_csc", csc),
        unary("cellrun_math_cot", cot),
        unary("cellrun_math_sinh", sinh),
        unary("cellrun_math_cosh", cosh),
        unary("cellrun_math_tanh", tanh),
        unary("cellrun_math_sech", sech),
        unary("cellrun_math_csch", csch),
        unary("cellrun_math_coth", coth),
        unary("cellrun_math_asin", asin),
        unary("cellrun_math_acos", acos),
        unary("cellrun_math_atan", atan),
        unary("cellrun_math_asec", asec),
        unary("cellrun_math_acsc", acsc),
        unary("cellrun_math_acot", acot),
        unary("cellrun_math_asinh", asinh),
        unary("cellrun_math_acosh", acosh),
        unary("cellrun_math_atanh", atanh),
        unary("cellrun_math_asech", asech),
        unary("cellrun_math_acsch", acsch),
        unary("cellrun_math_acoth", acoth),
        binary("cellrun_math_min", min),
        binary("cellrun_math_max", max),
        binary("cellrun_math_gcd", gcd),
        binary("cellrun_math_lcm", lcm),
        unary("cellrun_math_report_error", report_error),
    ]
}

extern "C" fn exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn log(x: f64) -> f64 {
    x.ln()
}

extern "C" fn log10(x: f64) -> f64 {
    x.log10()
}

extern "C" fn factorial(x: f64) -> f64 {
    let mut result: f64 = 1.0;
    let mut n = x;
    // Past 2^53 the decrement no longer changes `n`, but the product has
    // long since overflowed.
    while n > 1.0 && result.is_finite() {
        result *= n;
        n -= 1.0;
    }
    result
}

extern "C" fn pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

extern "C" fn fmod(x: f64, y: f64) -> f64 {
    x % y
}

extern "C" fn arbitrary_log(x: f64, base: f64) -> f64 {
    x.ln() / base.ln()
}

extern "C" fn sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn tan(x: f64) -> f64 {
    x.tan()
}

extern "C" fn sec(x: f64) -> f64 {
    1.0 / x.cos()
}

extern "C" fn csc(x: f64) -> f64 {
    1.0 / x.sin()
}

extern "C" fn cot(x: f64) -> f64 {
    1.0 / x.tan()
}

extern "C" fn sinh(x: f64) -> f64 {
    x.sinh()
}

extern "C" fn cosh(x: f64) -> f64 {
    x.cosh()
}

extern "C" fn tanh(x: f64) -> f64 {
    x.tanh()
}

extern "C" fn sech(x: f64) -> f64 {
    1.0 / x.cosh()
}

extern "C" fn csch(x: f64) -> f64 {
    1.0 / x.sinh()
}

extern "C" fn coth(x: f64) -> f64 {
    1.0 / x.tanh()
}

extern "C" fn asin(x: f64) -> f64 {
    x.asin()
}

extern "C" fn acos(x: f64) -> f64 {
    x.acos()
}

extern "C" fn atan(x: f64) -> f64 {
    x.atan()
}

extern "C" fn asec(x: f64) -> f64 {
    (1.0 / x).acos()
}

extern "C" fn acsc(x: f64) -> f64 {
    (1.0 / x).asin()
}

extern "C" fn acot(x: f64) -> f64 {
    (1.0 / x).atan()
}

extern "C" fn asinh(x: f64) -> f64 {
    x.asinh()
}

extern "C" fn acosh(x: f64) -> f64 {
    x.acosh()
}

extern "C" fn atanh(x: f64) -> f64 {
    x.atanh()
}

extern "C" fn asech(x: f64) -> f64 {
    let inverse = 1.0 / x;
    (inverse + (inverse * inverse - 1.0).sqrt()).ln()
}

extern "C" fn acsch(x: f64) -> f64 {
    let inverse = 1.0 / x;
    (inverse + (inverse * inverse + 1.0).sqrt()).ln()
}

extern "C" fn acoth(x: f64) -> f64 {
    let inverse = 1.0 / x;
    0.5 * ((1.0 + inverse) / (1.0 - inverse)).ln()
}

// NaN operands never replace the running result.
extern "C" fn min(current: f64, other: f64) -> f64 {
    if other < current {
        other
    } else {
        current
    }
}

extern "C" fn max(current: f64, other: f64) -> f64 {
    if other > current {
        other
    } else {
        current
    }
}

/// Greatest common divisor of the truncated magnitudes.
extern "C" fn gcd(a: f64, b: f64) -> f64 {
    let mut a = a.abs().trunc() as u64;
    let mut b = b.abs().trunc() as u64;
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a as f64
}

extern "C" fn lcm(a: f64, b: f64) -> f64 {
    (a * b) / gcd(a, b)
}

extern "C" fn report_error(code: f64) -> f64 {
    REPORTED_ERROR.with(|slot| {
        if slot.get().is_none() {
            slot.set(Some(code));
        }
    });
    f64::NAN
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_called_function_has_a_registered_primitive() {
        let registered: HashSet<&str> = primitives().iter().map(|p| p.symbol).collect();
        for function in MathFunction::ALL {
            match lowering(function) {
                Lowering::Call(symbol) | Lowering::Fold(symbol) => {
                    assert!(registered.contains(symbol), "{symbol} is not registered");
                    assert!(symbol.starts_with(SYMBOL_PREFIX));
                }
                Lowering::Instruction(_) => {}
            }
        }
        assert_eq!(registered.len(), primitives().len());
    }

    #[test]
    fn fold_primitives_are_binary() {
        for primitive in primitives() {
            let folded = MathFunction::ALL
                .iter()
                .any(|f| lowering(*f) == Lowering::Fold(primitive.symbol));
            if folded {
                assert_eq!(primitive.arity, 2);
            }
        }
    }

    #[test]
    fn integer_helpers_match_reference_values() {
        assert_eq!(factorial(5.0), 120.0);
        assert_eq!(factorial(0.0), 1.0);
        assert_eq!(factorial(171.0), f64::INFINITY);
        assert_eq!(factorial(1e300), f64::INFINITY);
        assert_eq!(factorial(f64::INFINITY), f64::INFINITY);
        assert_eq!(gcd(12.0, -18.0), 6.0);
        assert_eq!(gcd(0.0, 7.0), 7.0);
        assert_eq!(lcm(4.0, 6.0), 12.0);
    }

    #[test]
    fn min_and_max_skip_nan_operands() {
        assert_eq!(min(2.0, f64::NAN), 2.0);
        assert_eq!(max(2.0, 5.0), 5.0);
        assert!(min(f64::NAN, 1.0).is_nan());
    }

    #[test]
    fn reciprocal_functions() {
        assert!((sec(0.0) - 1.0).abs() < 1e-15);
        assert!((acot(1.0) - std::f64::consts::FRAC_PI_4).abs() < 1e-15);
        assert!((arbitrary_log(8.0, 2.0) - 3.0).abs() < 1e-12);
        assert!((asech(0.5) - (2.0f64).acosh()).abs() < 1e-12);
    }

    #[test]
    fn report_error_keeps_the_first_code() {
        assert_eq!(take_reported_error(), None);
        assert!(report_error(3.0).is_nan());
        report_error(4.0);
        assert_eq!(take_reported_error(), Some(3.0));
        assert_eq!(take_reported_error(), None);
    }
}
