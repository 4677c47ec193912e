use super::math::{lowering, Lowering, NativeOp};
use crate::equation_engine::ir::{Assignment, BinaryOp, Expr, IrFunction, Target, UnaryOp};
use cranelift::codegen::ir::{FuncRef, Function};
use cranelift::prelude::*;
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Module};
use std::collections::HashMap;

const F64_BYTES: usize = 8;

/// `fn(scalars: *const f64, arrays: *const *mut f64) -> f64`
pub(crate) fn entry_signature(module: &JITModule) -> Signature {
    let pointer = module.target_config().pointer_type();
    let mut signature = module.make_signature();
    signature.params.push(AbiParam::new(pointer));
    signature.params.push(AbiParam::new(pointer));
    signature.returns.push(AbiParam::new(types::F64));
    signature
}

pub(crate) fn primitive_signature(module: &JITModule, arity: usize) -> Signature {
    let mut signature = module.make_signature();
    for _ in 0..arity {
        signature.params.push(AbiParam::new(types::F64));
    }
    signature.returns.push(AbiParam::new(types::F64));
    signature
}

/// Builds the body of `function` into `func`.
pub(crate) fn translate_function(
    module: &mut JITModule,
    imports: &HashMap<&'static str, FuncId>,
    function: &IrFunction,
    func: &mut Function,
    builder_context: &mut FunctionBuilderContext,
) -> Result<(), String> {
    func.signature = entry_signature(module);
    let pointer = module.target_config().pointer_type();
    let pointer_bytes = pointer.bytes() as usize;

    let mut builder = FunctionBuilder::new(func, builder_context);
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    builder.seal_block(entry);

    let params = builder.block_params(entry).to_vec();
    let (scalars, arrays_base) = (params[0], params[1]);

    let scalar_parameters = function.scalar_parameter_count();
    for slot in 0..function.scalar_slot_count() {
        let variable = Variable::new(slot);
        builder.declare_var(variable, types::F64);
        let initial = if slot < scalar_parameters {
            builder.ins().load(
                types::F64,
                MemFlags::trusted(),
                scalars,
                offset(slot, F64_BYTES)?,
            )
        } else {
            builder.ins().f64const(0.0)
        };
        builder.def_var(variable, initial);
    }

    let mut arrays = Vec::with_capacity(function.array_parameter_count());
    for ordinal in 0..function.array_parameter_count() {
        let base = builder.ins().load(
            pointer,
            MemFlags::trusted(),
            arrays_base,
            offset(ordinal, pointer_bytes)?,
        );
        arrays.push(base);
    }

    let mut translator = FunctionTranslator {
        builder,
        module,
        imports,
        func_refs: HashMap::new(),
        arrays,
    };

    for assignment in &function.body {
        translator.assignment(assignment)?;
    }

    let result = match &function.return_value {
        Some(expr) => translator.expr(expr)?,
        None => translator.builder.ins().f64const(0.0),
    };
    translator.builder.ins().return_(&[result]);
    translator.builder.finalize();
    Ok(())
}

fn offset(index: usize, stride: usize) -> Result<i32, String> {
    index
        .checked_mul(stride)
        .and_then(|bytes| i32::try_from(bytes).ok())
        .ok_or_else(|| format!("index {index} is too large to address"))
}

struct FunctionTranslator<'a, 'm> {
    builder: FunctionBuilder<'a>,
    module: &'m mut JITModule,
    imports: &'m HashMap<&'static str, FuncId>,
    func_refs: HashMap<FuncId, FuncRef>,
    arrays: Vec<Value>,
}

impl FunctionTranslator<'_, '_> {
    fn assignment(&mut self, assignment: &Assignment) -> Result<(), String> {
        let value = self.expr(&assignment.value)?;
        match assignment.target {
            Target::Scalar(slot) => self.builder.def_var(Variable::new(slot), value),
            Target::Element { array, index } => {
                let base = self.array(array)?;
                self.builder.ins().store(
                    MemFlags::trusted(),
                    value,
                    base,
                    offset(index, F64_BYTES)?,
                );
            }
        }
        Ok(())
    }

    fn array(&self, ordinal: usize) -> Result<Value, String> {
        self.arrays
            .get(ordinal)
            .copied()
            .ok_or_else(|| format!("array parameter {ordinal} does not exist"))
    }

    fn expr(&mut self, expr: &Expr) -> Result<Value, String> {
        let value = match expr {
            Expr::Number(value) => self.builder.ins().f64const(*value),
            Expr::Constant(constant) => self.builder.ins().f64const(constant.value()),
            Expr::Scalar(slot) => self.builder.use_var(Variable::new(*slot)),
            Expr::Element { array, index } => {
                let base = self.array(*array)?;
                self.builder.ins().load(
                    types::F64,
                    MemFlags::trusted(),
                    base,
                    offset(*index, F64_BYTES)?,
                )
            }
            Expr::Unary { op, operand } => {
                let operand = self.expr(operand)?;
                match op {
                    UnaryOp::Negate => self.builder.ins().fneg(operand),
                    UnaryOp::Not => {
                        let zero = self.builder.ins().f64const(0.0);
                        let is_zero = self.builder.ins().fcmp(FloatCC::Equal, operand, zero);
                        self.bool_to_f64(is_zero)
                    }
                }
            }
            Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs)?,
            Expr::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                let condition = self.expr(condition)?;
                let condition = self.truthy(condition);

                let then_block = self.builder.create_block();
                let else_block = self.builder.create_block();
                let merge = self.builder.create_block();
                self.builder.append_block_param(merge, types::F64);

                self.builder
                    .ins()
                    .brif(condition, then_block, &[], else_block, &[]);

                self.builder.switch_to_block(then_block);
                self.builder.seal_block(then_block);
                let value = self.expr(if_true)?;
                self.builder.ins().jump(merge, &[value]);

                self.builder.switch_to_block(else_block);
                self.builder.seal_block(else_block);
                let value = self.expr(if_false)?;
                self.builder.ins().jump(merge, &[value]);

                self.builder.switch_to_block(merge);
                self.builder.seal_block(merge);
                self.builder.block_params(merge)[0]
            }
            Expr::Call { function, args } => match lowering(*function) {
                Lowering::Instruction(op) => {
                    let arg = match args.first() {
                        Some(arg) => self.expr(arg)?,
                        None => return Err(format!("`{}` needs an argument", function.name())),
                    };
                    match op {
                        NativeOp::Fabs => self.builder.ins().fabs(arg),
                        NativeOp::Floor => self.builder.ins().floor(arg),
                        NativeOp::Ceil => self.builder.ins().ceil(arg),
                        NativeOp::Sqrt => self.builder.ins().sqrt(arg),
                    }
                }
                Lowering::Call(symbol) => {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.expr(arg)?);
                    }
                    self.call(symbol, &values)?
                }
                Lowering::Fold(symbol) => {
                    let (first, rest) = args
                        .split_first()
                        .ok_or_else(|| format!("`{}` needs an argument", function.name()))?;
                    let mut accumulator = self.expr(first)?;
                    for arg in rest {
                        let value = self.expr(arg)?;
                        accumulator = self.call(symbol, &[accumulator, value])?;
                    }
                    accumulator
                }
            },
        };
        Ok(value)
    }

    fn binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value, String> {
        let (a, b) = match op {
            BinaryOp::And | BinaryOp::Or => return self.short_circuit(op, lhs, rhs),
            _ => (self.expr(lhs)?, self.expr(rhs)?),
        };
        let compare = |translator: &mut Self, cc: FloatCC| {
            let flag = translator.builder.ins().fcmp(cc, a, b);
            translator.bool_to_f64(flag)
        };

        let value = match op {
            BinaryOp::Add => self.builder.ins().fadd(a, b),
            BinaryOp::Sub => self.builder.ins().fsub(a, b),
            BinaryOp::Mul => self.builder.ins().fmul(a, b),
            BinaryOp::Div => self.builder.ins().fdiv(a, b),
            BinaryOp::Rem => self.call("cellrun_math_fmod", &[a, b])?,
            BinaryOp::Eq => compare(self, FloatCC::Equal),
            BinaryOp::Ne => compare(self, FloatCC::NotEqual),
            BinaryOp::Lt => compare(self, FloatCC::LessThan),
            BinaryOp::Le => compare(self, FloatCC::LessThanOrEqual),
            BinaryOp::Gt => compare(self, FloatCC::GreaterThan),
            BinaryOp::Ge => compare(self, FloatCC::GreaterThanOrEqual),
            // Xor; `&&` and `||` returned above.
            _ => {
                let a = self.truthy(a);
                let b = self.truthy(b);
                let flag = self.builder.ins().bxor(a, b);
                self.bool_to_f64(flag)
            }
        };
        Ok(value)
    }

    fn short_circuit(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value, String> {
        let lhs = self.expr(lhs)?;
        let lhs = self.truthy(lhs);

        let rhs_block = self.builder.create_block();
        let merge = self.builder.create_block();
        self.builder.append_block_param(merge, types::F64);

        if op == BinaryOp::And {
            let zero = self.builder.ins().f64const(0.0);
            self.builder.ins().brif(lhs, rhs_block, &[], merge, &[zero]);
        } else {
            let one = self.builder.ins().f64const(1.0);
            self.builder.ins().brif(lhs, merge, &[one], rhs_block, &[]);
        }

        self.builder.switch_to_block(rhs_block);
        self.builder.seal_block(rhs_block);
        let rhs = self.expr(rhs)?;
        let rhs = self.truthy(rhs);
        let rhs = self.bool_to_f64(rhs);
        self.builder.ins().jump(merge, &[rhs]);

        self.builder.switch_to_block(merge);
        self.builder.seal_block(merge);
        Ok(self.builder.block_params(merge)[0])
    }

    /// Non-zero (including NaN) is true, as in C.
    fn truthy(&mut self, value: Value) -> Value {
        let zero = self.builder.ins().f64const(0.0);
        self.builder.ins().fcmp(FloatCC::NotEqual, value, zero)
    }

    fn bool_to_f64(&mut self, flag: Value) -> Value {
        let wide = self.builder.ins().uextend(types::I64, flag);
        self.builder.ins().fcvt_from_uint(types::F64, wide)
    }

    fn call(&mut self, symbol: &'static str, args: &[Value]) -> Result<Value, String> {
        let id = *self
            .imports
            .get(symbol)
            .ok_or_else(|| format!("the primitive `{symbol}` is not registered"))?;
        let func_ref = match self.func_refs.get(&id) {
            Some(func_ref) => *func_ref,
            None => {
                let func_ref = self.module.declare_func_in_func(id, self.builder.func);
                self.func_refs.insert(id, func_ref);
                func_ref
            }
        };
        let call = self.builder.ins().call(func_ref, args);
        Ok(self.builder.inst_results(call)[0])
    }
}
