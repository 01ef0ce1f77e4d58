//! Primitive scalar operator dispatch.
//!
//! A flat table of named operators over dynamic scalar values, used for
//! symbolic-shape arithmetic: algebra with Int/Double promotion,
//! comparisons (which also accept Bool pairs), Python-compatible floor
//! division and rounding, and the tensor-metadata readers `sym_size`,
//! `sym_numel`, and `local_scalar_dense`.

use crate::errors::{PrimOpError, PrimOpResult};
use crate::values::{DataType, Value};

/// One entry in the operator table.
pub struct PrimOp {
    pub name: &'static str,
    pub arity: usize,
    pub func: fn(&[Value]) -> PrimOpResult<Value>,
}

fn invalid_type(op: &'static str, args: &[Value]) -> PrimOpError {
    PrimOpError::InvalidType {
        op,
        lhs: args[0].kind(),
        rhs: args.get(1).map(|v| v.kind()),
    }
}

fn algebra(
    op: &'static str,
    args: &[Value],
    int_op: fn(i64, i64) -> i64,
    double_op: fn(f64, f64) -> f64,
) -> PrimOpResult<Value> {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
        (Value::Double(a), Value::Double(b)) => Ok(Value::Double(double_op(*a, *b))),
        (Value::Int(a), Value::Double(b)) => Ok(Value::Double(double_op(*a as f64, *b))),
        (Value::Double(a), Value::Int(b)) => Ok(Value::Double(double_op(*a, *b as f64))),
        _ => Err(invalid_type(op, args)),
    }
}

fn compare(
    op: &'static str,
    args: &[Value],
    int_op: fn(i64, i64) -> bool,
    double_op: fn(f64, f64) -> bool,
) -> PrimOpResult<Value> {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Bool(int_op(*a, *b))),
        (Value::Double(a), Value::Double(b)) => Ok(Value::Bool(double_op(*a, *b))),
        (Value::Int(a), Value::Double(b)) => Ok(Value::Bool(double_op(*a as f64, *b))),
        (Value::Double(a), Value::Int(b)) => Ok(Value::Bool(double_op(*a, *b as f64))),
        _ => Err(invalid_type(op, args)),
    }
}

fn compare_with_bool(
    op: &'static str,
    args: &[Value],
    int_op: fn(i64, i64) -> bool,
    double_op: fn(f64, f64) -> bool,
    bool_op: fn(bool, bool) -> bool,
) -> PrimOpResult<Value> {
    if let (Value::Bool(a), Value::Bool(b)) = (&args[0], &args[1]) {
        return Ok(Value::Bool(bool_op(*a, *b)));
    }
    compare(op, args, int_op, double_op)
}

/// Python `//` over doubles: `(a - fmod(a, b)) / b`, decremented when the
/// remainder's sign differs from the divisor's. Division by zero yields
/// ±infinity by the dividend's sign.
fn floor_div_double(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        return if a.is_sign_negative() {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }
    let rem = a % b;
    let div = (a - rem) / b;
    if rem != 0.0 && b.is_sign_negative() != rem.is_sign_negative() {
        div - 1.0
    } else {
        div
    }
}

/// Python `//` over integers, maintaining `a == (a // b) * b + a mod b`:
/// the truncated quotient is decremented for opposite-sign operands with a
/// non-zero remainder.
fn floor_div_int(op: &'static str, a: i64, b: i64) -> PrimOpResult<i64> {
    if b == 0 {
        return Err(PrimOpError::IntegerDivisionByZero { op });
    }
    let quot = a / b;
    if (a < 0) == (b < 0) {
        return Ok(quot);
    }
    let rem = a % b;
    Ok(if rem != 0 { quot - 1 } else { quot })
}

fn floordiv(args: &[Value]) -> PrimOpResult<Value> {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(floor_div_int("floordiv", *a, *b)?)),
        (Value::Double(a), Value::Double(b)) => Ok(Value::Double(floor_div_double(*a, *b))),
        (Value::Int(a), Value::Double(b)) => Ok(Value::Double(floor_div_double(*a as f64, *b))),
        (Value::Double(a), Value::Int(b)) => Ok(Value::Double(floor_div_double(*a, *b as f64))),
        _ => Err(invalid_type("floordiv", args)),
    }
}

fn truediv(args: &[Value]) -> PrimOpResult<Value> {
    // Integer operands are cast before dividing, so the result is always a
    // double; division by zero follows IEEE semantics.
    let to_double = |v: &Value| match v {
        Value::Int(v) => Some(*v as f64),
        Value::Double(v) => Some(*v),
        _ => None,
    };
    match (to_double(&args[0]), to_double(&args[1])) {
        (Some(a), Some(b)) => Ok(Value::Double(a / b)),
        _ => Err(invalid_type("truediv", args)),
    }
}

fn modulo(args: &[Value]) -> PrimOpResult<Value> {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(PrimOpError::IntegerDivisionByZero { op: "mod" })
            } else {
                Ok(Value::Int(a % b))
            }
        }
        _ => Err(invalid_type("mod", args)),
    }
}

fn neg(args: &[Value]) -> PrimOpResult<Value> {
    match &args[0] {
        Value::Int(v) => Ok(Value::Int(-v)),
        Value::Double(v) => Ok(Value::Double(-v)),
        _ => Err(invalid_type("neg", args)),
    }
}

fn sym_float(args: &[Value]) -> PrimOpResult<Value> {
    match &args[0] {
        Value::Int(v) => Ok(Value::Double(*v as f64)),
        Value::Double(v) => Ok(Value::Double(*v)),
        _ => Err(invalid_type("sym_float", args)),
    }
}

fn ceil(args: &[Value]) -> PrimOpResult<Value> {
    match &args[0] {
        Value::Double(v) => Ok(Value::Int(v.ceil() as i64)),
        _ => Err(invalid_type("ceil", args)),
    }
}

fn trunc(args: &[Value]) -> PrimOpResult<Value> {
    match &args[0] {
        Value::Double(v) => Ok(Value::Int(v.trunc() as i64)),
        _ => Err(invalid_type("trunc", args)),
    }
}

/// Round half to even, matching Python's `round()`. Implemented explicitly
/// since fenv rounding modes are not portable.
fn round(args: &[Value]) -> PrimOpResult<Value> {
    match &args[0] {
        Value::Double(val) => {
            let r = val.round();
            let d = r - val;
            let res = if d.abs() != 0.5 {
                r
            } else if r % 2.0 == 0.0 {
                r
            } else {
                val - d
            };
            Ok(Value::Int(res as i64))
        }
        _ => Err(invalid_type("round", args)),
    }
}

fn sym_extreme(
    op: &'static str,
    args: &[Value],
    pick: fn(i64, i64) -> i64,
) -> PrimOpResult<Value> {
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(pick(*a, *b))),
        _ => Err(invalid_type(op, args)),
    }
}

fn tensor_sizes(op: &'static str, args: &[Value]) -> PrimOpResult<Vec<i64>> {
    match &args[0] {
        Value::Tensor(t) => Ok(t.sizes().to_vec()),
        Value::TensorRef(t) => Ok(t.sizes().to_vec()),
        _ => Err(invalid_type(op, args)),
    }
}

fn sym_size(args: &[Value]) -> PrimOpResult<Value> {
    let sizes = tensor_sizes("sym_size", args)?;
    let dim = match &args[1] {
        Value::Int(dim) => *dim,
        _ => return Err(invalid_type("sym_size", args)),
    };
    if dim < 0 || dim as usize >= sizes.len() {
        return Err(PrimOpError::DimOutOfBounds {
            op: "sym_size",
            dim,
            rank: sizes.len(),
        });
    }
    Ok(Value::Int(sizes[dim as usize]))
}

fn sym_numel(args: &[Value]) -> PrimOpResult<Value> {
    let sizes = tensor_sizes("sym_numel", args)?;
    Ok(Value::Int(sizes.iter().product()))
}

/// Reads the first element of a constant tensor's host data as a scalar.
fn local_scalar_dense(args: &[Value]) -> PrimOpResult<Value> {
    let tref = match &args[0] {
        Value::TensorRef(t) => t,
        Value::Tensor(_) => return Err(PrimOpError::MissingHostData {
            op: "local_scalar_dense",
        }),
        _ => return Err(invalid_type("local_scalar_dense", args)),
    };
    let data = tref.data();
    if data.is_empty() {
        return Err(PrimOpError::MissingHostData {
            op: "local_scalar_dense",
        });
    }
    let value = match tref.dtype() {
        DataType::Bool => Value::Bool(data[0] != 0),
        DataType::UInt8 => Value::Int(data[0] as i64),
        DataType::Int8 => Value::Int(data[0] as i8 as i64),
        DataType::Int32 => {
            Value::Int(i32::from_le_bytes(data[..4].try_into().unwrap()) as i64)
        }
        DataType::Int64 => Value::Int(i64::from_le_bytes(data[..8].try_into().unwrap())),
        DataType::Float32 => {
            Value::Double(f32::from_le_bytes(data[..4].try_into().unwrap()) as f64)
        }
        DataType::Float64 => Value::Double(f64::from_le_bytes(data[..8].try_into().unwrap())),
        DataType::Float16 => return Err(invalid_type("local_scalar_dense", args)),
    };
    Ok(value)
}

/// The operator table.
pub const PRIM_OPS: &[PrimOp] = &[
    PrimOp {
        name: "add",
        arity: 2,
        func: |args| algebra("add", args, |a, b| a + b, |a, b| a + b),
    },
    PrimOp {
        name: "sub",
        arity: 2,
        func: |args| algebra("sub", args, |a, b| a - b, |a, b| a - b),
    },
    PrimOp {
        name: "mul",
        arity: 2,
        func: |args| algebra("mul", args, |a, b| a * b, |a, b| a * b),
    },
    PrimOp {
        name: "floordiv",
        arity: 2,
        func: floordiv,
    },
    PrimOp {
        name: "truediv",
        arity: 2,
        func: truediv,
    },
    PrimOp {
        name: "mod",
        arity: 2,
        func: modulo,
    },
    PrimOp {
        name: "neg",
        arity: 1,
        func: neg,
    },
    PrimOp {
        name: "eq",
        arity: 2,
        func: |args| compare_with_bool("eq", args, |a, b| a == b, |a, b| a == b, |a, b| a == b),
    },
    PrimOp {
        name: "gt",
        arity: 2,
        func: |args| compare_with_bool("gt", args, |a, b| a > b, |a, b| a > b, |a, b| a & !b),
    },
    PrimOp {
        name: "lt",
        arity: 2,
        func: |args| compare_with_bool("lt", args, |a, b| a < b, |a, b| a < b, |a, b| !a & b),
    },
    PrimOp {
        name: "ge",
        arity: 2,
        func: |args| compare_with_bool("ge", args, |a, b| a >= b, |a, b| a >= b, |a, b| a >= b),
    },
    PrimOp {
        name: "le",
        arity: 2,
        func: |args| compare_with_bool("le", args, |a, b| a <= b, |a, b| a <= b, |a, b| a <= b),
    },
    PrimOp {
        name: "ceil",
        arity: 1,
        func: ceil,
    },
    PrimOp {
        name: "round",
        arity: 1,
        func: round,
    },
    PrimOp {
        name: "trunc",
        arity: 1,
        func: trunc,
    },
    PrimOp {
        name: "sym_float",
        arity: 1,
        func: sym_float,
    },
    PrimOp {
        name: "sym_max",
        arity: 2,
        func: |args| sym_extreme("sym_max", args, i64::max),
    },
    PrimOp {
        name: "sym_min",
        arity: 2,
        func: |args| sym_extreme("sym_min", args, i64::min),
    },
    PrimOp {
        name: "sym_size",
        arity: 2,
        func: sym_size,
    },
    PrimOp {
        name: "sym_numel",
        arity: 1,
        func: sym_numel,
    },
    PrimOp {
        name: "local_scalar_dense",
        arity: 1,
        func: local_scalar_dense,
    },
];

/// Finds a table entry by name.
pub fn lookup_op(name: &str) -> Option<&'static PrimOp> {
    PRIM_OPS.iter().find(|op| op.name == name)
}

/// Dispatches a named operator over the argument stack.
pub fn call_op(name: &str, args: &[Value]) -> PrimOpResult<Value> {
    let op = lookup_op(name).ok_or_else(|| PrimOpError::UnknownOp {
        name: name.to_string(),
    })?;
    if args.len() != op.arity {
        return Err(PrimOpError::WrongArity {
            op: op.name,
            expected: op.arity,
            actual: args.len(),
        });
    }
    (op.func)(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::ValueKind;

    fn int(v: i64) -> Value {
        Value::Int(v)
    }

    fn double(v: f64) -> Value {
        Value::Double(v)
    }

    #[test]
    fn test_algebra_promotion() {
        assert_eq!(call_op("add", &[int(2), int(3)]).unwrap().as_int(), Some(5));
        assert_eq!(
            call_op("add", &[int(2), double(0.5)]).unwrap().as_double(),
            Some(2.5)
        );
        assert_eq!(
            call_op("mul", &[double(1.5), int(4)]).unwrap().as_double(),
            Some(6.0)
        );
        assert_eq!(
            call_op("sub", &[double(1.0), double(0.25)])
                .unwrap()
                .as_double(),
            Some(0.75)
        );
    }

    #[test]
    fn test_algebra_rejects_bools() {
        let err = call_op("add", &[Value::Bool(true), int(1)]).unwrap_err();
        assert!(matches!(
            err,
            PrimOpError::InvalidType {
                op: "add",
                lhs: ValueKind::Bool,
                rhs: Some(ValueKind::Int),
            }
        ));
    }

    #[test]
    fn test_floordiv_int_mixed_signs() {
        // Same signs truncate.
        assert_eq!(call_op("floordiv", &[int(7), int(2)]).unwrap().as_int(), Some(3));
        assert_eq!(
            call_op("floordiv", &[int(-7), int(-2)]).unwrap().as_int(),
            Some(3)
        );
        // Opposite signs with a remainder decrement.
        assert_eq!(
            call_op("floordiv", &[int(-7), int(2)]).unwrap().as_int(),
            Some(-4)
        );
        assert_eq!(
            call_op("floordiv", &[int(7), int(-2)]).unwrap().as_int(),
            Some(-4)
        );
        // Exact division never decrements.
        assert_eq!(
            call_op("floordiv", &[int(-8), int(2)]).unwrap().as_int(),
            Some(-4)
        );
    }

    #[test]
    fn test_floordiv_double_sign_fixup() {
        assert_eq!(
            call_op("floordiv", &[double(7.0), double(2.0)])
                .unwrap()
                .as_double(),
            Some(3.0)
        );
        // fmod(7, -2) = 1, (7 - 1) / -2 = -3, signs differ => -4.
        assert_eq!(
            call_op("floordiv", &[double(7.0), double(-2.0)])
                .unwrap()
                .as_double(),
            Some(-4.0)
        );
        assert_eq!(
            call_op("floordiv", &[double(-7.0), double(2.0)])
                .unwrap()
                .as_double(),
            Some(-4.0)
        );
        // Mixed int/double promotes.
        assert_eq!(
            call_op("floordiv", &[int(7), double(2.0)]).unwrap().as_double(),
            Some(3.0)
        );
    }

    #[test]
    fn test_floordiv_double_division_by_zero_is_infinite() {
        assert_eq!(
            call_op("floordiv", &[double(3.0), double(0.0)])
                .unwrap()
                .as_double(),
            Some(f64::INFINITY)
        );
        assert_eq!(
            call_op("floordiv", &[double(-3.0), double(0.0)])
                .unwrap()
                .as_double(),
            Some(f64::NEG_INFINITY)
        );
    }

    #[test]
    fn test_floordiv_int_division_by_zero_is_an_error() {
        assert!(matches!(
            call_op("floordiv", &[int(1), int(0)]),
            Err(PrimOpError::IntegerDivisionByZero { op: "floordiv" })
        ));
    }

    #[test]
    fn test_truediv_always_produces_double() {
        assert_eq!(
            call_op("truediv", &[int(7), int(2)]).unwrap().as_double(),
            Some(3.5)
        );
        assert_eq!(
            call_op("truediv", &[double(1.0), double(0.0)])
                .unwrap()
                .as_double(),
            Some(f64::INFINITY)
        );
    }

    #[test]
    fn test_round_half_to_even() {
        assert_eq!(call_op("round", &[double(0.5)]).unwrap().as_int(), Some(0));
        assert_eq!(call_op("round", &[double(1.5)]).unwrap().as_int(), Some(2));
        assert_eq!(call_op("round", &[double(2.5)]).unwrap().as_int(), Some(2));
        assert_eq!(call_op("round", &[double(-0.5)]).unwrap().as_int(), Some(0));
        assert_eq!(call_op("round", &[double(-1.5)]).unwrap().as_int(), Some(-2));
        assert_eq!(call_op("round", &[double(2.25)]).unwrap().as_int(), Some(2));
        assert_eq!(call_op("round", &[double(2.75)]).unwrap().as_int(), Some(3));
    }

    #[test]
    fn test_ceil_trunc_sym_float() {
        assert_eq!(call_op("ceil", &[double(1.25)]).unwrap().as_int(), Some(2));
        assert_eq!(call_op("trunc", &[double(-1.75)]).unwrap().as_int(), Some(-1));
        assert_eq!(
            call_op("sym_float", &[int(3)]).unwrap().as_double(),
            Some(3.0)
        );
    }

    #[test]
    fn test_comparisons_accept_bool_pairs() {
        assert_eq!(
            call_op("eq", &[Value::Bool(true), Value::Bool(true)])
                .unwrap()
                .as_bool(),
            Some(true)
        );
        assert_eq!(
            call_op("gt", &[Value::Bool(true), Value::Bool(false)])
                .unwrap()
                .as_bool(),
            Some(true)
        );
        assert_eq!(
            call_op("le", &[int(3), double(3.0)]).unwrap().as_bool(),
            Some(true)
        );
        assert_eq!(
            call_op("lt", &[double(2.0), int(1)]).unwrap().as_bool(),
            Some(false)
        );
        // Bools are only legal for comparisons, pairwise.
        assert!(call_op("ge", &[Value::Bool(true), int(1)]).is_err());
    }

    #[test]
    fn test_sym_max_min_require_ints() {
        assert_eq!(
            call_op("sym_max", &[int(3), int(9)]).unwrap().as_int(),
            Some(9)
        );
        assert_eq!(
            call_op("sym_min", &[int(3), int(9)]).unwrap().as_int(),
            Some(3)
        );
        assert!(matches!(
            call_op("sym_max", &[double(1.0), int(2)]),
            Err(PrimOpError::InvalidType { op: "sym_max", .. })
        ));
    }

    #[test]
    fn test_neg() {
        assert_eq!(call_op("neg", &[int(5)]).unwrap().as_int(), Some(-5));
        assert_eq!(call_op("neg", &[double(-2.5)]).unwrap().as_double(), Some(2.5));
    }

    #[test]
    fn test_mod_int_only() {
        assert_eq!(call_op("mod", &[int(7), int(3)]).unwrap().as_int(), Some(1));
        assert_eq!(call_op("mod", &[int(-7), int(3)]).unwrap().as_int(), Some(-1));
        assert!(call_op("mod", &[double(7.0), int(3)]).is_err());
        assert!(matches!(
            call_op("mod", &[int(7), int(0)]),
            Err(PrimOpError::IntegerDivisionByZero { op: "mod" })
        ));
    }

    #[test]
    fn test_sym_size_and_numel_read_tensor_metadata() {
        let tref = crate::values::TensorRef::new(
            vec![2, 3, 4],
            DataType::Float32,
            vec![0u8; 96].into(),
        )
        .unwrap();
        let t = Value::TensorRef(tref);
        assert_eq!(call_op("sym_size", &[t, int(1)]).unwrap().as_int(), Some(3));

        let tref = crate::values::TensorRef::new(
            vec![2, 3, 4],
            DataType::Float32,
            vec![0u8; 96].into(),
        )
        .unwrap();
        let t = Value::TensorRef(tref);
        assert_eq!(call_op("sym_numel", &[t]).unwrap().as_int(), Some(24));

        let tref = crate::values::TensorRef::new(
            vec![2],
            DataType::Float32,
            vec![0u8; 8].into(),
        )
        .unwrap();
        let t = Value::TensorRef(tref);
        assert!(matches!(
            call_op("sym_size", &[t, int(5)]),
            Err(PrimOpError::DimOutOfBounds {
                op: "sym_size",
                dim: 5,
                rank: 1
            })
        ));
    }

    #[test]
    fn test_local_scalar_dense_reads_first_element() {
        let data: Vec<u8> = bytemuck::cast_slice(&[42i32, 7]).to_vec();
        let tref =
            crate::values::TensorRef::new(vec![2], DataType::Int32, data.into()).unwrap();
        assert_eq!(
            call_op("local_scalar_dense", &[Value::TensorRef(tref)])
                .unwrap()
                .as_int(),
            Some(42)
        );

        let data: Vec<u8> = bytemuck::cast_slice(&[1.5f32]).to_vec();
        let tref =
            crate::values::TensorRef::new(vec![1], DataType::Float32, data.into()).unwrap();
        assert_eq!(
            call_op("local_scalar_dense", &[Value::TensorRef(tref)])
                .unwrap()
                .as_double(),
            Some(1.5)
        );
    }

    #[test]
    fn test_lookup_and_arity_checks() {
        assert!(lookup_op("add").is_some());
        assert!(lookup_op("does_not_exist").is_none());
        assert!(matches!(
            call_op("does_not_exist", &[int(1)]),
            Err(PrimOpError::UnknownOp { .. })
        ));
        assert!(matches!(
            call_op("add", &[int(1)]),
            Err(PrimOpError::WrongArity {
                op: "add",
                expected: 2,
                actual: 1
            })
        ));
    }
}
