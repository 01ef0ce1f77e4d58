//! Error types for primitive scalar operator dispatch.

use thiserror::Error;

use crate::values::ValueKind;

/// Errors raised by the primitive scalar operator table.
#[derive(Error, Debug)]
pub enum PrimOpError {
    #[error("Unknown primitive operator: {name}")]
    UnknownOp { name: String },

    #[error("Operator {op} expects {expected} operands but received {actual}")]
    WrongArity {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Operator {op} received unsupported operand kinds {lhs} and {rhs:?}")]
    InvalidType {
        op: &'static str,
        lhs: ValueKind,
        rhs: Option<ValueKind>,
    },

    #[error("Operator {op} attempted integer division by zero")]
    IntegerDivisionByZero { op: &'static str },

    #[error("Operator {op}: dimension {dim} is out of bounds for rank {rank}")]
    DimOutOfBounds {
        op: &'static str,
        dim: i64,
        rank: usize,
    },

    #[error("Operator {op} requires a constant tensor with host data")]
    MissingHostData { op: &'static str },
}

pub type PrimOpResult<T> = std::result::Result<T, PrimOpError>;
