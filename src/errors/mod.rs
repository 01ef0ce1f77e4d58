//! Error types for the compute graph runtime.
//!
//! Each domain carries its own specific error enum rather than a generic
//! wrapper like `anyhow` or `Box<dyn Error>`, so callers can match on the
//! exact failure.

mod graph_error;
mod prim_op_error;

pub use graph_error::{GraphError, GraphResult};
pub use prim_op_error::{PrimOpError, PrimOpResult};

/// Result type alias for operations that may fail with a graph error.
pub type Result<T> = std::result::Result<T, GraphError>;
