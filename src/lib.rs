//! GPU compute graph runtime for executing pre-lowered neural network
//! computations.
//!
//! This library provides a static compute graph over a command-buffer
//! oriented GPU API: a typed value store with stable index handles, shared
//! storage assignment for transient tensors, a two-phase prepack/execute
//! pipeline with a staging-memory throttle, and a strict command-buffer
//! recording state machine. Operator kernels and graph lowering live
//! outside this crate; nodes plug in through the [`nodes`] traits.

pub mod compute_graph;
pub mod errors;
pub mod gpu;
pub mod graph_config;
pub mod nodes;
pub mod prim_ops;
pub mod utils;
pub mod values;

pub use compute_graph::{ComputeGraph, IoValueRef, Phase};
pub use errors::{GraphError, PrimOpError};
pub use graph_config::GraphConfig;
pub use values::{DataType, MemoryLayout, Scalar, StorageType, Value, ValueRef, DUMMY_VALUE_REF};
