//! Error types for compute graph operations.

use thiserror::Error;

use crate::gpu::command::CommandBufferState;
use crate::gpu::errors::DeviceError;
use crate::values::ValueKind;

/// Errors that can occur during graph construction, preparation, encoding,
/// or execution.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Value reference {index} is out of bounds for a store of {len} values")]
    ValueRefOutOfBounds { index: usize, len: usize },

    #[error("Value at index {index} has kind {actual}, but {expected} was required")]
    InvalidValueType {
        index: usize,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("ValueList element at index {index} is neither Int nor SymInt, but has kind {actual}")]
    InvalidListElementType { index: usize, actual: ValueKind },

    #[error("Cannot determine {query} for value at index {index} with kind {actual}")]
    UnsupportedMetadataQuery {
        query: &'static str,
        index: usize,
        actual: ValueKind,
    },

    #[error("Called {operation}() on a command buffer whose state is {state:?}")]
    InvalidCommandBufferState {
        operation: &'static str,
        state: CommandBufferState,
    },

    #[error("No command buffer is currently being recorded")]
    NoActiveCommandBuffer,

    #[error("Cannot flush the context while a command buffer is still being recorded")]
    FlushWithActiveCommandBuffer,

    #[error(
        "Virtual resize to {requested_nbytes} bytes exceeds the allocated footprint of {capacity_nbytes} bytes"
    )]
    ResizeExceedsCapacity {
        requested_nbytes: usize,
        capacity_nbytes: usize,
    },

    #[error("New sizes have rank {new_rank}, but the tensor has rank {rank}")]
    ResizeRankMismatch { rank: usize, new_rank: usize },

    #[error("Input index {index} is out of bounds for {len} bound inputs")]
    InputIndexOutOfBounds { index: usize, len: usize },

    #[error("Staging copy of {requested} elements exceeds the staging buffer's {numel} elements")]
    StagingCopyTooLarge { requested: usize, numel: usize },

    #[error(
        "Host data of {provided} bytes is too small for a staging copy of {required} bytes"
    )]
    StagingHostTooSmall { provided: usize, required: usize },

    #[error("Tensor data of {provided} bytes does not match the expected {expected} bytes")]
    TensorRefSizeMismatch { provided: usize, expected: usize },

    #[error("Tensor at index {index} has no {resource} storage")]
    MissingTensorStorage {
        index: usize,
        resource: &'static str,
    },

    #[error("Shader {shader} declares {layout_len} bindings but {bound} resources were provided")]
    BindingCountMismatch {
        shader: String,
        layout_len: usize,
        bound: usize,
    },

    #[error("Push constant data exceeds the {max} byte limit")]
    PushConstantOverflow { max: usize },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Result type alias for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;
