//! GPU-device-specific error types.

use thiserror::Error;

/// Errors reported by a compute device implementation.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("GPU device not available: {message}")]
    DeviceNotAvailable { message: String },

    #[error("Buffer creation failed: {message}")]
    BufferCreationFailed { message: String },

    #[error("Shader compilation failed for {shader}: {message}")]
    ShaderCompilationFailed { shader: String, message: String },

    #[error("Shader {shader} has no source available on this device")]
    MissingShaderSource { shader: String },

    #[error("Unknown {kind} handle {handle} passed to {operation}")]
    InvalidHandle {
        kind: &'static str,
        handle: u64,
        operation: &'static str,
    },

    #[error("Operation not supported by this device: {operation}")]
    Unsupported { operation: &'static str },

    #[error("Descriptor pool has not been initialized")]
    DescriptorPoolNotInitialized,

    #[error("Command buffer {handle} is not in a recording state")]
    NotRecording { handle: u64 },

    #[error("Out-of-bounds access on buffer {handle}: offset {offset} + {len} > {size}")]
    BufferAccessOutOfBounds {
        handle: u64,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Buffer {handle} has no memory bound")]
    BufferNotBound { handle: u64 },

    #[error("Submission failed: {message}")]
    SubmissionFailed { message: String },
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;
