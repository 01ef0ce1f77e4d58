//! Value types stored in the compute graph: tensors, constant references,
//! staging buffers, symbolic integers, scalars, lists, and the shared
//! storage machinery for transient tensors.

pub mod shared_object;
pub mod staging;
pub mod symint;
pub mod tensor;
pub mod value;

pub use shared_object::{SharedObject, TmpSharedObjectStack, TmpTensor};
pub use staging::StagingBuffer;
pub use symint::SymInt;
pub use tensor::{DataType, GpuTensor, MemoryLayout, StorageType, TensorRef};
pub use value::{Scalar, Value, ValueKind, ValueRef, DUMMY_VALUE_REF};
