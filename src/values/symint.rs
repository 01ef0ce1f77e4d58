//! Symbolic integers mirrored in device uniform buffers.

use std::fmt;
use std::sync::Arc;

use crate::errors::Result;
use crate::gpu::types::BufferHandle;
use crate::gpu::ComputeDevice;

/// A symbolic integer whose host value is mirrored in a small uniform
/// buffer, so shaders can read sizes that change between executions without
/// re-encoding.
pub struct SymInt {
    device: Arc<dyn ComputeDevice>,
    buffer: BufferHandle,
    value: i32,
}

impl fmt::Debug for SymInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymInt")
            .field("buffer", &self.buffer)
            .field("value", &self.value)
            .finish()
    }
}

impl SymInt {
    pub fn new(device: Arc<dyn ComputeDevice>, value: i32) -> Result<Self> {
        let buffer = device.create_buffer(std::mem::size_of::<i32>(), true)?;
        device.write_buffer(buffer, 0, bytemuck::bytes_of(&value))?;
        Ok(Self {
            device,
            buffer,
            value,
        })
    }

    /// Updates both the host value and the GPU mirror.
    pub fn set(&mut self, value: i32) -> Result<()> {
        self.value = value;
        self.device
            .write_buffer(self.buffer, 0, bytemuck::bytes_of(&value))?;
        Ok(())
    }

    /// Reads the host value.
    pub fn get(&self) -> i32 {
        self.value
    }

    /// The uniform buffer backing this symbolic integer.
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }
}

impl Drop for SymInt {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
    }
}
