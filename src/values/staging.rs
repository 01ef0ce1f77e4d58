//! Host-visible staging buffers for streaming tensor data.

use std::fmt;
use std::sync::Arc;

use crate::errors::{GraphError, Result};
use crate::gpu::types::BufferHandle;
use crate::gpu::ComputeDevice;

use super::tensor::DataType;

/// A host-visible GPU buffer used to move tensor data between host memory
/// and device-local storage.
pub struct StagingBuffer {
    device: Arc<dyn ComputeDevice>,
    buffer: BufferHandle,
    dtype: DataType,
    numel: usize,
}

impl fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("buffer", &self.buffer)
            .field("dtype", &self.dtype)
            .field("numel", &self.numel)
            .finish()
    }
}

impl StagingBuffer {
    pub fn new(device: Arc<dyn ComputeDevice>, dtype: DataType, numel: usize) -> Result<Self> {
        let nbytes = numel * dtype.element_size();
        let buffer = device.create_buffer(nbytes.max(1), true)?;
        Ok(Self {
            device,
            buffer,
            dtype,
            numel,
        })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn nbytes(&self) -> usize {
        self.numel * self.dtype.element_size()
    }

    /// Copies `nbytes` from host memory into the staging buffer.
    pub fn copy_from(&self, data: &[u8], nbytes: usize) -> Result<()> {
        if nbytes > self.nbytes() {
            return Err(GraphError::StagingCopyTooLarge {
                requested: nbytes / self.dtype.element_size(),
                numel: self.numel,
            });
        }
        if data.len() < nbytes {
            return Err(GraphError::StagingHostTooSmall {
                provided: data.len(),
                required: nbytes,
            });
        }
        self.device.write_buffer(self.buffer, 0, &data[..nbytes])?;
        Ok(())
    }

    /// Copies `nbytes` out of the staging buffer into host memory.
    pub fn copy_to(&self, out: &mut [u8], nbytes: usize) -> Result<()> {
        if nbytes > self.nbytes() {
            return Err(GraphError::StagingCopyTooLarge {
                requested: nbytes / self.dtype.element_size(),
                numel: self.numel,
            });
        }
        if out.len() < nbytes {
            return Err(GraphError::StagingHostTooSmall {
                provided: out.len(),
                required: nbytes,
            });
        }
        self.device.read_buffer(self.buffer, 0, &mut out[..nbytes])?;
        Ok(())
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::VirtualDevice;

    #[test]
    fn test_staging_roundtrip() {
        let device: Arc<dyn ComputeDevice> = Arc::new(VirtualDevice::new());
        let staging = StagingBuffer::new(device, DataType::Float32, 4).unwrap();

        let data: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]).to_vec();
        staging.copy_from(&data, data.len()).unwrap();

        let mut out = vec![0u8; 16];
        staging.copy_to(&mut out, 16).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_staging_copy_bounds() {
        let device: Arc<dyn ComputeDevice> = Arc::new(VirtualDevice::new());
        let staging = StagingBuffer::new(device, DataType::Float32, 2).unwrap();

        let result = staging.copy_from(&[0u8; 32], 32);
        assert!(matches!(result, Err(GraphError::StagingCopyTooLarge { .. })));

        let result = staging.copy_from(&[0u8; 2], 8);
        assert!(matches!(result, Err(GraphError::StagingHostTooSmall { .. })));
    }
}
