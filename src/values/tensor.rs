//! GPU tensors and host-side constant tensor descriptions.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{GraphError, Result};
use crate::gpu::types::{BufferHandle, ImageHandle, MemoryHandle, ResourceBinding};
use crate::gpu::ComputeDevice;
use crate::utils::{align_up_i64, div_up_i64, WorkgroupSize};

/// Element types a tensor can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Bool,
    UInt8,
    Int8,
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        match self {
            DataType::Bool | DataType::UInt8 | DataType::Int8 => 1,
            DataType::Float16 => 2,
            DataType::Int32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Float64 => 8,
        }
    }
}

/// Where a tensor's data lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    Buffer,
    Texture3D,
    Texture2D,
}

impl StorageType {
    pub fn is_buffer(&self) -> bool {
        matches!(self, StorageType::Buffer)
    }
}

/// Which logical dimension is packed into the innermost texel lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryLayout {
    WidthPacked,
    HeightPacked,
    ChannelsPacked,
}

impl MemoryLayout {
    /// The packed dimension as a WHCN index (width = 0).
    pub fn packed_dim(&self) -> usize {
        match self {
            MemoryLayout::WidthPacked => 0,
            MemoryLayout::HeightPacked => 1,
            MemoryLayout::ChannelsPacked => 2,
        }
    }
}

/// Returns the size at a negative WHCN offset (`-1` = width), or 1 when the
/// tensor has fewer dimensions.
pub fn size_at_whcn(offset: i64, sizes: &[i64]) -> i64 {
    let rank = sizes.len() as i64;
    let index = rank + offset;
    if index < 0 {
        1
    } else {
        sizes[index as usize]
    }
}

fn contiguous_dim_order(rank: usize) -> Vec<i64> {
    (0..rank as i64).collect()
}

fn strides_from_dim_order(sizes: &[i64], dim_order: &[i64]) -> Vec<i64> {
    let mut strides = vec![0i64; sizes.len()];
    let mut running = 1i64;
    for &dim in dim_order.iter().rev() {
        strides[dim as usize] = running;
        running *= sizes[dim as usize].max(1);
    }
    strides
}

fn padded_sizes_for(sizes: &[i64], layout: MemoryLayout, storage: StorageType) -> Vec<i64> {
    let mut padded = sizes.to_vec();
    if storage.is_buffer() || padded.is_empty() {
        return padded;
    }
    // The packed dimension is padded to a whole number of 4-wide texels.
    let rank = padded.len();
    let packed_offset = layout.packed_dim() + 1;
    if packed_offset <= rank {
        let index = rank - packed_offset;
        padded[index] = align_up_i64(padded[index], 4);
    }
    padded
}

fn image_extents_for(sizes: &[i64], layout: MemoryLayout) -> [u32; 3] {
    let width = size_at_whcn(-1, sizes);
    let height = size_at_whcn(-2, sizes);
    let channels = size_at_whcn(-3, sizes);
    let batch = size_at_whcn(-4, sizes);
    let extents = match layout {
        MemoryLayout::WidthPacked => [div_up_i64(width, 4), height, channels * batch],
        MemoryLayout::HeightPacked => [width, div_up_i64(height, 4), channels * batch],
        MemoryLayout::ChannelsPacked => [width, height, div_up_i64(channels, 4) * batch],
    };
    [extents[0] as u32, extents[1] as u32, extents[2] as u32]
}

#[derive(Debug, Clone, Copy)]
enum TensorStorage {
    Buffer(BufferHandle),
    Image(ImageHandle),
}

/// A device tensor: sizes, dtype, storage mode, layout metadata, and a GPU
/// allocation that is either owned or bound later from a shared region.
///
/// `virtual_resize` updates the metadata in place without reallocating, as
/// long as the new footprint fits the allocated one.
pub struct GpuTensor {
    device: Arc<dyn ComputeDevice>,
    sizes: Vec<i64>,
    dtype: DataType,
    storage_type: StorageType,
    memory_layout: MemoryLayout,
    axis_map: Vec<i64>,
    dim_order: Vec<i64>,
    strides: Vec<i64>,
    numel: i64,
    padded_sizes: Vec<i64>,
    padded_numel: i64,
    image_extents: [u32; 3],
    /// Allocated footprint in bytes; the ceiling for `virtual_resize`.
    max_nbytes: usize,
    storage: TensorStorage,
    bound: bool,
}

impl fmt::Debug for GpuTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuTensor")
            .field("sizes", &self.sizes)
            .field("dtype", &self.dtype)
            .field("storage_type", &self.storage_type)
            .field("memory_layout", &self.memory_layout)
            .field("axis_map", &self.axis_map)
            .field("dim_order", &self.dim_order)
            .field("strides", &self.strides)
            .field("numel", &self.numel)
            .field("padded_sizes", &self.padded_sizes)
            .field("padded_numel", &self.padded_numel)
            .field("image_extents", &self.image_extents)
            .field("max_nbytes", &self.max_nbytes)
            .field("storage", &self.storage)
            .field("bound", &self.bound)
            .finish()
    }
}

impl GpuTensor {
    /// Creates a tensor. With `allocate_memory` the storage is backed
    /// immediately; otherwise the resource is created unbound and must be
    /// bound to a shared memory region before use.
    pub fn new(
        device: Arc<dyn ComputeDevice>,
        sizes: Vec<i64>,
        dtype: DataType,
        storage_type: StorageType,
        memory_layout: MemoryLayout,
        allocate_memory: bool,
    ) -> Result<Self> {
        let rank = sizes.len();
        let dim_order = contiguous_dim_order(rank);
        let strides = strides_from_dim_order(&sizes, &dim_order);
        let numel: i64 = sizes.iter().product();
        let padded_sizes = padded_sizes_for(&sizes, memory_layout, storage_type);
        let padded_numel: i64 = padded_sizes.iter().product();
        let image_extents = image_extents_for(&sizes, memory_layout);

        let max_nbytes = if storage_type.is_buffer() {
            numel as usize * dtype.element_size()
        } else {
            padded_numel as usize * dtype.element_size()
        };

        let storage = if storage_type.is_buffer() {
            let handle = if allocate_memory {
                device.create_buffer(max_nbytes.max(1), false)?
            } else {
                device.create_unbound_buffer(max_nbytes.max(1))?
            };
            TensorStorage::Buffer(handle)
        } else {
            TensorStorage::Image(device.create_image(image_extents, allocate_memory)?)
        };

        Ok(Self {
            device,
            sizes,
            dtype,
            storage_type,
            memory_layout,
            // Standard axis map: identity over the three spatial axes, with
            // the packed dim replicated as the concatenation axis.
            axis_map: vec![0, 1, 2, memory_layout.packed_dim() as i64],
            dim_order,
            strides,
            numel,
            padded_sizes,
            padded_numel,
            image_extents,
            max_nbytes,
            storage,
            bound: allocate_memory,
        })
    }

    /// Creates a view aliasing `src`'s storage, optionally with new sizes
    /// and strides.
    pub fn view_of(
        src: &GpuTensor,
        sizes: Option<Vec<i64>>,
        strides: Option<Vec<i64>>,
    ) -> Result<Self> {
        let sizes = sizes.unwrap_or_else(|| src.sizes.clone());
        let numel: i64 = sizes.iter().product();
        let dim_order = contiguous_dim_order(sizes.len());
        let strides = strides.unwrap_or_else(|| strides_from_dim_order(&sizes, &dim_order));
        let padded_sizes = padded_sizes_for(&sizes, src.memory_layout, src.storage_type);
        let padded_numel: i64 = padded_sizes.iter().product();
        let image_extents = image_extents_for(&sizes, src.memory_layout);

        Ok(Self {
            device: Arc::clone(&src.device),
            sizes,
            dtype: src.dtype,
            storage_type: src.storage_type,
            memory_layout: src.memory_layout,
            axis_map: src.axis_map.clone(),
            dim_order,
            strides,
            numel,
            padded_sizes,
            padded_numel,
            image_extents,
            max_nbytes: src.max_nbytes,
            storage: src.storage,
            bound: src.bound,
        })
    }

    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn memory_layout(&self) -> MemoryLayout {
        self.memory_layout
    }

    pub fn packed_dim(&self) -> usize {
        self.memory_layout.packed_dim()
    }

    pub fn axis_map(&self) -> &[i64] {
        &self.axis_map
    }

    pub fn dim(&self) -> usize {
        self.sizes.len()
    }

    pub fn dim_order(&self) -> &[i64] {
        &self.dim_order
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    pub fn numel(&self) -> i64 {
        self.numel
    }

    /// Sizes with the packed dimension rounded up to whole texels. For
    /// buffer storage, identical to `sizes`.
    pub fn padded_sizes(&self) -> &[i64] {
        &self.padded_sizes
    }

    pub fn padded_numel(&self) -> i64 {
        self.padded_numel
    }

    /// Element count a staging buffer must hold to cover this tensor,
    /// including texel padding for texture storage.
    pub fn staging_buffer_numel(&self) -> usize {
        if self.storage_type.is_buffer() {
            self.numel as usize
        } else {
            self.padded_numel as usize
        }
    }

    /// Logical texel extents for texture tensors; the dispatch grid for a
    /// whole-tensor shader.
    pub fn logical_limits(&self) -> WorkgroupSize {
        WorkgroupSize(self.image_extents)
    }

    pub fn nbytes(&self) -> usize {
        self.numel as usize * self.dtype.element_size()
    }

    /// Bytes of device memory this tensor requires, including padding.
    pub fn memory_requirements(&self) -> usize {
        self.max_nbytes
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn buffer_handle(&self) -> Option<BufferHandle> {
        match self.storage {
            TensorStorage::Buffer(handle) => Some(handle),
            TensorStorage::Image(_) => None,
        }
    }

    pub fn image_handle(&self) -> Option<ImageHandle> {
        match self.storage {
            TensorStorage::Image(handle) => Some(handle),
            TensorStorage::Buffer(_) => None,
        }
    }

    /// The resource to bind into a descriptor set slot.
    pub fn resource_binding(&self) -> ResourceBinding {
        match self.storage {
            TensorStorage::Buffer(handle) => ResourceBinding::Buffer(handle),
            TensorStorage::Image(handle) => ResourceBinding::Image(handle),
        }
    }

    /// Binds the tensor's resource to a shared memory region.
    pub fn bind_memory(&mut self, memory: MemoryHandle) -> Result<()> {
        match self.storage {
            TensorStorage::Buffer(handle) => self.device.bind_buffer_memory(handle, memory)?,
            TensorStorage::Image(handle) => self.device.bind_image_memory(handle, memory)?,
        }
        self.bound = true;
        Ok(())
    }

    /// Updates sizes, strides, and texel extents in place. Fails if the new
    /// footprint exceeds the allocated one or the rank changes.
    pub fn virtual_resize(&mut self, new_sizes: &[i64]) -> Result<()> {
        if new_sizes.len() != self.sizes.len() {
            return Err(GraphError::ResizeRankMismatch {
                rank: self.sizes.len(),
                new_rank: new_sizes.len(),
            });
        }
        let padded_sizes = padded_sizes_for(new_sizes, self.memory_layout, self.storage_type);
        let padded_numel: i64 = padded_sizes.iter().product();
        let numel: i64 = new_sizes.iter().product();
        let requested_nbytes = if self.storage_type.is_buffer() {
            numel as usize * self.dtype.element_size()
        } else {
            padded_numel as usize * self.dtype.element_size()
        };
        if requested_nbytes > self.max_nbytes {
            return Err(GraphError::ResizeExceedsCapacity {
                requested_nbytes,
                capacity_nbytes: self.max_nbytes,
            });
        }

        self.sizes = new_sizes.to_vec();
        self.strides = strides_from_dim_order(&self.sizes, &self.dim_order);
        self.numel = numel;
        self.padded_sizes = padded_sizes;
        self.padded_numel = padded_numel;
        self.image_extents = image_extents_for(&self.sizes, self.memory_layout);
        Ok(())
    }
}

/// A non-owning description of constant data living on the host: sizes,
/// dtype, and the bytes to upload during prepack.
#[derive(Debug, Clone)]
pub struct TensorRef {
    sizes: Vec<i64>,
    dtype: DataType,
    data: Arc<[u8]>,
}

impl TensorRef {
    pub fn new(sizes: Vec<i64>, dtype: DataType, data: Arc<[u8]>) -> Result<Self> {
        let numel: i64 = sizes.iter().product();
        let expected = numel as usize * dtype.element_size();
        if data.len() != expected {
            return Err(GraphError::TensorRefSizeMismatch {
                provided: data.len(),
                expected,
            });
        }
        Ok(Self { sizes, dtype, data })
    }

    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// A shared handle to the host bytes, for use after the borrow guard is
    /// released.
    pub fn clone_data(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    pub fn numel(&self) -> i64 {
        self.sizes.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::VirtualDevice;

    fn device() -> Arc<dyn ComputeDevice> {
        Arc::new(VirtualDevice::new())
    }

    #[test]
    fn test_buffer_tensor_metadata() {
        let t = GpuTensor::new(
            device(),
            vec![2, 3, 4],
            DataType::Float32,
            StorageType::Buffer,
            MemoryLayout::WidthPacked,
            true,
        )
        .unwrap();
        assert_eq!(t.numel(), 24);
        assert_eq!(t.strides(), &[12, 4, 1]);
        assert_eq!(t.dim_order(), &[0, 1, 2]);
        assert_eq!(t.staging_buffer_numel(), 24);
        assert_eq!(t.memory_requirements(), 24 * 4);
        assert!(t.buffer_handle().is_some());
        assert!(t.image_handle().is_none());
    }

    #[test]
    fn test_texture_tensor_padding_and_extents() {
        let t = GpuTensor::new(
            device(),
            vec![2, 6, 5],
            DataType::Float32,
            StorageType::Texture3D,
            MemoryLayout::ChannelsPacked,
            true,
        )
        .unwrap();
        // Channels (2) pad up to 4 texel lanes.
        assert_eq!(t.padded_numel(), 4 * 6 * 5);
        assert_eq!(t.staging_buffer_numel(), 120);
        // Extents: (W, H, ceil(C/4) * N) = (5, 6, 1).
        assert_eq!(t.logical_limits(), WorkgroupSize::new(5, 6, 1));
    }

    #[test]
    fn test_width_packed_extents() {
        let t = GpuTensor::new(
            device(),
            vec![3, 10],
            DataType::Float32,
            StorageType::Texture3D,
            MemoryLayout::WidthPacked,
            true,
        )
        .unwrap();
        // Extents: (ceil(W/4), H, C*N) = (3, 3, 1).
        assert_eq!(t.logical_limits(), WorkgroupSize::new(3, 3, 1));
        assert_eq!(t.padded_numel(), 3 * 12);
    }

    #[test]
    fn test_virtual_resize_within_capacity() {
        let mut t = GpuTensor::new(
            device(),
            vec![4, 8],
            DataType::Float32,
            StorageType::Buffer,
            MemoryLayout::WidthPacked,
            true,
        )
        .unwrap();
        t.virtual_resize(&[2, 8]).unwrap();
        assert_eq!(t.sizes(), &[2, 8]);
        assert_eq!(t.numel(), 16);
        assert_eq!(t.strides(), &[8, 1]);
    }

    #[test]
    fn test_virtual_resize_rejects_growth_beyond_footprint() {
        let mut t = GpuTensor::new(
            device(),
            vec![4, 8],
            DataType::Float32,
            StorageType::Buffer,
            MemoryLayout::WidthPacked,
            true,
        )
        .unwrap();
        let result = t.virtual_resize(&[8, 8]);
        assert!(matches!(
            result,
            Err(GraphError::ResizeExceedsCapacity { .. })
        ));
        let result = t.virtual_resize(&[32]);
        assert!(matches!(result, Err(GraphError::ResizeRankMismatch { .. })));
    }

    #[test]
    fn test_layout_enums_serialize() {
        assert_eq!(
            serde_json::to_string(&DataType::Float32).unwrap(),
            "\"FLOAT32\""
        );
        assert_eq!(
            serde_json::from_str::<DataType>("\"INT64\"").unwrap(),
            DataType::Int64
        );
        assert_eq!(
            serde_json::to_string(&MemoryLayout::ChannelsPacked).unwrap(),
            "\"ChannelsPacked\""
        );
        assert_eq!(
            serde_json::to_string(&StorageType::Buffer).unwrap(),
            "\"Buffer\""
        );
    }

    #[test]
    fn test_tensorref_validates_byte_length() {
        let data: Arc<[u8]> = vec![0u8; 24].into();
        assert!(TensorRef::new(vec![2, 3], DataType::Float32, data.clone()).is_ok());
        let result = TensorRef::new(vec![2, 4], DataType::Float32, data);
        assert!(matches!(
            result,
            Err(GraphError::TensorRefSizeMismatch {
                provided: 24,
                expected: 32
            })
        ));
    }
}
