//! Handle types and resource descriptions for the compute device interface.
//!
//! All device objects are addressed through opaque integer handles. The
//! runtime never dereferences a handle itself; handles are only meaningful to
//! the device that issued them.

use serde::{Deserialize, Serialize};

use crate::utils::WorkgroupSize;

/// Maximum number of push constant bytes a pipeline layout may carry.
pub const MAX_PUSH_CONSTANT_SIZE: usize = 128;

macro_rules! device_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

device_handle!(
    /// A GPU buffer object.
    BufferHandle
);
device_handle!(
    /// A GPU 3D image object.
    ImageHandle
);
device_handle!(
    /// A region of device memory that resources can be bound to.
    MemoryHandle
);
device_handle!(
    /// A command pool owning command buffer allocations.
    CommandPoolHandle
);
device_handle!(
    /// A recorded or recording command buffer.
    CommandBufferHandle
);
device_handle!(
    /// A queue-ordering semaphore.
    SemaphoreHandle
);
device_handle!(
    /// A host-waitable fence.
    FenceHandle
);
device_handle!(
    /// A compiled shader module.
    ShaderModuleHandle
);
device_handle!(
    /// A descriptor set layout derived from a shader's binding list.
    ShaderLayoutHandle
);
device_handle!(
    /// A pipeline layout (shader layout + push constant range).
    PipelineLayoutHandle
);
device_handle!(
    /// A compute pipeline.
    PipelineHandle
);
device_handle!(
    /// A descriptor set allocated from the device descriptor pool.
    DescriptorSetHandle
);
device_handle!(
    /// A timestamp query pool.
    QueryPoolHandle
);

/// The binding categories a shader layout may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    StorageImage,
}

/// Aggregated descriptor demand, used both to accumulate per-phase counts
/// and to size the device descriptor pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorCounts {
    pub max_sets: u32,
    pub uniform_buffer_count: u32,
    pub storage_buffer_count: u32,
    pub combined_sampler_count: u32,
    pub storage_image_count: u32,
}

impl DescriptorCounts {
    /// Adds one descriptor of the given type.
    pub fn add(&mut self, ty: DescriptorType) {
        match ty {
            DescriptorType::UniformBuffer => self.uniform_buffer_count += 1,
            DescriptorType::StorageBuffer => self.storage_buffer_count += 1,
            DescriptorType::CombinedImageSampler => self.combined_sampler_count += 1,
            DescriptorType::StorageImage => self.storage_image_count += 1,
        }
    }
}

/// Description of a compute shader: its name, binding layout, and (for
/// devices that compile from source) optional WGSL text.
#[derive(Debug, Clone)]
pub struct ShaderInfo {
    pub name: String,
    pub layout: Vec<DescriptorType>,
    pub wgsl: Option<String>,
}

impl ShaderInfo {
    pub fn new(name: impl Into<String>, layout: Vec<DescriptorType>) -> Self {
        Self {
            name: name.into(),
            layout,
            wgsl: None,
        }
    }

    pub fn with_wgsl(mut self, source: impl Into<String>) -> Self {
        self.wgsl = Some(source.into());
        self
    }
}

/// A specialization constant value. Float values are stored as raw bits so
/// the whole list can be hashed as a pipeline cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecConstant {
    U32(u32),
    I32(i32),
    F32Bits(u32),
    Bool(bool),
}

impl SpecConstant {
    pub fn f32(v: f32) -> Self {
        SpecConstant::F32Bits(v.to_bits())
    }

    /// Widens the constant for devices that take override values as f64.
    pub fn as_f64(&self) -> f64 {
        match *self {
            SpecConstant::U32(v) => v as f64,
            SpecConstant::I32(v) => v as f64,
            SpecConstant::F32Bits(bits) => f32::from_bits(bits) as f64,
            SpecConstant::Bool(v) => v as u32 as f64,
        }
    }
}

/// Uniquely identifies a compute pipeline to create: the pipeline layout,
/// the shader module, and the full specialization constant list. The first
/// three constants are always the local workgroup dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineDescriptor {
    pub pipeline_layout: PipelineLayoutHandle,
    pub shader_module: ShaderModuleHandle,
    pub spec_constants: Vec<SpecConstant>,
}

/// Pipeline stages a barrier can separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Transfer,
    Compute,
}

/// Memory access direction for a barrier entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccess {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMemoryBarrier {
    pub buffer: BufferHandle,
    pub src_access: MemoryAccess,
    pub dst_access: MemoryAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMemoryBarrier {
    pub image: ImageHandle,
    pub src_access: MemoryAccess,
    pub dst_access: MemoryAccess,
}

/// A set of memory barriers between two pipeline stages. An empty barrier is
/// legal and records nothing on the device, but still advances the command
/// buffer state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineBarrier {
    pub src_stage: PipelineStage,
    pub dst_stage: PipelineStage,
    pub buffers: Vec<BufferMemoryBarrier>,
    pub images: Vec<ImageMemoryBarrier>,
}

impl PipelineBarrier {
    pub fn new(src_stage: PipelineStage, dst_stage: PipelineStage) -> Self {
        Self {
            src_stage,
            dst_stage,
            buffers: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }
}

/// A resource bound into a descriptor set slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceBinding {
    Buffer(BufferHandle),
    Image(ImageHandle),
}

/// Builds the canonical specialization constant list for a pipeline: the
/// three local workgroup dimensions followed by shader-specific entries.
pub fn build_spec_constants(
    local_wg_size: WorkgroupSize,
    extra: &[SpecConstant],
) -> Vec<SpecConstant> {
    let mut constants = Vec::with_capacity(3 + extra.len());
    constants.push(SpecConstant::U32(local_wg_size[0]));
    constants.push(SpecConstant::U32(local_wg_size[1]));
    constants.push(SpecConstant::U32(local_wg_size[2]));
    constants.extend_from_slice(extra);
    constants
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_constants_prefixed_with_local_wg_size() {
        let constants = build_spec_constants(
            WorkgroupSize::new(16, 4, 1),
            &[SpecConstant::I32(-3), SpecConstant::f32(0.5)],
        );
        assert_eq!(constants.len(), 5);
        assert_eq!(constants[0], SpecConstant::U32(16));
        assert_eq!(constants[1], SpecConstant::U32(4));
        assert_eq!(constants[2], SpecConstant::U32(1));
        assert_eq!(constants[3], SpecConstant::I32(-3));
        assert_eq!(constants[4], SpecConstant::F32Bits(0.5f32.to_bits()));
    }

    #[test]
    fn test_descriptor_counts_accumulate() {
        let mut counts = DescriptorCounts::default();
        counts.add(DescriptorType::UniformBuffer);
        counts.add(DescriptorType::StorageBuffer);
        counts.add(DescriptorType::StorageBuffer);
        counts.add(DescriptorType::StorageImage);
        assert_eq!(counts.uniform_buffer_count, 1);
        assert_eq!(counts.storage_buffer_count, 2);
        assert_eq!(counts.combined_sampler_count, 0);
        assert_eq!(counts.storage_image_count, 1);
    }
}
