//! The compute device interface.
//!
//! The runtime records and submits work through this trait and never talks
//! to a concrete GPU API directly. Device discovery, memory allocation
//! internals, and shader compilation all live behind it. Two implementations
//! are provided: [`VirtualDevice`](super::VirtualDevice), a driverless
//! software device used for deterministic testing, and
//! [`WgpuDevice`](super::WgpuDevice) for real buffer-storage execution.

use super::errors::DeviceResult;
use super::types::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorCounts, DescriptorSetHandle,
    DescriptorType, FenceHandle, ImageHandle, MemoryHandle, PipelineBarrier, PipelineDescriptor,
    PipelineHandle, PipelineLayoutHandle, QueryPoolHandle, ResourceBinding, SemaphoreHandle,
    ShaderInfo, ShaderLayoutHandle, ShaderModuleHandle,
};

/// Object-safe interface over a compute-capable GPU API.
///
/// All handle arguments must have been issued by the same device instance.
/// Implementations are internally synchronized; the runtime may call into
/// the device from the thread owning the graph and, for command pool
/// operations, from any thread.
pub trait ComputeDevice: Send + Sync {
    /// Human-readable device name.
    fn name(&self) -> String;

    // Command pools, synchronization primitives

    fn create_command_pool(&self) -> DeviceResult<CommandPoolHandle>;

    fn destroy_command_pool(&self, pool: CommandPoolHandle);

    /// Allocates `count` fresh command buffers from `pool`.
    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        count: u32,
    ) -> DeviceResult<Vec<CommandBufferHandle>>;

    /// Resets every command buffer allocated from `pool` back to its initial
    /// state so the handles can be reused.
    fn reset_command_pool(&self, pool: CommandPoolHandle) -> DeviceResult<()>;

    fn create_semaphore(&self) -> DeviceResult<SemaphoreHandle>;

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    fn create_fence(&self) -> DeviceResult<FenceHandle>;

    fn destroy_fence(&self, fence: FenceHandle);

    /// Blocks the calling thread until the fence is signaled.
    fn wait_for_fence(&self, fence: FenceHandle) -> DeviceResult<()>;

    /// Returns the fence to the unsignaled state.
    fn reset_fence(&self, fence: FenceHandle) -> DeviceResult<()>;

    // Resources

    /// Creates a buffer with its own memory allocation.
    fn create_buffer(&self, nbytes: usize, host_visible: bool) -> DeviceResult<BufferHandle>;

    /// Creates a buffer without backing memory; it must be bound to a
    /// [`MemoryHandle`] before first use.
    fn create_unbound_buffer(&self, nbytes: usize) -> DeviceResult<BufferHandle>;

    fn destroy_buffer(&self, buffer: BufferHandle);

    fn write_buffer(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> DeviceResult<()>;

    fn read_buffer(&self, buffer: BufferHandle, offset: usize, out: &mut [u8])
        -> DeviceResult<()>;

    /// Creates a 3D image with its own memory allocation when `bound` is
    /// true, or an unbound image otherwise.
    fn create_image(&self, extents: [u32; 3], bound: bool) -> DeviceResult<ImageHandle>;

    fn destroy_image(&self, image: ImageHandle);

    /// Allocates a raw memory region that buffers and images can alias.
    fn allocate_memory(&self, nbytes: usize) -> DeviceResult<MemoryHandle>;

    fn free_memory(&self, memory: MemoryHandle);

    fn bind_buffer_memory(&self, buffer: BufferHandle, memory: MemoryHandle) -> DeviceResult<()>;

    fn bind_image_memory(&self, image: ImageHandle, memory: MemoryHandle) -> DeviceResult<()>;

    // Descriptors and pipelines

    /// Initializes the device descriptor pool with aggregated demand. Called
    /// at most once per device.
    fn init_descriptor_pool(&self, config: &DescriptorCounts) -> DeviceResult<()>;

    /// Releases all descriptor sets allocated from the pool.
    fn reset_descriptor_pool(&self) -> DeviceResult<()>;

    /// Returns a layout for the given binding list. Idempotent per layout.
    fn create_shader_layout(
        &self,
        bindings: &[DescriptorType],
    ) -> DeviceResult<ShaderLayoutHandle>;

    fn create_pipeline_layout(
        &self,
        shader_layout: ShaderLayoutHandle,
        push_constant_size: u32,
    ) -> DeviceResult<PipelineLayoutHandle>;

    fn create_shader_module(&self, shader: &ShaderInfo) -> DeviceResult<ShaderModuleHandle>;

    /// Creates all pipelines in one batch, in order.
    fn create_compute_pipelines(
        &self,
        descriptors: &[PipelineDescriptor],
    ) -> DeviceResult<Vec<PipelineHandle>>;

    fn allocate_descriptor_set(
        &self,
        layout: ShaderLayoutHandle,
    ) -> DeviceResult<DescriptorSetHandle>;

    fn update_descriptor_set(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        ty: DescriptorType,
        resource: ResourceBinding,
    ) -> DeviceResult<()>;

    // Query pools

    fn create_query_pool(&self, query_count: u32) -> DeviceResult<QueryPoolHandle>;

    fn destroy_query_pool(&self, pool: QueryPoolHandle);

    // Command recording

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> DeviceResult<()>;

    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> DeviceResult<()>;

    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
    ) -> DeviceResult<()>;

    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
    ) -> DeviceResult<()>;

    fn cmd_push_constants(
        &self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        data: &[u8],
    ) -> DeviceResult<()>;

    fn cmd_pipeline_barrier(
        &self,
        cmd: CommandBufferHandle,
        barrier: &PipelineBarrier,
    ) -> DeviceResult<()>;

    fn cmd_dispatch(&self, cmd: CommandBufferHandle, group_counts: [u32; 3]) -> DeviceResult<()>;

    fn cmd_copy_buffer(
        &self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        nbytes: usize,
    ) -> DeviceResult<()>;

    /// Full-image nearest-filter blit.
    fn cmd_blit_image(
        &self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
    ) -> DeviceResult<()>;

    fn cmd_write_timestamp(
        &self,
        cmd: CommandBufferHandle,
        pool: QueryPoolHandle,
        query: u32,
    ) -> DeviceResult<()>;

    fn cmd_reset_query_pool(
        &self,
        cmd: CommandBufferHandle,
        pool: QueryPoolHandle,
        first_query: u32,
        query_count: u32,
    ) -> DeviceResult<()>;

    // Submission

    /// Submits one command buffer to the device queue. `wait_semaphore` (if
    /// any) gates the start of execution, `signal_semaphore` is signaled on
    /// completion, and `fence` (if any) becomes host-waitable when the
    /// submission retires.
    fn queue_submit(
        &self,
        cmd: CommandBufferHandle,
        wait_semaphore: Option<SemaphoreHandle>,
        signal_semaphore: Option<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    ) -> DeviceResult<()>;
}
