//! Command buffer recording and pooling.
//!
//! A [`CommandBuffer`] wraps a device command buffer handle and enforces a
//! strict recording state machine: pipeline binding, descriptor binding,
//! barrier insertion, and dispatch must happen in order, and submission is
//! only possible from a fully recorded buffer. The [`CommandPool`] recycles
//! command buffers and their signal semaphores under a mutex.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::errors::{GraphError, Result};
use crate::utils::{div_up, WorkgroupSize};

use super::device::ComputeDevice;
use super::types::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorSetHandle, ImageHandle,
    PipelineBarrier, PipelineHandle, PipelineLayoutHandle, QueryPoolHandle, SemaphoreHandle,
};

/// Recording lifecycle of a command buffer. Most operations require a
/// specific source state and move the buffer to a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    New,
    Recording,
    PipelineBound,
    DescriptorsBound,
    BarriersInserted,
    Ready,
    Submitted,
    Invalid,
}

#[derive(Debug, Clone, Copy, Default)]
struct BoundState {
    pipeline: Option<PipelineHandle>,
    pipeline_layout: Option<PipelineLayoutHandle>,
    descriptors: Option<DescriptorSetHandle>,
    local_workgroup_size: WorkgroupSize,
}

/// A single command buffer with its signal semaphore.
///
/// The semaphore is owned by the pool and persists across recycles; it is
/// signaled whenever a submission of this buffer completes.
pub struct CommandBuffer {
    device: Arc<dyn ComputeDevice>,
    handle: Option<CommandBufferHandle>,
    signal_semaphore: SemaphoreHandle,
    reusable: bool,
    state: CommandBufferState,
    bound: BoundState,
}

impl CommandBuffer {
    pub(crate) fn new(
        device: Arc<dyn ComputeDevice>,
        handle: CommandBufferHandle,
        signal_semaphore: SemaphoreHandle,
        reusable: bool,
    ) -> Self {
        Self {
            device,
            handle: Some(handle),
            signal_semaphore,
            reusable,
            state: CommandBufferState::New,
            bound: BoundState::default(),
        }
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Whether this buffer still wraps a live device handle.
    pub fn is_valid(&self) -> bool {
        self.handle.is_some()
    }

    /// The semaphore signaled when a submission of this buffer retires.
    pub fn signal_semaphore(&self) -> SemaphoreHandle {
        self.signal_semaphore
    }

    fn require_state(
        &self,
        allowed: &[CommandBufferState],
        operation: &'static str,
    ) -> Result<CommandBufferHandle> {
        if !allowed.contains(&self.state) {
            return Err(GraphError::InvalidCommandBufferState {
                operation,
                state: self.state,
            });
        }
        self.handle.ok_or(GraphError::InvalidCommandBufferState {
            operation,
            state: CommandBufferState::Invalid,
        })
    }

    pub fn begin(&mut self) -> Result<()> {
        let handle = self.require_state(&[CommandBufferState::New], "begin")?;
        self.device.begin_command_buffer(handle)?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Finishes recording. Calling `end` on a SUBMITTED reusable buffer is a
    /// pure state transition; the device recording was already closed.
    pub fn end(&mut self) -> Result<()> {
        let handle = self.require_state(
            &[CommandBufferState::Recording, CommandBufferState::Submitted],
            "end",
        )?;
        if self.state == CommandBufferState::Recording {
            self.device.end_command_buffer(handle)?;
        }
        self.state = CommandBufferState::Ready;
        Ok(())
    }

    /// Binds a compute pipeline. The device call is elided when the pipeline
    /// is already bound, but the local workgroup size is always refreshed.
    pub fn bind_pipeline(
        &mut self,
        pipeline: PipelineHandle,
        pipeline_layout: PipelineLayoutHandle,
        local_workgroup_size: WorkgroupSize,
    ) -> Result<()> {
        let handle = self.require_state(&[CommandBufferState::Recording], "bind_pipeline")?;
        if self.bound.pipeline != Some(pipeline) {
            self.device.cmd_bind_pipeline(handle, pipeline)?;
            self.bound.pipeline = Some(pipeline);
        }
        self.bound.pipeline_layout = Some(pipeline_layout);
        self.bound.local_workgroup_size = local_workgroup_size;
        self.state = CommandBufferState::PipelineBound;
        Ok(())
    }

    /// Binds a descriptor set against the currently bound pipeline layout.
    /// Elided when the same set is already bound.
    pub fn bind_descriptors(&mut self, descriptors: DescriptorSetHandle) -> Result<()> {
        let handle =
            self.require_state(&[CommandBufferState::PipelineBound], "bind_descriptors")?;
        if self.bound.descriptors != Some(descriptors) {
            let layout = self
                .bound
                .pipeline_layout
                .expect("pipeline layout recorded at bind_pipeline");
            self.device.cmd_bind_descriptor_set(handle, layout, descriptors)?;
        }
        self.bound.descriptors = Some(descriptors);
        self.state = CommandBufferState::DescriptorsBound;
        Ok(())
    }

    /// Records push constants. A no-op for empty data; legal in any
    /// recording state and does not advance the state machine.
    pub fn set_push_constants(
        &mut self,
        pipeline_layout: PipelineLayoutHandle,
        data: &[u8],
    ) -> Result<()> {
        let handle = self.require_state(
            &[
                CommandBufferState::Recording,
                CommandBufferState::PipelineBound,
                CommandBufferState::DescriptorsBound,
                CommandBufferState::BarriersInserted,
            ],
            "set_push_constants",
        )?;
        if data.is_empty() {
            return Ok(());
        }
        self.device.cmd_push_constants(handle, pipeline_layout, data)?;
        Ok(())
    }

    pub fn insert_barrier(&mut self, barrier: &PipelineBarrier) -> Result<()> {
        let handle = self.require_state(
            &[
                CommandBufferState::DescriptorsBound,
                CommandBufferState::Recording,
            ],
            "insert_barrier",
        )?;
        if !barrier.is_empty() {
            self.device.cmd_pipeline_barrier(handle, barrier)?;
        }
        self.state = CommandBufferState::BarriersInserted;
        Ok(())
    }

    /// Dispatches `ceil(global / local)` workgroups per axis, using the
    /// local size recorded at the last `bind_pipeline`.
    pub fn dispatch(&mut self, global_workgroup_size: WorkgroupSize) -> Result<()> {
        let handle = self.require_state(&[CommandBufferState::BarriersInserted], "dispatch")?;
        let local = self.bound.local_workgroup_size;
        let group_counts = [
            div_up(global_workgroup_size[0], local[0]),
            div_up(global_workgroup_size[1], local[1]),
            div_up(global_workgroup_size[2], local[2]),
        ];
        self.device.cmd_dispatch(handle, group_counts)?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Full-image nearest-filter blit between two images.
    pub fn blit(&mut self, src: ImageHandle, dst: ImageHandle) -> Result<()> {
        let handle = self.require_state(&[CommandBufferState::BarriersInserted], "blit")?;
        self.device.cmd_blit_image(handle, src, dst)?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Byte copy between two buffers. Follows the same barrier discipline as
    /// `blit`.
    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        dst: BufferHandle,
        nbytes: usize,
    ) -> Result<()> {
        let handle = self.require_state(&[CommandBufferState::BarriersInserted], "copy_buffer")?;
        self.device.cmd_copy_buffer(handle, src, dst, nbytes)?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    pub fn write_timestamp(&mut self, querypool: QueryPoolHandle, query: u32) -> Result<()> {
        let handle = self.require_state(&[CommandBufferState::Recording], "write_timestamp")?;
        self.device.cmd_write_timestamp(handle, querypool, query)?;
        Ok(())
    }

    pub fn reset_querypool(
        &mut self,
        querypool: QueryPoolHandle,
        first_query: u32,
        query_count: u32,
    ) -> Result<()> {
        let handle = self.require_state(&[CommandBufferState::Recording], "reset_querypool")?;
        self.device
            .cmd_reset_query_pool(handle, querypool, first_query, query_count)?;
        Ok(())
    }

    /// Hands out the device handle for submission. Non-reusable buffers, and
    /// reusable buffers on their final use, are invalidated so the handle
    /// cannot be submitted again after the caller's submission.
    pub fn get_submit_handle(&mut self, final_use: bool) -> Result<CommandBufferHandle> {
        let handle = self.require_state(&[CommandBufferState::Ready], "get_submit_handle")?;
        if !self.reusable || final_use {
            self.handle = None;
            self.bound = BoundState::default();
        }
        self.state = CommandBufferState::Submitted;
        Ok(handle)
    }

    /// Drops the device handle without submitting.
    pub(crate) fn invalidate(&mut self) {
        self.handle = None;
        self.bound = BoundState::default();
        self.state = CommandBufferState::Invalid;
    }
}

/// Configuration for the command pool's allocation behavior.
#[derive(Debug, Clone, Copy)]
pub struct CommandPoolConfig {
    /// Command buffers allocated up front.
    pub initial_size: u32,
    /// Command buffers allocated per growth batch.
    pub batch_size: u32,
}

impl Default for CommandPoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 32,
            batch_size: 8,
        }
    }
}

struct PoolInner {
    buffers: Vec<CommandBufferHandle>,
    semaphores: Vec<SemaphoreHandle>,
    in_use: usize,
}

/// Mutex-guarded pool of command buffers and their signal semaphores.
///
/// Each buffer slot keeps its semaphore across recycles, so a recycled
/// command buffer signals through the same semaphore as before.
pub struct CommandPool {
    device: Arc<dyn ComputeDevice>,
    pool: CommandPoolHandle,
    config: CommandPoolConfig,
    inner: Mutex<PoolInner>,
}

impl CommandPool {
    pub fn new(device: Arc<dyn ComputeDevice>, config: CommandPoolConfig) -> Result<Self> {
        let pool = device.create_command_pool()?;
        let command_pool = Self {
            device,
            pool,
            config,
            inner: Mutex::new(PoolInner {
                buffers: Vec::new(),
                semaphores: Vec::new(),
                in_use: 0,
            }),
        };
        {
            let mut inner = command_pool.inner.lock().unwrap();
            command_pool.allocate_new_batch(&mut inner, config.initial_size)?;
        }
        Ok(command_pool)
    }

    /// Returns the next free command buffer, growing the pool if needed.
    /// Non-reusable buffers are flagged for one-time submission.
    pub fn get_new_cmd(&self, reusable: bool) -> Result<CommandBuffer> {
        let mut inner = self.inner.lock().unwrap();
        self.allocate_new_batch(&mut inner, self.config.batch_size)?;

        let handle = inner.buffers[inner.in_use];
        let semaphore = inner.semaphores[inner.in_use];
        inner.in_use += 1;
        Ok(CommandBuffer::new(
            Arc::clone(&self.device),
            handle,
            semaphore,
            reusable,
        ))
    }

    /// Resets the underlying device pool and marks every buffer free.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.device.reset_command_pool(self.pool)?;
        inner.in_use = 0;
        Ok(())
    }

    fn allocate_new_batch(&self, inner: &mut PoolInner, count: u32) -> Result<()> {
        // No-op while free buffers remain.
        if inner.in_use < inner.buffers.len() {
            return Ok(());
        }
        let new_buffers = self.device.allocate_command_buffers(self.pool, count)?;
        for _ in 0..count {
            inner.semaphores.push(self.device.create_semaphore()?);
        }
        inner.buffers.extend(new_buffers);
        debug!(
            "command pool grew to {} buffers ({} in use)",
            inner.buffers.len(),
            inner.in_use
        );
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        let inner = self.inner.lock().unwrap();
        for &semaphore in &inner.semaphores {
            self.device.destroy_semaphore(semaphore);
        }
        self.device.destroy_command_pool(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::types::{DescriptorCounts, DescriptorType, PipelineDescriptor};
    use crate::gpu::VirtualDevice;

    fn test_device() -> Arc<VirtualDevice> {
        Arc::new(VirtualDevice::new())
    }

    fn test_pipeline(
        device: &Arc<VirtualDevice>,
    ) -> (PipelineHandle, PipelineLayoutHandle, DescriptorSetHandle) {
        device
            .init_descriptor_pool(&DescriptorCounts {
                max_sets: 8,
                uniform_buffer_count: 8,
                storage_buffer_count: 8,
                combined_sampler_count: 8,
                storage_image_count: 8,
            })
            .unwrap();
        let shader_layout = device
            .create_shader_layout(&[DescriptorType::StorageBuffer])
            .unwrap();
        let pipeline_layout = device.create_pipeline_layout(shader_layout, 0).unwrap();
        let module = device
            .create_shader_module(&crate::gpu::types::ShaderInfo::new(
                "noop",
                vec![DescriptorType::StorageBuffer],
            ))
            .unwrap();
        let pipeline = device
            .create_compute_pipelines(&[PipelineDescriptor {
                pipeline_layout,
                shader_module: module,
                spec_constants: vec![],
            }])
            .unwrap()[0];
        let set = device.allocate_descriptor_set(shader_layout).unwrap();
        (pipeline, pipeline_layout, set)
    }

    #[test]
    fn test_full_recording_sequence() {
        let device = test_device();
        let (pipeline, layout, set) = test_pipeline(&device);
        let pool = CommandPool::new(device.clone(), CommandPoolConfig::default()).unwrap();

        let mut cmd = pool.get_new_cmd(false).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::New);

        cmd.begin().unwrap();
        cmd.bind_pipeline(pipeline, layout, WorkgroupSize::new(8, 1, 1))
            .unwrap();
        cmd.bind_descriptors(set).unwrap();
        cmd.set_push_constants(layout, &[0u8; 8]).unwrap();
        cmd.insert_barrier(&PipelineBarrier::new(
            crate::gpu::types::PipelineStage::Compute,
            crate::gpu::types::PipelineStage::Compute,
        ))
        .unwrap();
        cmd.dispatch(WorkgroupSize::new(64, 1, 1)).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);

        cmd.end().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Ready);

        let handle = cmd.get_submit_handle(false).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Submitted);
        // Non-reusable buffer is invalidated after handing out its handle.
        assert!(!cmd.is_valid());
        device.queue_submit(handle, None, None, None).unwrap();
    }

    #[test]
    fn test_dispatch_uses_ceil_div_group_counts() {
        let device = test_device();
        let (pipeline, layout, set) = test_pipeline(&device);
        let pool = CommandPool::new(device.clone(), CommandPoolConfig::default()).unwrap();

        let mut cmd = pool.get_new_cmd(false).unwrap();
        cmd.begin().unwrap();
        cmd.bind_pipeline(pipeline, layout, WorkgroupSize::new(16, 4, 1))
            .unwrap();
        cmd.bind_descriptors(set).unwrap();
        cmd.insert_barrier(&PipelineBarrier::new(
            crate::gpu::types::PipelineStage::Compute,
            crate::gpu::types::PipelineStage::Compute,
        ))
        .unwrap();
        cmd.dispatch(WorkgroupSize::new(33, 8, 1)).unwrap();
        cmd.end().unwrap();
        let handle = cmd.get_submit_handle(false).unwrap();
        device.queue_submit(handle, None, None, None).unwrap();

        let submissions = device.submissions();
        let dispatch = submissions[0]
            .commands
            .iter()
            .find_map(|c| match c {
                crate::gpu::virtual_device::RecordedCommand::Dispatch(groups) => Some(*groups),
                _ => None,
            })
            .unwrap();
        assert_eq!(dispatch, [3, 2, 1]);
    }

    #[test]
    fn test_operations_rejected_from_wrong_state() {
        let device = test_device();
        let (pipeline, layout, set) = test_pipeline(&device);
        let pool = CommandPool::new(device.clone(), CommandPoolConfig::default()).unwrap();

        let mut cmd = pool.get_new_cmd(false).unwrap();

        // Everything except begin() is rejected from NEW.
        assert!(matches!(
            cmd.bind_pipeline(pipeline, layout, WorkgroupSize::default()),
            Err(GraphError::InvalidCommandBufferState {
                operation: "bind_pipeline",
                ..
            })
        ));
        assert!(matches!(
            cmd.dispatch(WorkgroupSize::default()),
            Err(GraphError::InvalidCommandBufferState { .. })
        ));
        assert!(matches!(
            cmd.end(),
            Err(GraphError::InvalidCommandBufferState { .. })
        ));

        cmd.begin().unwrap();
        // begin() twice is rejected.
        assert!(matches!(
            cmd.begin(),
            Err(GraphError::InvalidCommandBufferState {
                operation: "begin",
                ..
            })
        ));
        // Descriptors cannot be bound before a pipeline.
        assert!(matches!(
            cmd.bind_descriptors(set),
            Err(GraphError::InvalidCommandBufferState { .. })
        ));
        // Dispatch requires barriers to have been inserted.
        cmd.bind_pipeline(pipeline, layout, WorkgroupSize::default())
            .unwrap();
        assert!(matches!(
            cmd.dispatch(WorkgroupSize::default()),
            Err(GraphError::InvalidCommandBufferState { .. })
        ));
    }

    #[test]
    fn test_rebind_of_same_pipeline_is_elided() {
        let device = test_device();
        let (pipeline, layout, set) = test_pipeline(&device);
        let pool = CommandPool::new(device.clone(), CommandPoolConfig::default()).unwrap();

        let mut cmd = pool.get_new_cmd(false).unwrap();
        cmd.begin().unwrap();
        cmd.bind_pipeline(pipeline, layout, WorkgroupSize::new(8, 1, 1))
            .unwrap();
        cmd.bind_descriptors(set).unwrap();
        cmd.insert_barrier(&PipelineBarrier::new(
            crate::gpu::types::PipelineStage::Compute,
            crate::gpu::types::PipelineStage::Compute,
        ))
        .unwrap();
        cmd.dispatch(WorkgroupSize::new(8, 1, 1)).unwrap();

        // Rebinding the same pipeline and set must not emit device commands.
        cmd.bind_pipeline(pipeline, layout, WorkgroupSize::new(8, 1, 1))
            .unwrap();
        cmd.bind_descriptors(set).unwrap();
        cmd.insert_barrier(&PipelineBarrier::new(
            crate::gpu::types::PipelineStage::Compute,
            crate::gpu::types::PipelineStage::Compute,
        ))
        .unwrap();
        cmd.dispatch(WorkgroupSize::new(8, 1, 1)).unwrap();
        cmd.end().unwrap();
        let handle = cmd.get_submit_handle(false).unwrap();
        device.queue_submit(handle, None, None, None).unwrap();

        let submissions = device.submissions();
        let binds = submissions[0]
            .commands
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    crate::gpu::virtual_device::RecordedCommand::BindPipeline(_)
                        | crate::gpu::virtual_device::RecordedCommand::BindDescriptorSet(_, _)
                )
            })
            .count();
        assert_eq!(binds, 2);
    }

    #[test]
    fn test_reusable_buffer_survives_resubmission() {
        let device = test_device();
        let pool = CommandPool::new(device.clone(), CommandPoolConfig::default()).unwrap();

        let mut cmd = pool.get_new_cmd(true).unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();

        let first = cmd.get_submit_handle(false).unwrap();
        assert!(cmd.is_valid());
        device.queue_submit(first, None, None, None).unwrap();

        // SUBMITTED -> READY -> SUBMITTED again.
        cmd.end().unwrap();
        let second = cmd.get_submit_handle(false).unwrap();
        assert_eq!(first, second);

        // final_use invalidates even a reusable buffer.
        cmd.end().unwrap();
        cmd.get_submit_handle(true).unwrap();
        assert!(!cmd.is_valid());
        assert!(matches!(
            cmd.end().and_then(|_| cmd.get_submit_handle(false).map(|_| ())),
            Err(GraphError::InvalidCommandBufferState { .. })
        ));
    }

    #[test]
    fn test_blit_and_query_ops_follow_state_machine() {
        let device = test_device();
        let pool = CommandPool::new(device.clone(), CommandPoolConfig::default()).unwrap();
        let src = device.create_image([4, 4, 1], true).unwrap();
        let dst = device.create_image([8, 8, 1], true).unwrap();
        let querypool = device.create_query_pool(2).unwrap();

        let mut cmd = pool.get_new_cmd(false).unwrap();
        cmd.begin().unwrap();

        // Query ops are only legal while plainly recording.
        cmd.reset_querypool(querypool, 0, 2).unwrap();
        cmd.write_timestamp(querypool, 0).unwrap();

        // Blit requires barriers, like dispatch.
        assert!(matches!(
            cmd.blit(src, dst),
            Err(GraphError::InvalidCommandBufferState { .. })
        ));
        cmd.insert_barrier(&PipelineBarrier::new(
            crate::gpu::types::PipelineStage::Transfer,
            crate::gpu::types::PipelineStage::Transfer,
        ))
        .unwrap();
        cmd.blit(src, dst).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);

        cmd.write_timestamp(querypool, 1).unwrap();
        cmd.end().unwrap();
    }

    #[test]
    fn test_pool_grows_in_batches_and_flush_recycles() {
        let device = test_device();
        let pool = CommandPool::new(
            device.clone(),
            CommandPoolConfig {
                initial_size: 2,
                batch_size: 2,
            },
        )
        .unwrap();

        let a = pool.get_new_cmd(false).unwrap();
        let b = pool.get_new_cmd(false).unwrap();
        let c = pool.get_new_cmd(false).unwrap();
        let handles: Vec<_> = [&a, &b, &c]
            .iter()
            .map(|cmd| cmd.signal_semaphore())
            .collect();
        assert_eq!(handles.len(), 3);

        pool.flush().unwrap();
        let recycled = pool.get_new_cmd(false).unwrap();
        // The first slot's semaphore persists across the recycle.
        assert_eq!(recycled.signal_semaphore(), a.signal_semaphore());
    }
}
