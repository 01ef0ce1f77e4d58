//! A driverless software implementation of [`ComputeDevice`].
//!
//! The virtual device hands out monotonically increasing handle ids, keeps
//! buffer contents in host memory, records every command into a per-buffer
//! stream, and executes transfer commands when a command buffer is
//! submitted. Dispatches and blits are recorded but perform no arithmetic.
//! Tests use the recorded submission history to assert ordering properties
//! that a real driver would enforce in hardware.

use std::collections::HashMap;
use std::sync::Mutex;

use super::device::ComputeDevice;
use super::errors::{DeviceError, DeviceResult};
use super::types::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorCounts, DescriptorSetHandle,
    DescriptorType, FenceHandle, ImageHandle, MemoryHandle, PipelineBarrier, PipelineDescriptor,
    PipelineHandle, PipelineLayoutHandle, QueryPoolHandle, ResourceBinding, SemaphoreHandle,
    ShaderInfo, ShaderLayoutHandle, ShaderModuleHandle,
};

/// One command recorded into a virtual command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BindPipeline(PipelineHandle),
    BindDescriptorSet(PipelineLayoutHandle, DescriptorSetHandle),
    PushConstants(Vec<u8>),
    Barrier {
        buffer_count: usize,
        image_count: usize,
    },
    Dispatch([u32; 3]),
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        nbytes: usize,
    },
    BlitImage {
        src: ImageHandle,
        dst: ImageHandle,
    },
    WriteTimestamp {
        query: u32,
    },
    ResetQueryPool {
        first_query: u32,
        query_count: u32,
    },
}

/// One queue submission as seen by the virtual device.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
    pub cmd: CommandBufferHandle,
    pub wait_semaphore: Option<SemaphoreHandle>,
    pub signal_semaphore: Option<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
    pub commands: Vec<RecordedCommand>,
}

#[derive(Debug)]
enum BufferBacking {
    Owned(Vec<u8>),
    Memory(MemoryHandle),
    Unbound,
}

#[derive(Debug)]
struct BufferState {
    nbytes: usize,
    backing: BufferBacking,
}

#[derive(Debug, Default)]
struct CommandBufferState {
    recording: bool,
    ended: bool,
    commands: Vec<RecordedCommand>,
}

#[derive(Default)]
struct DeviceState {
    next_handle: u64,
    buffers: HashMap<u64, BufferState>,
    images: HashMap<u64, [u32; 3]>,
    memories: HashMap<u64, Vec<u8>>,
    command_pools: HashMap<u64, Vec<CommandBufferHandle>>,
    command_buffers: HashMap<u64, CommandBufferState>,
    semaphores: HashMap<u64, ()>,
    fences: HashMap<u64, bool>,
    descriptor_pool: Option<DescriptorCounts>,
    descriptor_sets: HashMap<u64, Vec<(u32, DescriptorType, ResourceBinding)>>,
    shader_layouts: HashMap<u64, Vec<DescriptorType>>,
    pipeline_layouts: HashMap<u64, (ShaderLayoutHandle, u32)>,
    shader_modules: HashMap<u64, String>,
    pipelines: HashMap<u64, PipelineDescriptor>,
    query_pools: HashMap<u64, u32>,
    submissions: Vec<SubmissionRecord>,
}

impl DeviceState {
    fn fresh_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn buffer(&self, handle: BufferHandle, operation: &'static str) -> DeviceResult<&BufferState> {
        self.buffers.get(&handle.0).ok_or(DeviceError::InvalidHandle {
            kind: "buffer",
            handle: handle.0,
            operation,
        })
    }

    fn cmd_state(
        &mut self,
        cmd: CommandBufferHandle,
        operation: &'static str,
    ) -> DeviceResult<&mut CommandBufferState> {
        self.command_buffers
            .get_mut(&cmd.0)
            .ok_or(DeviceError::InvalidHandle {
                kind: "command buffer",
                handle: cmd.0,
                operation,
            })
    }

    fn record(
        &mut self,
        cmd: CommandBufferHandle,
        operation: &'static str,
        command: RecordedCommand,
    ) -> DeviceResult<()> {
        let state = self.cmd_state(cmd, operation)?;
        if !state.recording {
            return Err(DeviceError::NotRecording { handle: cmd.0 });
        }
        state.commands.push(command);
        Ok(())
    }

    /// Resolves the byte store backing a buffer, following memory bindings.
    fn buffer_bytes(&mut self, handle: BufferHandle, operation: &'static str) -> DeviceResult<&mut Vec<u8>> {
        let backing = {
            let state = self.buffers.get(&handle.0).ok_or(DeviceError::InvalidHandle {
                kind: "buffer",
                handle: handle.0,
                operation,
            })?;
            match &state.backing {
                BufferBacking::Owned(_) => None,
                BufferBacking::Memory(memory) => Some(*memory),
                BufferBacking::Unbound => {
                    return Err(DeviceError::BufferNotBound { handle: handle.0 })
                }
            }
        };
        match backing {
            Some(memory) => self
                .memories
                .get_mut(&memory.0)
                .ok_or(DeviceError::InvalidHandle {
                    kind: "memory",
                    handle: memory.0,
                    operation,
                }),
            None => match &mut self.buffers.get_mut(&handle.0).unwrap().backing {
                BufferBacking::Owned(data) => Ok(data),
                _ => unreachable!(),
            },
        }
    }

    /// Executes the transfer commands of a submitted stream.
    fn execute_transfers(&mut self, commands: &[RecordedCommand]) -> DeviceResult<()> {
        for command in commands {
            if let RecordedCommand::CopyBuffer { src, dst, nbytes } = command {
                let data = {
                    let src_bytes = self.buffer_bytes(*src, "queue_submit")?;
                    if src_bytes.len() < *nbytes {
                        return Err(DeviceError::BufferAccessOutOfBounds {
                            handle: src.0,
                            offset: 0,
                            len: *nbytes,
                            size: src_bytes.len(),
                        });
                    }
                    src_bytes[..*nbytes].to_vec()
                };
                let dst_bytes = self.buffer_bytes(*dst, "queue_submit")?;
                if dst_bytes.len() < *nbytes {
                    return Err(DeviceError::BufferAccessOutOfBounds {
                        handle: dst.0,
                        offset: 0,
                        len: *nbytes,
                        size: dst_bytes.len(),
                    });
                }
                dst_bytes[..*nbytes].copy_from_slice(&data);
            }
        }
        Ok(())
    }
}

/// In-process software device. See the module docs.
#[derive(Default)]
pub struct VirtualDevice {
    state: Mutex<DeviceState>,
}

impl VirtualDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submission history, oldest first.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Number of compute pipelines created so far.
    pub fn pipeline_count(&self) -> usize {
        self.state.lock().unwrap().pipelines.len()
    }

    /// The descriptor pool configuration, if initialized.
    pub fn descriptor_pool_config(&self) -> Option<DescriptorCounts> {
        self.state.lock().unwrap().descriptor_pool
    }

    /// Copies out the current contents of a buffer, if it is backed.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.buffer_bytes(buffer, "buffer_contents").ok().map(|b| b.clone())
    }
}

impl ComputeDevice for VirtualDevice {
    fn name(&self) -> String {
        "virtual-device".to_string()
    }

    fn create_command_pool(&self) -> DeviceResult<CommandPoolHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.command_pools.insert(handle, Vec::new());
        Ok(CommandPoolHandle(handle))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(buffers) = state.command_pools.remove(&pool.0) {
            for cmd in buffers {
                state.command_buffers.remove(&cmd.0);
            }
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        count: u32,
    ) -> DeviceResult<Vec<CommandBufferHandle>> {
        let mut state = self.state.lock().unwrap();
        if !state.command_pools.contains_key(&pool.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "command pool",
                handle: pool.0,
                operation: "allocate_command_buffers",
            });
        }
        let mut handles = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let handle = state.fresh_handle();
            state
                .command_buffers
                .insert(handle, CommandBufferState::default());
            handles.push(CommandBufferHandle(handle));
        }
        state
            .command_pools
            .get_mut(&pool.0)
            .unwrap()
            .extend(handles.iter().copied());
        Ok(handles)
    }

    fn reset_command_pool(&self, pool: CommandPoolHandle) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        let buffers = state
            .command_pools
            .get(&pool.0)
            .ok_or(DeviceError::InvalidHandle {
                kind: "command pool",
                handle: pool.0,
                operation: "reset_command_pool",
            })?
            .clone();
        for cmd in buffers {
            if let Some(cmd_state) = state.command_buffers.get_mut(&cmd.0) {
                *cmd_state = CommandBufferState::default();
            }
        }
        Ok(())
    }

    fn create_semaphore(&self) -> DeviceResult<SemaphoreHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.semaphores.insert(handle, ());
        Ok(SemaphoreHandle(handle))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.state.lock().unwrap().semaphores.remove(&semaphore.0);
    }

    fn create_fence(&self) -> DeviceResult<FenceHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.fences.insert(handle, false);
        Ok(FenceHandle(handle))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.lock().unwrap().fences.remove(&fence.0);
    }

    fn wait_for_fence(&self, fence: FenceHandle) -> DeviceResult<()> {
        // Submissions complete synchronously, so a known fence never blocks.
        let state = self.state.lock().unwrap();
        if state.fences.contains_key(&fence.0) {
            Ok(())
        } else {
            Err(DeviceError::InvalidHandle {
                kind: "fence",
                handle: fence.0,
                operation: "wait_for_fence",
            })
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.fences.get_mut(&fence.0) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(DeviceError::InvalidHandle {
                kind: "fence",
                handle: fence.0,
                operation: "reset_fence",
            }),
        }
    }

    fn create_buffer(&self, nbytes: usize, _host_visible: bool) -> DeviceResult<BufferHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.buffers.insert(
            handle,
            BufferState {
                nbytes,
                backing: BufferBacking::Owned(vec![0u8; nbytes]),
            },
        );
        Ok(BufferHandle(handle))
    }

    fn create_unbound_buffer(&self, nbytes: usize) -> DeviceResult<BufferHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.buffers.insert(
            handle,
            BufferState {
                nbytes,
                backing: BufferBacking::Unbound,
            },
        );
        Ok(BufferHandle(handle))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.state.lock().unwrap().buffers.remove(&buffer.0);
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        let bytes = state.buffer_bytes(buffer, "write_buffer")?;
        if offset + data.len() > bytes.len() {
            return Err(DeviceError::BufferAccessOutOfBounds {
                handle: buffer.0,
                offset,
                len: data.len(),
                size: bytes.len(),
            });
        }
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: BufferHandle,
        offset: usize,
        out: &mut [u8],
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        let bytes = state.buffer_bytes(buffer, "read_buffer")?;
        if offset + out.len() > bytes.len() {
            return Err(DeviceError::BufferAccessOutOfBounds {
                handle: buffer.0,
                offset,
                len: out.len(),
                size: bytes.len(),
            });
        }
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn create_image(&self, extents: [u32; 3], _bound: bool) -> DeviceResult<ImageHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.images.insert(handle, extents);
        Ok(ImageHandle(handle))
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.state.lock().unwrap().images.remove(&image.0);
    }

    fn allocate_memory(&self, nbytes: usize) -> DeviceResult<MemoryHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.memories.insert(handle, vec![0u8; nbytes]);
        Ok(MemoryHandle(handle))
    }

    fn free_memory(&self, memory: MemoryHandle) {
        self.state.lock().unwrap().memories.remove(&memory.0);
    }

    fn bind_buffer_memory(&self, buffer: BufferHandle, memory: MemoryHandle) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        let region_size = state
            .memories
            .get(&memory.0)
            .map(|region| region.len())
            .ok_or(DeviceError::InvalidHandle {
                kind: "memory",
                handle: memory.0,
                operation: "bind_buffer_memory",
            })?;
        let buffer_state =
            state
                .buffers
                .get_mut(&buffer.0)
                .ok_or(DeviceError::InvalidHandle {
                    kind: "buffer",
                    handle: buffer.0,
                    operation: "bind_buffer_memory",
                })?;
        if buffer_state.nbytes > region_size {
            return Err(DeviceError::BufferAccessOutOfBounds {
                handle: buffer.0,
                offset: 0,
                len: buffer_state.nbytes,
                size: region_size,
            });
        }
        buffer_state.backing = BufferBacking::Memory(memory);
        Ok(())
    }

    fn bind_image_memory(&self, image: ImageHandle, memory: MemoryHandle) -> DeviceResult<()> {
        let state = self.state.lock().unwrap();
        if !state.images.contains_key(&image.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "image",
                handle: image.0,
                operation: "bind_image_memory",
            });
        }
        if !state.memories.contains_key(&memory.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "memory",
                handle: memory.0,
                operation: "bind_image_memory",
            });
        }
        Ok(())
    }

    fn init_descriptor_pool(&self, config: &DescriptorCounts) -> DeviceResult<()> {
        self.state.lock().unwrap().descriptor_pool = Some(*config);
        Ok(())
    }

    fn reset_descriptor_pool(&self) -> DeviceResult<()> {
        self.state.lock().unwrap().descriptor_sets.clear();
        Ok(())
    }

    fn create_shader_layout(
        &self,
        bindings: &[DescriptorType],
    ) -> DeviceResult<ShaderLayoutHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.shader_layouts.insert(handle, bindings.to_vec());
        Ok(ShaderLayoutHandle(handle))
    }

    fn create_pipeline_layout(
        &self,
        shader_layout: ShaderLayoutHandle,
        push_constant_size: u32,
    ) -> DeviceResult<PipelineLayoutHandle> {
        let mut state = self.state.lock().unwrap();
        if !state.shader_layouts.contains_key(&shader_layout.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "shader layout",
                handle: shader_layout.0,
                operation: "create_pipeline_layout",
            });
        }
        let handle = state.fresh_handle();
        state
            .pipeline_layouts
            .insert(handle, (shader_layout, push_constant_size));
        Ok(PipelineLayoutHandle(handle))
    }

    fn create_shader_module(&self, shader: &ShaderInfo) -> DeviceResult<ShaderModuleHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.shader_modules.insert(handle, shader.name.clone());
        Ok(ShaderModuleHandle(handle))
    }

    fn create_compute_pipelines(
        &self,
        descriptors: &[PipelineDescriptor],
    ) -> DeviceResult<Vec<PipelineHandle>> {
        let mut state = self.state.lock().unwrap();
        let mut handles = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let handle = state.fresh_handle();
            state.pipelines.insert(handle, descriptor.clone());
            handles.push(PipelineHandle(handle));
        }
        Ok(handles)
    }

    fn allocate_descriptor_set(
        &self,
        layout: ShaderLayoutHandle,
    ) -> DeviceResult<DescriptorSetHandle> {
        let mut state = self.state.lock().unwrap();
        if state.descriptor_pool.is_none() {
            return Err(DeviceError::DescriptorPoolNotInitialized);
        }
        if !state.shader_layouts.contains_key(&layout.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "shader layout",
                handle: layout.0,
                operation: "allocate_descriptor_set",
            });
        }
        let handle = state.fresh_handle();
        state.descriptor_sets.insert(handle, Vec::new());
        Ok(DescriptorSetHandle(handle))
    }

    fn update_descriptor_set(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        ty: DescriptorType,
        resource: ResourceBinding,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        let bindings = state
            .descriptor_sets
            .get_mut(&set.0)
            .ok_or(DeviceError::InvalidHandle {
                kind: "descriptor set",
                handle: set.0,
                operation: "update_descriptor_set",
            })?;
        bindings.push((binding, ty, resource));
        Ok(())
    }

    fn create_query_pool(&self, query_count: u32) -> DeviceResult<QueryPoolHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.query_pools.insert(handle, query_count);
        Ok(QueryPoolHandle(handle))
    }

    fn destroy_query_pool(&self, pool: QueryPoolHandle) {
        self.state.lock().unwrap().query_pools.remove(&pool.0);
    }

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        let cmd_state = state.cmd_state(cmd, "begin_command_buffer")?;
        cmd_state.recording = true;
        cmd_state.ended = false;
        cmd_state.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        let cmd_state = state.cmd_state(cmd, "end_command_buffer")?;
        cmd_state.recording = false;
        cmd_state.ended = true;
        Ok(())
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.pipelines.contains_key(&pipeline.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "pipeline",
                handle: pipeline.0,
                operation: "cmd_bind_pipeline",
            });
        }
        state.record(cmd, "cmd_bind_pipeline", RecordedCommand::BindPipeline(pipeline))
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(
            cmd,
            "cmd_bind_descriptor_set",
            RecordedCommand::BindDescriptorSet(layout, set),
        )
    }

    fn cmd_push_constants(
        &self,
        cmd: CommandBufferHandle,
        _layout: PipelineLayoutHandle,
        data: &[u8],
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(
            cmd,
            "cmd_push_constants",
            RecordedCommand::PushConstants(data.to_vec()),
        )
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: CommandBufferHandle,
        barrier: &PipelineBarrier,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(
            cmd,
            "cmd_pipeline_barrier",
            RecordedCommand::Barrier {
                buffer_count: barrier.buffers.len(),
                image_count: barrier.images.len(),
            },
        )
    }

    fn cmd_dispatch(&self, cmd: CommandBufferHandle, group_counts: [u32; 3]) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(cmd, "cmd_dispatch", RecordedCommand::Dispatch(group_counts))
    }

    fn cmd_copy_buffer(
        &self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        nbytes: usize,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.buffer(src, "cmd_copy_buffer")?;
        state.buffer(dst, "cmd_copy_buffer")?;
        state.record(
            cmd,
            "cmd_copy_buffer",
            RecordedCommand::CopyBuffer { src, dst, nbytes },
        )
    }

    fn cmd_blit_image(
        &self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(cmd, "cmd_blit_image", RecordedCommand::BlitImage { src, dst })
    }

    fn cmd_write_timestamp(
        &self,
        cmd: CommandBufferHandle,
        pool: QueryPoolHandle,
        query: u32,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.query_pools.contains_key(&pool.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "query pool",
                handle: pool.0,
                operation: "cmd_write_timestamp",
            });
        }
        state.record(cmd, "cmd_write_timestamp", RecordedCommand::WriteTimestamp { query })
    }

    fn cmd_reset_query_pool(
        &self,
        cmd: CommandBufferHandle,
        pool: QueryPoolHandle,
        first_query: u32,
        query_count: u32,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.query_pools.contains_key(&pool.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "query pool",
                handle: pool.0,
                operation: "cmd_reset_query_pool",
            });
        }
        state.record(
            cmd,
            "cmd_reset_query_pool",
            RecordedCommand::ResetQueryPool {
                first_query,
                query_count,
            },
        )
    }

    fn queue_submit(
        &self,
        cmd: CommandBufferHandle,
        wait_semaphore: Option<SemaphoreHandle>,
        signal_semaphore: Option<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        let commands = {
            let cmd_state = state.cmd_state(cmd, "queue_submit")?;
            if !cmd_state.ended {
                return Err(DeviceError::SubmissionFailed {
                    message: format!("command buffer {} was not ended", cmd.0),
                });
            }
            cmd_state.commands.clone()
        };
        state.execute_transfers(&commands)?;
        if let Some(fence) = fence {
            if let Some(signaled) = state.fences.get_mut(&fence.0) {
                *signaled = true;
            }
        }
        state.submissions.push(SubmissionRecord {
            cmd,
            wait_semaphore,
            signal_semaphore,
            fence,
            commands,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let device = VirtualDevice::new();
        let a = device.create_buffer(16, false).unwrap();
        let b = device.create_buffer(16, false).unwrap();
        let sem = device.create_semaphore().unwrap();
        assert_ne!(a, b);
        assert_ne!(a.0, sem.0);
    }

    #[test]
    fn test_buffer_write_read_roundtrip() {
        let device = VirtualDevice::new();
        let buffer = device.create_buffer(8, true).unwrap();
        device.write_buffer(buffer, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut out = [0u8; 8];
        device.read_buffer(buffer, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_buffer_access_bounds_checked() {
        let device = VirtualDevice::new();
        let buffer = device.create_buffer(4, true).unwrap();
        let result = device.write_buffer(buffer, 2, &[0u8; 4]);
        assert!(matches!(
            result,
            Err(DeviceError::BufferAccessOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_unbound_buffer_rejects_io_until_bound() {
        let device = VirtualDevice::new();
        let buffer = device.create_unbound_buffer(16).unwrap();
        let result = device.write_buffer(buffer, 0, &[0u8; 4]);
        assert!(matches!(result, Err(DeviceError::BufferNotBound { .. })));

        let memory = device.allocate_memory(16).unwrap();
        device.bind_buffer_memory(buffer, memory).unwrap();
        device.write_buffer(buffer, 0, &[9u8; 4]).unwrap();
    }

    #[test]
    fn test_aliased_buffers_share_memory() {
        let device = VirtualDevice::new();
        let memory = device.allocate_memory(8).unwrap();
        let a = device.create_unbound_buffer(8).unwrap();
        let b = device.create_unbound_buffer(8).unwrap();
        device.bind_buffer_memory(a, memory).unwrap();
        device.bind_buffer_memory(b, memory).unwrap();

        device.write_buffer(a, 0, &[7u8; 8]).unwrap();
        let mut out = [0u8; 8];
        device.read_buffer(b, 0, &mut out).unwrap();
        assert_eq!(out, [7u8; 8]);
    }

    #[test]
    fn test_submit_executes_copies_and_records_history() {
        let device = VirtualDevice::new();
        let src = device.create_buffer(4, true).unwrap();
        let dst = device.create_buffer(4, true).unwrap();
        device.write_buffer(src, 0, &[0xAB; 4]).unwrap();

        let pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffers(pool, 1).unwrap()[0];
        device.begin_command_buffer(cmd).unwrap();
        device.cmd_copy_buffer(cmd, src, dst, 4).unwrap();
        device.end_command_buffer(cmd).unwrap();

        let fence = device.create_fence().unwrap();
        device.queue_submit(cmd, None, None, Some(fence)).unwrap();
        device.wait_for_fence(fence).unwrap();

        let mut out = [0u8; 4];
        device.read_buffer(dst, 0, &mut out).unwrap();
        assert_eq!(out, [0xAB; 4]);

        let submissions = device.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].fence, Some(fence));
        assert_eq!(submissions[0].commands.len(), 1);
    }

    #[test]
    fn test_submit_requires_ended_buffer() {
        let device = VirtualDevice::new();
        let pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffers(pool, 1).unwrap()[0];
        device.begin_command_buffer(cmd).unwrap();
        let result = device.queue_submit(cmd, None, None, None);
        assert!(matches!(result, Err(DeviceError::SubmissionFailed { .. })));
    }

    #[test]
    fn test_descriptor_set_requires_pool_init() {
        let device = VirtualDevice::new();
        let layout = device
            .create_shader_layout(&[DescriptorType::StorageBuffer])
            .unwrap();
        assert!(matches!(
            device.allocate_descriptor_set(layout),
            Err(DeviceError::DescriptorPoolNotInitialized)
        ));

        device
            .init_descriptor_pool(&DescriptorCounts {
                max_sets: 4,
                uniform_buffer_count: 4,
                storage_buffer_count: 4,
                combined_sampler_count: 4,
                storage_image_count: 4,
            })
            .unwrap();
        assert!(device.allocate_descriptor_set(layout).is_ok());
    }
}
