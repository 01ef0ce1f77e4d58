//! A wgpu-backed implementation of [`ComputeDevice`] for buffer-storage
//! graphs.
//!
//! wgpu's queue executes submissions in order and synchronizes resource
//! access automatically, so semaphore chaining and pipeline barriers are
//! validated no-ops here, and a fence wait maps onto a blocking device
//! poll. Texture storage, blits, and timestamp queries are not supported;
//! graphs targeting this device should force buffer storage via
//! `GraphConfig::with_storage_type_override`.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Mutex;

use log::debug;
use pollster::FutureExt;

use super::device::ComputeDevice;
use super::errors::{DeviceError, DeviceResult};
use super::types::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorCounts, DescriptorSetHandle,
    DescriptorType, FenceHandle, ImageHandle, MemoryHandle, PipelineBarrier, PipelineDescriptor,
    PipelineHandle, PipelineLayoutHandle, QueryPoolHandle, ResourceBinding, SemaphoreHandle,
    ShaderInfo, ShaderLayoutHandle, ShaderModuleHandle,
};

#[derive(Debug, Clone)]
enum Recorded {
    BindPipeline(PipelineHandle),
    BindSet(DescriptorSetHandle),
    PushConstants(Vec<u8>),
    Dispatch([u32; 3]),
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        nbytes: usize,
    },
}

#[derive(Debug, Default)]
struct CmdState {
    recording: bool,
    ended: bool,
    commands: Vec<Recorded>,
}

struct DescSet {
    layout: ShaderLayoutHandle,
    bindings: Vec<(u32, BufferHandle)>,
}

#[derive(Default)]
struct WgpuState {
    next_handle: u64,
    buffers: HashMap<u64, wgpu::Buffer>,
    unbound_buffers: HashMap<u64, usize>,
    buffer_aliases: HashMap<u64, u64>,
    memories: HashMap<u64, wgpu::Buffer>,
    shader_layouts: HashMap<u64, wgpu::BindGroupLayout>,
    pipeline_layouts: HashMap<u64, wgpu::PipelineLayout>,
    shader_modules: HashMap<u64, wgpu::ShaderModule>,
    pipelines: HashMap<u64, wgpu::ComputePipeline>,
    descriptor_sets: HashMap<u64, DescSet>,
    command_pools: HashMap<u64, Vec<u64>>,
    command_buffers: HashMap<u64, CmdState>,
    semaphores: HashMap<u64, ()>,
    fences: HashMap<u64, ()>,
}

impl WgpuState {
    fn fresh_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn resolve_buffer(
        &self,
        handle: BufferHandle,
        operation: &'static str,
    ) -> DeviceResult<&wgpu::Buffer> {
        if let Some(memory) = self.buffer_aliases.get(&handle.0) {
            return self.memories.get(memory).ok_or(DeviceError::InvalidHandle {
                kind: "memory",
                handle: *memory,
                operation,
            });
        }
        if let Some(buffer) = self.buffers.get(&handle.0) {
            return Ok(buffer);
        }
        if self.unbound_buffers.contains_key(&handle.0) {
            return Err(DeviceError::BufferNotBound { handle: handle.0 });
        }
        Err(DeviceError::InvalidHandle {
            kind: "buffer",
            handle: handle.0,
            operation,
        })
    }

    fn cmd_state(
        &mut self,
        cmd: CommandBufferHandle,
        operation: &'static str,
    ) -> DeviceResult<&mut CmdState> {
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
        recorded: Recorded,
    ) -> DeviceResult<()> {
        let state = self.cmd_state(cmd, operation)?;
        if !state.recording {
            return Err(DeviceError::NotRecording { handle: cmd.0 });
        }
        state.commands.push(recorded);
        Ok(())
    }
}

/// wgpu realization of the device interface. See the module docs for the
/// supported subset.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    has_push_constants: bool,
    state: Mutex<WgpuState>,
}

impl WgpuDevice {
    /// Acquires the default adapter and device. Fails with
    /// [`DeviceError::DeviceNotAvailable`] when no adapter is present.
    pub fn new() -> DeviceResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .block_on()
            .ok_or_else(|| DeviceError::DeviceNotAvailable {
                message: "no wgpu adapter found".to_string(),
            })?;

        let adapter_features = adapter.features();
        let mut required_features = wgpu::Features::empty();
        let mut required_limits = wgpu::Limits::default();
        let has_push_constants = adapter_features.contains(wgpu::Features::PUSH_CONSTANTS);
        if has_push_constants {
            required_features |= wgpu::Features::PUSH_CONSTANTS;
            required_limits.max_push_constant_size =
                adapter.limits().max_push_constant_size.min(128);
        }

        let adapter_name = adapter.get_info().name;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gpugraph-device"),
                    required_features,
                    required_limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .block_on()
            .map_err(|e| DeviceError::DeviceNotAvailable {
                message: e.to_string(),
            })?;
        debug!("wgpu device created on adapter {adapter_name}");

        Ok(Self {
            device,
            queue,
            adapter_name,
            has_push_constants,
            state: Mutex::new(WgpuState::default()),
        })
    }

    fn storage_buffer(&self, nbytes: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: nbytes.max(4) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Replays a recorded command stream into one wgpu command buffer.
    fn encode_commands(
        &self,
        state: &WgpuState,
        commands: &[Recorded],
    ) -> DeviceResult<wgpu::CommandBuffer> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        let mut bound_pipeline: Option<PipelineHandle> = None;
        let mut bound_set: Option<DescriptorSetHandle> = None;
        let mut pending_push_constants: Option<Vec<u8>> = None;

        for command in commands {
            match command {
                Recorded::BindPipeline(pipeline) => bound_pipeline = Some(*pipeline),
                Recorded::BindSet(set) => bound_set = Some(*set),
                Recorded::PushConstants(data) => pending_push_constants = Some(data.clone()),
                Recorded::CopyBuffer { src, dst, nbytes } => {
                    let src = state.resolve_buffer(*src, "queue_submit")?;
                    let dst = state.resolve_buffer(*dst, "queue_submit")?;
                    encoder.copy_buffer_to_buffer(src, 0, dst, 0, *nbytes as u64);
                }
                Recorded::Dispatch(groups) => {
                    let pipeline_handle =
                        bound_pipeline.ok_or(DeviceError::SubmissionFailed {
                            message: "dispatch without a bound pipeline".to_string(),
                        })?;
                    let pipeline = state.pipelines.get(&pipeline_handle.0).ok_or(
                        DeviceError::InvalidHandle {
                            kind: "pipeline",
                            handle: pipeline_handle.0,
                            operation: "queue_submit",
                        },
                    )?;
                    let set_handle = bound_set.ok_or(DeviceError::SubmissionFailed {
                        message: "dispatch without a bound descriptor set".to_string(),
                    })?;
                    let set = state.descriptor_sets.get(&set_handle.0).ok_or(
                        DeviceError::InvalidHandle {
                            kind: "descriptor set",
                            handle: set_handle.0,
                            operation: "queue_submit",
                        },
                    )?;
                    let layout = state.shader_layouts.get(&set.layout.0).ok_or(
                        DeviceError::InvalidHandle {
                            kind: "shader layout",
                            handle: set.layout.0,
                            operation: "queue_submit",
                        },
                    )?;

                    let mut entries = Vec::with_capacity(set.bindings.len());
                    for (binding, buffer) in &set.bindings {
                        let buffer = state.resolve_buffer(*buffer, "queue_submit")?;
                        entries.push(wgpu::BindGroupEntry {
                            binding: *binding,
                            resource: buffer.as_entire_binding(),
                        });
                    }
                    let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: None,
                        layout,
                        entries: &entries,
                    });

                    let mut pass =
                        encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
                    pass.set_pipeline(pipeline);
                    pass.set_bind_group(0, &bind_group, &[]);
                    if let Some(data) = pending_push_constants.take() {
                        if !data.is_empty() {
                            pass.set_push_constants(0, &data);
                        }
                    }
                    pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
                }
            }
        }
        Ok(encoder.finish())
    }
}

impl ComputeDevice for WgpuDevice {
    fn name(&self) -> String {
        format!("wgpu:{}", self.adapter_name)
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
                state.command_buffers.remove(&cmd);
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
            state.command_buffers.insert(handle, CmdState::default());
            handles.push(CommandBufferHandle(handle));
        }
        state
            .command_pools
            .get_mut(&pool.0)
            .unwrap()
            .extend(handles.iter().map(|h| h.0));
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
            if let Some(cmd_state) = state.command_buffers.get_mut(&cmd) {
                *cmd_state = CmdState::default();
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
        state.fences.insert(handle, ());
        Ok(FenceHandle(handle))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.lock().unwrap().fences.remove(&fence.0);
    }

    /// All prior submissions retire before this returns; the queue is
    /// in-order, so this is equivalent to waiting on the fence's
    /// submission.
    fn wait_for_fence(&self, fence: FenceHandle) -> DeviceResult<()> {
        if !self.state.lock().unwrap().fences.contains_key(&fence.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "fence",
                handle: fence.0,
                operation: "wait_for_fence",
            });
        }
        let _ = self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn reset_fence(&self, _fence: FenceHandle) -> DeviceResult<()> {
        Ok(())
    }

    fn create_buffer(&self, nbytes: usize, _host_visible: bool) -> DeviceResult<BufferHandle> {
        let buffer = self.storage_buffer(nbytes);
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.buffers.insert(handle, buffer);
        Ok(BufferHandle(handle))
    }

    fn create_unbound_buffer(&self, nbytes: usize) -> DeviceResult<BufferHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.unbound_buffers.insert(handle, nbytes);
        Ok(BufferHandle(handle))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock().unwrap();
        state.buffers.remove(&buffer.0);
        state.unbound_buffers.remove(&buffer.0);
        state.buffer_aliases.remove(&buffer.0);
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> DeviceResult<()> {
        let state = self.state.lock().unwrap();
        let target = state.resolve_buffer(buffer, "write_buffer")?;
        self.queue.write_buffer(target, offset as u64, data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: BufferHandle,
        offset: usize,
        out: &mut [u8],
    ) -> DeviceResult<()> {
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: out.len().max(4) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        {
            let state = self.state.lock().unwrap();
            let source = state.resolve_buffer(buffer, "read_buffer")?;
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
            encoder.copy_buffer_to_buffer(source, offset as u64, &readback, 0, out.len() as u64);
            self.queue.submit(Some(encoder.finish()));
        }

        let slice = readback.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| DeviceError::SubmissionFailed {
                message: "readback mapping was dropped".to_string(),
            })?
            .map_err(|e| DeviceError::SubmissionFailed {
                message: format!("readback mapping failed: {e:?}"),
            })?;
        out.copy_from_slice(&slice.get_mapped_range()[..out.len()]);
        readback.unmap();
        Ok(())
    }

    fn create_image(&self, _extents: [u32; 3], _bound: bool) -> DeviceResult<ImageHandle> {
        Err(DeviceError::Unsupported {
            operation: "create_image",
        })
    }

    fn destroy_image(&self, _image: ImageHandle) {}

    fn allocate_memory(&self, nbytes: usize) -> DeviceResult<MemoryHandle> {
        let buffer = self.storage_buffer(nbytes);
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.memories.insert(handle, buffer);
        Ok(MemoryHandle(handle))
    }

    fn free_memory(&self, memory: MemoryHandle) {
        self.state.lock().unwrap().memories.remove(&memory.0);
    }

    fn bind_buffer_memory(&self, buffer: BufferHandle, memory: MemoryHandle) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.memories.contains_key(&memory.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "memory",
                handle: memory.0,
                operation: "bind_buffer_memory",
            });
        }
        if state.unbound_buffers.remove(&buffer.0).is_none() && !state.buffers.contains_key(&buffer.0)
        {
            return Err(DeviceError::InvalidHandle {
                kind: "buffer",
                handle: buffer.0,
                operation: "bind_buffer_memory",
            });
        }
        state.buffer_aliases.insert(buffer.0, memory.0);
        Ok(())
    }

    fn bind_image_memory(&self, _image: ImageHandle, _memory: MemoryHandle) -> DeviceResult<()> {
        Err(DeviceError::Unsupported {
            operation: "bind_image_memory",
        })
    }

    fn init_descriptor_pool(&self, _config: &DescriptorCounts) -> DeviceResult<()> {
        // wgpu pools descriptor memory internally.
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
        let mut entries = Vec::with_capacity(bindings.len());
        for (index, ty) in bindings.iter().enumerate() {
            let buffer_type = match ty {
                DescriptorType::UniformBuffer => wgpu::BufferBindingType::Uniform,
                DescriptorType::StorageBuffer => {
                    wgpu::BufferBindingType::Storage { read_only: false }
                }
                DescriptorType::CombinedImageSampler | DescriptorType::StorageImage => {
                    return Err(DeviceError::Unsupported {
                        operation: "create_shader_layout with image bindings",
                    })
                }
            };
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: index as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: buffer_type,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: None,
                entries: &entries,
            });
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.shader_layouts.insert(handle, layout);
        Ok(ShaderLayoutHandle(handle))
    }

    fn create_pipeline_layout(
        &self,
        shader_layout: ShaderLayoutHandle,
        push_constant_size: u32,
    ) -> DeviceResult<PipelineLayoutHandle> {
        if push_constant_size > 0 && !self.has_push_constants {
            return Err(DeviceError::Unsupported {
                operation: "create_pipeline_layout with push constants",
            });
        }
        let mut state = self.state.lock().unwrap();
        let bind_group_layout =
            state
                .shader_layouts
                .get(&shader_layout.0)
                .ok_or(DeviceError::InvalidHandle {
                    kind: "shader layout",
                    handle: shader_layout.0,
                    operation: "create_pipeline_layout",
                })?;
        let push_constant_ranges = if push_constant_size > 0 {
            vec![wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::COMPUTE,
                range: 0..push_constant_size,
            }]
        } else {
            Vec::new()
        };
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: None,
                bind_group_layouts: &[bind_group_layout],
                push_constant_ranges: &push_constant_ranges,
            });
        let handle = state.fresh_handle();
        state.pipeline_layouts.insert(handle, layout);
        Ok(PipelineLayoutHandle(handle))
    }

    fn create_shader_module(&self, shader: &ShaderInfo) -> DeviceResult<ShaderModuleHandle> {
        let source = shader
            .wgsl
            .as_ref()
            .ok_or_else(|| DeviceError::MissingShaderSource {
                shader: shader.name.clone(),
            })?;
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&shader.name),
                source: wgpu::ShaderSource::Wgsl(source.clone().into()),
            });
        let mut state = self.state.lock().unwrap();
        let handle = state.fresh_handle();
        state.shader_modules.insert(handle, module);
        Ok(ShaderModuleHandle(handle))
    }

    fn create_compute_pipelines(
        &self,
        descriptors: &[PipelineDescriptor],
    ) -> DeviceResult<Vec<PipelineHandle>> {
        let mut state = self.state.lock().unwrap();
        let mut handles = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let layout = state
                .pipeline_layouts
                .get(&descriptor.pipeline_layout.0)
                .ok_or(DeviceError::InvalidHandle {
                    kind: "pipeline layout",
                    handle: descriptor.pipeline_layout.0,
                    operation: "create_compute_pipelines",
                })?;
            let module = state
                .shader_modules
                .get(&descriptor.shader_module.0)
                .ok_or(DeviceError::InvalidHandle {
                    kind: "shader module",
                    handle: descriptor.shader_module.0,
                    operation: "create_compute_pipelines",
                })?;
            let pipeline =
                self.device
                    .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: None,
                        layout: Some(layout),
                        module,
                        entry_point: Some("main"),
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        cache: None,
                    });
            let handle = state.fresh_handle();
            state.pipelines.insert(handle, pipeline);
            handles.push(PipelineHandle(handle));
        }
        Ok(handles)
    }

    fn allocate_descriptor_set(
        &self,
        layout: ShaderLayoutHandle,
    ) -> DeviceResult<DescriptorSetHandle> {
        let mut state = self.state.lock().unwrap();
        if !state.shader_layouts.contains_key(&layout.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "shader layout",
                handle: layout.0,
                operation: "allocate_descriptor_set",
            });
        }
        let handle = state.fresh_handle();
        state.descriptor_sets.insert(
            handle,
            DescSet {
                layout,
                bindings: Vec::new(),
            },
        );
        Ok(DescriptorSetHandle(handle))
    }

    fn update_descriptor_set(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        _ty: DescriptorType,
        resource: ResourceBinding,
    ) -> DeviceResult<()> {
        let buffer = match resource {
            ResourceBinding::Buffer(buffer) => buffer,
            ResourceBinding::Image(_) => {
                return Err(DeviceError::Unsupported {
                    operation: "update_descriptor_set with image resources",
                })
            }
        };
        let mut state = self.state.lock().unwrap();
        let desc_set = state
            .descriptor_sets
            .get_mut(&set.0)
            .ok_or(DeviceError::InvalidHandle {
                kind: "descriptor set",
                handle: set.0,
                operation: "update_descriptor_set",
            })?;
        desc_set.bindings.push((binding, buffer));
        Ok(())
    }

    fn create_query_pool(&self, _query_count: u32) -> DeviceResult<QueryPoolHandle> {
        Err(DeviceError::Unsupported {
            operation: "create_query_pool",
        })
    }

    fn destroy_query_pool(&self, _pool: QueryPoolHandle) {}

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
        state.record(cmd, "cmd_bind_pipeline", Recorded::BindPipeline(pipeline))
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        _layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(cmd, "cmd_bind_descriptor_set", Recorded::BindSet(set))
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
            Recorded::PushConstants(data.to_vec()),
        )
    }

    fn cmd_pipeline_barrier(
        &self,
        _cmd: CommandBufferHandle,
        _barrier: &PipelineBarrier,
    ) -> DeviceResult<()> {
        // wgpu inserts hazard barriers automatically.
        Ok(())
    }

    fn cmd_dispatch(&self, cmd: CommandBufferHandle, group_counts: [u32; 3]) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(cmd, "cmd_dispatch", Recorded::Dispatch(group_counts))
    }

    fn cmd_copy_buffer(
        &self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        nbytes: usize,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(
            cmd,
            "cmd_copy_buffer",
            Recorded::CopyBuffer { src, dst, nbytes },
        )
    }

    fn cmd_blit_image(
        &self,
        _cmd: CommandBufferHandle,
        _src: ImageHandle,
        _dst: ImageHandle,
    ) -> DeviceResult<()> {
        Err(DeviceError::Unsupported {
            operation: "cmd_blit_image",
        })
    }

    fn cmd_write_timestamp(
        &self,
        _cmd: CommandBufferHandle,
        _pool: QueryPoolHandle,
        _query: u32,
    ) -> DeviceResult<()> {
        Err(DeviceError::Unsupported {
            operation: "cmd_write_timestamp",
        })
    }

    fn cmd_reset_query_pool(
        &self,
        _cmd: CommandBufferHandle,
        _pool: QueryPoolHandle,
        _first_query: u32,
        _query_count: u32,
    ) -> DeviceResult<()> {
        Err(DeviceError::Unsupported {
            operation: "cmd_reset_query_pool",
        })
    }

    /// Submits in queue order. Wait and signal semaphores are validated but
    /// otherwise no-ops: the queue already executes submissions in order.
    fn queue_submit(
        &self,
        cmd: CommandBufferHandle,
        wait_semaphore: Option<SemaphoreHandle>,
        signal_semaphore: Option<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    ) -> DeviceResult<()> {
        let state = self.state.lock().unwrap();
        for semaphore in [wait_semaphore, signal_semaphore].into_iter().flatten() {
            if !state.semaphores.contains_key(&semaphore.0) {
                return Err(DeviceError::InvalidHandle {
                    kind: "semaphore",
                    handle: semaphore.0,
                    operation: "queue_submit",
                });
            }
        }
        if let Some(fence) = fence {
            if !state.fences.contains_key(&fence.0) {
                return Err(DeviceError::InvalidHandle {
                    kind: "fence",
                    handle: fence.0,
                    operation: "queue_submit",
                });
            }
        }
        let commands = {
            let cmd_state = state
                .command_buffers
                .get(&cmd.0)
                .ok_or(DeviceError::InvalidHandle {
                    kind: "command buffer",
                    handle: cmd.0,
                    operation: "queue_submit",
                })?;
            if !cmd_state.ended {
                return Err(DeviceError::SubmissionFailed {
                    message: format!("command buffer {} was not ended", cmd.0),
                });
            }
            cmd_state.commands.clone()
        };
        let command_buffer = self.encode_commands(&state, &commands)?;
        self.queue.submit(Some(command_buffer));
        Ok(())
    }
}
