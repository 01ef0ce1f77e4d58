//! Device context: the current command buffer, object caches, and the
//! descriptor pool latch.
//!
//! The context owns everything the graph needs to talk to one device: the
//! command pool, a free-list of fences, idempotent caches for shader
//! layouts, pipeline layouts, shader modules and pipelines, and the
//! (at most one) query pool.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::errors::{GraphError, Result};

use super::command::{CommandBuffer, CommandPool, CommandPoolConfig};
use super::device::ComputeDevice;
use super::types::{
    DescriptorCounts, DescriptorSetHandle, DescriptorType, FenceHandle, PipelineDescriptor,
    PipelineHandle, PipelineLayoutHandle, QueryPoolHandle, ShaderInfo, ShaderLayoutHandle,
    ShaderModuleHandle,
};

/// Number of timestamp queries reserved when the query pool is enabled.
const QUERY_POOL_SIZE: u32 = 256;

pub struct Context {
    device: Arc<dyn ComputeDevice>,
    command_pool: CommandPool,
    cmd: Option<CommandBuffer>,
    fences: Vec<FenceHandle>,
    descriptor_pool_config: Option<DescriptorCounts>,
    shader_layout_cache: HashMap<Vec<DescriptorType>, ShaderLayoutHandle>,
    pipeline_layout_cache: HashMap<(ShaderLayoutHandle, u32), PipelineLayoutHandle>,
    shader_module_cache: HashMap<String, ShaderModuleHandle>,
    pipeline_cache: HashMap<PipelineDescriptor, PipelineHandle>,
    querypool: Option<QueryPoolHandle>,
}

impl Context {
    pub fn new(device: Arc<dyn ComputeDevice>, pool_config: CommandPoolConfig) -> Result<Self> {
        let command_pool = CommandPool::new(Arc::clone(&device), pool_config)?;
        Ok(Self {
            device,
            command_pool,
            cmd: None,
            fences: Vec::new(),
            descriptor_pool_config: None,
            shader_layout_cache: HashMap::new(),
            pipeline_layout_cache: HashMap::new(),
            shader_module_cache: HashMap::new(),
            pipeline_cache: HashMap::new(),
            querypool: None,
        })
    }

    pub fn device(&self) -> &Arc<dyn ComputeDevice> {
        &self.device
    }

    /// Opens a command buffer if none is being recorded.
    pub fn set_cmd(&mut self, reusable: bool) -> Result<()> {
        if self.cmd.is_none() {
            let mut cmd = self.command_pool.get_new_cmd(reusable)?;
            cmd.begin()?;
            self.cmd = Some(cmd);
        }
        Ok(())
    }

    /// The command buffer currently being recorded.
    pub fn cmd_mut(&mut self) -> Result<&mut CommandBuffer> {
        self.cmd.as_mut().ok_or(GraphError::NoActiveCommandBuffer)
    }

    pub fn has_cmd(&self) -> bool {
        self.cmd.is_some()
    }

    /// Takes ownership of the command buffer being recorded.
    pub fn extract_cmd(&mut self) -> Result<CommandBuffer> {
        self.cmd.take().ok_or(GraphError::NoActiveCommandBuffer)
    }

    /// Ends and submits the current command buffer, if any. The buffer is
    /// dropped afterwards; its pool slot is recycled on the next `flush`.
    pub fn submit_current_cmd(
        &mut self,
        fence: Option<FenceHandle>,
        final_use: bool,
    ) -> Result<()> {
        if let Some(mut cmd) = self.cmd.take() {
            cmd.end()?;
            let handle = cmd.get_submit_handle(final_use)?;
            self.device.queue_submit(handle, None, None, fence)?;
        }
        Ok(())
    }

    /// Pops a fence from the free-list, or creates one.
    pub fn get_fence(&mut self) -> Result<FenceHandle> {
        match self.fences.pop() {
            Some(fence) => {
                self.device.reset_fence(fence)?;
                Ok(fence)
            }
            None => Ok(self.device.create_fence()?),
        }
    }

    pub fn return_fence(&mut self, fence: FenceHandle) {
        self.fences.push(fence);
    }

    /// Resets the command pool and descriptor pool. All previously recorded
    /// command buffers and allocated descriptor sets become invalid.
    pub fn flush(&mut self) -> Result<()> {
        if self.cmd.is_some() {
            return Err(GraphError::FlushWithActiveCommandBuffer);
        }
        self.command_pool.flush()?;
        if self.descriptor_pool_config.is_some() {
            self.device.reset_descriptor_pool()?;
        }
        Ok(())
    }

    /// Initializes the descriptor pool exactly once; later calls are no-ops
    /// so a re-`prepare()` leaves the configuration unchanged.
    pub fn init_descriptor_pool(&mut self, config: DescriptorCounts) -> Result<()> {
        if self.descriptor_pool_config.is_none() {
            self.device.init_descriptor_pool(&config)?;
            self.descriptor_pool_config = Some(config);
            debug!(
                "descriptor pool initialized: {} sets, {} uniform / {} storage / {} sampler / {} image",
                config.max_sets,
                config.uniform_buffer_count,
                config.storage_buffer_count,
                config.combined_sampler_count,
                config.storage_image_count
            );
        }
        Ok(())
    }

    pub fn descriptor_pool_config(&self) -> Option<DescriptorCounts> {
        self.descriptor_pool_config
    }

    pub fn init_querypool(&mut self) -> Result<()> {
        if self.querypool.is_none() {
            self.querypool = Some(self.device.create_query_pool(QUERY_POOL_SIZE)?);
        }
        Ok(())
    }

    pub fn querypool(&self) -> Option<QueryPoolHandle> {
        self.querypool
    }

    /// Cached layout for a shader's binding list.
    pub fn shader_layout(&mut self, bindings: &[DescriptorType]) -> Result<ShaderLayoutHandle> {
        if let Some(&layout) = self.shader_layout_cache.get(bindings) {
            return Ok(layout);
        }
        let layout = self.device.create_shader_layout(bindings)?;
        self.shader_layout_cache.insert(bindings.to_vec(), layout);
        Ok(layout)
    }

    pub fn pipeline_layout(
        &mut self,
        shader_layout: ShaderLayoutHandle,
        push_constant_size: u32,
    ) -> Result<PipelineLayoutHandle> {
        let key = (shader_layout, push_constant_size);
        if let Some(&layout) = self.pipeline_layout_cache.get(&key) {
            return Ok(layout);
        }
        let layout = self
            .device
            .create_pipeline_layout(shader_layout, push_constant_size)?;
        self.pipeline_layout_cache.insert(key, layout);
        Ok(layout)
    }

    pub fn shader_module(&mut self, shader: &ShaderInfo) -> Result<ShaderModuleHandle> {
        if let Some(&module) = self.shader_module_cache.get(&shader.name) {
            return Ok(module);
        }
        let module = self.device.create_shader_module(shader)?;
        self.shader_module_cache.insert(shader.name.clone(), module);
        Ok(module)
    }

    pub fn contains_pipeline(&self, descriptor: &PipelineDescriptor) -> bool {
        self.pipeline_cache.contains_key(descriptor)
    }

    /// Materializes every descriptor not yet in the cache, in one batch.
    pub fn create_pipelines<'a>(
        &mut self,
        descriptors: impl Iterator<Item = &'a PipelineDescriptor>,
    ) -> Result<()> {
        let missing: Vec<PipelineDescriptor> = descriptors
            .filter(|d| !self.pipeline_cache.contains_key(*d))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let handles = self.device.create_compute_pipelines(&missing)?;
        for (descriptor, handle) in missing.into_iter().zip(handles) {
            self.pipeline_cache.insert(descriptor, handle);
        }
        Ok(())
    }

    /// Returns the pipeline for a descriptor, creating it on a cache miss.
    pub fn pipeline(&mut self, descriptor: &PipelineDescriptor) -> Result<PipelineHandle> {
        if let Some(&pipeline) = self.pipeline_cache.get(descriptor) {
            return Ok(pipeline);
        }
        let handles = self
            .device
            .create_compute_pipelines(std::slice::from_ref(descriptor))?;
        self.pipeline_cache.insert(descriptor.clone(), handles[0]);
        Ok(handles[0])
    }

    pub fn allocate_descriptor_set(
        &self,
        layout: ShaderLayoutHandle,
    ) -> Result<DescriptorSetHandle> {
        Ok(self.device.allocate_descriptor_set(layout)?)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(cmd) = self.cmd.as_mut() {
            cmd.invalidate();
        }
        for &fence in &self.fences {
            self.device.destroy_fence(fence);
        }
        if let Some(querypool) = self.querypool {
            self.device.destroy_query_pool(querypool);
        }
    }
}
