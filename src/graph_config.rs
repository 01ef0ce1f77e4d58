//! Configuration for a [`ComputeGraph`](crate::ComputeGraph).

use std::sync::Arc;

use crate::gpu::{CommandPoolConfig, ComputeDevice};
use crate::utils::WorkgroupSize;
use crate::values::{MemoryLayout, StorageType};

pub const MB: usize = 1024 * 1024;

/// Staging budget used for prepack splits when no threshold is configured.
pub const DEFAULT_PREPACK_THRESHOLD_NBYTES: usize = 10 * MB;

/// Graph-wide configuration. Unset overrides fall back to the layout
/// heuristics; unset prepack thresholds default to 10 MiB.
#[derive(Clone, Default)]
pub struct GraphConfig {
    storage_type_override: Option<StorageType>,
    memory_layout_override: Option<MemoryLayout>,
    local_wg_size_override: Option<WorkgroupSize>,
    prepack_threshold_nbytes: Option<usize>,
    prepack_initial_threshold_nbytes: Option<usize>,
    descriptor_pool_safety_factor: Option<f32>,
    enable_querypool: bool,
    expect_dynamic_shapes: bool,
    device: Option<Arc<dyn ComputeDevice>>,
    command_pool_config: Option<CommandPoolConfig>,
}

impl GraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces texture or buffer storage for all tensors added through the
    /// suggestion path.
    pub fn with_storage_type_override(mut self, storage_type: StorageType) -> Self {
        self.storage_type_override = Some(storage_type);
        self
    }

    /// Forces a packed-dim memory layout for all tensors added through the
    /// suggestion path.
    pub fn with_memory_layout_override(mut self, memory_layout: MemoryLayout) -> Self {
        self.memory_layout_override = Some(memory_layout);
        self
    }

    /// Forces a fixed local workgroup size.
    pub fn with_local_wg_size_override(mut self, local_wg_size: WorkgroupSize) -> Self {
        self.local_wg_size_override = Some(local_wg_size);
        self
    }

    /// Staging budget per prepack command buffer after the first submission.
    pub fn with_prepack_threshold_nbytes(mut self, nbytes: usize) -> Self {
        self.prepack_threshold_nbytes = Some(nbytes);
        self
    }

    /// Staging budget for the first prepack command buffer.
    pub fn with_prepack_initial_threshold_nbytes(mut self, nbytes: usize) -> Self {
        self.prepack_initial_threshold_nbytes = Some(nbytes);
        self
    }

    /// Multiplier applied to aggregated descriptor demand when sizing the
    /// descriptor pool.
    pub fn with_descriptor_pool_safety_factor(mut self, factor: f32) -> Self {
        self.descriptor_pool_safety_factor = Some(factor);
        self
    }

    /// Enables GPU timestamp collection.
    pub fn with_querypool(mut self) -> Self {
        self.enable_querypool = true;
        self
    }

    /// Re-encode the execute command buffer on every `propagate_resize()`.
    pub fn with_dynamic_shapes(mut self) -> Self {
        self.expect_dynamic_shapes = true;
        self
    }

    /// Injects an externally owned device. Without one, the graph runs on a
    /// driverless virtual device.
    pub fn with_device(mut self, device: Arc<dyn ComputeDevice>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_command_pool_config(mut self, config: CommandPoolConfig) -> Self {
        self.command_pool_config = Some(config);
        self
    }

    pub fn storage_type_override(&self) -> Option<StorageType> {
        self.storage_type_override
    }

    pub fn memory_layout_override(&self) -> Option<MemoryLayout> {
        self.memory_layout_override
    }

    pub fn local_wg_size_override(&self) -> Option<WorkgroupSize> {
        self.local_wg_size_override
    }

    pub fn prepack_threshold_nbytes(&self) -> usize {
        self.prepack_threshold_nbytes
            .unwrap_or(DEFAULT_PREPACK_THRESHOLD_NBYTES)
    }

    pub fn prepack_initial_threshold_nbytes(&self) -> usize {
        self.prepack_initial_threshold_nbytes
            .unwrap_or(DEFAULT_PREPACK_THRESHOLD_NBYTES)
    }

    pub fn descriptor_pool_safety_factor(&self) -> f32 {
        self.descriptor_pool_safety_factor.unwrap_or(1.25)
    }

    pub fn enable_querypool(&self) -> bool {
        self.enable_querypool
    }

    pub fn expect_dynamic_shapes(&self) -> bool {
        self.expect_dynamic_shapes
    }

    pub fn device(&self) -> Option<Arc<dyn ComputeDevice>> {
        self.device.clone()
    }

    pub fn command_pool_config(&self) -> CommandPoolConfig {
        self.command_pool_config.unwrap_or_default()
    }
}
