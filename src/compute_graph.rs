//! The compute graph: value store, node orchestration, and the
//! prepack/execute pipeline.
//!
//! A builder populates the value store and appends prepack and execute
//! nodes, then runs the phases in order: `prepare()` sizes the descriptor
//! pool and binds shared storage, `prepare_pipelines()` materializes every
//! discovered pipeline, `prepack()` uploads constants in bounded
//! command-buffer chunks, `encode_execute()` records the reusable execute
//! command buffer, and `execute()` submits the deferred buffers chained by
//! semaphores and waits on a fence.

use std::collections::HashSet;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, trace};

use crate::errors::{GraphError, Result};
use crate::gpu::command::CommandBuffer;
use crate::gpu::types::{
    build_spec_constants, DescriptorCounts, DescriptorSetHandle, DescriptorType,
    PipelineDescriptor, PipelineHandle, PipelineLayoutHandle, ResourceBinding, SemaphoreHandle,
    ShaderInfo, SpecConstant, MAX_PUSH_CONSTANT_SIZE,
};
use crate::gpu::{ComputeDevice, Context, VirtualDevice};
use crate::graph_config::{GraphConfig, MB};
use crate::nodes::staging_nodes::{StagingToTensorNode, TensorToStagingNode};
use crate::nodes::{ExecuteNode, PrepackNode, PushConstant};
use crate::utils::{default_local_wg_size, WorkgroupSize};
use crate::values::shared_object::TmpSharedObjectStack;
use crate::values::{
    DataType, GpuTensor, MemoryLayout, Scalar, SharedObject, StagingBuffer, StorageType, SymInt,
    TensorRef, TmpTensor, Value, ValueKind, ValueRef, DUMMY_VALUE_REF,
};

/// Switch-over point for the prepack peak-memory strategy: above this much
/// constant data, split submissions wait and flush to recycle staging.
const PREPACK_REDUCE_PEAK_MEMORY_NBYTES: usize = 500 * MB;

/// Which phase a node's descriptor demand belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepack,
    Execute,
}

/// A bound input or output: the tensor value and its staging buffer (or
/// [`DUMMY_VALUE_REF`] when staging is not used).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoValueRef {
    pub value: ValueRef,
    pub staging: ValueRef,
}

macro_rules! value_guard {
    ($(#[$doc:meta])* $guard:ident, $target:ty, $variant:ident, $getter:ident) => {
        $(#[$doc])*
        pub struct $guard<'a>(&'a $target);

        impl<'a> std::ops::Deref for $guard<'a> {
            type Target = $target;

            fn deref(&self) -> &$target {
                self.0
            }
        }

        impl ComputeGraph {
            pub fn $getter(&self, idx: ValueRef) -> Result<$guard<'_>> {
                match self.value_at(idx)? {
                    Value::$variant(v) => Ok($guard(v)),
                    other => Err(GraphError::InvalidValueType {
                        index: idx,
                        expected: ValueKind::$variant,
                        actual: other.kind(),
                    }),
                }
            }
        }
    };
}

value_guard!(
    /// Borrow guard over a stored tensor.
    TensorGuard,
    GpuTensor,
    Tensor,
    get_tensor
);
value_guard!(
    /// Borrow guard over a stored constant tensor reference.
    TensorRefGuard,
    TensorRef,
    TensorRef,
    get_tensor_ref
);
value_guard!(
    /// Borrow guard over a stored staging buffer.
    StagingGuard,
    StagingBuffer,
    Staging,
    get_staging
);
value_guard!(
    /// Borrow guard over a stored integer list.
    IntListGuard,
    Vec<i64>,
    IntList,
    get_int_list
);
value_guard!(
    /// Borrow guard over a stored double list.
    DoubleListGuard,
    Vec<f64>,
    DoubleList,
    get_double_list
);
value_guard!(
    /// Borrow guard over a stored bool list.
    BoolListGuard,
    Vec<bool>,
    BoolList,
    get_bool_list
);
value_guard!(
    /// Borrow guard over a stored value list.
    ValueListGuard,
    Vec<ValueRef>,
    ValueList,
    get_value_list
);
value_guard!(
    /// Borrow guard over a stored symbolic integer.
    SymIntGuard,
    SymInt,
    SymInt,
    get_symint
);

/// The compute graph. See the module docs for the phase choreography.
///
/// The value store is append-only: indices are dense, monotonically
/// increasing, and never reused. Borrow guards returned by the `get_*`
/// accessors hold a shared borrow of the graph, so every API that could
/// grow the store (`&mut self`) is statically unreachable while a guard is
/// live.
pub struct ComputeGraph {
    config: GraphConfig,
    context: Context,
    values: Vec<Value>,
    shared_objects: Vec<SharedObject>,
    tmp_shared_object_idxs: TmpSharedObjectStack,
    prepack_nodes: Vec<Box<dyn PrepackNode>>,
    execute_nodes: Vec<Box<dyn ExecuteNode>>,
    inputs: Vec<IoValueRef>,
    outputs: Vec<IoValueRef>,
    prepack_descriptor_counts: DescriptorCounts,
    execute_descriptor_counts: DescriptorCounts,
    pipeline_descriptors: HashSet<PipelineDescriptor>,
    deferred_cmds: Vec<CommandBuffer>,
    pending_staging: Vec<StagingBuffer>,
    total_constant_nbytes: usize,
    staging_nbytes_in_cmd: usize,
    execute_count: u64,
}

impl ComputeGraph {
    pub fn new(config: GraphConfig) -> Result<Self> {
        let device: Arc<dyn ComputeDevice> = match config.device() {
            Some(device) => device,
            None => Arc::new(VirtualDevice::new()),
        };
        let context = Context::new(device, config.command_pool_config())?;
        Ok(Self {
            config,
            context,
            values: Vec::new(),
            shared_objects: Vec::new(),
            tmp_shared_object_idxs: TmpSharedObjectStack::default(),
            prepack_nodes: Vec::new(),
            execute_nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            prepack_descriptor_counts: DescriptorCounts::default(),
            execute_descriptor_counts: DescriptorCounts::default(),
            pipeline_descriptors: HashSet::new(),
            deferred_cmds: Vec::new(),
            pending_staging: Vec::new(),
            total_constant_nbytes: 0,
            staging_nbytes_in_cmd: 0,
            execute_count: 0,
        })
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// The device this graph records against.
    pub fn device(&self) -> Arc<dyn ComputeDevice> {
        Arc::clone(self.context.device())
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn inputs(&self) -> &[IoValueRef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[IoValueRef] {
        &self.outputs
    }

    pub fn execute_count(&self) -> u64 {
        self.execute_count
    }

    pub fn total_constant_nbytes(&self) -> usize {
        self.total_constant_nbytes
    }

    fn value_at(&self, idx: ValueRef) -> Result<&Value> {
        self.values.get(idx).ok_or(GraphError::ValueRefOutOfBounds {
            index: idx,
            len: self.values.len(),
        })
    }

    fn value_at_mut(&mut self, idx: ValueRef) -> Result<&mut Value> {
        let len = self.values.len();
        self.values
            .get_mut(idx)
            .ok_or(GraphError::ValueRefOutOfBounds { index: idx, len })
    }

    fn tensor_mut(&mut self, idx: ValueRef) -> Result<&mut GpuTensor> {
        match self.value_at_mut(idx)? {
            Value::Tensor(t) => Ok(t),
            other => Err(GraphError::InvalidValueType {
                index: idx,
                expected: ValueKind::Tensor,
                actual: other.kind(),
            }),
        }
    }

    fn push_value(&mut self, value: Value) -> ValueRef {
        let idx = self.values.len();
        self.values.push(value);
        idx
    }

    // Value store: add_* family

    /// Adds a tensor with explicit storage type and memory layout. A
    /// `shared_object_idx` of `None` allocates private memory; otherwise
    /// allocation is deferred to `prepare()` and the tensor is registered as
    /// a user of the shared object.
    pub fn add_tensor_with_storage_and_layout(
        &mut self,
        sizes: Vec<i64>,
        dtype: DataType,
        storage_type: StorageType,
        memory_layout: MemoryLayout,
        shared_object_idx: Option<usize>,
    ) -> Result<ValueRef> {
        let allocate_memory = shared_object_idx.is_none();
        let tensor = GpuTensor::new(
            self.device(),
            sizes,
            dtype,
            storage_type,
            memory_layout,
            allocate_memory,
        )?;
        let idx = self.push_value(Value::Tensor(tensor));
        if let Some(sobj_idx) = shared_object_idx {
            self.get_shared_object_mut(sobj_idx).add_user(idx);
        }
        Ok(idx)
    }

    /// Adds a tensor with explicit storage; the layout is suggested from
    /// the sizes.
    pub fn add_tensor_with_storage(
        &mut self,
        sizes: Vec<i64>,
        dtype: DataType,
        storage_type: StorageType,
        shared_object_idx: Option<usize>,
    ) -> Result<ValueRef> {
        let memory_layout = self.suggested_memory_layout(&sizes);
        self.add_tensor_with_storage_and_layout(
            sizes,
            dtype,
            storage_type,
            memory_layout,
            shared_object_idx,
        )
    }

    /// Adds a tensor with explicit layout; the storage type is suggested.
    pub fn add_tensor_with_layout(
        &mut self,
        sizes: Vec<i64>,
        dtype: DataType,
        memory_layout: MemoryLayout,
        shared_object_idx: Option<usize>,
    ) -> Result<ValueRef> {
        let storage_type = self.suggested_storage_type();
        self.add_tensor_with_storage_and_layout(
            sizes,
            dtype,
            storage_type,
            memory_layout,
            shared_object_idx,
        )
    }

    /// Adds a tensor with suggested storage and layout.
    pub fn add_tensor(
        &mut self,
        sizes: Vec<i64>,
        dtype: DataType,
        shared_object_idx: Option<usize>,
    ) -> Result<ValueRef> {
        let storage_type = self.suggested_storage_type();
        let memory_layout = self.suggested_memory_layout(&sizes);
        self.add_tensor_with_storage_and_layout(
            sizes,
            dtype,
            storage_type,
            memory_layout,
            shared_object_idx,
        )
    }

    /// Adds a tensor with the same sizes, dtype, storage, and layout as an
    /// existing one, privately allocated.
    pub fn add_tensor_like(&mut self, idx: ValueRef) -> Result<ValueRef> {
        let (sizes, dtype, storage_type, memory_layout) = {
            let t = self.get_tensor(idx)?;
            (
                t.sizes().to_vec(),
                t.dtype(),
                t.storage_type(),
                t.memory_layout(),
            )
        };
        self.add_tensor_with_storage_and_layout(sizes, dtype, storage_type, memory_layout, None)
    }

    /// Adds a view aliasing an existing tensor's storage, optionally with
    /// new sizes and strides.
    pub fn add_tensor_view(
        &mut self,
        src: ValueRef,
        sizes: Option<Vec<i64>>,
        strides: Option<Vec<i64>>,
    ) -> Result<ValueRef> {
        let view = {
            let t = self.get_tensor(src)?;
            GpuTensor::view_of(&t, sizes, strides)?
        };
        Ok(self.push_value(Value::Tensor(view)))
    }

    /// Adds a constant tensor reference. Its byte size is accumulated into
    /// the running total used to pick the prepack peak-memory strategy.
    pub fn add_tensorref(
        &mut self,
        sizes: Vec<i64>,
        dtype: DataType,
        data: Arc<[u8]>,
    ) -> Result<ValueRef> {
        let tref = TensorRef::new(sizes, dtype, data)?;
        self.total_constant_nbytes += tref.nbytes();
        Ok(self.push_value(Value::TensorRef(tref)))
    }

    pub fn add_staging(&mut self, dtype: DataType, numel: usize) -> Result<ValueRef> {
        let staging = StagingBuffer::new(self.device(), dtype, numel)?;
        Ok(self.push_value(Value::Staging(staging)))
    }

    pub fn add_none(&mut self) -> ValueRef {
        self.push_value(Value::None)
    }

    pub fn add_value_list(&mut self, values: Vec<ValueRef>) -> ValueRef {
        self.push_value(Value::ValueList(values))
    }

    pub fn add_int_list(&mut self, values: Vec<i64>) -> ValueRef {
        self.push_value(Value::IntList(values))
    }

    pub fn add_double_list(&mut self, values: Vec<f64>) -> ValueRef {
        self.push_value(Value::DoubleList(values))
    }

    pub fn add_bool_list(&mut self, values: Vec<bool>) -> ValueRef {
        self.push_value(Value::BoolList(values))
    }

    pub fn add_string(&mut self, s: String) -> ValueRef {
        self.push_value(Value::String(s))
    }

    pub fn add_symint(&mut self, value: i32) -> Result<ValueRef> {
        let symint = SymInt::new(self.device(), value)?;
        Ok(self.push_value(Value::SymInt(symint)))
    }

    pub fn add_scalar(&mut self, value: impl Into<Scalar>) -> ValueRef {
        self.push_value(value.into().into())
    }

    /// Returns the earliest value index holding the given integer, adding a
    /// new Int value only when none exists.
    pub fn get_or_add_value_for_int(&mut self, value: i64) -> ValueRef {
        for (idx, stored) in self.values.iter().enumerate() {
            if stored.as_int() == Some(value) {
                return idx;
            }
        }
        self.add_scalar(value)
    }

    // Metadata queries

    /// Sizes of a Tensor or TensorRef value.
    pub fn sizes_of(&self, idx: ValueRef) -> Result<Vec<i64>> {
        match self.value_at(idx)? {
            Value::Tensor(t) => Ok(t.sizes().to_vec()),
            Value::TensorRef(t) => Ok(t.sizes().to_vec()),
            other => Err(GraphError::UnsupportedMetadataQuery {
                query: "sizes",
                index: idx,
                actual: other.kind(),
            }),
        }
    }

    pub fn dim_of(&self, idx: ValueRef) -> Result<usize> {
        Ok(self.sizes_of(idx)?.len())
    }

    pub fn numel_of(&self, idx: ValueRef) -> Result<i64> {
        match self.value_at(idx)? {
            Value::Tensor(t) => Ok(t.numel()),
            Value::TensorRef(t) => Ok(t.numel()),
            other => Err(GraphError::UnsupportedMetadataQuery {
                query: "numel",
                index: idx,
                actual: other.kind(),
            }),
        }
    }

    /// Dim order of a Tensor value. TensorRefs have no layout.
    pub fn dim_order_of(&self, idx: ValueRef) -> Result<Vec<i64>> {
        Ok(self.get_tensor(idx)?.dim_order().to_vec())
    }

    /// Strides of a Tensor value. TensorRefs have no layout.
    pub fn strides_of(&self, idx: ValueRef) -> Result<Vec<i64>> {
        Ok(self.get_tensor(idx)?.strides().to_vec())
    }

    /// Dtype of a Tensor or TensorRef; scalar values report synthetic
    /// dtypes.
    pub fn dtype_of(&self, idx: ValueRef) -> Result<DataType> {
        match self.value_at(idx)? {
            Value::Tensor(t) => Ok(t.dtype()),
            Value::TensorRef(t) => Ok(t.dtype()),
            Value::Bool(_) => Ok(DataType::Bool),
            // Shaders downcast doubles anyway.
            Value::Double(_) => Ok(DataType::Float32),
            Value::Int(_) => Ok(DataType::Int32),
            other => Err(GraphError::UnsupportedMetadataQuery {
                query: "dtype",
                index: idx,
                actual: other.kind(),
            }),
        }
    }

    pub fn storage_type_of(&self, idx: ValueRef) -> Result<StorageType> {
        Ok(self.get_tensor(idx)?.storage_type())
    }

    pub fn memory_layout_of(&self, idx: ValueRef) -> Result<MemoryLayout> {
        Ok(self.get_tensor(idx)?.memory_layout())
    }

    pub fn is_buffer_storage(&self, idx: ValueRef) -> Result<bool> {
        Ok(self.get_tensor(idx)?.storage_type().is_buffer())
    }

    /// Normalizes an IntList, or a ValueList of Int/SymInt elements, into an
    /// owned list of 64-bit integers.
    pub fn extract_int_or_symint_list(&self, idx: ValueRef) -> Result<Vec<i64>> {
        match self.value_at(idx)? {
            Value::IntList(list) => Ok(list.clone()),
            Value::ValueList(refs) => {
                let mut result = Vec::with_capacity(refs.len());
                for &vref in refs {
                    match self.value_at(vref)? {
                        Value::Int(v) => result.push(*v),
                        Value::SymInt(symint) => result.push(symint.get() as i64),
                        other => {
                            return Err(GraphError::InvalidListElementType {
                                index: vref,
                                actual: other.kind(),
                            })
                        }
                    }
                }
                Ok(result)
            }
            other => Err(GraphError::UnsupportedMetadataQuery {
                query: "int or symint list",
                index: idx,
                actual: other.kind(),
            }),
        }
    }

    pub fn set_symint(&mut self, idx: ValueRef, value: i32) -> Result<()> {
        match self.value_at_mut(idx)? {
            Value::SymInt(symint) => symint.set(value),
            other => Err(GraphError::InvalidValueType {
                index: idx,
                expected: ValueKind::SymInt,
                actual: other.kind(),
            }),
        }
    }

    pub fn read_symint(&self, idx: ValueRef) -> Result<i32> {
        Ok(self.get_symint(idx)?.get())
    }

    // Shared objects and transient tensors

    /// The shared object at `idx`, growing the pool as needed.
    pub fn get_shared_object_mut(&mut self, idx: usize) -> &mut SharedObject {
        if idx >= self.shared_objects.len() {
            self.shared_objects.resize_with(idx + 1, SharedObject::default);
        }
        &mut self.shared_objects[idx]
    }

    pub fn shared_object(&self, idx: usize) -> Option<&SharedObject> {
        self.shared_objects.get(idx)
    }

    pub fn num_shared_objects(&self) -> usize {
        self.shared_objects.len()
    }

    fn acquire_tmp_shared_object_idx(&mut self) -> usize {
        let reused = self.tmp_shared_object_idxs.borrow_mut().pop();
        match reused {
            Some(idx) => idx,
            None => self.shared_objects.len(),
        }
    }

    /// Creates a scoped transient tensor backed by a shared object. The
    /// shared object index is taken from the LIFO free-list when available,
    /// and returned there when the [`TmpTensor`] is dropped.
    pub fn create_tmp_tensor(&mut self, sizes: Vec<i64>, dtype: DataType) -> Result<TmpTensor> {
        let storage_type = self.suggested_storage_type();
        let memory_layout = self.suggested_memory_layout(&sizes);
        self.create_tmp_tensor_with(sizes, dtype, storage_type, memory_layout)
    }

    pub fn create_tmp_tensor_with(
        &mut self,
        sizes: Vec<i64>,
        dtype: DataType,
        storage_type: StorageType,
        memory_layout: MemoryLayout,
    ) -> Result<TmpTensor> {
        let sobj_idx = self.acquire_tmp_shared_object_idx();
        let vref = self.add_tensor_with_storage_and_layout(
            sizes,
            dtype,
            storage_type,
            memory_layout,
            Some(sobj_idx),
        )?;
        Ok(TmpTensor::from_parts(
            vref,
            sobj_idx,
            Rc::clone(&self.tmp_shared_object_idxs),
        ))
    }

    // Layout heuristics and workgroup sizing

    pub fn suggested_storage_type(&self) -> StorageType {
        self.config
            .storage_type_override()
            .unwrap_or(StorageType::Texture3D)
    }

    pub fn suggested_memory_layout(&self, sizes: &[i64]) -> MemoryLayout {
        if let Some(layout) = self.config.memory_layout_override() {
            return layout;
        }
        if sizes.len() < 3 {
            return MemoryLayout::WidthPacked;
        }
        // Rank-3+ tensors with a channels dimension of 1 still prefer width
        // packing.
        if crate::values::tensor::size_at_whcn(-3, sizes) == 1 {
            return MemoryLayout::WidthPacked;
        }
        MemoryLayout::ChannelsPacked
    }

    /// Global workgroup size covering a tensor: its element count for buffer
    /// storage, its logical texel extents otherwise.
    pub fn create_global_wg_size(&self, idx: ValueRef) -> Result<WorkgroupSize> {
        let tensor = self.get_tensor(idx)?;
        if tensor.storage_type().is_buffer() {
            Ok(WorkgroupSize::new(tensor.numel() as u32, 1, 1))
        } else {
            Ok(tensor.logical_limits())
        }
    }

    pub fn create_local_wg_size(&self, global_wg_size: WorkgroupSize) -> WorkgroupSize {
        if let Some(local) = self.config.local_wg_size_override() {
            return local;
        }
        default_local_wg_size(global_wg_size)
    }

    pub fn create_local_wg_size_for(&self, idx: ValueRef) -> Result<WorkgroupSize> {
        Ok(self.create_local_wg_size(self.create_global_wg_size(idx)?))
    }

    // Node registration and pipeline discovery

    pub fn add_prepack_node(&mut self, node: Box<dyn PrepackNode>) {
        self.prepack_nodes.push(node);
    }

    pub fn add_execute_node(&mut self, node: Box<dyn ExecuteNode>) {
        self.execute_nodes.push(node);
    }

    pub fn num_prepack_nodes(&self) -> usize {
        self.prepack_nodes.len()
    }

    pub fn num_execute_nodes(&self) -> usize {
        self.execute_nodes.len()
    }

    /// Registers one descriptor set worth of demand for a shader's layout in
    /// the given phase.
    pub fn update_descriptor_counts(&mut self, shader: &ShaderInfo, phase: Phase) {
        let counts = match phase {
            Phase::Prepack => &mut self.prepack_descriptor_counts,
            Phase::Execute => &mut self.execute_descriptor_counts,
        };
        counts.max_sets += 1;
        for &ty in &shader.layout {
            counts.add(ty);
        }
    }

    /// Records a pipeline descriptor for batch creation in
    /// `prepare_pipelines()`. The descriptor's spec constants start with the
    /// three local workgroup dimensions; the push constant size is computed
    /// by invoking each contribution against a bounded buffer.
    pub fn register_pipeline_to_create(
        &mut self,
        shader: &ShaderInfo,
        local_wg_size: WorkgroupSize,
        spec_constants: &[SpecConstant],
        push_constants: &[PushConstant],
    ) -> Result<()> {
        let (_, pc_size) = self.write_push_constants(push_constants)?;
        let shader_layout = self.context.shader_layout(&shader.layout)?;
        let pipeline_layout = self.context.pipeline_layout(shader_layout, pc_size as u32)?;
        let shader_module = self.context.shader_module(shader)?;
        let descriptor = PipelineDescriptor {
            pipeline_layout,
            shader_module,
            spec_constants: build_spec_constants(local_wg_size, spec_constants),
        };
        if self.context.contains_pipeline(&descriptor) {
            return Ok(());
        }
        self.pipeline_descriptors.insert(descriptor);
        Ok(())
    }

    /// Resolves (creating on a cache miss) the pipeline and pipeline layout
    /// for a shader invocation.
    pub fn pipeline_for(
        &mut self,
        shader: &ShaderInfo,
        local_wg_size: WorkgroupSize,
        spec_constants: &[SpecConstant],
        push_constant_size: u32,
    ) -> Result<(PipelineHandle, PipelineLayoutHandle)> {
        let shader_layout = self.context.shader_layout(&shader.layout)?;
        let pipeline_layout = self
            .context
            .pipeline_layout(shader_layout, push_constant_size)?;
        let shader_module = self.context.shader_module(shader)?;
        let descriptor = PipelineDescriptor {
            pipeline_layout,
            shader_module,
            spec_constants: build_spec_constants(local_wg_size, spec_constants),
        };
        let pipeline = self.context.pipeline(&descriptor)?;
        Ok((pipeline, pipeline_layout))
    }

    pub fn allocate_descriptor_set_for(
        &mut self,
        shader: &ShaderInfo,
    ) -> Result<DescriptorSetHandle> {
        let layout = self.context.shader_layout(&shader.layout)?;
        self.context.allocate_descriptor_set(layout)
    }

    pub fn bind_resource(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        ty: DescriptorType,
        resource: ResourceBinding,
    ) -> Result<()> {
        Ok(self
            .context
            .device()
            .update_descriptor_set(set, binding, ty, resource)?)
    }

    /// The resource backing a Tensor, Staging, or SymInt value.
    pub fn resource_binding_of(&self, idx: ValueRef) -> Result<ResourceBinding> {
        match self.value_at(idx)? {
            Value::Tensor(t) => Ok(t.resource_binding()),
            Value::Staging(s) => Ok(ResourceBinding::Buffer(s.buffer())),
            Value::SymInt(s) => Ok(ResourceBinding::Buffer(s.buffer())),
            other => Err(GraphError::UnsupportedMetadataQuery {
                query: "resource binding",
                index: idx,
                actual: other.kind(),
            }),
        }
    }

    /// Writes all push constant contributions into one bounded buffer,
    /// returning the buffer and the number of bytes used.
    pub fn write_push_constants(
        &self,
        push_constants: &[PushConstant],
    ) -> Result<([u8; MAX_PUSH_CONSTANT_SIZE], usize)> {
        let mut data = [0u8; MAX_PUSH_CONSTANT_SIZE];
        let mut offset = 0;
        for pc in push_constants {
            offset += pc.write(self, &mut data, offset)?;
        }
        Ok((data, offset))
    }

    /// The command buffer currently being recorded.
    pub fn current_cmd(&mut self) -> Result<&mut CommandBuffer> {
        self.context.cmd_mut()
    }

    pub fn querypool(&self) -> Option<crate::gpu::types::QueryPoolHandle> {
        self.context.querypool()
    }

    /// Accumulates staging bytes recorded into the current prepack command
    /// buffer.
    pub fn count_staging_nbytes(&mut self, nbytes: usize) {
        self.staging_nbytes_in_cmd += nbytes;
    }

    pub fn staging_nbytes_in_cmd(&self) -> usize {
        self.staging_nbytes_in_cmd
    }

    /// Keeps a transient staging buffer alive until the next context flush,
    /// after which its memory is recycled.
    pub fn retain_staging(&mut self, staging: StagingBuffer) {
        self.pending_staging.push(staging);
    }

    // Phases

    /// Sizes and initializes the descriptor pool from the aggregated
    /// prepack and execute demand, optionally initializes the query pool,
    /// and allocates and binds every shared object. Idempotent: a second
    /// call with no new nodes leaves the descriptor pool configuration
    /// unchanged.
    pub fn prepare(&mut self) -> Result<()> {
        let safety = self.config.descriptor_pool_safety_factor();
        let prepack = self.prepack_descriptor_counts;
        let execute = self.execute_descriptor_counts;
        let merge = |p: u32, e: u32| ((p.max(e) as f32) * safety).ceil() as u32;

        let max_sets = merge(prepack.max_sets, execute.max_sets);
        let pool_config = DescriptorCounts {
            max_sets,
            uniform_buffer_count: merge(
                prepack.uniform_buffer_count,
                execute.uniform_buffer_count,
            )
            .max(max_sets),
            storage_buffer_count: merge(
                prepack.storage_buffer_count,
                execute.storage_buffer_count,
            )
            .max(max_sets),
            combined_sampler_count: merge(
                prepack.combined_sampler_count,
                execute.combined_sampler_count,
            )
            .max(max_sets),
            storage_image_count: merge(prepack.storage_image_count, execute.storage_image_count)
                .max(max_sets),
        };
        self.context.init_descriptor_pool(pool_config)?;

        if self.config.enable_querypool() {
            self.context.init_querypool()?;
        }

        // Allocate each shared object to the max of its users' demand, then
        // bind every user. Already-allocated objects are left untouched.
        for sobj_idx in 0..self.shared_objects.len() {
            if self.shared_objects[sobj_idx].is_allocated() {
                continue;
            }
            let users = self.shared_objects[sobj_idx].users().to_vec();
            if users.is_empty() {
                continue;
            }
            let mut max_nbytes = 0;
            for &user in &users {
                max_nbytes = max_nbytes.max(self.get_tensor(user)?.memory_requirements());
            }
            let memory = self.device().allocate_memory(max_nbytes)?;
            self.shared_objects[sobj_idx].set_memory(memory);
            for &user in &users {
                self.tensor_mut(user)?.bind_memory(memory)?;
            }
            debug!(
                "shared object {} allocated {} bytes for {} users",
                sobj_idx,
                max_nbytes,
                users.len()
            );
        }
        Ok(())
    }

    /// The descriptor pool configuration chosen by `prepare()`, if any.
    pub fn descriptor_pool_config(&self) -> Option<DescriptorCounts> {
        self.context.descriptor_pool_config()
    }

    /// Lets every node register its pipeline descriptors, then materializes
    /// all unique descriptors in one batch and clears the discovery set.
    pub fn prepare_pipelines(&mut self) -> Result<()> {
        let prepack_nodes = mem::take(&mut self.prepack_nodes);
        let result = prepack_nodes
            .iter()
            .try_for_each(|node| node.prepare_pipelines(self));
        let added = mem::replace(&mut self.prepack_nodes, prepack_nodes);
        self.prepack_nodes.extend(added);
        result?;

        let execute_nodes = mem::take(&mut self.execute_nodes);
        let result = execute_nodes
            .iter()
            .try_for_each(|node| node.prepare_pipelines(self));
        let added = mem::replace(&mut self.execute_nodes, execute_nodes);
        self.execute_nodes.extend(added);
        result?;

        let descriptors = mem::take(&mut self.pipeline_descriptors);
        self.context.create_pipelines(descriptors.iter())?;
        Ok(())
    }

    /// Ends and submits the current command buffer without waiting.
    pub fn submit_current_cmd(&mut self, final_use: bool) -> Result<()> {
        self.context.submit_current_cmd(None, final_use)
    }

    /// Ends and submits the current command buffer, then blocks until the
    /// attached fence signals.
    pub fn submit_current_cmd_and_wait(&mut self, final_use: bool) -> Result<()> {
        let fence = self.context.get_fence()?;
        self.context.submit_current_cmd(Some(fence), final_use)?;
        self.device().wait_for_fence(fence)?;
        self.context.return_fence(fence);
        Ok(())
    }

    fn flush_context(&mut self) -> Result<()> {
        self.context.flush()?;
        self.pending_staging.clear();
        Ok(())
    }

    /// Records every prepack node under the staging-memory throttle.
    ///
    /// Before each node that is neither first nor last, if the staging bytes
    /// already recorded exceed the applicable threshold, the current command
    /// buffer is closed and either submitted-and-waited (when total constant
    /// bytes exceed 500 MiB, trading latency for lower peak memory) or
    /// submitted asynchronously. The last chunk is always submitted with
    /// `final_use` and waited on, then the context is flushed.
    pub fn prepack(&mut self) -> Result<()> {
        let reduce_peak_memory = self.total_constant_nbytes > PREPACK_REDUCE_PEAK_MEMORY_NBYTES;
        self.context.set_cmd(false)?;

        let nodes = mem::take(&mut self.prepack_nodes);
        let mut submitted = false;
        let result: Result<()> = (|| {
            for (i, node) in nodes.iter().enumerate() {
                // Never split on the first or last node.
                let not_terminal = i != 0 && i != nodes.len() - 1;
                let threshold = if submitted {
                    self.config.prepack_threshold_nbytes()
                } else {
                    self.config.prepack_initial_threshold_nbytes()
                };
                if not_terminal && self.staging_nbytes_in_cmd > threshold {
                    debug!(
                        "prepack split after {} bytes of staging (threshold {})",
                        self.staging_nbytes_in_cmd, threshold
                    );
                    if reduce_peak_memory {
                        self.submit_current_cmd_and_wait(false)?;
                        self.flush_context()?;
                    } else {
                        self.submit_current_cmd(false)?;
                    }
                    self.staging_nbytes_in_cmd = 0;
                    self.context.set_cmd(false)?;
                    submitted = true;
                }
                node.encode(self)?;
            }
            Ok(())
        })();
        let added = mem::replace(&mut self.prepack_nodes, nodes);
        self.prepack_nodes.extend(added);
        result?;

        self.submit_current_cmd_and_wait(true)?;
        self.flush_context()?;
        self.staging_nbytes_in_cmd = 0;
        Ok(())
    }

    fn clear_deferred_cmds(&mut self) {
        for mut cmd in self.deferred_cmds.drain(..) {
            if cmd.is_valid() {
                let _ = cmd.end();
                cmd.invalidate();
            }
        }
    }

    /// Records the reusable execute command buffer: discards previously
    /// deferred buffers, flushes the context, encodes every execute node,
    /// and defers the finished buffer for submission by `execute()`.
    pub fn encode_execute(&mut self) -> Result<()> {
        self.clear_deferred_cmds();
        self.flush_context()?;
        self.context.set_cmd(true)?;

        if let Some(querypool) = self.context.querypool() {
            self.context.cmd_mut()?.reset_querypool(querypool, 0, 1)?;
        }

        let nodes = mem::take(&mut self.execute_nodes);
        let result: Result<()> = (|| {
            for node in nodes.iter() {
                trace!("encoding execute node");
                node.encode(self)?;
            }
            Ok(())
        })();
        let added = mem::replace(&mut self.execute_nodes, nodes);
        self.execute_nodes.extend(added);
        result?;

        self.deferred_cmds.push(self.context.extract_cmd()?);
        Ok(())
    }

    /// Submits every deferred command buffer in order, chaining them by
    /// semaphores (buffer *i*'s signal semaphore is buffer *i+1*'s wait
    /// semaphore), attaches one fence to the last submission, and waits.
    pub fn execute(&mut self) -> Result<()> {
        let device = self.device();
        let fence = self.context.get_fence()?;
        let count = self.deferred_cmds.len();
        let mut prev_semaphore: Option<SemaphoreHandle> = None;
        for (i, cmd) in self.deferred_cmds.iter_mut().enumerate() {
            cmd.end()?;
            let signal_semaphore = cmd.signal_semaphore();
            let handle = cmd.get_submit_handle(false)?;
            let submit_fence = if i + 1 == count { Some(fence) } else { None };
            device.queue_submit(handle, prev_semaphore, Some(signal_semaphore), submit_fence)?;
            prev_semaphore = Some(signal_semaphore);
        }
        device.wait_for_fence(fence)?;
        self.context.return_fence(fence);
        self.execute_count += 1;
        Ok(())
    }

    // I/O binding

    /// Binds a tensor as the next graph input. With staging, a host-visible
    /// staging buffer sized to the tensor's padded element count is
    /// allocated and a staging-to-tensor transfer node is appended; the
    /// staging ref is returned. Without staging the tensor ref itself is
    /// returned.
    pub fn set_input_tensor(&mut self, idx: ValueRef, use_staging: bool) -> Result<ValueRef> {
        if use_staging {
            let (dtype, buf_numel) = {
                let tensor = self.get_tensor(idx)?;
                // Texture storage pads the staging buffer to whole texels.
                (tensor.dtype(), tensor.staging_buffer_numel())
            };
            let staging_idx = self.add_staging(dtype, buf_numel)?;
            let node = StagingToTensorNode::new(staging_idx, idx);
            self.add_execute_node(Box::new(node));
            self.inputs.push(IoValueRef {
                value: idx,
                staging: staging_idx,
            });
            return Ok(staging_idx);
        }
        self.inputs.push(IoValueRef {
            value: idx,
            staging: DUMMY_VALUE_REF,
        });
        Ok(idx)
    }

    /// Binds a tensor as the next graph output, symmetrically to
    /// `set_input_tensor`. The tensor-to-staging node is only appended when
    /// the padded element count is positive.
    pub fn set_output_tensor(&mut self, idx: ValueRef, use_staging: bool) -> Result<ValueRef> {
        if use_staging {
            let (dtype, buf_numel) = {
                let tensor = self.get_tensor(idx)?;
                (tensor.dtype(), tensor.staging_buffer_numel())
            };
            let staging_idx = self.add_staging(dtype, buf_numel)?;
            // An empty tensor has no image to bind, so no transfer node.
            if buf_numel > 0 {
                let node = TensorToStagingNode::new(idx, staging_idx);
                self.add_execute_node(Box::new(node));
            }
            self.outputs.push(IoValueRef {
                value: idx,
                staging: staging_idx,
            });
            return Ok(staging_idx);
        }
        self.outputs.push(IoValueRef {
            value: idx,
            staging: DUMMY_VALUE_REF,
        });
        Ok(idx)
    }

    /// Binds any value as an output. Tensors go through the staging path;
    /// other values are recorded as-is.
    pub fn set_output_value(&mut self, idx: ValueRef) -> Result<ValueRef> {
        if self.value_at(idx)?.is_tensor() {
            return self.set_output_tensor(idx, true);
        }
        self.outputs.push(IoValueRef {
            value: idx,
            staging: DUMMY_VALUE_REF,
        });
        Ok(idx)
    }

    /// Copies `numel` elements of host data into a staging buffer.
    pub fn copy_into_staging(&self, idx: ValueRef, data: &[u8], numel: usize) -> Result<()> {
        let staging = self.get_staging(idx)?;
        let nbytes = numel * staging.dtype().element_size();
        staging.copy_from(data, nbytes)
    }

    /// Copies `numel` elements out of a staging buffer into host memory.
    pub fn copy_from_staging(&self, idx: ValueRef, out: &mut [u8], numel: usize) -> Result<()> {
        let staging = self.get_staging(idx)?;
        let nbytes = numel * staging.dtype().element_size();
        staging.copy_to(out, nbytes)
    }

    // Dynamic shapes

    /// Virtually resizes the `idx`-th bound input.
    pub fn resize_input(&mut self, idx: usize, new_sizes: &[i64]) -> Result<()> {
        let io_val = *self
            .inputs
            .get(idx)
            .ok_or(GraphError::InputIndexOutOfBounds {
                index: idx,
                len: self.inputs.len(),
            })?;
        self.virtual_resize(io_val.value, new_sizes)
    }

    /// Virtually resizes a tensor value in place.
    pub fn virtual_resize(&mut self, idx: ValueRef, new_sizes: &[i64]) -> Result<()> {
        self.tensor_mut(idx)?.virtual_resize(new_sizes)
    }

    /// Triggers size recomputation on every execute node in order and, when
    /// the graph expects dynamic shapes, re-encodes the execute command
    /// buffer.
    pub fn propagate_resize(&mut self) -> Result<()> {
        let mut nodes = mem::take(&mut self.execute_nodes);
        let result = nodes
            .iter_mut()
            .try_for_each(|node| node.trigger_resize(self));
        let added = mem::replace(&mut self.execute_nodes, nodes);
        self.execute_nodes.extend(added);
        result?;

        if self.config.expect_dynamic_shapes() {
            self.encode_execute()?;
        }
        Ok(())
    }
}

impl Drop for ComputeGraph {
    fn drop(&mut self) {
        self.clear_deferred_cmds();
    }
}
