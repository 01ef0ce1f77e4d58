//! The generic shader-dispatch execute node.

use crate::compute_graph::{ComputeGraph, Phase};
use crate::errors::{GraphError, Result};
use crate::gpu::types::{
    BufferMemoryBarrier, ImageMemoryBarrier, MemoryAccess, PipelineBarrier, PipelineStage,
    ResourceBinding, ShaderInfo, SpecConstant,
};
use crate::utils::WorkgroupSize;
use crate::values::ValueRef;

use super::{ExecuteNode, PushConstant};

/// Size-recomputation callback invoked by `trigger_resize`. Receives the
/// node's resize argument refs; typically reads input sizes and virtually
/// resizes the output.
pub type ResizeFn = fn(&mut ComputeGraph, &[ValueRef]) -> Result<()>;

/// One resource argument of a dispatch, bound in shader layout order.
#[derive(Debug, Clone, Copy)]
pub struct DispatchArg {
    pub vref: ValueRef,
    pub access: MemoryAccess,
}

impl DispatchArg {
    pub fn read(vref: ValueRef) -> Self {
        Self {
            vref,
            access: MemoryAccess::Read,
        }
    }

    pub fn write(vref: ValueRef) -> Self {
        Self {
            vref,
            access: MemoryAccess::Write,
        }
    }
}

/// Builds the barrier guarding a dispatch's arguments: written resources
/// from previous stages must be visible before this stage reads or writes
/// them.
pub(crate) fn barrier_for_args(
    graph: &ComputeGraph,
    args: &[DispatchArg],
    src_stage: PipelineStage,
    dst_stage: PipelineStage,
) -> Result<PipelineBarrier> {
    let mut barrier = PipelineBarrier::new(src_stage, dst_stage);
    for arg in args {
        match graph.resource_binding_of(arg.vref)? {
            ResourceBinding::Buffer(buffer) => barrier.buffers.push(BufferMemoryBarrier {
                buffer,
                src_access: MemoryAccess::Write,
                dst_access: arg.access,
            }),
            ResourceBinding::Image(image) => barrier.images.push(ImageMemoryBarrier {
                image,
                src_access: MemoryAccess::Write,
                dst_access: arg.access,
            }),
        }
    }
    Ok(barrier)
}

/// An execute node that binds a pipeline and a descriptor set over its
/// arguments, inserts a barrier, and dispatches a grid covering its output.
pub struct DispatchNode {
    shader: ShaderInfo,
    args: Vec<DispatchArg>,
    global_wg_size: WorkgroupSize,
    local_wg_size: WorkgroupSize,
    /// When set, the global size is recomputed from this tensor at encode
    /// time, so a re-encode after a resize covers the new extent.
    sized_from: Option<ValueRef>,
    spec_constants: Vec<SpecConstant>,
    push_constants: Vec<PushConstant>,
    resize_fn: Option<ResizeFn>,
    resize_args: Vec<ValueRef>,
}

impl DispatchNode {
    pub fn new(
        shader: ShaderInfo,
        args: Vec<DispatchArg>,
        global_wg_size: WorkgroupSize,
        local_wg_size: WorkgroupSize,
    ) -> Self {
        Self {
            shader,
            args,
            global_wg_size,
            local_wg_size,
            sized_from: None,
            spec_constants: Vec::new(),
            push_constants: Vec::new(),
            resize_fn: None,
            resize_args: Vec::new(),
        }
    }

    /// Creates a node whose dispatch grid covers the given output tensor,
    /// recomputed at every encode.
    pub fn sized_for(
        graph: &ComputeGraph,
        shader: ShaderInfo,
        args: Vec<DispatchArg>,
        out: ValueRef,
    ) -> Result<Self> {
        let global_wg_size = graph.create_global_wg_size(out)?;
        let local_wg_size = graph.create_local_wg_size(global_wg_size);
        let mut node = Self::new(shader, args, global_wg_size, local_wg_size);
        node.sized_from = Some(out);
        Ok(node)
    }

    pub fn with_spec_constants(mut self, spec_constants: Vec<SpecConstant>) -> Self {
        self.spec_constants = spec_constants;
        self
    }

    pub fn with_push_constants(mut self, push_constants: Vec<PushConstant>) -> Self {
        self.push_constants = push_constants;
        self
    }

    pub fn with_resize_fn(mut self, resize_fn: ResizeFn, resize_args: Vec<ValueRef>) -> Self {
        self.resize_fn = Some(resize_fn);
        self.resize_args = resize_args;
        self
    }
}

impl ExecuteNode for DispatchNode {
    fn prepare_pipelines(&self, graph: &mut ComputeGraph) -> Result<()> {
        graph.update_descriptor_counts(&self.shader, Phase::Execute);
        graph.register_pipeline_to_create(
            &self.shader,
            self.local_wg_size,
            &self.spec_constants,
            &self.push_constants,
        )
    }

    fn encode(&self, graph: &mut ComputeGraph) -> Result<()> {
        if self.args.len() != self.shader.layout.len() {
            return Err(GraphError::BindingCountMismatch {
                shader: self.shader.name.clone(),
                layout_len: self.shader.layout.len(),
                bound: self.args.len(),
            });
        }

        let global_wg_size = match self.sized_from {
            Some(out) => graph.create_global_wg_size(out)?,
            None => self.global_wg_size,
        };
        let (pc_data, pc_len) = graph.write_push_constants(&self.push_constants)?;
        let (pipeline, pipeline_layout) = graph.pipeline_for(
            &self.shader,
            self.local_wg_size,
            &self.spec_constants,
            pc_len as u32,
        )?;

        let set = graph.allocate_descriptor_set_for(&self.shader)?;
        for (binding, arg) in self.args.iter().enumerate() {
            let resource = graph.resource_binding_of(arg.vref)?;
            graph.bind_resource(set, binding as u32, self.shader.layout[binding], resource)?;
        }
        let barrier = barrier_for_args(
            graph,
            &self.args,
            PipelineStage::Compute,
            PipelineStage::Compute,
        )?;

        let cmd = graph.current_cmd()?;
        cmd.bind_pipeline(pipeline, pipeline_layout, self.local_wg_size)?;
        cmd.bind_descriptors(set)?;
        cmd.set_push_constants(pipeline_layout, &pc_data[..pc_len])?;
        cmd.insert_barrier(&barrier)?;
        cmd.dispatch(global_wg_size)?;
        Ok(())
    }

    fn trigger_resize(&mut self, graph: &mut ComputeGraph) -> Result<()> {
        if let Some(resize_fn) = self.resize_fn {
            resize_fn(graph, &self.resize_args)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_config::GraphConfig;
    use crate::gpu::types::DescriptorType;
    use crate::gpu::virtual_device::RecordedCommand;
    use crate::gpu::VirtualDevice;
    use crate::values::{DataType, StorageType};
    use std::sync::Arc;

    #[test]
    fn test_dispatch_node_records_full_sequence() {
        let device = Arc::new(VirtualDevice::new());
        let mut graph = crate::ComputeGraph::new(
            GraphConfig::new()
                .with_device(device.clone())
                .with_storage_type_override(StorageType::Buffer),
        )
        .unwrap();

        let a = graph.add_tensor(vec![64], DataType::Float32, None).unwrap();
        let out = graph.add_tensor(vec![64], DataType::Float32, None).unwrap();
        let shader = ShaderInfo::new(
            "unary_op",
            vec![DescriptorType::StorageBuffer, DescriptorType::StorageBuffer],
        );
        let node = DispatchNode::sized_for(
            &graph,
            shader,
            vec![DispatchArg::write(out), DispatchArg::read(a)],
            out,
        )
        .unwrap()
        .with_push_constants(vec![PushConstant::TensorNumel(out)]);
        graph.add_execute_node(Box::new(node));

        graph.prepare().unwrap();
        graph.prepare_pipelines().unwrap();
        graph.encode_execute().unwrap();
        graph.execute().unwrap();

        let submissions = device.submissions();
        let commands = &submissions.last().unwrap().commands;
        assert!(matches!(commands[0], RecordedCommand::BindPipeline(_)));
        assert!(matches!(
            commands[1],
            RecordedCommand::BindDescriptorSet(_, _)
        ));
        assert!(matches!(commands[2], RecordedCommand::PushConstants(ref d) if d.len() == 4));
        assert!(matches!(
            commands[3],
            RecordedCommand::Barrier { buffer_count: 2, .. }
        ));
        // numel 64 with local (64, 1, 1) dispatches one group.
        assert!(matches!(commands[4], RecordedCommand::Dispatch([1, 1, 1])));
    }

    #[test]
    fn test_dispatch_node_rejects_binding_mismatch() {
        let device = Arc::new(VirtualDevice::new());
        let mut graph = crate::ComputeGraph::new(
            GraphConfig::new()
                .with_device(device)
                .with_storage_type_override(StorageType::Buffer),
        )
        .unwrap();
        let out = graph.add_tensor(vec![8], DataType::Float32, None).unwrap();
        let shader = ShaderInfo::new(
            "binary_op",
            vec![DescriptorType::StorageBuffer, DescriptorType::StorageBuffer],
        );
        let node =
            DispatchNode::sized_for(&graph, shader, vec![DispatchArg::write(out)], out).unwrap();
        graph.add_execute_node(Box::new(node));

        graph.prepare().unwrap();
        graph.prepare_pipelines().unwrap();
        let result = graph.encode_execute();
        assert!(matches!(
            result,
            Err(GraphError::BindingCountMismatch {
                layout_len: 2,
                bound: 1,
                ..
            })
        ));
    }
}
