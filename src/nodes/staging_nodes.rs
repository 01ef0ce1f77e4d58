//! Transfer nodes: constant uploads and staging I/O.
//!
//! Buffer-backed tensors transfer with plain buffer copies; texture-backed
//! tensors go through the packing transfer shaders, whose kernels live in
//! the operator library.

use crate::compute_graph::{ComputeGraph, Phase};
use crate::errors::{GraphError, Result};
use crate::gpu::types::{
    BufferMemoryBarrier, DescriptorType, MemoryAccess, PipelineBarrier, PipelineStage,
    ResourceBinding, ShaderInfo,
};
use crate::values::{StagingBuffer, ValueRef};

use super::{ExecuteNode, PrepackNode, PushConstant};

fn nchw_to_image_shader() -> ShaderInfo {
    ShaderInfo::new(
        "nchw_to_image",
        vec![DescriptorType::StorageImage, DescriptorType::StorageBuffer],
    )
}

fn image_to_nchw_shader() -> ShaderInfo {
    ShaderInfo::new(
        "image_to_nchw",
        vec![
            DescriptorType::StorageBuffer,
            DescriptorType::CombinedImageSampler,
        ],
    )
}

fn transfer_barrier(src: ResourceBinding, dst: ResourceBinding) -> PipelineBarrier {
    let mut barrier = PipelineBarrier::new(PipelineStage::Transfer, PipelineStage::Transfer);
    for (resource, dst_access) in [(src, MemoryAccess::Read), (dst, MemoryAccess::Write)] {
        if let ResourceBinding::Buffer(buffer) = resource {
            barrier.buffers.push(BufferMemoryBarrier {
                buffer,
                src_access: MemoryAccess::Write,
                dst_access,
            });
        }
    }
    barrier
}

fn register_transfer_pipeline(
    graph: &mut ComputeGraph,
    shader: &ShaderInfo,
    tensor: ValueRef,
    phase: Phase,
) -> Result<()> {
    graph.update_descriptor_counts(shader, phase);
    let local_wg_size = graph.create_local_wg_size_for(tensor)?;
    graph.register_pipeline_to_create(
        shader,
        local_wg_size,
        &[],
        &[PushConstant::TensorSizes(tensor)],
    )
}

/// Dispatches a packing transfer shader between a texture tensor and a
/// staging source or destination buffer.
fn encode_transfer_dispatch(
    graph: &mut ComputeGraph,
    shader: &ShaderInfo,
    tensor: ValueRef,
    staging: ResourceBinding,
) -> Result<()> {
    let global_wg_size = graph.create_global_wg_size(tensor)?;
    let local_wg_size = graph.create_local_wg_size(global_wg_size);
    let push_constants = [PushConstant::TensorSizes(tensor)];
    let (pc_data, pc_len) = graph.write_push_constants(&push_constants)?;
    let (pipeline, pipeline_layout) =
        graph.pipeline_for(shader, local_wg_size, &[], pc_len as u32)?;

    let set = graph.allocate_descriptor_set_for(shader)?;
    let tensor_resource = graph.resource_binding_of(tensor)?;
    graph.bind_resource(set, 0, shader.layout[0], tensor_resource)?;
    graph.bind_resource(set, 1, shader.layout[1], staging)?;

    let barrier = transfer_barrier(staging, tensor_resource);
    let cmd = graph.current_cmd()?;
    cmd.bind_pipeline(pipeline, pipeline_layout, local_wg_size)?;
    cmd.bind_descriptors(set)?;
    cmd.set_push_constants(pipeline_layout, &pc_data[..pc_len])?;
    cmd.insert_barrier(&barrier)?;
    cmd.dispatch(global_wg_size)?;
    Ok(())
}

fn tensor_buffer_handle(graph: &ComputeGraph, tensor: ValueRef) -> Result<crate::gpu::types::BufferHandle> {
    graph
        .get_tensor(tensor)?
        .buffer_handle()
        .ok_or(GraphError::MissingTensorStorage {
            index: tensor,
            resource: "buffer",
        })
}

/// Prepack node that uploads a constant TensorRef into its packed device
/// tensor through a transient staging buffer. The staging footprint is
/// accumulated into the graph's running counter so `prepack()` can split
/// command buffers under the configured budget.
pub struct ConstantUploadNode {
    tref: ValueRef,
    packed: ValueRef,
}

impl ConstantUploadNode {
    pub fn new(tref: ValueRef, packed: ValueRef) -> Self {
        Self { tref, packed }
    }
}

impl PrepackNode for ConstantUploadNode {
    fn prepare_pipelines(&self, graph: &mut ComputeGraph) -> Result<()> {
        if !graph.is_buffer_storage(self.packed)? {
            register_transfer_pipeline(
                graph,
                &nchw_to_image_shader(),
                self.packed,
                Phase::Prepack,
            )?;
        }
        Ok(())
    }

    fn encode(&self, graph: &mut ComputeGraph) -> Result<()> {
        let (dtype, buf_numel, is_buffer) = {
            let tensor = graph.get_tensor(self.packed)?;
            (
                tensor.dtype(),
                tensor.staging_buffer_numel(),
                tensor.storage_type().is_buffer(),
            )
        };
        let (data, nbytes) = {
            let tref = graph.get_tensor_ref(self.tref)?;
            (tref.clone_data(), tref.nbytes())
        };

        let staging = StagingBuffer::new(graph.device(), dtype, buf_numel)?;
        staging.copy_from(&data, nbytes)?;

        if is_buffer {
            let dst = tensor_buffer_handle(graph, self.packed)?;
            let barrier = transfer_barrier(
                ResourceBinding::Buffer(staging.buffer()),
                ResourceBinding::Buffer(dst),
            );
            let cmd = graph.current_cmd()?;
            cmd.insert_barrier(&barrier)?;
            cmd.copy_buffer(staging.buffer(), dst, nbytes)?;
        } else {
            encode_transfer_dispatch(
                graph,
                &nchw_to_image_shader(),
                self.packed,
                ResourceBinding::Buffer(staging.buffer()),
            )?;
        }

        graph.count_staging_nbytes(staging.nbytes());
        graph.retain_staging(staging);
        Ok(())
    }
}

/// Execute node that moves a bound input's staging contents into its
/// tensor on every graph invocation.
pub struct StagingToTensorNode {
    staging: ValueRef,
    tensor: ValueRef,
}

impl StagingToTensorNode {
    pub fn new(staging: ValueRef, tensor: ValueRef) -> Self {
        Self { staging, tensor }
    }
}

impl ExecuteNode for StagingToTensorNode {
    fn prepare_pipelines(&self, graph: &mut ComputeGraph) -> Result<()> {
        if !graph.is_buffer_storage(self.tensor)? {
            register_transfer_pipeline(
                graph,
                &nchw_to_image_shader(),
                self.tensor,
                Phase::Execute,
            )?;
        }
        Ok(())
    }

    fn encode(&self, graph: &mut ComputeGraph) -> Result<()> {
        if graph.is_buffer_storage(self.tensor)? {
            let src = graph.get_staging(self.staging)?.buffer();
            let dst = tensor_buffer_handle(graph, self.tensor)?;
            let nbytes = graph.get_tensor(self.tensor)?.nbytes();
            let barrier =
                transfer_barrier(ResourceBinding::Buffer(src), ResourceBinding::Buffer(dst));
            let cmd = graph.current_cmd()?;
            cmd.insert_barrier(&barrier)?;
            cmd.copy_buffer(src, dst, nbytes)?;
            return Ok(());
        }
        let staging = graph.resource_binding_of(self.staging)?;
        encode_transfer_dispatch(graph, &nchw_to_image_shader(), self.tensor, staging)
    }
}

/// Execute node that moves a bound output's tensor contents into its
/// staging buffer on every graph invocation.
pub struct TensorToStagingNode {
    tensor: ValueRef,
    staging: ValueRef,
}

impl TensorToStagingNode {
    pub fn new(tensor: ValueRef, staging: ValueRef) -> Self {
        Self { tensor, staging }
    }
}

impl ExecuteNode for TensorToStagingNode {
    fn prepare_pipelines(&self, graph: &mut ComputeGraph) -> Result<()> {
        if !graph.is_buffer_storage(self.tensor)? {
            register_transfer_pipeline(
                graph,
                &image_to_nchw_shader(),
                self.tensor,
                Phase::Execute,
            )?;
        }
        Ok(())
    }

    fn encode(&self, graph: &mut ComputeGraph) -> Result<()> {
        if graph.is_buffer_storage(self.tensor)? {
            let src = tensor_buffer_handle(graph, self.tensor)?;
            let dst = graph.get_staging(self.staging)?.buffer();
            let nbytes = graph.get_tensor(self.tensor)?.nbytes();
            let barrier =
                transfer_barrier(ResourceBinding::Buffer(src), ResourceBinding::Buffer(dst));
            let cmd = graph.current_cmd()?;
            cmd.insert_barrier(&barrier)?;
            cmd.copy_buffer(src, dst, nbytes)?;
            return Ok(());
        }
        let staging = graph.resource_binding_of(self.staging)?;
        encode_transfer_dispatch(graph, &image_to_nchw_shader(), self.tensor, staging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_config::GraphConfig;
    use crate::gpu::VirtualDevice;
    use crate::values::{DataType, MemoryLayout, StorageType};
    use std::sync::Arc;

    #[test]
    fn test_constant_upload_to_texture_registers_prepack_demand() {
        let device = Arc::new(VirtualDevice::new());
        let mut graph = crate::ComputeGraph::new(GraphConfig::new().with_device(device)).unwrap();

        let data: Arc<[u8]> = vec![0u8; 4 * 12].into();
        let tref = graph
            .add_tensorref(vec![3, 4], DataType::Float32, data)
            .unwrap();
        let packed = graph
            .add_tensor_with_storage_and_layout(
                vec![3, 4],
                DataType::Float32,
                StorageType::Texture3D,
                MemoryLayout::WidthPacked,
                None,
            )
            .unwrap();
        graph.add_prepack_node(Box::new(ConstantUploadNode::new(tref, packed)));

        graph.prepare_pipelines().unwrap();
        graph.prepare().unwrap();
        graph.prepack().unwrap();
        assert_eq!(graph.total_constant_nbytes(), 48);
    }

    #[test]
    fn test_texture_input_transfer_dispatches_packing_shader() {
        let device = Arc::new(VirtualDevice::new());
        let mut graph = crate::ComputeGraph::new(GraphConfig::new().with_device(device.clone()))
            .unwrap();

        let t = graph
            .add_tensor(vec![2, 4, 4], DataType::Float32, None)
            .unwrap();
        let staging = graph.set_input_tensor(t, true).unwrap();
        // Texture staging is padded to whole texels.
        assert_eq!(graph.get_staging(staging).unwrap().numel(), 4 * 4 * 4);

        graph.prepare_pipelines().unwrap();
        graph.prepare().unwrap();
        graph.encode_execute().unwrap();
        graph.execute().unwrap();

        let submissions = device.submissions();
        let dispatched = submissions
            .last()
            .unwrap()
            .commands
            .iter()
            .any(|c| matches!(c, crate::gpu::virtual_device::RecordedCommand::Dispatch(_)));
        assert!(dispatched);
    }
}
