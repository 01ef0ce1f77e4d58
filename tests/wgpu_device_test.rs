//! Smoke test against a real wgpu adapter. Skips when no adapter is
//! available (e.g. headless CI).

use std::sync::Arc;

use gpugraph_runtime::gpu::shaders::scale_buffer_wgsl;
use gpugraph_runtime::gpu::types::{DescriptorType, ShaderInfo};
use gpugraph_runtime::gpu::WgpuDevice;
use gpugraph_runtime::nodes::{DispatchArg, DispatchNode};
use gpugraph_runtime::utils::WorkgroupSize;
use gpugraph_runtime::{ComputeGraph, DataType, GraphConfig, StorageType};

fn wgpu_device() -> Option<Arc<WgpuDevice>> {
    match WgpuDevice::new() {
        Ok(device) => Some(Arc::new(device)),
        Err(e) => {
            eprintln!("skipping wgpu test: {e}");
            None
        }
    }
}

#[test]
fn test_staging_roundtrip_on_wgpu() {
    let Some(device) = wgpu_device() else {
        return;
    };
    let mut graph = ComputeGraph::new(
        GraphConfig::new()
            .with_device(device)
            .with_storage_type_override(StorageType::Buffer),
    )
    .unwrap();

    let t = graph.add_tensor(vec![16], DataType::Float32, None).unwrap();
    let staging_in = graph.set_input_tensor(t, true).unwrap();
    let staging_out = graph.set_output_tensor(t, true).unwrap();

    graph.prepare().unwrap();
    graph.prepare_pipelines().unwrap();
    graph.prepack().unwrap();
    graph.encode_execute().unwrap();

    let data: Vec<f32> = (0..16).map(|v| v as f32 - 8.0).collect();
    graph
        .copy_into_staging(staging_in, bytemuck::cast_slice(&data), 16)
        .unwrap();
    graph.execute().unwrap();

    let mut out = vec![0.0f32; 16];
    graph
        .copy_from_staging(staging_out, bytemuck::cast_slice_mut(&mut out), 16)
        .unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_compute_dispatch_on_wgpu() {
    let Some(device) = wgpu_device() else {
        return;
    };
    let mut graph = ComputeGraph::new(
        GraphConfig::new()
            .with_device(device)
            .with_storage_type_override(StorageType::Buffer)
            .with_local_wg_size_override(WorkgroupSize::new(64, 1, 1)),
    )
    .unwrap();

    let input = graph.add_tensor(vec![64], DataType::Float32, None).unwrap();
    let staging_in = graph.set_input_tensor(input, true).unwrap();
    let output = graph.add_tensor(vec![64], DataType::Float32, None).unwrap();

    let shader = ShaderInfo::new(
        "scale_buffer",
        vec![DescriptorType::StorageBuffer, DescriptorType::StorageBuffer],
    )
    .with_wgsl(scale_buffer_wgsl());
    let node = DispatchNode::sized_for(
        &graph,
        shader,
        vec![DispatchArg::write(output), DispatchArg::read(input)],
        output,
    )
    .unwrap();
    graph.add_execute_node(Box::new(node));
    let staging_out = graph.set_output_tensor(output, true).unwrap();

    graph.prepare().unwrap();
    graph.prepare_pipelines().unwrap();
    graph.prepack().unwrap();
    graph.encode_execute().unwrap();

    let data: Vec<f32> = (0..64).map(|v| v as f32 * 0.25).collect();
    graph
        .copy_into_staging(staging_in, bytemuck::cast_slice(&data), 64)
        .unwrap();
    graph.execute().unwrap();

    let mut out = vec![0.0f32; 64];
    graph
        .copy_from_staging(staging_out, bytemuck::cast_slice_mut(&mut out), 64)
        .unwrap();
    let expected: Vec<f32> = data.iter().map(|v| v * 2.0).collect();
    assert_eq!(out, expected);
}
