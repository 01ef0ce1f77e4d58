//! End-to-end graph construction and execution on the virtual device.

use std::sync::Arc;

use gpugraph_runtime::gpu::types::{DescriptorType, ShaderInfo};
use gpugraph_runtime::gpu::virtual_device::RecordedCommand;
use gpugraph_runtime::gpu::VirtualDevice;
use gpugraph_runtime::nodes::{ConstantUploadNode, DispatchArg, DispatchNode};
use gpugraph_runtime::{ComputeGraph, DataType, GraphConfig, StorageType};

fn f32_bytes(data: &[f32]) -> Arc<[u8]> {
    bytemuck::cast_slice::<f32, u8>(data).to_vec().into()
}

fn buffer_graph(device: &Arc<VirtualDevice>) -> ComputeGraph {
    ComputeGraph::new(
        GraphConfig::new()
            .with_device(device.clone())
            .with_storage_type_override(StorageType::Buffer),
    )
    .unwrap()
}

/// Builds a small linear-layer-shaped graph: a staged input, one uploaded
/// constant, a dispatch producing an output, and a staged output.
struct LinearGraph {
    graph: ComputeGraph,
    staging_in: usize,
    staging_out: usize,
    input: usize,
    weights: usize,
}

fn build_linear_graph(device: &Arc<VirtualDevice>, weights_data: &[f32]) -> LinearGraph {
    let mut graph = buffer_graph(device);

    let input = graph
        .add_tensor(vec![1, 4], DataType::Float32, None)
        .unwrap();
    let staging_in = graph.set_input_tensor(input, true).unwrap();

    let weights_ref = graph
        .add_tensorref(vec![4, 4], DataType::Float32, f32_bytes(weights_data))
        .unwrap();
    let weights = graph
        .add_tensor(vec![4, 4], DataType::Float32, None)
        .unwrap();
    graph.add_prepack_node(Box::new(ConstantUploadNode::new(weights_ref, weights)));

    let output = graph
        .add_tensor(vec![1, 4], DataType::Float32, None)
        .unwrap();
    let shader = ShaderInfo::new(
        "linear",
        vec![
            DescriptorType::StorageBuffer,
            DescriptorType::StorageBuffer,
            DescriptorType::StorageBuffer,
        ],
    );
    let node = DispatchNode::sized_for(
        &graph,
        shader,
        vec![
            DispatchArg::write(output),
            DispatchArg::read(input),
            DispatchArg::read(weights),
        ],
        output,
    )
    .unwrap();
    graph.add_execute_node(Box::new(node));
    let staging_out = graph.set_output_tensor(output, true).unwrap();

    LinearGraph {
        graph,
        staging_in,
        staging_out,
        input,
        weights,
    }
}

#[test]
fn test_full_pipeline_phases_run_in_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(VirtualDevice::new());
    let weights = [0.5f32; 16];
    let mut lg = build_linear_graph(&device, &weights);

    assert_eq!(lg.graph.num_prepack_nodes(), 1);
    // Input transfer, dispatch, output transfer.
    assert_eq!(lg.graph.num_execute_nodes(), 3);
    assert_eq!(lg.graph.total_constant_nbytes(), 64);

    lg.graph.prepare().unwrap();
    lg.graph.prepare_pipelines().unwrap();
    assert!(device.pipeline_count() >= 1);

    lg.graph.prepack().unwrap();
    // The constant upload landed in the weights tensor.
    let weights_buffer = lg
        .graph
        .get_tensor(lg.weights)
        .unwrap()
        .buffer_handle()
        .unwrap();
    assert_eq!(
        device.buffer_contents(weights_buffer).unwrap(),
        bytemuck::cast_slice::<f32, u8>(&weights).to_vec()
    );

    lg.graph.encode_execute().unwrap();

    let input = [1.0f32, 2.0, 3.0, 4.0];
    lg.graph
        .copy_into_staging(lg.staging_in, bytemuck::cast_slice(&input), 4)
        .unwrap();
    lg.graph.execute().unwrap();
    assert_eq!(lg.graph.execute_count(), 1);

    // The staged input reached the input tensor through the execute chain.
    let input_buffer = lg
        .graph
        .get_tensor(lg.input)
        .unwrap()
        .buffer_handle()
        .unwrap();
    assert_eq!(
        device.buffer_contents(input_buffer).unwrap(),
        bytemuck::cast_slice::<f32, u8>(&input).to_vec()
    );

    // The execute submission carries the full recorded sequence: two
    // transfers around one dispatch.
    let submissions = device.submissions();
    let execute_submission = submissions.last().unwrap();
    let copies = execute_submission
        .commands
        .iter()
        .filter(|c| matches!(c, RecordedCommand::CopyBuffer { .. }))
        .count();
    let dispatches = execute_submission
        .commands
        .iter()
        .filter(|c| matches!(c, RecordedCommand::Dispatch(_)))
        .count();
    assert_eq!(copies, 2);
    assert_eq!(dispatches, 1);
}

#[test]
fn test_staging_roundtrip_through_tensor() {
    let device = Arc::new(VirtualDevice::new());
    let mut graph = buffer_graph(&device);

    let t = graph.add_tensor(vec![3, 3], DataType::Float32, None).unwrap();
    let staging_in = graph.set_input_tensor(t, true).unwrap();
    let staging_out = graph.set_output_tensor(t, true).unwrap();

    graph.prepare().unwrap();
    graph.prepare_pipelines().unwrap();
    graph.prepack().unwrap();
    graph.encode_execute().unwrap();

    let data: Vec<f32> = (0..9).map(|v| v as f32 * 1.5 - 2.0).collect();
    graph
        .copy_into_staging(staging_in, bytemuck::cast_slice(&data), data.len())
        .unwrap();
    graph.execute().unwrap();

    let mut out = vec![0.0f32; 9];
    graph
        .copy_from_staging(staging_out, bytemuck::cast_slice_mut(&mut out), 9)
        .unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_execute_chain_signals_semaphores_and_final_fence() {
    let device = Arc::new(VirtualDevice::new());
    let mut graph = buffer_graph(&device);

    let t = graph.add_tensor(vec![4], DataType::Float32, None).unwrap();
    graph.set_input_tensor(t, true).unwrap();
    graph.set_output_tensor(t, true).unwrap();

    graph.prepare().unwrap();
    graph.prepare_pipelines().unwrap();
    graph.prepack().unwrap();
    graph.encode_execute().unwrap();
    graph.execute().unwrap();

    let submissions = device.submissions();
    let execute_submission = submissions.last().unwrap();
    assert!(execute_submission.signal_semaphore.is_some());
    assert!(execute_submission.fence.is_some());
}

#[test]
fn test_value_refs_stay_dense_across_mixed_adds() {
    let device = Arc::new(VirtualDevice::new());
    let mut graph = buffer_graph(&device);

    let mut refs = Vec::new();
    refs.push(graph.add_tensor(vec![2], DataType::Float32, None).unwrap());
    refs.push(graph.add_staging(DataType::Float32, 2).unwrap());
    refs.push(graph.add_none());
    refs.push(graph.add_scalar(1i64));
    refs.push(graph.add_symint(9).unwrap());
    refs.push(
        graph
            .add_tensorref(vec![2], DataType::Float32, f32_bytes(&[1.0, 2.0]))
            .unwrap(),
    );
    let list_elems = vec![refs[3]];
    refs.push(graph.add_value_list(list_elems));
    assert_eq!(refs, (0..7).collect::<Vec<_>>());
}

#[test]
fn test_multiple_executes_reuse_recorded_buffer() {
    let device = Arc::new(VirtualDevice::new());
    let mut graph = buffer_graph(&device);

    let t = graph.add_tensor(vec![8], DataType::Float32, None).unwrap();
    let staging_in = graph.set_input_tensor(t, true).unwrap();
    let staging_out = graph.set_output_tensor(t, true).unwrap();

    graph.prepare().unwrap();
    graph.prepare_pipelines().unwrap();
    graph.prepack().unwrap();
    graph.encode_execute().unwrap();

    for round in 1..=4 {
        let data = vec![round as f32; 8];
        graph
            .copy_into_staging(staging_in, bytemuck::cast_slice(&data), 8)
            .unwrap();
        graph.execute().unwrap();
        let mut out = vec![0.0f32; 8];
        graph
            .copy_from_staging(staging_out, bytemuck::cast_slice_mut(&mut out), 8)
            .unwrap();
        assert_eq!(out, data);
    }
    assert_eq!(graph.execute_count(), 4);
}
