//! Graph nodes.
//!
//! A node is either a [`PrepackNode`] (records one-shot constant uploads
//! during the prepack phase) or an [`ExecuteNode`] (records dispatches into
//! the reusable execute command buffer). During `prepare_pipelines` a node
//! calls back into the graph to register its shader's descriptor demand and
//! its pipeline descriptor; during `encode` it records device commands
//! through the graph's current command buffer.

pub mod dispatch_node;
pub mod push_constants;
pub mod staging_nodes;

pub use dispatch_node::{DispatchArg, DispatchNode, ResizeFn};
pub use push_constants::PushConstant;
pub use staging_nodes::{ConstantUploadNode, StagingToTensorNode, TensorToStagingNode};

use crate::compute_graph::ComputeGraph;
use crate::errors::Result;

/// A node that records constant uploads during the prepack phase.
pub trait PrepackNode: Send + Sync {
    /// Registers descriptor demand and pipeline descriptors with the graph.
    fn prepare_pipelines(&self, graph: &mut ComputeGraph) -> Result<()>;

    /// Records this node's upload into the graph's current command buffer,
    /// accumulating its staging footprint into the graph's running counter.
    fn encode(&self, graph: &mut ComputeGraph) -> Result<()>;
}

/// A node that records per-invocation work during the execute phase.
pub trait ExecuteNode: Send + Sync {
    /// Registers descriptor demand and pipeline descriptors with the graph.
    fn prepare_pipelines(&self, graph: &mut ComputeGraph) -> Result<()>;

    /// Records this node's dispatches into the graph's current command
    /// buffer.
    fn encode(&self, graph: &mut ComputeGraph) -> Result<()>;

    /// Recomputes downstream tensor sizes after an input resize.
    fn trigger_resize(&mut self, _graph: &mut ComputeGraph) -> Result<()> {
        Ok(())
    }
}
