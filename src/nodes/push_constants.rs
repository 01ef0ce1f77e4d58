//! Push constant contributions.
//!
//! A node carries an ordered list of contributions; each writes its bytes
//! into a bounded buffer at encode time. Tensor-derived contributions read
//! the tensor's current metadata, so a re-encode after a resize picks up
//! fresh values.

use crate::compute_graph::ComputeGraph;
use crate::errors::{GraphError, Result};
use crate::gpu::types::MAX_PUSH_CONSTANT_SIZE;
use crate::values::tensor::size_at_whcn;
use crate::values::ValueRef;

/// One push constant contribution.
#[derive(Debug, Clone)]
pub enum PushConstant {
    /// Raw bytes, written verbatim.
    Data(Vec<u8>),
    /// The tensor's sizes in WHCN order, written as four `i32`s.
    TensorSizes(ValueRef),
    /// The tensor's element count, written as one `u32`.
    TensorNumel(ValueRef),
}

impl PushConstant {
    /// Writes this contribution at `offset`, returning the number of bytes
    /// appended.
    pub fn write(&self, graph: &ComputeGraph, out: &mut [u8], offset: usize) -> Result<usize> {
        let bytes: Vec<u8> = match self {
            PushConstant::Data(data) => data.clone(),
            PushConstant::TensorSizes(vref) => {
                let sizes = graph.sizes_of(*vref)?;
                let whcn = [
                    size_at_whcn(-1, &sizes) as i32,
                    size_at_whcn(-2, &sizes) as i32,
                    size_at_whcn(-3, &sizes) as i32,
                    size_at_whcn(-4, &sizes) as i32,
                ];
                bytemuck::cast_slice(&whcn).to_vec()
            }
            PushConstant::TensorNumel(vref) => {
                let numel = graph.numel_of(*vref)? as u32;
                bytemuck::bytes_of(&numel).to_vec()
            }
        };
        if offset + bytes.len() > out.len() || offset + bytes.len() > MAX_PUSH_CONSTANT_SIZE {
            return Err(GraphError::PushConstantOverflow {
                max: MAX_PUSH_CONSTANT_SIZE,
            });
        }
        out[offset..offset + bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}
