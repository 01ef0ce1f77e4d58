//! WGSL shader sources for buffer-storage devices.
//!
//! Operator libraries ship their own kernels; this module only carries the
//! sources the runtime itself needs on devices that compile from WGSL.

/// Elementwise `out[i] = in[i] * 2.0` over two storage buffers. Fixed
/// 64-wide workgroups; dispatch with a local workgroup size of (64, 1, 1).
pub fn scale_buffer_wgsl() -> String {
    include_str!("scale_buffer.wgsl").to_string()
}
