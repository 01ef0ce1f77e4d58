//! The GPU API layer.
//!
//! The runtime drives compute hardware through the [`ComputeDevice`] trait:
//! an abstraction over a command-buffer-oriented compute API with pipelines,
//! descriptor sets, push constants, semaphores, and fences. On top of the
//! trait sit the command-buffer state machine ([`command`]) and the device
//! [`Context`] holding caches and the current recording.
//!
//! Two device implementations are provided:
//!
//! - [`VirtualDevice`]: a driverless software device that records command
//!   streams and executes transfers at submit time. All deterministic tests
//!   run against it.
//! - [`WgpuDevice`]: wgpu-backed execution for buffer-storage graphs.

pub mod command;
pub mod context;
pub mod device;
pub mod errors;
pub mod shaders;
pub mod types;
pub mod virtual_device;
pub mod wgpu_device;

pub use command::{CommandBuffer, CommandBufferState, CommandPool, CommandPoolConfig};
pub use context::Context;
pub use device::ComputeDevice;
pub use errors::{DeviceError, DeviceResult};
pub use virtual_device::VirtualDevice;
pub use wgpu_device::WgpuDevice;
