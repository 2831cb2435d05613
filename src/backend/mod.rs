// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Ownership: Instance <- Surface <- DeviceContext <- everything else, via Arc

pub mod adapter;
pub mod device;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod upload;

pub use adapter::{select_adapter, AdapterCandidate, QueueFamilyIndices};
pub use device::DeviceContext;
pub use instance::Instance;
pub use surface::{Surface, SurfaceBackend};
pub use swapchain::Swapchain;
pub use upload::{BufferId, BufferRegistry, BufferUploader, GpuBuffer};
