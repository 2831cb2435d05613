// GPU core of a small real-time renderer: adapter selection, logical device
// and queues, swapchain lifecycle, frames in flight, staged buffer uploads
// and indexed mesh drawing on Vulkan.

pub mod backend;
pub mod config;
pub mod error;
pub mod mesh;
pub mod renderer;

pub use config::Config;
pub use error::GpuError;
pub use mesh::{Mesh, MeshIndex, Vertex};
pub use renderer::Renderer;
