// Error kinds callers may want to tell apart.
//
// Everything else travels as `anyhow::Error` with context attached at the
// failing Vulkan call. These variants are wrapped into `anyhow` too and can
// be recovered with `downcast_ref::<GpuError>()`.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GpuError {
    /// Every adapter scored below zero (or none were enumerated)
    #[error("No suitable GPU found")]
    NoSuitableAdapter,

    /// No memory type satisfies both the resource and the requested flags
    #[error("No memory type matches bits {type_bits:#b} with properties {flags:?}")]
    NoMatchingMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// Compiled shader binary is absent from the asset root
    #[error("Shader binary not found: {0}")]
    MissingShader(PathBuf),

    /// The window handle belongs to a platform we cannot create surfaces for
    #[error("Unsupported window system: {0}")]
    UnsupportedWindowSystem(String),

    /// The surface reported an empty format list
    #[error("Surface reports no formats")]
    NoSurfaceFormats,

    /// Vulkan buffers cannot be zero-sized
    #[error("Cannot upload an empty buffer")]
    EmptyUpload,

    /// Swapchain format differs from the one the render pass was built for
    #[error("Surface format changed from {old:?} to {new:?}")]
    SurfaceFormatChanged { old: vk::Format, new: vk::Format },
}
