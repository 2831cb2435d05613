// Shader module loading
//
// Vulkan uses SPIR-V bytecode for shaders. The binaries are produced by the
// asset build (see build.rs) and read from disk at connect time.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use crate::error::GpuError;

/// Read a compiled SPIR-V binary into 32-bit words.
///
/// A missing file is a `GpuError::MissingShader`.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(GpuError::MissingShader(path.to_path_buf()).into());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read shader {:?}", path));
        }
    };

    // read_spv copes with unaligned input and checks the magic number
    ash::util::read_spv(&mut Cursor::new(bytes))
        .with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

/// Shader module that is destroyed with its owner; only needed until the
/// pipeline has been built.
pub struct ShaderModule {
    pub handle: vk::ShaderModule,
    device: ash::Device,
}

impl ShaderModule {
    pub fn new(device: &ash::Device, code: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let handle = unsafe { device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self {
            handle,
            device: device.clone(),
        })
    }

    pub fn from_file(device: &ash::Device, path: &Path) -> Result<Self> {
        log::debug!("Loading shader {:?}", path);
        let code = load_spirv(path)?;
        Self::new(device, &code)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_reported_as_such() {
        let path = Path::new("no/such/dir/mesh.vert.spv");
        let err = load_spirv(path).unwrap_err();
        match err.downcast_ref::<GpuError>() {
            Some(GpuError::MissingShader(missing)) => assert_eq!(missing, path),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        let path = std::env::temp_dir().join(format!("ember-garbage-{}.spv", std::process::id()));
        std::fs::write(&path, b"not spirv").unwrap();
        let result = load_spirv(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn valid_header_round_trips_to_words() {
        let path = std::env::temp_dir().join(format!("ember-valid-{}.spv", std::process::id()));
        let words: [u32; 2] = [0x0723_0203, 0x0001_0000];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        std::fs::write(&path, &bytes).unwrap();
        let loaded = load_spirv(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.unwrap(), words);
    }
}
