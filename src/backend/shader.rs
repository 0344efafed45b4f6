// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. The bytecode is read from disk
// once at startup; modules are created per pipeline build and dropped as
// soon as the pipeline exists.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::RendererError;

/// SPIR-V words for one shader stage
#[derive(Debug, Clone)]
pub struct ShaderCode {
    pub words: Vec<u32>,
}

impl ShaderCode {
    /// Read a precompiled SPIR-V file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RendererError> {
        let path = path.as_ref();
        let fail = |source| RendererError::ShaderLoadFailed {
            path: path.to_path_buf(),
            source,
        };

        let bytes = std::fs::read(path).map_err(fail)?;
        log::info!("Opened shader {:?} ({} bytes)", path, bytes.len());

        Self::from_bytes(&bytes).map_err(fail)
    }

    /// Words are re-aligned, so any byte buffer is accepted as long as
    /// its length is a multiple of four.
    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<Self> {
        let words = ash::util::read_spv(&mut Cursor::new(bytes))?;
        Ok(Self { words })
    }
}

/// Vertex and fragment stages of the triangle pipeline
#[derive(Debug, Clone)]
pub struct ShaderSet {
    pub vertex: ShaderCode,
    pub fragment: ShaderCode,
}

impl ShaderSet {
    pub fn load<P: AsRef<Path>>(vertex: P, fragment: P) -> Result<Self, RendererError> {
        Ok(Self {
            vertex: ShaderCode::load(vertex)?,
            fragment: ShaderCode::load(fragment)?,
        })
    }
}

/// Owned shader module
pub struct ShaderModule {
    device: Arc<VulkanDevice>,
    pub handle: vk::ShaderModule,
}

impl ShaderModule {
    pub fn new(device: &Arc<VulkanDevice>, code: &ShaderCode) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code.words);

        let handle = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn temp_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "swapchain-renderer-{}-{}",
            std::process::id(),
            name
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_word_aligned_spirv() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        let path = temp_file("valid.spv", &bytes);

        let code = ShaderCode::load(&path).unwrap();
        assert_eq!(code.words, vec![SPIRV_MAGIC, 0x0001_0000]);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_is_shader_load_failure() {
        let err = ShaderCode::load("no/such/shader.spv").unwrap_err();
        match err {
            RendererError::ShaderLoadFailed { path, .. } => {
                assert_eq!(path, Path::new("no/such/shader.spv"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn truncated_bytecode_is_rejected() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0xAB);
        let path = temp_file("truncated.spv", &bytes);

        let err = ShaderCode::load(&path).unwrap_err();
        assert!(matches!(err, RendererError::ShaderLoadFailed { .. }));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn shader_set_fails_on_first_missing_stage() {
        let err = ShaderSet::load("missing.vert.spv", "missing.frag.spv").unwrap_err();
        assert!(err.to_string().contains("missing.vert.spv"));
    }
}
