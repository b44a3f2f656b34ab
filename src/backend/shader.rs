// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. Modules only need to live until
// the pipelines using them are built.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;

use super::VulkanDevice;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Entry point every shader in this crate uses
pub const ENTRY_POINT: &CStr = c"main";

/// Turn raw bytes into SPIR-V words (either endianness)
pub fn read_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut std::io::Cursor::new(bytes))
        .context("SPIR-V size is not a multiple of four bytes")?;

    anyhow::ensure!(
        words.first() == Some(&SPIRV_MAGIC),
        "Missing SPIR-V magic number"
    );
    Ok(words)
}

pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {:?} (was glslc available at build time?)", path))?;
    read_spirv(&bytes).with_context(|| format!("Invalid shader {:?}", path))
}

pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    let module = unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")?;
    Ok(module)
}

/// The shader stages of one pipeline
pub struct ShaderSet {
    modules: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    device: Arc<VulkanDevice>,
}

impl ShaderSet {
    pub fn new(device: Arc<VulkanDevice>) -> Self {
        Self {
            modules: Vec::new(),
            device,
        }
    }

    /// Build a set from `(stage, path)` pairs of compiled SPIR-V files
    pub fn from_files(device: Arc<VulkanDevice>, stages: &[(vk::ShaderStageFlags, &Path)]) -> Result<Self> {
        let mut set = Self::new(device);
        for &(stage, path) in stages {
            let code = load_spirv(path)?;
            set.add(stage, &code)?;
            log::debug!("Loaded {:?} shader from {:?}", stage, path);
        }
        Ok(set)
    }

    pub fn add(&mut self, stage: vk::ShaderStageFlags, code: &[u32]) -> Result<()> {
        let module = create_shader_module(&self.device, code)?;
        self.modules.push((stage, module));
        Ok(())
    }

    /// Stage descriptions for pipeline creation, valid while `self` lives
    pub fn stages(&self) -> Vec<vk::PipelineShaderStageCreateInfo> {
        self.modules
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage)
                    .module(module)
                    .name(ENTRY_POINT)
                    .build()
            })
            .collect()
    }
}

impl Drop for ShaderSet {
    fn drop(&mut self) {
        for &(_, module) in &self.modules {
            unsafe { self.device.device.destroy_shader_module(module, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn reads_little_endian_module() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        let words = read_spirv(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[1], 0x0001_0000);
    }

    #[test]
    fn byte_swapped_module_is_normalized() {
        let bytes: Vec<u8> = [SPIRV_MAGIC, 0x0001_0000]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        let words = read_spirv(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_or_foreign_data() {
        let mut bytes = module_bytes(&[SPIRV_MAGIC, 1]);
        bytes.pop();
        assert!(read_spirv(&bytes).is_err());

        assert!(read_spirv(&module_bytes(&[0xdead_beef, 1])).is_err());
        assert!(read_spirv(&[]).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.spv");
        let err = load_spirv(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.spv"));
    }
}
