// Descriptors - set layout, pool, the one set, and the pipeline layout
//
// Each drawable (and the compute binary) owns exactly one descriptor set.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// One binding slot in a set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

/// Uniform buffer for the vertex shader, plus the texture sampler when textured
pub fn drawable_bindings(textured: bool) -> Vec<DescriptorBinding> {
    let mut bindings = vec![DescriptorBinding {
        binding: 0,
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        stages: vk::ShaderStageFlags::VERTEX,
    }];
    if textured {
        bindings.push(DescriptorBinding {
            binding: 1,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            stages: vk::ShaderStageFlags::FRAGMENT,
        });
    }
    bindings
}

/// `count` storage buffers at bindings 0.., visible to the compute stage
pub fn storage_bindings(count: u32) -> Vec<DescriptorBinding> {
    (0..count)
        .map(|binding| DescriptorBinding {
            binding,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            stages: vk::ShaderStageFlags::COMPUTE,
        })
        .collect()
}

/// Pool sizes holding exactly one set of `bindings`
pub fn pool_sizes(bindings: &[DescriptorBinding]) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        match sizes.iter_mut().find(|size| size.ty == binding.ty) {
            Some(size) => size.descriptor_count += 1,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.ty,
                descriptor_count: 1,
            }),
        }
    }
    sizes
}

pub struct Descriptors {
    pub set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    device: Arc<VulkanDevice>,
}

impl Descriptors {
    pub fn new(device: Arc<VulkanDevice>, bindings: &[DescriptorBinding]) -> Result<Self> {
        let mut descriptors = Self {
            set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pool: vk::DescriptorPool::null(),
            set: vk::DescriptorSet::null(),
            device: device.clone(),
        };

        let layout_bindings: Vec<_> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(1)
                    .stage_flags(b.stages)
                    .build()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
        descriptors.set_layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;

        let set_layouts = [descriptors.set_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        descriptors.pipeline_layout =
            unsafe { device.device.create_pipeline_layout(&pipeline_layout_info, None) }
                .context("Failed to create pipeline layout")?;

        let sizes = pool_sizes(bindings);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(1)
            .pool_sizes(&sizes);
        descriptors.pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptors.pool)
            .set_layouts(&set_layouts);
        descriptors.set = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?
            .into_iter()
            .next()
            .context("Driver returned no descriptor set")?;

        Ok(descriptors)
    }

    pub fn write_buffer(&self, binding: u32, ty: vk::DescriptorType, info: vk::DescriptorBufferInfo) {
        let infos = [info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(&infos);
        unsafe { self.device.device.update_descriptor_sets(&[write.build()], &[]) };
    }

    pub fn write_image(&self, binding: u32, info: vk::DescriptorImageInfo) {
        let infos = [info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&infos);
        unsafe { self.device.device.update_descriptor_sets(&[write.build()], &[]) };
    }
}

impl Drop for Descriptors {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            // Destroying the pool frees the set
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn textured_drawable_layout() {
        let bindings = drawable_bindings(true);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(bindings[0].stages, vk::ShaderStageFlags::VERTEX);
        assert_eq!(bindings[1].binding, 1);
        assert_eq!(bindings[1].stages, vk::ShaderStageFlags::FRAGMENT);

        assert_eq!(drawable_bindings(false).len(), 1);
    }

    #[test]
    fn pool_holds_exactly_one_set() {
        let sizes = pool_sizes(&drawable_bindings(true));
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|s| s.descriptor_count == 1));

        let sizes = pool_sizes(&storage_bindings(2));
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 2);
    }
}
