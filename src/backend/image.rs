// Images - depth buffer and layout transitions
//
// Images are bound to raw device memory picked with
// `memory_type_from_properties`; buffers go through gpu-allocator instead.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::CommandPool;
use super::VulkanDevice;

/// Depth formats tried in order when none is configured
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

/// Pick the depth format: the requested one, else the first candidate the
/// device can attach, else D16_UNORM (always supported).
pub fn select_depth_format(
    requested: Option<vk::Format>,
    supported: impl Fn(vk::Format) -> bool,
) -> vk::Format {
    if let Some(format) = requested {
        if supported(format) {
            return format;
        }
        log::warn!("Depth format {:?} unsupported, picking another", format);
    }

    DEPTH_FORMAT_CANDIDATES
        .into_iter()
        .find(|&format| supported(format))
        .unwrap_or(vk::Format::D16_UNORM)
}

/// Aspect flags for a depth format; formats with a stencil part get STENCIL too
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// Access masks and pipeline stages for one layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    pub fn new(old: vk::ImageLayout, new: vk::ImageLayout) -> Self {
        let mut src_access = match old {
            vk::ImageLayout::PREINITIALIZED => vk::AccessFlags::HOST_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            _ => vk::AccessFlags::empty(),
        };

        let dst_access = match new {
            vk::ImageLayout::TRANSFER_DST_OPTIMAL | vk::ImageLayout::PRESENT_SRC_KHR => {
                vk::AccessFlags::TRANSFER_WRITE
            }
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
                // Flush the copy, or the host writes of a linear image
                if old != vk::ImageLayout::PREINITIALIZED {
                    src_access = vk::AccessFlags::TRANSFER_WRITE;
                }
                vk::AccessFlags::SHADER_READ
            }
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_READ,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            _ => vk::AccessFlags::empty(),
        };

        Self {
            src_access,
            dst_access,
            src_stage: stage_for(src_access, vk::PipelineStageFlags::TOP_OF_PIPE),
            dst_stage: stage_for(dst_access, vk::PipelineStageFlags::BOTTOM_OF_PIPE),
        }
    }
}

fn stage_for(access: vk::AccessFlags, none: vk::PipelineStageFlags) -> vk::PipelineStageFlags {
    if access.is_empty() {
        none
    } else if access.intersects(vk::AccessFlags::HOST_WRITE) {
        vk::PipelineStageFlags::HOST
    } else if access.intersects(vk::AccessFlags::TRANSFER_WRITE) {
        vk::PipelineStageFlags::TRANSFER
    } else if access.intersects(vk::AccessFlags::SHADER_READ) {
        vk::PipelineStageFlags::FRAGMENT_SHADER
    } else if access.intersects(
        vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    ) {
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
    } else if access.intersects(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE) {
        vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
    } else {
        vk::PipelineStageFlags::ALL_COMMANDS
    }
}

/// Record an image memory barrier moving `image` from `old` to `new` layout
pub fn set_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    subresource_range: vk::ImageSubresourceRange,
) {
    let transition = LayoutTransition::new(old, new);

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(transition.src_access)
        .dst_access_mask(transition.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            transition.src_stage,
            transition.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        );
    }
}

/// Create an image and bind it to freshly allocated memory of the given kind
pub fn create_bound_image(
    device: &VulkanDevice,
    info: &vk::ImageCreateInfo,
    memory_flags: vk::MemoryPropertyFlags,
) -> Result<(vk::Image, vk::DeviceMemory)> {
    let image = unsafe { device.device.create_image(info, None) }
        .context("Failed to create image")?;

    let bind = || -> Result<vk::DeviceMemory> {
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let memory_type_index =
            device.find_memory_type(requirements.memory_type_bits, memory_flags)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate image memory")?;

        if let Err(e) = unsafe { device.device.bind_image_memory(image, memory, 0) } {
            unsafe { device.device.free_memory(memory, None) };
            return Err(e).context("Failed to bind image memory");
        }
        Ok(memory)
    };

    match bind() {
        Ok(memory) => Ok((image, memory)),
        Err(e) => {
            unsafe { device.device.destroy_image(image, None) };
            Err(e)
        }
    }
}

/// Depth attachment shared by every framebuffer
pub struct DepthImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    device: Arc<VulkanDevice>,
}

impl DepthImage {
    pub fn new(
        device: Arc<VulkanDevice>,
        commands: &CommandPool,
        queue: vk::Queue,
        extent: vk::Extent2D,
        requested_format: Option<vk::Format>,
    ) -> Result<Self> {
        let format = select_depth_format(requested_format, |f| device.supports_depth_attachment(f));
        let aspect = depth_aspect(format);
        log::info!("Depth format: {:?}", format);

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (image, memory) =
            create_bound_image(&device, &image_info, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;

        let mut depth = Self {
            image,
            memory,
            view: vk::ImageView::null(),
            format,
            device: device.clone(),
        };

        let range = vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        commands.one_shot(queue, |device, cmd| {
            set_image_layout(
                device,
                cmd,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                range,
            );
            Ok(())
        })?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(range);

        depth.view = unsafe { device.device.create_image_view(&view_info, None) }
            .context("Failed to create depth image view")?;

        Ok(depth)
    }
}

impl Drop for DepthImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.view, None);
            }
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_format_prefers_request_then_candidates() {
        let all = |_: vk::Format| true;
        assert_eq!(
            select_depth_format(Some(vk::Format::D16_UNORM_S8_UINT), all),
            vk::Format::D16_UNORM_S8_UINT
        );
        assert_eq!(select_depth_format(None, all), vk::Format::D32_SFLOAT);

        let no_float = |f: vk::Format| f != vk::Format::D32_SFLOAT;
        assert_eq!(
            select_depth_format(Some(vk::Format::D32_SFLOAT), no_float),
            vk::Format::D24_UNORM_S8_UINT
        );
        assert_eq!(select_depth_format(None, |_: vk::Format| false), vk::Format::D16_UNORM);
    }

    #[test]
    fn stencil_formats_get_stencil_aspect() {
        let both = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;
        assert_eq!(depth_aspect(vk::Format::D24_UNORM_S8_UINT), both);
        assert_eq!(depth_aspect(vk::Format::D16_UNORM_S8_UINT), both);
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT_S8_UINT), both);
        assert_eq!(depth_aspect(vk::Format::D16_UNORM), vk::ImageAspectFlags::DEPTH);
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn upload_transitions() {
        let to_dst = LayoutTransition::new(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(to_dst.src_access, vk::AccessFlags::empty());
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read = LayoutTransition::new(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn linear_image_flushes_host_writes() {
        let t = LayoutTransition::new(
            vk::ImageLayout::PREINITIALIZED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(t.src_access, vk::AccessFlags::HOST_WRITE);
        assert_eq!(t.src_stage, vk::PipelineStageFlags::HOST);
        assert_eq!(t.dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn attachment_transitions() {
        let depth = LayoutTransition::new(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(depth.dst_access, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE);
        assert!(depth
            .dst_stage
            .contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS));

        let color = LayoutTransition::new(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        assert_eq!(color.src_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(color.src_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(color.dst_access, vk::AccessFlags::TRANSFER_WRITE);

        let to_color = LayoutTransition::new(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(to_color.src_access, vk::AccessFlags::empty());
        assert_eq!(to_color.dst_access, vk::AccessFlags::COLOR_ATTACHMENT_READ);
        assert_eq!(to_color.dst_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    }

    #[test]
    fn sampling_an_undefined_image_still_waits_on_transfers() {
        let t = LayoutTransition::new(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(t.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(t.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(t.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(t.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }
}
