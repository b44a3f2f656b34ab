// Render passes, framebuffers and pipelines
//
// Two render pass flavours exist: `clear` starts a frame, `load` draws on top
// of what an earlier pass left in the same framebuffer.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// What a render pass attaches and whether it clears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
    pub clear: bool,
}

/// Attachment 0 is color, attachment 1 (if any) depth
pub fn attachment_descriptions(desc: &RenderPassDesc) -> Vec<vk::AttachmentDescription> {
    let (load_op, color_initial, depth_initial) = if desc.clear {
        (
            vk::AttachmentLoadOp::CLEAR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::UNDEFINED,
        )
    } else {
        (
            vk::AttachmentLoadOp::LOAD,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
    };

    let mut attachments = vec![vk::AttachmentDescription::builder()
        .format(desc.color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(load_op)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(color_initial)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build()];

    if let Some(depth_format) = desc.depth_format {
        // Stored so the load pass can keep testing against it
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(depth_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(depth_initial)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
        );
    }

    attachments
}

pub fn create_render_pass(device: &VulkanDevice, desc: &RenderPassDesc) -> Result<vk::RenderPass> {
    let attachments = attachment_descriptions(desc);

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if desc.depth_format.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }

    // Wait for the acquire semaphore's stage and any earlier pass's writes
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let subpasses = [subpass.build()];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .context("Failed to create render pass")?;
    Ok(render_pass)
}

/// One framebuffer per swapchain image, all sharing the depth view
pub fn create_framebuffers(
    device: &VulkanDevice,
    image_views: &[vk::ImageView],
    depth_view: Option<vk::ImageView>,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(image_views.len());

    for &image_view in image_views {
        let mut attachments = vec![image_view];
        attachments.extend(depth_view);

        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match unsafe { device.device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                destroy_framebuffers(device, &mut framebuffers);
                return Err(e).context("Failed to create framebuffer");
            }
        }
    }

    Ok(framebuffers)
}

pub fn destroy_framebuffers(device: &VulkanDevice, framebuffers: &mut Vec<vk::Framebuffer>) {
    for framebuffer in framebuffers.drain(..) {
        unsafe { device.device.destroy_framebuffer(framebuffer, None) };
    }
}

/// Pipeline cache shared by every pipeline of a program
pub struct PipelineCache {
    pub cache: vk::PipelineCache,
    device: Arc<VulkanDevice>,
}

impl PipelineCache {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let info = vk::PipelineCacheCreateInfo::builder();
        let cache = unsafe { device.device.create_pipeline_cache(&info, None) }
            .context("Failed to create pipeline cache")?;
        Ok(Self { cache, device })
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_pipeline_cache(self.cache, None) };
    }
}

/// Fixed-function choices for a graphics pipeline
pub struct GraphicsPipelineDesc<'a> {
    pub stages: &'a [vk::PipelineShaderStageCreateInfo],
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
}

/// A pipeline destroyed with its owner
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub bind_point: vk::PipelineBindPoint,
    device: Arc<VulkanDevice>,
}

impl Pipeline {
    /// Graphics pipeline with dynamic viewport and scissor
    pub fn graphics(
        device: Arc<VulkanDevice>,
        cache: &PipelineCache,
        desc: &GraphicsPipelineDesc,
    ) -> Result<Self> {
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(desc.vertex_bindings)
            .vertex_attribute_descriptions(desc.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Counts only; the actual rectangles are set while recording
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_test)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0);

        // Opaque
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();

        let color_blend_attachments = [color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(desc.stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout)
            .render_pass(desc.render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(cache.cache, &[pipeline_info], None)
        }
        .map_err(|(_, e)| e)
        .context("Failed to create graphics pipeline")?;

        Ok(Self {
            pipeline: pipelines[0],
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            device,
        })
    }

    pub fn compute(
        device: Arc<VulkanDevice>,
        cache: &PipelineCache,
        stage: vk::PipelineShaderStageCreateInfo,
        layout: vk::PipelineLayout,
    ) -> Result<Self> {
        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_compute_pipelines(cache.cache, &[pipeline_info], None)
        }
        .map_err(|(_, e)| e)
        .context("Failed to create compute pipeline")?;

        Ok(Self {
            pipeline: pipelines[0],
            bind_point: vk::PipelineBindPoint::COMPUTE,
            device,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_pipeline(self.pipeline, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(clear: bool, depth: bool) -> RenderPassDesc {
        RenderPassDesc {
            color_format: vk::Format::B8G8R8A8_UNORM,
            depth_format: depth.then_some(vk::Format::D24_UNORM_S8_UINT),
            clear,
        }
    }

    #[test]
    fn clear_pass_starts_from_undefined() {
        let attachments = attachment_descriptions(&desc(true, true));
        assert_eq!(attachments.len(), 2);

        let color = attachments[0];
        assert_eq!(color.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(color.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(color.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);

        let depth = attachments[1];
        assert_eq!(depth.format, vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(depth.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(depth.store_op, vk::AttachmentStoreOp::STORE);
    }

    #[test]
    fn load_pass_keeps_previous_contents() {
        let attachments = attachment_descriptions(&desc(false, true));
        let (color, depth) = (attachments[0], attachments[1]);

        assert_eq!(color.load_op, vk::AttachmentLoadOp::LOAD);
        // Must match what the clear pass left behind
        assert_eq!(color.initial_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(depth.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(
            depth.initial_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn depthless_pass_has_one_attachment() {
        assert_eq!(attachment_descriptions(&desc(true, false)).len(), 1);
    }
}
