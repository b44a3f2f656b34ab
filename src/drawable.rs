// Drawable - one instanced, textured cube cloud
//
// Built in steps that follow the renderer's creation order:
// buffers -> descriptors -> pipeline. `update` rewrites the uniform MVP each
// frame and `record` adds one render pass to a command buffer.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::backend::descriptor::{drawable_bindings, Descriptors};
use crate::backend::pipeline::{GraphicsPipelineDesc, Pipeline, PipelineCache};
use crate::backend::shader::ShaderSet;
use crate::backend::texture::Texture;
use crate::backend::{CommandPool, GpuBuffer, VulkanDevice};
use crate::geometry::{self, Spin, CUBE_VERTEX_COUNT, INSTANCE_BINDING, VERTEX_BINDING};

pub struct Drawable {
    // Field order is drop order: pipeline and set before the buffers they use
    pipeline: Option<Pipeline>,
    descriptors: Option<Descriptors>,
    uniform_buffer: GpuBuffer,
    instance_buffer: GpuBuffer,
    vertex_buffer: GpuBuffer,
    instance_count: u32,
    spin: Spin,
}

impl Drawable {
    /// Create the vertex, instance and uniform buffers
    pub fn new(
        device: Arc<VulkanDevice>,
        commands: &CommandPool,
        queue: vk::Queue,
        instance_count: u32,
        reverse: bool,
    ) -> Result<Self> {
        let vertices = geometry::textured_cube();
        let vertex_buffer = GpuBuffer::with_data(
            device.clone(),
            "cube vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &vertices,
        )?;

        // Never changes, so it lives in device-local memory
        let instances = geometry::instance_layout(instance_count.max(1));
        let instance_buffer = GpuBuffer::device_local_with_data(
            device.clone(),
            commands,
            queue,
            "cube instances",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &instances,
        )?;

        let uniform_buffer = GpuBuffer::with_data(
            device,
            "mvp uniform",
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            &[glam::Mat4::IDENTITY],
        )?;

        Ok(Self {
            pipeline: None,
            descriptors: None,
            uniform_buffer,
            instance_buffer,
            vertex_buffer,
            instance_count: instances.len() as u32,
            spin: Spin::new(reverse),
        })
    }

    /// Descriptor set with the uniform buffer and, if given, the texture
    pub fn create_descriptors(
        &mut self,
        device: Arc<VulkanDevice>,
        texture: Option<&Texture>,
    ) -> Result<()> {
        let descriptors = Descriptors::new(device, &drawable_bindings(texture.is_some()))?;

        descriptors.write_buffer(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            self.uniform_buffer.descriptor_info(),
        );
        if let Some(texture) = texture {
            descriptors.write_image(1, texture.descriptor_info());
        }

        self.descriptors = Some(descriptors);
        Ok(())
    }

    pub fn create_pipeline(
        &mut self,
        device: Arc<VulkanDevice>,
        cache: &PipelineCache,
        shaders: &ShaderSet,
        render_pass: vk::RenderPass,
        cull_mode: vk::CullModeFlags,
    ) -> Result<()> {
        let layout = self
            .descriptors
            .as_ref()
            .context("Descriptors must exist before the pipeline")?
            .pipeline_layout;

        let stages = shaders.stages();
        let bindings = geometry::vertex_bindings();
        let attributes = geometry::vertex_attributes();

        let pipeline = Pipeline::graphics(
            device,
            cache,
            &GraphicsPipelineDesc {
                stages: &stages,
                vertex_bindings: &bindings,
                vertex_attributes: &attributes,
                layout,
                render_pass,
                cull_mode,
                front_face: vk::FrontFace::COUNTER_CLOCKWISE,
                depth_test: true,
            },
        )?;

        self.pipeline = Some(pipeline);
        Ok(())
    }

    /// Advance the spin and upload the new MVP
    pub fn update(&mut self, extent: vk::Extent2D, dt: f32) -> Result<()> {
        self.spin.advance(dt);
        let mvp = geometry::model_view_projection(extent, &self.spin);
        self.uniform_buffer.write(&[mvp])
    }

    /// Record this drawable's render pass into `cmd`
    pub fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) -> Result<()> {
        let pipeline = self.pipeline.as_ref().context("Drawable has no pipeline")?;
        let descriptors = self.descriptors.as_ref().context("Drawable has no descriptors")?;

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);

            device.cmd_bind_pipeline(cmd, pipeline.bind_point, pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                descriptors.pipeline_layout,
                0,
                &[descriptors.set],
                &[],
            );

            device.cmd_bind_vertex_buffers(cmd, VERTEX_BINDING, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_vertex_buffers(
                cmd,
                INSTANCE_BINDING,
                &[self.instance_buffer.buffer],
                &[0],
            );

            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);

            device.cmd_draw(cmd, CUBE_VERTEX_COUNT, self.instance_count, 0, 0);

            device.cmd_end_render_pass(cmd);
        }

        Ok(())
    }
}
