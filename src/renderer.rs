// =============================================================================
// RENDERER - owns every Vulkan object of the windowed binary
// =============================================================================
//
// CREATION ORDER:
//   instance -> surface -> device -> command pool -> swapchain -> depth ->
//   drawable buffers -> render passes (clear, load) -> framebuffers ->
//   shaders -> texture -> descriptors -> pipelines -> command buffers
//
// FRAME FLOW (one frame in flight):
//   acquire (signals present_complete) -> submit (waits on it at
//   COLOR_ATTACHMENT_OUTPUT, signals drawing_complete) -> queue idle ->
//   present (waits on drawing_complete)
//
// Each swapchain image gets one pre-recorded command buffer holding both
// drawables: the first in the clear pass, the second in the load pass.
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

use crate::backend::image::DepthImage;
use crate::backend::pipeline::{
    create_framebuffers, create_render_pass, destroy_framebuffers, PipelineCache, RenderPassDesc,
};
use crate::backend::shader::ShaderSet;
use crate::backend::sync::FrameSync;
use crate::backend::texture::Texture;
use crate::backend::{CommandPool, Surface, Swapchain, VulkanDevice, VulkanInstance};
use crate::config::Config;
use crate::drawable::Drawable;

const VERTEX_SHADER: &str = "texture.vert.spv";
const FRAGMENT_SHADER: &str = "texture.frag.spv";

/// Render passes and the framebuffers built for them
struct RenderTargets {
    clear_pass: vk::RenderPass,
    load_pass: vk::RenderPass,
    clear_framebuffers: Vec<vk::Framebuffer>,
    load_framebuffers: Vec<vk::Framebuffer>,
    device: Arc<VulkanDevice>,
}

impl RenderTargets {
    fn new(device: Arc<VulkanDevice>, color_format: vk::Format, depth_format: vk::Format) -> Result<Self> {
        let mut targets = Self {
            clear_pass: vk::RenderPass::null(),
            load_pass: vk::RenderPass::null(),
            clear_framebuffers: Vec::new(),
            load_framebuffers: Vec::new(),
            device: device.clone(),
        };

        let mut desc = RenderPassDesc {
            color_format,
            depth_format: Some(depth_format),
            clear: true,
        };
        targets.clear_pass = create_render_pass(&device, &desc)?;
        desc.clear = false;
        targets.load_pass = create_render_pass(&device, &desc)?;

        Ok(targets)
    }

    fn build_framebuffers(&mut self, swapchain: &Swapchain, depth: &DepthImage) -> Result<()> {
        self.destroy_framebuffers();
        self.clear_framebuffers = create_framebuffers(
            &self.device,
            &swapchain.image_views,
            Some(depth.view),
            self.clear_pass,
            swapchain.extent,
        )?;
        self.load_framebuffers = create_framebuffers(
            &self.device,
            &swapchain.image_views,
            Some(depth.view),
            self.load_pass,
            swapchain.extent,
        )?;
        Ok(())
    }

    fn destroy_framebuffers(&mut self) {
        destroy_framebuffers(&self.device, &mut self.clear_framebuffers);
        destroy_framebuffers(&self.device, &mut self.load_framebuffers);
    }
}

impl Drop for RenderTargets {
    fn drop(&mut self) {
        self.destroy_framebuffers();
        unsafe {
            self.device.device.destroy_render_pass(self.load_pass, None);
            self.device.device.destroy_render_pass(self.clear_pass, None);
        }
    }
}

/// IMPORTANT: Field order is drop order. Everything holding an
/// `Arc<VulkanDevice>` goes before the swapchain, the swapchain before the
/// surface.
pub struct Renderer {
    // ─────────────────────────────────────────────────────────────────────────
    // PER-FRAME STATE
    // ─────────────────────────────────────────────────────────────────────────
    command_buffers: Vec<vk::CommandBuffer>,
    frame_sync: FrameSync,

    // ─────────────────────────────────────────────────────────────────────────
    // SCENE
    // ─────────────────────────────────────────────────────────────────────────
    drawables: Vec<Drawable>,
    _texture: Texture,
    _pipeline_cache: PipelineCache,

    // ─────────────────────────────────────────────────────────────────────────
    // SWAPCHAIN-SIZED RESOURCES (rebuilt on resize)
    // ─────────────────────────────────────────────────────────────────────────
    targets: RenderTargets,
    depth: DepthImage,
    swapchain: Swapchain,

    // ─────────────────────────────────────────────────────────────────────────
    // CORE
    // ─────────────────────────────────────────────────────────────────────────
    commands: CommandPool,
    queue: vk::Queue,
    device: Arc<VulkanDevice>,
    surface: Surface,
    _instance: Arc<VulkanInstance>,

    // ─────────────────────────────────────────────────────────────────────────
    // SETTINGS & STATE FLAGS
    // ─────────────────────────────────────────────────────────────────────────
    clear_values: [vk::ClearValue; 2],
    present_mode: vk::PresentModeKHR,
    depth_request: Option<vk::Format>,
    window_size: (u32, u32),
    needs_rebuild: bool,
    last_update: Instant,
}

impl Renderer {
    pub fn new(config: &Config, window: &Window) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Instance, surface, device
        // ─────────────────────────────────────────────────────────────────────
        let extensions = Surface::required_extensions(window)?;
        let instance = VulkanInstance::new(
            &config.window.title,
            &extensions,
            config.debug.validation_layers,
        )?;
        let surface = Surface::new(instance.clone(), window)?;
        let device = VulkanDevice::new(instance.clone(), Some(&surface))?;
        let queue = device.graphics_queue()?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Command pool (buffers are re-recorded after a resize)
        // ─────────────────────────────────────────────────────────────────────
        let commands = CommandPool::new(
            device.clone(),
            device.graphics_family()?,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Swapchain and depth image
        // ─────────────────────────────────────────────────────────────────────
        let size = window.inner_size();
        let present_mode = config.present_mode();
        let swapchain = Swapchain::new(
            device.clone(),
            &surface,
            size.width,
            size.height,
            present_mode,
            None,
        )?;

        let depth_request = config.depth_format();
        let depth = DepthImage::new(
            device.clone(),
            &commands,
            queue,
            swapchain.extent,
            depth_request,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Drawable buffers (the second one spins the other way)
        // ─────────────────────────────────────────────────────────────────────
        let instance_count = config.graphics.instance_count;
        let mut drawables = vec![
            Drawable::new(device.clone(), &commands, queue, instance_count, false)?,
            Drawable::new(device.clone(), &commands, queue, instance_count, true)?,
        ];

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Render passes and framebuffers
        // ─────────────────────────────────────────────────────────────────────
        let mut targets = RenderTargets::new(device.clone(), swapchain.format, depth.format)?;
        targets.build_framebuffers(&swapchain, &depth)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Shaders, texture, descriptors, pipelines
        // ─────────────────────────────────────────────────────────────────────
        let shader_dir = &config.graphics.shader_dir;
        let shaders = ShaderSet::from_files(
            device.clone(),
            &[
                (vk::ShaderStageFlags::VERTEX, shader_dir.join(VERTEX_SHADER).as_path()),
                (vk::ShaderStageFlags::FRAGMENT, shader_dir.join(FRAGMENT_SHADER).as_path()),
            ],
        )?;

        let texture = Texture::load(
            device.clone(),
            &commands,
            queue,
            &config.graphics.texture_path,
            config.texture_tiling(),
        )?;

        let pipeline_cache = PipelineCache::new(device.clone())?;
        let passes = [targets.clear_pass, targets.load_pass];
        // Two pipeline objects differing in culling
        let cull_modes = [vk::CullModeFlags::BACK, vk::CullModeFlags::NONE];

        for ((drawable, render_pass), cull_mode) in drawables.iter_mut().zip(passes).zip(cull_modes) {
            drawable.create_descriptors(device.clone(), Some(&texture))?;
            drawable.create_pipeline(device.clone(), &pipeline_cache, &shaders, render_pass, cull_mode)?;
        }

        // Modules are only needed while pipelines are built
        drop(shaders);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 7: Synchronization and command buffers
        // ─────────────────────────────────────────────────────────────────────
        let frame_sync = FrameSync::new(device.clone())?;
        let command_buffers = commands.allocate(swapchain.image_count() as u32)?;

        let color = config.graphics.clear_color;
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let renderer = Self {
            command_buffers,
            frame_sync,
            drawables,
            _texture: texture,
            _pipeline_cache: pipeline_cache,
            targets,
            depth,
            swapchain,
            commands,
            queue,
            device,
            surface,
            _instance: instance,
            clear_values,
            present_mode,
            depth_request,
            window_size: (size.width, size.height),
            needs_rebuild: false,
            last_update: Instant::now(),
        };

        renderer.record_command_buffers()?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    /// Record both drawables into each swapchain image's command buffer
    fn record_command_buffers(&self) -> Result<()> {
        let extent = self.swapchain.extent;

        for (i, &cmd) in self.command_buffers.iter().enumerate() {
            self.commands.begin(cmd, vk::CommandBufferUsageFlags::empty())?;

            let passes = [
                (self.targets.clear_pass, self.targets.clear_framebuffers[i]),
                (self.targets.load_pass, self.targets.load_framebuffers[i]),
            ];
            for (drawable, (render_pass, framebuffer)) in self.drawables.iter().zip(passes) {
                drawable.record(
                    &self.device.device,
                    cmd,
                    render_pass,
                    framebuffer,
                    extent,
                    &self.clear_values,
                )?;
            }

            self.commands.end(cmd)?;
        }

        log::debug!("Recorded {} command buffers", self.command_buffers.len());
        Ok(())
    }

    /// Note a new window size; the swapchain is rebuilt before the next frame
    pub fn resize(&mut self, width: u32, height: u32) {
        self.window_size = (width, height);
        self.needs_rebuild = true;
    }

    fn is_minimized(&self) -> bool {
        self.window_size.0 == 0 || self.window_size.1 == 0
    }

    /// Rebuild everything sized by the swapchain
    fn rebuild(&mut self) -> Result<()> {
        self.device.wait_idle()?;

        let (width, height) = self.window_size;
        log::info!("Rebuilding swapchain: {}x{}", width, height);

        let swapchain = Swapchain::new(
            self.device.clone(),
            &self.surface,
            width,
            height,
            self.present_mode,
            Some(&self.swapchain),
        )?;

        if swapchain.format != self.swapchain.format {
            anyhow::bail!(
                "Surface format changed from {:?} to {:?}",
                self.swapchain.format,
                swapchain.format
            );
        }

        // The old framebuffers reference the old views and depth image
        self.targets.destroy_framebuffers();
        self.swapchain = swapchain;
        self.depth = DepthImage::new(
            self.device.clone(),
            &self.commands,
            self.queue,
            self.swapchain.extent,
            self.depth_request,
        )?;
        self.targets.build_framebuffers(&self.swapchain, &self.depth)?;

        if self.command_buffers.len() != self.swapchain.image_count() {
            self.commands.free(&self.command_buffers);
            self.command_buffers = self.commands.allocate(self.swapchain.image_count() as u32)?;
        }
        self.record_command_buffers()?;

        self.needs_rebuild = false;
        Ok(())
    }

    /// Update the drawables and draw one frame.
    ///
    /// Returns `false` when nothing was presented (minimized or rebuilding).
    pub fn render(&mut self) -> Result<bool> {
        if self.is_minimized() {
            return Ok(false);
        }

        if self.needs_rebuild {
            self.rebuild().context("Failed to rebuild swapchain")?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Update uniforms
        // ─────────────────────────────────────────────────────────────────────
        let now = Instant::now();
        let dt = now.duration_since(self.last_update).as_secs_f32();
        self.last_update = now;

        let extent = self.swapchain.extent;
        for drawable in &mut self.drawables {
            drawable.update(extent, dt)?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Acquire next swapchain image
        // ─────────────────────────────────────────────────────────────────────
        let Some(image_index) = self
            .swapchain
            .acquire_next_image(u64::MAX, self.frame_sync.present_complete)?
        else {
            self.needs_rebuild = true;
            return Ok(false);
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Submit and wait for the queue to drain
        // ─────────────────────────────────────────────────────────────────────
        let cmd = self.command_buffers[image_index as usize];
        self.commands.submit(
            self.queue,
            &[cmd],
            &[(
                self.frame_sync.present_complete,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )],
            &[self.frame_sync.drawing_complete],
            vk::Fence::null(),
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Present
        // ─────────────────────────────────────────────────────────────────────
        let stale = self.swapchain.present(
            self.queue,
            image_index,
            &[self.frame_sync.drawing_complete],
        )?;
        if stale {
            self.needs_rebuild = true;
        }

        Ok(true)
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Nothing may be in use while the fields drop
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle failed during teardown: {:?}", e);
        }
    }
}
