// Command buffers - pools, recording and submission
//
// Every submission blocks until the queue is idle, so command buffers are
// always safe to re-record or free right after `submit` returns.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::sync::create_fence;
use super::VulkanDevice;

/// Upper bound for a single one-shot upload, in nanoseconds
pub const FENCE_TIMEOUT: u64 = 10_000_000_000;

/// A command pool bound to one queue family
pub struct CommandPool {
    pub pool: vk::CommandPool,
    pub queue_family: u32,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(
        device: Arc<VulkanDevice>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.device.create_command_pool(&create_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            queue_family,
            device,
        })
    }

    /// Allocate `count` primary command buffers
    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        Ok(buffers)
    }

    pub fn free(&self, buffers: &[vk::CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        unsafe { self.device.device.free_command_buffers(self.pool, buffers) };
    }

    pub fn begin(&self, cmd: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.device.device.begin_command_buffer(cmd, &begin_info) }
            .context("Failed to begin command buffer")?;
        Ok(())
    }

    pub fn end(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.device.end_command_buffer(cmd) }
            .context("Failed to end command buffer")?;
        Ok(())
    }

    /// Submit `buffers` to `queue` and block until the queue is idle.
    ///
    /// `wait` pairs each semaphore with the stage that waits on it.
    pub fn submit(
        &self,
        queue: vk::Queue,
        buffers: &[vk::CommandBuffer],
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) = wait.iter().copied().unzip();

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(buffers)
            .signal_semaphores(signal);

        unsafe {
            self.device
                .device
                .queue_submit(queue, &[submit_info.build()], fence)
                .context("Failed to submit command buffers")?;
            self.device
                .device
                .queue_wait_idle(queue)
                .context("Failed waiting for queue idle")?;
        }

        Ok(())
    }

    /// Record and run a throwaway command buffer, waiting on a fence.
    pub fn one_shot<F>(&self, queue: vk::Queue, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let cmd = self
            .allocate(1)?
            .into_iter()
            .next()
            .context("Driver returned no command buffer")?;

        let result = self.run_one_shot(queue, cmd, record);
        self.free(&[cmd]);
        result
    }

    fn run_one_shot<F>(&self, queue: vk::Queue, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        self.begin(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        record(&self.device.device, cmd)?;
        self.end(cmd)?;

        let fence = create_fence(&self.device, false)?;
        let buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&buffers);

        let result = unsafe {
            self.device
                .device
                .queue_submit(queue, &[submit_info.build()], fence)
                .context("Failed to submit one-shot commands")
                .and_then(|_| {
                    self.device
                        .device
                        .wait_for_fences(&[fence], true, FENCE_TIMEOUT)
                        .context("Timed out waiting for one-shot commands")
                })
        };

        unsafe { self.device.device.destroy_fence(fence, None) };
        result
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Destroying the pool frees every buffer still allocated from it
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}
