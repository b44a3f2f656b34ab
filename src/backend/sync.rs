// Synchronization primitives
//
// Semaphores order acquire -> draw -> present on the GPU; fences let the CPU
// wait for uploads

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// The semaphore pair used by the render loop. There is one frame in flight,
/// so a single pair is enough.
pub struct FrameSync {
    /// Signalled when the acquired image is ready to be drawn into
    pub present_complete: vk::Semaphore,
    /// Signalled when drawing finished and the image may be presented
    pub drawing_complete: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let present_complete = create_semaphore(&device)?;
        let drawing_complete = match create_semaphore(&device) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.device.destroy_semaphore(present_complete, None) };
                return Err(e);
            }
        };

        Ok(Self {
            present_complete,
            drawing_complete,
            device,
        })
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.present_complete, None);
            self.device.device.destroy_semaphore(self.drawing_complete, None);
        }
    }
}

pub fn create_semaphore(device: &VulkanDevice) -> Result<vk::Semaphore> {
    let info = vk::SemaphoreCreateInfo::builder();
    let semaphore = unsafe { device.device.create_semaphore(&info, None) }
        .context("Failed to create semaphore")?;
    Ok(semaphore)
}

pub fn create_fence(device: &VulkanDevice, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    let info = vk::FenceCreateInfo::builder().flags(flags);
    let fence = unsafe { device.device.create_fence(&info, None) }
        .context("Failed to create fence")?;
    Ok(fence)
}
