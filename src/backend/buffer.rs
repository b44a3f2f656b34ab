// Buffers - vertex, instance, uniform and storage memory
//
// Memory comes from the device's gpu-allocator; host-visible buffers stay
// persistently mapped for their whole life.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::command::CommandPool;
use super::VulkanDevice;

/// A buffer and the memory it is bound to
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).with_context(|| format!("Failed to allocate memory for '{}'", name));
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };

        if let Err(e) = bound {
            let _ = device.allocator().free(allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).with_context(|| format!("Failed to bind memory for '{}'", name));
        }

        log::debug!("Buffer '{}': {} bytes in {:?}", name, size, location);

        Ok(Self {
            buffer,
            size,
            allocation: Some(allocation),
            device,
        })
    }

    /// Host-visible buffer holding `data`
    pub fn with_data<T: Pod>(
        device: Arc<VulkanDevice>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buffer = Self::new(
            device,
            name,
            bytes.len() as vk::DeviceSize,
            usage,
            MemoryLocation::CpuToGpu,
        )?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Device-local buffer filled through a staging copy
    pub fn device_local_with_data<T: Pod>(
        device: Arc<VulkanDevice>,
        commands: &CommandPool,
        queue: vk::Queue,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let staging = Self::with_data(
            device.clone(),
            "staging",
            vk::BufferUsageFlags::TRANSFER_SRC,
            data,
        )?;

        let buffer = Self::new(
            device,
            name,
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: staging.size,
        };

        commands.one_shot(queue, |device, cmd| {
            unsafe { device.cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]) };
            Ok(())
        })?;

        Ok(buffer)
    }

    /// Copy `data` to the start of a mapped buffer
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .context("Buffer is not host visible")?;

        anyhow::ensure!(
            bytes.len() <= mapped.len(),
            "Write of {} bytes overflows a {} byte buffer",
            bytes.len(),
            mapped.len()
        );

        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read the first `count` elements back from a mapped buffer
    pub fn read<T: Pod>(&self, count: usize) -> Result<Vec<T>> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .context("Buffer is not host visible")?;

        let len = count * std::mem::size_of::<T>();
        anyhow::ensure!(len <= mapped.len(), "Read past the end of the buffer");

        Ok(bytemuck::pod_collect_to_vec(&mapped[..len]))
    }

    /// Whole-buffer descriptor
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: 0,
            range: self.size,
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
    }
}
