// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (prefer discrete GPU)
// - Queue family selection (graphics+present, compute, transfer)
// - Logical device + queue creation
// - Memory type lookup and the buffer allocator

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::instance::VulkanInstance;
use super::swapchain::Surface;

pub type GpuAllocator = gpu_allocator::vulkan::Allocator;

/// Queue family indices picked for a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    /// Graphics family; when a surface was given it can also present
    pub graphics: Option<u32>,
    pub compute: u32,
    /// Dedicated copy family, if the GPU has one. Only reported: staged
    /// uploads run on the queue that later uses the resource, so no
    /// ownership transfer is needed.
    pub transfer: u32,
}

impl QueueFamilies {
    /// Pick queue families from the properties reported by a physical device.
    ///
    /// `presents(i)` tells whether family `i` can present to the target
    /// surface; headless callers pass `|_| true`.
    pub fn select(
        families: &[vk::QueueFamilyProperties],
        require_graphics: bool,
        presents: impl Fn(u32) -> bool,
    ) -> Option<Self> {
        let graphics = find_graphics_family(families, presents);
        if require_graphics && graphics.is_none() {
            return None;
        }

        Some(Self {
            graphics,
            compute: find_compute_family(families)?,
            transfer: find_transfer_family(families)?,
        })
    }

    /// Distinct families that get a queue, in ascending order
    pub fn unique(&self) -> Vec<u32> {
        let mut set = BTreeSet::new();
        if let Some(graphics) = self.graphics {
            set.insert(graphics);
        }
        set.insert(self.compute);
        set.into_iter().collect()
    }
}

fn indexed(families: &[vk::QueueFamilyProperties]) -> impl Iterator<Item = (u32, vk::QueueFlags)> + '_ {
    families
        .iter()
        .enumerate()
        .filter(|(_, props)| props.queue_count > 0)
        .map(|(i, props)| (i as u32, props.queue_flags))
}

/// First family that supports graphics and can present.
pub fn find_graphics_family(
    families: &[vk::QueueFamilyProperties],
    presents: impl Fn(u32) -> bool,
) -> Option<u32> {
    indexed(families)
        .find(|&(i, flags)| flags.contains(vk::QueueFlags::GRAPHICS) && presents(i))
        .map(|(i, _)| i)
}

/// Prefer a compute family without graphics, then any compute family.
pub fn find_compute_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    // Transfer and sparse bits don't matter here
    let masked = |flags: vk::QueueFlags| {
        flags & !(vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING)
    };

    indexed(families)
        .find(|&(_, flags)| {
            let flags = masked(flags);
            flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .or_else(|| {
            indexed(families).find(|&(_, flags)| masked(flags).contains(vk::QueueFlags::COMPUTE))
        })
        .map(|(i, _)| i)
}

/// Prefer a transfer-only family, then compute without graphics (compute
/// implies transfer), then anything that can do graphics, compute or transfer.
pub fn find_transfer_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    let masked = |flags: vk::QueueFlags| flags & !vk::QueueFlags::SPARSE_BINDING;
    let graphics_or_compute = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;

    indexed(families)
        .find(|&(_, flags)| {
            let flags = masked(flags);
            !flags.intersects(graphics_or_compute) && flags.contains(vk::QueueFlags::TRANSFER)
        })
        .or_else(|| {
            indexed(families).find(|&(_, flags)| {
                let flags = masked(flags);
                !flags.contains(vk::QueueFlags::GRAPHICS) && flags.contains(vk::QueueFlags::COMPUTE)
            })
        })
        .or_else(|| {
            indexed(families).find(|&(_, flags)| {
                masked(flags).intersects(graphics_or_compute | vk::QueueFlags::TRANSFER)
            })
        })
        .map(|(i, _)| i)
}

/// First memory type allowed by `type_bits` whose flags contain `required`.
pub fn memory_type_from_properties(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

/// First memory type whose flags contain `required`, ignoring resource limits.
pub fn memory_type_with_properties(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_type_from_properties(memory_properties, u32::MAX, required)
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub instance: Arc<VulkanInstance>,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,

    pub queue_families: QueueFamilies,
    pub graphics_queue: Option<vk::Queue>,
    pub compute_queue: vk::Queue,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub enabled_features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    // Dropped by hand before the device goes away
    allocator: ManuallyDrop<Mutex<GpuAllocator>>,
}

impl VulkanDevice {
    /// Create the logical device.
    ///
    /// With a surface the device must expose a graphics queue that presents to
    /// it, and `VK_KHR_swapchain` is enabled. Without one (compute-only
    /// programs) only a compute queue is required.
    pub fn new(instance: Arc<VulkanInstance>, surface: Option<&Surface>) -> Result<Arc<Self>> {
        let (physical_device, queue_families) = Self::pick_physical_device(&instance, surface)?;

        let properties = unsafe { instance.instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.instance.get_physical_device_memory_properties(physical_device) };
        let supported_features =
            unsafe { instance.instance.get_physical_device_features(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!("Queue families: {:?}", queue_families);

        // Only what the renderer samples with, and only if the GPU has it
        let enabled_features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: supported_features.sampler_anisotropy,
            ..Default::default()
        };

        let device = Self::create_logical_device(
            &instance,
            physical_device,
            &queue_families,
            &enabled_features,
            surface.is_some(),
        )?;

        let graphics_queue = queue_families
            .graphics
            .map(|family| unsafe { device.get_device_queue(family, 0) });
        let compute_queue = unsafe { device.get_device_queue(queue_families.compute, 0) };

        let allocator = Self::create_allocator(&instance.instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            instance,
            physical_device,
            device,
            queue_families,
            graphics_queue,
            compute_queue,
            properties,
            enabled_features,
            memory_properties,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
        }))
    }

    fn pick_physical_device(
        instance: &VulkanInstance,
        surface: Option<&Surface>,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.instance.get_physical_device_properties(device) };
            let families = unsafe {
                instance
                    .instance
                    .get_physical_device_queue_family_properties(device)
            };

            let presents = |family: u32| match surface {
                Some(surface) => surface.supports_present(device, family),
                None => true,
            };

            let Some(queue_families) = QueueFamilies::select(&families, surface.is_some(), presents)
            else {
                log::debug!(
                    "Skipping {}: missing queue families",
                    unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy()
                );
                continue;
            };

            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, queue_families));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn create_logical_device(
        instance: &VulkanInstance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilies,
        enabled_features: &vk::PhysicalDeviceFeatures,
        presenting: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = if presenting {
            vec![ash::extensions::khr::Swapchain::name().as_ptr()]
        } else {
            vec![]
        };

        // Device layers are deprecated, none are passed
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(enabled_features);

        let device = unsafe {
            instance
                .instance
                .create_device(physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;

        Ok(device)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<GpuAllocator> {
        let allocator = GpuAllocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU allocator")?;

        Ok(allocator)
    }

    /// Lock the buffer allocator
    pub fn allocator(&self) -> parking_lot::MutexGuard<'_, GpuAllocator> {
        self.allocator.lock()
    }

    /// Memory type index for a resource's requirements
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        memory_type_from_properties(&self.memory_properties, type_bits, required).with_context(
            || format!("No memory type matches bits {:#b} with {:?}", type_bits, required),
        )
    }

    /// Graphics queue; only present on devices created for a surface
    pub fn graphics_queue(&self) -> Result<vk::Queue> {
        self.graphics_queue
            .context("Device was created without a graphics queue")
    }

    pub fn graphics_family(&self) -> Result<u32> {
        self.queue_families
            .graphics
            .context("Device was created without a graphics queue")
    }

    /// Whether `format` can back a depth attachment with optimal tiling
    pub fn supports_depth_attachment(&self, format: vk::Format) -> bool {
        let props = unsafe {
            self.instance
                .instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // The allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;
    const S: vk::QueueFlags = vk::QueueFlags::SPARSE_BINDING;

    #[test]
    fn typical_discrete_gpu_layout() {
        // Family 0: everything, 1: async compute, 2: copy engine
        let families = [family(G | C | T | S), family(C | T), family(T | S)];
        let picked = QueueFamilies::select(&families, true, |_| true).unwrap();
        assert_eq!(
            picked,
            QueueFamilies {
                graphics: Some(0),
                compute: 1,
                transfer: 2
            }
        );
        // The copy engine is picked but never given a queue
        assert_eq!(picked.unique(), vec![0, 1]);
    }

    #[test]
    fn single_family_gpu_shares_everything() {
        let families = [family(G | C | T)];
        let picked = QueueFamilies::select(&families, true, |_| true).unwrap();
        assert_eq!(picked.graphics, Some(0));
        assert_eq!(picked.compute, 0);
        assert_eq!(picked.transfer, 0);
        assert_eq!(picked.unique(), vec![0]);
    }

    #[test]
    fn transfer_falls_back_to_async_compute() {
        let families = [family(G | C | T), family(C | T)];
        assert_eq!(find_transfer_family(&families), Some(1));
    }

    #[test]
    fn graphics_family_must_present() {
        let families = [family(G | C | T), family(G | T)];
        assert_eq!(find_graphics_family(&families, |i| i == 1), Some(1));
        assert_eq!(QueueFamilies::select(&families, true, |_| false), None);
        // Headless callers don't need graphics at all
        let headless = QueueFamilies::select(&families, false, |_| false).unwrap();
        assert_eq!(headless.graphics, None);
        assert_eq!(headless.compute, 0);
    }

    #[test]
    fn empty_families_are_ignored() {
        let mut empty = family(C);
        empty.queue_count = 0;
        let families = [empty, family(G | C | T)];
        assert_eq!(find_compute_family(&families), Some(1));
    }

    #[test]
    fn no_compute_means_no_device() {
        let families = [family(T)];
        assert_eq!(QueueFamilies::select(&families, false, |_| true), None);
    }

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
        }
        props
    }

    #[test]
    fn memory_type_respects_type_bits_and_flags() {
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = memory_properties(&[local, host, local | host]);

        assert_eq!(memory_type_from_properties(&props, 0b111, local), Some(0));
        assert_eq!(memory_type_from_properties(&props, 0b110, local), Some(2));
        assert_eq!(
            memory_type_from_properties(&props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(memory_type_from_properties(&props, 0b001, host), None);
        // No requirement: first allowed type
        assert_eq!(
            memory_type_from_properties(&props, 0b100, vk::MemoryPropertyFlags::empty()),
            Some(2)
        );
    }

    #[test]
    fn memory_type_ignores_bits_beyond_type_count() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(
            memory_type_with_properties(&props, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
        assert_eq!(
            memory_type_with_properties(&props, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }
}
