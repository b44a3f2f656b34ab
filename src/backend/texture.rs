// Textures - decode, upload and sample
//
// Two upload paths:
// - optimal: staging buffer -> device-local image with a full mip chain
// - linear: host-visible image written in place, a single level

use anyhow::{Context, Result};
use ash::vk;
use image::imageops::FilterType;
use image::{Rgba, RgbaImage};
use std::path::Path;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::command::CommandPool;
use super::image::{create_bound_image, set_image_layout};
use super::VulkanDevice;
use crate::config::TextureTiling;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const BYTES_PER_PIXEL: u32 = 4;

/// Decode `path` to RGBA8, or generate a checkerboard if the file is missing
pub fn load_rgba(path: &Path) -> Result<RgbaImage> {
    if !path.exists() {
        log::warn!("Texture {:?} not found, using a generated checkerboard", path);
        return Ok(checkerboard(256, 32));
    }

    let image = image::open(path).with_context(|| format!("Failed to decode texture {:?}", path))?;
    Ok(image.to_rgba8())
}

/// Square checkerboard of `size` pixels with `cell`-pixel squares
pub fn checkerboard(size: u32, cell: u32) -> RgbaImage {
    let cell = cell.max(1);
    RgbaImage::from_fn(size, size, |x, y| {
        if (x / cell + y / cell) % 2 == 0 {
            Rgba([255, 255, 255, 255])
        } else {
            Rgba([200, 60, 40, 255])
        }
    })
}

/// Levels in a full mip chain down to 1x1
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Base image followed by each half-sized level down to 1x1
pub fn build_mip_chain(base: RgbaImage) -> Vec<RgbaImage> {
    let levels = mip_level_count(base.width(), base.height());
    let mut chain = Vec::with_capacity(levels as usize);
    chain.push(base);

    for _ in 1..levels {
        let Some(prev) = chain.last() else { break };
        let width = (prev.width() / 2).max(1);
        let height = (prev.height() / 2).max(1);
        let next = image::imageops::resize(prev, width, height, FilterType::Triangle);
        chain.push(next);
    }

    chain
}

/// Pack every level back to back and describe one copy region per level
pub fn pack_mip_chain(chain: &[RgbaImage]) -> (Vec<u8>, Vec<vk::BufferImageCopy>) {
    let total = chain.iter().map(|level| level.as_raw().len()).sum();
    let mut bytes = Vec::with_capacity(total);
    let mut regions = Vec::with_capacity(chain.len());

    for (level, image) in chain.iter().enumerate() {
        regions.push(vk::BufferImageCopy {
            buffer_offset: bytes.len() as vk::DeviceSize,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level as u32,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: image.width(),
                height: image.height(),
                depth: 1,
            },
        });
        bytes.extend_from_slice(image.as_raw());
    }

    (bytes, regions)
}

/// Copy tightly packed rows of `row_bytes` into `dst`, one row every `row_pitch` bytes
pub fn copy_rows(src: &[u8], row_bytes: usize, dst: &mut [u8], row_pitch: usize) {
    for (row, src_row) in src.chunks_exact(row_bytes).enumerate() {
        let start = row * row_pitch;
        dst[start..start + row_bytes].copy_from_slice(src_row);
    }
}

/// A sampled 2D texture
pub struct Texture {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub layout: vk::ImageLayout,
    pub mip_levels: u32,
    pub width: u32,
    pub height: u32,
    device: Arc<VulkanDevice>,
}

impl Texture {
    /// Load an image file and upload it with the requested tiling
    pub fn load(
        device: Arc<VulkanDevice>,
        commands: &CommandPool,
        queue: vk::Queue,
        path: &Path,
        tiling: TextureTiling,
    ) -> Result<Self> {
        let pixels = load_rgba(path)?;
        log::info!(
            "Texture {:?}: {}x{}, {:?} tiling",
            path,
            pixels.width(),
            pixels.height(),
            tiling
        );

        match tiling {
            TextureTiling::Linear if Self::linear_supported(&device) => {
                Self::linear(device, commands, queue, &pixels)
            }
            TextureTiling::Linear => {
                log::warn!("Linear sampled textures unsupported, falling back to optimal tiling");
                Self::optimal(device, commands, queue, pixels)
            }
            TextureTiling::Optimal => Self::optimal(device, commands, queue, pixels),
        }
    }

    fn linear_supported(device: &VulkanDevice) -> bool {
        let props = unsafe {
            device
                .instance
                .instance
                .get_physical_device_format_properties(device.physical_device, TEXTURE_FORMAT)
        };
        props
            .linear_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE)
    }

    fn empty(device: Arc<VulkanDevice>, width: u32, height: u32, mip_levels: u32) -> Self {
        Self {
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            layout: vk::ImageLayout::UNDEFINED,
            mip_levels,
            width,
            height,
            device,
        }
    }

    /// Staged upload into a device-local, optimally tiled image with mipmaps
    pub fn optimal(
        device: Arc<VulkanDevice>,
        commands: &CommandPool,
        queue: vk::Queue,
        pixels: RgbaImage,
    ) -> Result<Self> {
        let (width, height) = pixels.dimensions();
        let chain = build_mip_chain(pixels);
        let mip_levels = chain.len() as u32;
        let (bytes, regions) = pack_mip_chain(&chain);

        let staging = GpuBuffer::with_data(
            device.clone(),
            "texture staging",
            vk::BufferUsageFlags::TRANSFER_SRC,
            &bytes,
        )?;

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(TEXTURE_FORMAT)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            // TRANSFER_DST is needed for the copy regardless of the final use
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut texture = Self::empty(device.clone(), width, height, mip_levels);
        (texture.image, texture.memory) =
            create_bound_image(&device, &image_info, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;

        let range = color_range(mip_levels);
        let image = texture.image;

        commands.one_shot(queue, |device, cmd| {
            set_image_layout(
                device,
                cmd,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                range,
            );
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &regions,
                );
            }
            set_image_layout(
                device,
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                range,
            );
            Ok(())
        })?;
        texture.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;

        texture.finish(mip_levels as f32)?;
        Ok(texture)
    }

    /// Host-visible, linearly tiled image written row by row; no mipmaps
    pub fn linear(
        device: Arc<VulkanDevice>,
        commands: &CommandPool,
        queue: vk::Queue,
        pixels: &RgbaImage,
    ) -> Result<Self> {
        let (width, height) = pixels.dimensions();

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(TEXTURE_FORMAT)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::PREINITIALIZED);

        let mut texture = Self::empty(device.clone(), width, height, 1);
        (texture.image, texture.memory) = create_bound_image(
            &device,
            &image_info,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };

        unsafe {
            let layout = device
                .device
                .get_image_subresource_layout(texture.image, subresource);
            let size = device
                .device
                .get_image_memory_requirements(texture.image)
                .size;

            let ptr = device
                .device
                .map_memory(texture.memory, 0, size, vk::MemoryMapFlags::empty())
                .context("Failed to map linear texture")?;
            let mapped = std::slice::from_raw_parts_mut(ptr as *mut u8, size as usize);

            copy_rows(
                pixels.as_raw(),
                (width * BYTES_PER_PIXEL) as usize,
                &mut mapped[layout.offset as usize..],
                layout.row_pitch as usize,
            );

            device.device.unmap_memory(texture.memory);
        }

        let image = texture.image;
        commands.one_shot(queue, |device, cmd| {
            set_image_layout(
                device,
                cmd,
                image,
                vk::ImageLayout::PREINITIALIZED,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                color_range(1),
            );
            Ok(())
        })?;
        texture.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;

        texture.finish(0.0)?;
        Ok(texture)
    }

    /// Create the sampler and view once the image holds its data
    fn finish(&mut self, max_lod: f32) -> Result<()> {
        let anisotropy = self.device.enabled_features.sampler_anisotropy == vk::TRUE;

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .mip_lod_bias(0.0)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { 8.0 } else { 1.0 })
            .compare_op(vk::CompareOp::NEVER)
            .min_lod(0.0)
            .max_lod(max_lod)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);

        self.sampler = unsafe { self.device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create sampler")?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(TEXTURE_FORMAT)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            })
            .subresource_range(color_range(self.mip_levels));

        self.view = unsafe { self.device.device.create_image_view(&view_info, None) }
            .context("Failed to create texture view")?;

        Ok(())
    }

    /// Combined image sampler descriptor
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.view,
            image_layout: self.layout,
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        // Null handles are ignored by the destroy calls
        unsafe {
            self.device.device.destroy_sampler(self.sampler, None);
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

fn color_range(levels: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: levels,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_counts() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(256, 128), 9);
        assert_eq!(mip_level_count(300, 1), 9);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn chain_halves_down_to_one_pixel() {
        let chain = build_mip_chain(RgbaImage::new(8, 4));
        let sizes: Vec<_> = chain.iter().map(|level| level.dimensions()).collect();
        assert_eq!(sizes, vec![(8, 4), (4, 2), (2, 1), (1, 1)]);
    }

    #[test]
    fn packed_regions_have_cumulative_offsets() {
        let chain = build_mip_chain(RgbaImage::new(8, 4));
        let (bytes, regions) = pack_mip_chain(&chain);

        assert_eq!(bytes.len(), 128 + 32 + 8 + 4);
        let offsets: Vec<_> = regions.iter().map(|r| r.buffer_offset).collect();
        assert_eq!(offsets, vec![0, 128, 160, 168]);

        for (level, region) in regions.iter().enumerate() {
            assert_eq!(region.image_subresource.mip_level, level as u32);
            assert_eq!(region.image_extent.depth, 1);
        }
        assert_eq!(regions[1].image_extent.width, 4);
        assert_eq!(regions[1].image_extent.height, 2);
    }

    #[test]
    fn rows_land_at_row_pitch() {
        let src: Vec<u8> = (1..=16).collect();
        let mut dst = vec![0u8; 24];
        copy_rows(&src, 8, &mut dst, 12);

        assert_eq!(&dst[0..8], &src[0..8]);
        assert_eq!(&dst[8..12], &[0, 0, 0, 0]);
        assert_eq!(&dst[12..20], &src[8..16]);
    }

    #[test]
    fn checkerboard_alternates_cells() {
        let board = checkerboard(64, 8);
        assert_eq!(board.dimensions(), (64, 64));
        assert_eq!(board.get_pixel(0, 0), board.get_pixel(8, 8));
        assert_ne!(board.get_pixel(0, 0), board.get_pixel(8, 0));
    }

    #[test]
    fn missing_texture_falls_back_to_checkerboard() {
        let dir = tempfile::tempdir().unwrap();
        let image = load_rgba(&dir.path().join("nope.png")).unwrap();
        assert_eq!(image.dimensions(), (256, 256));
    }

    #[test]
    fn decodes_png_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.png");
        checkerboard(4, 2).save(&path).unwrap();

        let image = load_rgba(&path).unwrap();
        assert_eq!(image.dimensions(), (4, 4));
        assert_eq!(image.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
    }
}
