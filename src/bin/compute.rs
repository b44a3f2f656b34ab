// =============================================================================
// HEADLESS COMPUTE - one dispatch over two storage buffers
// =============================================================================
//
// instance -> device (compute queue) -> storage buffers -> compute shader ->
// descriptor set + pipeline -> record dispatch -> submit, wait -> read back
//
// The shader writes `output[i] = input[i] * 2`; the host checks every element.
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use learning_vulkan::backend::descriptor::{storage_bindings, Descriptors};
use learning_vulkan::backend::pipeline::{Pipeline, PipelineCache};
use learning_vulkan::backend::shader::ShaderSet;
use learning_vulkan::backend::{CommandPool, GpuBuffer, VulkanDevice, VulkanInstance};
use learning_vulkan::config;

/// Must match `local_size_x` in shaders/compute.comp
const WORKGROUP_SIZE: u32 = 64;

fn main() -> Result<()> {
    let config = config::load_and_init_logging(config::CONFIG_PATH);

    let count = config.compute.element_count;
    let input = input_values(count)?;
    log::info!("Dispatching compute over {} elements", count);

    // ─────────────────────────────────────────────────────────────────────────
    // STEP 1: Instance and device, no surface
    // ─────────────────────────────────────────────────────────────────────────
    let instance = VulkanInstance::new("Learning Vulkan Compute", &[], config.debug.validation_layers)?;
    let device = VulkanDevice::new(instance, None)?;
    let queue = device.compute_queue;
    let commands = CommandPool::new(
        device.clone(),
        device.queue_families.compute,
        vk::CommandPoolCreateFlags::empty(),
    )?;

    // ─────────────────────────────────────────────────────────────────────────
    // STEP 2: Storage buffers
    // ─────────────────────────────────────────────────────────────────────────
    let input_buffer = GpuBuffer::with_data(
        device.clone(),
        "compute input",
        vk::BufferUsageFlags::STORAGE_BUFFER,
        &input,
    )?;
    let output_buffer = GpuBuffer::new(
        device.clone(),
        "compute output",
        (input.len() * std::mem::size_of::<i32>()) as vk::DeviceSize,
        vk::BufferUsageFlags::STORAGE_BUFFER,
        MemoryLocation::GpuToCpu,
    )?;

    // ─────────────────────────────────────────────────────────────────────────
    // STEP 3: Descriptors and pipeline
    // ─────────────────────────────────────────────────────────────────────────
    let descriptors = Descriptors::new(device.clone(), &storage_bindings(2))?;
    descriptors.write_buffer(0, vk::DescriptorType::STORAGE_BUFFER, input_buffer.descriptor_info());
    descriptors.write_buffer(1, vk::DescriptorType::STORAGE_BUFFER, output_buffer.descriptor_info());

    let shaders = ShaderSet::from_files(
        device.clone(),
        &[(vk::ShaderStageFlags::COMPUTE, config.compute.shader_path.as_path())],
    )?;
    let stage = shaders
        .stages()
        .into_iter()
        .next()
        .context("Compute shader set is empty")?;

    let cache = PipelineCache::new(device.clone())?;
    let pipeline = Pipeline::compute(device.clone(), &cache, stage, descriptors.pipeline_layout)?;
    drop(shaders);

    // ─────────────────────────────────────────────────────────────────────────
    // STEP 4: Record, submit, wait
    // ─────────────────────────────────────────────────────────────────────────
    let groups = dispatch_groups(count, WORKGROUP_SIZE);
    log::debug!("{} workgroups of {}", groups, WORKGROUP_SIZE);

    commands.one_shot(queue, |dev, cmd| {
        unsafe {
            dev.cmd_bind_pipeline(cmd, pipeline.bind_point, pipeline.pipeline);
            dev.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                descriptors.pipeline_layout,
                0,
                &[descriptors.set],
                &[],
            );
            dev.cmd_dispatch(cmd, groups, 1, 1);

            // Shader writes visible to the host read-back
            let barrier = vk::BufferMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(output_buffer.buffer)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .build();
            dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
        Ok(())
    })?;
    device.wait_idle()?;

    // ─────────────────────────────────────────────────────────────────────────
    // STEP 5: Read back and check
    // ─────────────────────────────────────────────────────────────────────────
    let output: Vec<i32> = output_buffer.read(input.len())?;
    for (i, (a, b)) in input.iter().zip(&output).take(4).enumerate() {
        println!("[{}] {} -> {}", i, a, b);
    }

    verify(&input, &output)?;
    println!("All {} elements match", count);
    Ok(())
}

/// `0..count` as the shader's i32 elements
fn input_values(count: u32) -> Result<Vec<i32>> {
    anyhow::ensure!(count > 0, "compute.element_count must be at least 1");
    let end = i32::try_from(count)
        .with_context(|| format!("compute.element_count {} does not fit in an i32", count))?;
    Ok((0..end).collect())
}

/// Workgroups needed to cover `count` invocations
fn dispatch_groups(count: u32, group_size: u32) -> u32 {
    count.div_ceil(group_size)
}

fn expected(value: i32) -> i32 {
    value.wrapping_mul(2)
}

/// Check every output element against the doubled input
fn verify(input: &[i32], output: &[i32]) -> Result<()> {
    anyhow::ensure!(
        input.len() == output.len(),
        "Length mismatch: {} inputs, {} outputs",
        input.len(),
        output.len()
    );

    let mut mismatches = input
        .iter()
        .zip(output)
        .enumerate()
        .filter(|&(_, (&a, &b))| expected(a) != b);

    if let Some((first, (a, b))) = mismatches.next() {
        let total = 1 + mismatches.count();
        anyhow::bail!(
            "{} of {} elements differ; first at [{}]: expected {}, got {}",
            total,
            input.len(),
            first,
            expected(*a),
            b
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_covers_every_element() {
        assert_eq!(dispatch_groups(1, 64), 1);
        assert_eq!(dispatch_groups(64, 64), 1);
        assert_eq!(dispatch_groups(65, 64), 2);
        assert_eq!(dispatch_groups(16384, 64), 256);
    }

    #[test]
    fn input_counts_outside_i32_are_rejected() {
        assert_eq!(input_values(4).unwrap(), vec![0, 1, 2, 3]);
        assert!(input_values(0).is_err());

        let err = input_values(i32::MAX as u32 + 1).unwrap_err().to_string();
        assert!(err.contains("does not fit"), "{}", err);
    }

    #[test]
    fn verify_accepts_doubled_values() {
        let input = vec![0, 1, -3, i32::MAX];
        let output: Vec<i32> = input.iter().map(|&x| expected(x)).collect();
        assert!(verify(&input, &output).is_ok());
    }

    #[test]
    fn verify_reports_mismatches() {
        let input = vec![1, 2, 3, 4];
        let output = vec![2, 4, 0, 0];
        let err = verify(&input, &output).unwrap_err().to_string();
        assert!(err.contains("2 of 4"), "{}", err);
        assert!(err.contains("[2]"), "{}", err);

        assert!(verify(&input, &output[..3]).is_err());
    }
}
