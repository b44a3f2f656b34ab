// Backend module - Vulkan abstraction layer
//
// Design: thin RAII wrappers around ash, one per object kind the binaries
// create. Everything holding a Vulkan handle keeps an `Arc<VulkanDevice>` so
// the device always outlives it.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use buffer::GpuBuffer;
pub use command::CommandPool;
pub use device::VulkanDevice;
pub use instance::VulkanInstance;
pub use swapchain::{Surface, Swapchain};
