//! Vulkan objects owned by the back end.

use std::sync::Arc;

use ash::vk;

use super::DeviceShared;
use crate::shared::TextureFormat;

/// Map a shareable texel format onto its Vulkan equivalent.
pub const fn vk_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::Rg16Float => vk::Format::R16G16_SFLOAT,
        TextureFormat::R16Float => vk::Format::R16_SFLOAT,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
    }
}

/// Image usage for an imported texture of `format`.
pub fn image_usage(format: TextureFormat) -> vk::ImageUsageFlags {
    let base = vk::ImageUsageFlags::SAMPLED
        | vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST;
    match format {
        TextureFormat::D32Float => base | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        _ => base | vk::ImageUsageFlags::STORAGE,
    }
}

/// Pick a memory type allowed by `type_bits` that has all of `flags`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..properties.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && properties.memory_types[i as usize]
                .property_flags
                .contains(flags)
    })
}

pub(super) struct SemaphoreInner {
    pub(super) shared: Arc<DeviceShared>,
    pub(super) semaphore: vk::Semaphore,
}

impl Drop for SemaphoreInner {
    fn drop(&mut self) {
        unsafe {
            self.shared.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Timeline semaphore used as a fence.
#[derive(Clone)]
pub struct VulkanFence {
    pub(super) inner: Arc<SemaphoreInner>,
}

impl VulkanFence {
    /// Raw semaphore handle.
    pub fn raw(&self) -> vk::Semaphore {
        self.inner.semaphore
    }
}

pub(super) struct BufferInner {
    pub(super) shared: Arc<DeviceShared>,
    pub(super) buffer: vk::Buffer,
    pub(super) memory: vk::DeviceMemory,
    pub(super) size: u64,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        unsafe {
            self.shared.device.destroy_buffer(self.buffer, None);
            self.shared.device.free_memory(self.memory, None);
        }
    }
}

/// Buffer bound to imported external memory.
#[derive(Clone)]
pub struct VulkanBuffer {
    pub(super) inner: Arc<BufferInner>,
}

impl VulkanBuffer {
    /// Raw buffer handle.
    pub fn raw(&self) -> vk::Buffer {
        self.inner.buffer
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size
    }
}

pub(super) struct ImageInner {
    pub(super) shared: Arc<DeviceShared>,
    pub(super) image: vk::Image,
    pub(super) memory: vk::DeviceMemory,
    pub(super) extent: vk::Extent2D,
    pub(super) format: vk::Format,
}

impl Drop for ImageInner {
    fn drop(&mut self) {
        unsafe {
            self.shared.device.destroy_image(self.image, None);
            self.shared.device.free_memory(self.memory, None);
        }
    }
}

/// Image bound to imported external memory.
#[derive(Clone)]
pub struct VulkanImage {
    pub(super) inner: Arc<ImageInner>,
}

impl VulkanImage {
    /// Raw image handle.
    pub fn raw(&self) -> vk::Image {
        self.inner.image
    }

    /// Image extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.inner.extent
    }

    /// Image format.
    pub fn format(&self) -> vk::Format {
        self.inner.format
    }
}

pub(super) struct PoolInner {
    pub(super) shared: Arc<DeviceShared>,
    pub(super) pool: vk::CommandPool,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Frees every command buffer allocated from the pool.
        unsafe {
            self.shared.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Command pool used as a command allocator.
pub struct VulkanCommandPool {
    pub(super) inner: Arc<PoolInner>,
}

/// Primary command buffer used as a command list.
pub struct VulkanCommandBuffer {
    pub(super) shared: Arc<DeviceShared>,
    // Keeps the owning pool alive as long as the buffer.
    pub(super) _pool: Arc<PoolInner>,
    pub(super) buffer: vk::CommandBuffer,
    pub(super) recording: bool,
}

impl VulkanCommandBuffer {
    /// Raw command buffer handle for recording engine commands.
    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Whether the buffer is between begin and end.
    pub fn is_recording(&self) -> bool {
        self.recording
    }
}
