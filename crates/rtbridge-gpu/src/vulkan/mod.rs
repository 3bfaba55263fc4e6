//! Vulkan native back end.
//!
//! Shared allocations arrive as opaque POSIX file descriptors
//! (`VK_KHR_external_memory_fd` / `VK_KHR_external_semaphore_fd`) and fences are
//! timeline semaphores. The host creates the device; this module only borrows it.

mod resource;

pub use resource::{
    find_memory_type, vk_format, VulkanBuffer, VulkanCommandBuffer, VulkanCommandPool,
    VulkanFence, VulkanImage,
};

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use rtbridge_core::CommandQueueKind;

use crate::api::{Api, CommandList, Device, Fence, Queue, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::shared::{SharedHandle, SharedHandleKind, SharedResourceDesc};
use resource::{image_usage, BufferInner, ImageInner, PoolInner, SemaphoreInner};

/// Marker type selecting the Vulkan back end.
#[derive(Debug)]
pub enum Vulkan {}

impl Api for Vulkan {
    type Device = VulkanDevice;
    type Queue = VulkanQueue;
    type Fence = VulkanFence;
    type CommandAllocator = VulkanCommandPool;
    type CommandList = VulkanCommandBuffer;
    type Buffer = VulkanBuffer;
    type Texture = VulkanImage;
}

pub(crate) struct DeviceShared {
    pub(crate) device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    semaphore_fd: ash::khr::external_semaphore_fd::Device,
    graphics_family: u32,
    compute_family: u32,
}

impl DeviceShared {
    const fn family(&self, kind: CommandQueueKind) -> u32 {
        match kind {
            CommandQueueKind::Direct => self.graphics_family,
            CommandQueueKind::Compute => self.compute_family,
        }
    }
}

/// Host-owned Vulkan device wrapped for interop use.
#[derive(Clone)]
pub struct VulkanDevice {
    shared: Arc<DeviceShared>,
}

impl VulkanDevice {
    /// Wrap an existing device.
    ///
    /// # Safety
    /// - `device` must have been created from `instance` and `physical_device` with
    ///   timeline semaphores, `VK_KHR_external_memory_fd` and
    ///   `VK_KHR_external_semaphore_fd` enabled.
    /// - The queue families must exist on the device.
    /// - The device must outlive every object created through this wrapper.
    pub unsafe fn from_raw(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        graphics_family: u32,
        compute_family: u32,
    ) -> Self {
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let semaphore_fd = ash::khr::external_semaphore_fd::Device::new(instance, &device);

        Self {
            shared: Arc::new(DeviceShared {
                device,
                memory_properties,
                semaphore_fd,
                graphics_family,
                compute_family,
            }),
        }
    }

    /// Underlying ash device.
    pub fn raw(&self) -> &ash::Device {
        &self.shared.device
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let semaphore = unsafe { self.shared.device.create_semaphore(&create_info, None)? };
        Ok(semaphore)
    }

    /// Allocate device memory from a duplicate of the fd behind `handle`.
    ///
    /// Vulkan takes ownership of the fd it imports, so the original stays with
    /// the handle owner and is closed by them.
    fn import_memory(
        &self,
        handle: &SharedHandle,
        requirements: vk::MemoryRequirements,
    ) -> Result<vk::DeviceMemory> {
        let memory_type = find_memory_type(
            &self.shared.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .ok_or_else(|| GpuError::SharedHandle("no device-local memory type".to_string()))?;

        let fd = duplicate_fd(handle)?;
        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
            .fd(fd.raw());
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type)
            .push_next(&mut import_info);

        let memory = unsafe { self.shared.device.allocate_memory(&alloc_info, None)? };
        fd.transfer_to_driver();
        Ok(memory)
    }
}

fn check_fd_handle(handle: &SharedHandle) -> Result<()> {
    if handle.kind() != SharedHandleKind::Fd {
        return Err(GpuError::SharedHandle(format!(
            "Vulkan back end only imports fd handles, got {handle:?}"
        )));
    }
    Ok(())
}

/// Duplicated fd that is closed on drop unless handed to the driver.
struct DuplicatedFd {
    #[cfg(unix)]
    fd: Option<std::os::fd::OwnedFd>,
}

impl DuplicatedFd {
    fn raw(&self) -> i32 {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            self.fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
        }
        #[cfg(not(unix))]
        {
            -1
        }
    }

    fn transfer_to_driver(self) {
        #[cfg(unix)]
        {
            use std::os::fd::IntoRawFd;
            let mut this = self;
            if let Some(fd) = this.fd.take() {
                // The driver owns it now.
                let _ = fd.into_raw_fd();
            }
        }
    }
}

#[cfg(unix)]
fn duplicate_fd(handle: &SharedHandle) -> Result<DuplicatedFd> {
    use std::os::fd::BorrowedFd;

    check_fd_handle(handle)?;
    let raw = i32::try_from(handle.raw().0)
        .map_err(|_| GpuError::SharedHandle(format!("{handle:?} is not a valid fd")))?;
    // SAFETY: the handle owner keeps the fd open for the duration of this call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    let owned = borrowed
        .try_clone_to_owned()
        .map_err(|e| GpuError::SharedHandle(format!("failed to duplicate {handle:?}: {e}")))?;
    Ok(DuplicatedFd { fd: Some(owned) })
}

#[cfg(not(unix))]
fn duplicate_fd(handle: &SharedHandle) -> Result<DuplicatedFd> {
    check_fd_handle(handle)?;
    Err(GpuError::SharedHandle(
        "fd import is only available on unix targets".to_string(),
    ))
}

impl Device<Vulkan> for VulkanDevice {
    fn create_queue(&self, kind: CommandQueueKind) -> Result<VulkanQueue> {
        let queue = unsafe { self.shared.device.get_device_queue(self.shared.family(kind), 0) };
        Ok(VulkanQueue {
            shared: self.shared.clone(),
            queue: Arc::new(Mutex::new(queue)),
        })
    }

    fn create_fence(&self, initial_value: u64) -> Result<VulkanFence> {
        let semaphore = self.create_timeline_semaphore(initial_value)?;
        Ok(VulkanFence {
            inner: Arc::new(SemaphoreInner {
                shared: self.shared.clone(),
                semaphore,
            }),
        })
    }

    fn create_command_allocator(&self, kind: CommandQueueKind) -> Result<VulkanCommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.shared.family(kind))
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { self.shared.device.create_command_pool(&create_info, None)? };
        Ok(VulkanCommandPool {
            inner: Arc::new(PoolInner {
                shared: self.shared.clone(),
                pool,
            }),
        })
    }

    fn create_command_list(
        &self,
        allocator: &VulkanCommandPool,
        _kind: CommandQueueKind,
    ) -> Result<VulkanCommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(allocator.inner.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.shared.device.allocate_command_buffers(&alloc_info)? };
        let buffer = buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Device("driver returned no command buffer".to_string()))?;

        Ok(VulkanCommandBuffer {
            shared: self.shared.clone(),
            _pool: allocator.inner.clone(),
            buffer,
            recording: false,
        })
    }

    fn reset_command_allocator(&self, allocator: &mut VulkanCommandPool) -> Result<()> {
        unsafe {
            self.shared
                .device
                .reset_command_pool(allocator.inner.pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }

    fn open_shared_buffer(&self, handle: &SharedHandle) -> Result<VulkanBuffer> {
        let SharedResourceDesc::Buffer { size } = handle.desc() else {
            return Err(GpuError::SharedHandle(format!("{handle:?} is not a buffer")));
        };
        check_fd_handle(handle)?;

        let mut external_info = vk::ExternalMemoryBufferCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .push_next(&mut external_info);

        let device = &self.shared.device;
        let buffer = unsafe { device.create_buffer(&create_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory = match self.import_memory(handle, requirements) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(e.into());
        }

        Ok(VulkanBuffer {
            inner: Arc::new(BufferInner {
                shared: self.shared.clone(),
                buffer,
                memory,
                size,
            }),
        })
    }

    fn open_shared_texture(&self, handle: &SharedHandle) -> Result<VulkanImage> {
        let SharedResourceDesc::Texture {
            width,
            height,
            format,
        } = handle.desc()
        else {
            return Err(GpuError::SharedHandle(format!("{handle:?} is not a texture")));
        };
        check_fd_handle(handle)?;

        let vk_format = vk_format(format);
        let extent = vk::Extent2D { width, height };
        let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_usage(format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external_info);

        let device = &self.shared.device;
        let image = unsafe { device.create_image(&create_info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let memory = match self.import_memory(handle, requirements) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(e.into());
        }

        Ok(VulkanImage {
            inner: Arc::new(ImageInner {
                shared: self.shared.clone(),
                image,
                memory,
                extent,
                format: vk_format,
            }),
        })
    }

    fn open_shared_fence(&self, handle: &SharedHandle) -> Result<VulkanFence> {
        if handle.desc() != SharedResourceDesc::Fence {
            return Err(GpuError::SharedHandle(format!("{handle:?} is not a fence")));
        }
        let fd = duplicate_fd(handle)?;

        let semaphore = self.create_timeline_semaphore(0)?;
        let fence = VulkanFence {
            inner: Arc::new(SemaphoreInner {
                shared: self.shared.clone(),
                semaphore,
            }),
        };

        let import_info = vk::ImportSemaphoreFdInfoKHR::default()
            .semaphore(semaphore)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD)
            .fd(fd.raw());
        unsafe { self.shared.semaphore_fd.import_semaphore_fd(&import_info)? };
        fd.transfer_to_driver();

        Ok(fence)
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.shared.device.device_wait_idle()? };
        Ok(())
    }
}

/// Vulkan queue. Submissions are serialised through an internal lock.
#[derive(Clone)]
pub struct VulkanQueue {
    shared: Arc<DeviceShared>,
    queue: Arc<Mutex<vk::Queue>>,
}

impl Queue<Vulkan> for VulkanQueue {
    fn submit(&self, batch: &SubmitBatch<'_, Vulkan>) -> Result<()> {
        if batch.lists.iter().any(|list| list.is_recording()) {
            return Err(GpuError::InvalidState(
                "executing a command buffer that is still recording".to_string(),
            ));
        }

        let (wait_semaphores, wait_values): (Vec<_>, Vec<_>) = batch
            .waits
            .iter()
            .map(|&(fence, value)| (fence.raw(), value))
            .unzip();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let command_buffers: Vec<_> = batch.lists.iter().map(|list| list.raw()).collect();
        let (signal_semaphores, signal_values): (Vec<_>, Vec<_>) = batch
            .signals
            .iter()
            .map(|&(fence, value)| (fence.raw(), value))
            .unzip();

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        let queue = self.queue.lock();
        unsafe {
            self.shared.device.queue_submit(
                *queue,
                std::slice::from_ref(&submit_info),
                vk::Fence::null(),
            )?;
        }
        Ok(())
    }
}

impl Fence for VulkanFence {
    fn completed_value(&self) -> Result<u64> {
        let value = unsafe {
            self.inner
                .shared
                .device
                .get_semaphore_counter_value(self.inner.semaphore)?
        };
        Ok(value)
    }
}

impl CommandList<Vulkan> for VulkanCommandBuffer {
    fn reset(&mut self, _allocator: &VulkanCommandPool) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.shared
                .device
                .begin_command_buffer(self.buffer, &begin_info)?;
        }
        self.recording = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        unsafe { self.shared.device.end_command_buffer(self.buffer)? };
        self.recording = false;
        Ok(())
    }
}
