//! GPU error types.

#[cfg(feature = "vulkan")]
use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[cfg(feature = "vulkan")]
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// The device was removed or reset; nothing submitted to it can be trusted.
    #[error("Device removed: {0}")]
    DeviceRemoved(String),

    /// A device-level call failed.
    #[error("Device call failed: {0}")]
    Device(String),

    /// Exporting or opening a shared handle failed.
    #[error("Shared handle error: {0}")]
    SharedHandle(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

#[cfg(feature = "vulkan")]
impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceRemoved(result.to_string()),
            other => Self::Vulkan(other),
        }
    }
}

impl GpuError {
    /// Whether the device can no longer be used at all.
    pub const fn is_device_removed(&self) -> bool {
        matches!(self, Self::DeviceRemoved(_))
    }
}

impl From<GpuError> for rtbridge_core::Error {
    fn from(e: GpuError) -> Self {
        Self::InternalError(e.to_string())
    }
}


/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
