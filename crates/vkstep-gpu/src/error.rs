//! GPU error types.

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("Failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// A frame fence stayed unsignaled for the whole timeout.
    #[error("Fence not signaled within {timeout_ns} ns")]
    FenceTimeout { timeout_ns: u64 },

    #[error("No GPU supports Vulkan 1.3 with dynamic rendering and synchronization2")]
    NoSuitableDevice,

    #[error("No supported depth-stencil attachment format")]
    NoDepthStencilFormat,

    #[error("Memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("Allocator used after shutdown")]
    AllocatorShutDown,

    #[error("Buffer memory is not host visible")]
    NotHostVisible,

    #[error("Range {offset}+{len} exceeds buffer of {size} bytes")]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("Window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("The graphics queue cannot present to this surface")]
    NotPresentable,

    #[error("Surface reports no formats")]
    NoSurfaceFormat,

    #[error("Application name contains a NUL byte")]
    InvalidAppName,
}

pub type Result<T> = std::result::Result<T, GpuError>;
