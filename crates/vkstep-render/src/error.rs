//! Render manager error types.

use crate::readback::DataFormat;
use ash::vk;
use thiserror::Error;
use vkstep_gpu::GpuError;

/// Errors surfaced by the render manager.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Device context error.
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The readback source cannot be converted to the requested format.
    #[error("Cannot convert {src:?} ({aspect:?}) readback to {dst:?}")]
    UnsupportedReadback {
        src: vk::Format,
        aspect: vk::ImageAspectFlags,
        dst: DataFormat,
    },

    /// A synchronous readback was requested but nothing was read back.
    #[error("No readback has been executed")]
    NoReadback,

    /// The frame worker thread could not be started.
    #[error("Failed to spawn frame worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// The frame worker thread exited while frames were still pending.
    #[error("Frame worker disconnected")]
    WorkerDisconnected,
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;
