//! Vulkan device context for vkstep.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - GPU capability detection
//! - Memory allocation via gpu-allocator
//! - Per-slot command pools and synchronization2 queue submission
//! - Surface and swapchain handling
//! - The frame index and per-frame deferred resource deletion

pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod error;
pub mod instance;
pub mod memory;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::SlotCommands;
pub use context::{GpuContext, GpuContextBuilder};
pub use deferred::{DeferredDeletionQueue, DeleteList};
pub use error::{GpuError, Result};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use surface::SurfaceContext;
pub use swapchain::{PresentStatus, SurfaceSupport, Swapchain, SwapchainDesc};
pub use sync::FrameSync;
