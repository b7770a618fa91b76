//! Deferred step recording for vkstep.
//!
//! This crate provides:
//! - Step recording with render target de-duplication and clear folding
//! - Read-after-render dependency resolution
//! - Translation of steps into dynamic rendering, barriers and transfers
//! - Round-robin frame slots with fence pacing, inline or on a worker thread
//! - Synchronous framebuffer readback and screenshots

pub mod backend;
pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod framebuffer;
pub mod manager;
pub mod queue_runner;
pub mod readback;
pub mod recorder;
pub mod resolver;
pub mod screenshot;
pub mod step;
mod worker;

#[cfg(test)]
mod testing;

pub use backend::{AcquireOutcome, FrameResources, RenderBackend, Submission, VulkanBackend};
pub use config::{RenderManagerConfig, SchedulingMode};
pub use encoder::{CommandEncoder, ImageTransition, RenderingTarget, VulkanEncoder};
pub use error::{RenderError, Result};
pub use frame::{FrameOutcome, FrameState};
pub use framebuffer::{rect, Framebuffer, ImageDesc, RenderImage};
pub use manager::{RenderManager, SwapchainImages};
pub use readback::DataFormat;
pub use screenshot::{capture_framebuffer, parse_frame_list, save_rgba, ScreenshotError, ScreenshotPlan};
pub use step::{ClearValues, DrawCommand, DrawIndexedCommand, RenderCommand, RenderPassAction};
