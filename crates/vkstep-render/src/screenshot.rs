//! Framebuffer screenshots.
//!
//! A [`ScreenshotPlan`] names the frames to capture and where to write them;
//! [`capture_framebuffer`] reads a framebuffer back synchronously and saves it.

use crate::backend::RenderBackend;
use crate::error::RenderError;
use crate::framebuffer::{rect, Framebuffer};
use crate::manager::RenderManager;
use crate::readback::DataFormat;
use ash::vk;
use image::{ImageBuffer, Rgba};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors from capturing or saving a screenshot.
#[derive(Error, Debug)]
pub enum ScreenshotError {
    #[error("Failed to read back framebuffer: {0}")]
    Readback(#[from] RenderError),

    #[error("Pixel data holds {actual} bytes, {width}x{height} RGBA needs {expected}")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to save screenshot: {0}")]
    Save(#[from] image::ImageError),

    #[error("Invalid frame list {0:?}")]
    InvalidFrameList(String),
}

/// Which frames to capture and where.
#[derive(Debug, Clone, Default)]
pub struct ScreenshotPlan {
    /// Output path; `{}` is replaced by the frame number.
    pub pattern: String,
    pub frames: BTreeSet<u64>,
    /// Stop the application once the last planned frame was captured.
    pub exit_after: bool,
}

impl ScreenshotPlan {
    pub const DEFAULT_PATTERN: &'static str = "screenshot_{}.png";

    /// A plan capturing frame 0 to `pattern`.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            frames: BTreeSet::from([0]),
            exit_after: false,
        }
    }

    pub fn with_frames(mut self, frames: impl IntoIterator<Item = u64>) -> Self {
        self.frames = frames.into_iter().collect();
        self
    }

    pub fn with_exit_after(mut self, exit_after: bool) -> Self {
        self.exit_after = exit_after;
        self
    }

    pub fn path_for(&self, frame: u64) -> PathBuf {
        PathBuf::from(self.pattern.replace("{}", &frame.to_string()))
    }

    pub fn wants(&self, frame: u64) -> bool {
        self.frames.contains(&frame)
    }

    /// Whether every planned frame lies before `frame`.
    pub fn is_complete(&self, frame: u64) -> bool {
        self.frames.last().is_some_and(|&last| frame > last)
    }
}

/// Parse a frame list such as `0,5,10-15`. Ranges are inclusive.
pub fn parse_frame_list(list: &str) -> Result<BTreeSet<u64>, ScreenshotError> {
    let invalid = || ScreenshotError::InvalidFrameList(list.to_string());
    let mut frames = BTreeSet::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u64 = start.trim().parse().map_err(|_| invalid())?;
                let end: u64 = end.trim().parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                frames.extend(start..=end);
            }
            None => {
                frames.insert(part.parse().map_err(|_| invalid())?);
            }
        }
    }
    if frames.is_empty() {
        return Err(invalid());
    }
    Ok(frames)
}

/// Save tightly packed RGBA8 pixels. The file format follows the extension.
pub fn save_rgba(
    data: Vec<u8>,
    width: u32,
    height: u32,
    path: impl AsRef<Path>,
) -> Result<(), ScreenshotError> {
    let path = path.as_ref();
    let expected = width as usize * height as usize * 4;
    let actual = data.len();
    let image = ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, data).ok_or(
        ScreenshotError::SizeMismatch {
            width,
            height,
            expected,
            actual,
        },
    )?;
    image.save(path)?;
    info!("Screenshot saved: {}", path.display());
    Ok(())
}

/// Read the color image of `framebuffer` and save it to `path`.
///
/// Must be called inside a frame; the frame is flushed synchronously.
pub fn capture_framebuffer<B: RenderBackend>(
    manager: &mut RenderManager<B>,
    framebuffer: &Arc<Framebuffer>,
    path: impl AsRef<Path>,
) -> Result<(), ScreenshotError> {
    let (width, height) = (framebuffer.width(), framebuffer.height());
    let mut pixels = vec![0u8; width as usize * height as usize * 4];
    manager.copy_framebuffer_to_memory_sync(
        framebuffer,
        vk::ImageAspectFlags::COLOR,
        rect(0, 0, width, height),
        DataFormat::R8G8B8A8Unorm,
        &mut pixels,
        width,
    )?;
    save_rgba(pixels, width, height, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderManagerConfig;
    use crate::step::{ClearValues, RenderPassAction};
    use crate::testing::MockBackend;

    #[test]
    fn frame_lists_accept_singles_and_ranges() {
        assert_eq!(parse_frame_list("5").unwrap(), BTreeSet::from([5]));
        assert_eq!(
            parse_frame_list("0, 5-7,10").unwrap(),
            BTreeSet::from([0, 5, 6, 7, 10])
        );
    }

    #[test]
    fn malformed_frame_lists_are_rejected() {
        for list in ["", "a", "3-1", "1-", "2,,x"] {
            assert!(
                matches!(parse_frame_list(list), Err(ScreenshotError::InvalidFrameList(_))),
                "{list:?} was accepted"
            );
        }
    }

    #[test]
    fn plan_paths_and_completion() {
        let plan = ScreenshotPlan::new("out/frame_{}.png").with_frames([2, 4]);
        assert_eq!(plan.path_for(4), PathBuf::from("out/frame_4.png"));
        assert!(plan.wants(2));
        assert!(!plan.wants(3));
        assert!(!plan.is_complete(4));
        assert!(plan.is_complete(5));
        assert!(!ScreenshotPlan::default().is_complete(100));
    }

    #[test]
    fn short_pixel_data_is_rejected() {
        let err = save_rgba(vec![0; 12], 2, 2, "unused.png").unwrap_err();
        assert!(matches!(
            err,
            ScreenshotError::SizeMismatch {
                expected: 16,
                actual: 12,
                ..
            }
        ));
    }

    #[test]
    fn captured_framebuffer_holds_cleared_color() {
        let mut manager =
            RenderManager::new(MockBackend::new(2), RenderManagerConfig::default()).unwrap();
        let fb = manager
            .create_framebuffer(3, 2, vk::Format::R8G8B8A8_UNORM)
            .unwrap();
        manager.begin_frame().unwrap();
        manager.bind_framebuffer_as_render_target(
            Some(&fb),
            RenderPassAction::Clear,
            RenderPassAction::Clear,
            ClearValues::new(0xFF20_4080, 1.0, 0),
        );

        let path = std::env::temp_dir().join(format!("vkstep-capture-{}.png", std::process::id()));
        capture_framebuffer(&mut manager, &fb, &path).unwrap();
        manager.finish().unwrap();

        let saved = image::open(&path).unwrap().to_rgba8();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(saved.dimensions(), (3, 2));
        assert!(saved.pixels().all(|p| p.0 == [0x80, 0x40, 0x20, 0xFF]));
    }
}
