//! Demo application: winit event handling around the render manager.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use tracing::{error, info, warn};
use vkstep_gpu::{GpuContext, GpuContextBuilder, SurfaceContext, Swapchain};
use vkstep_render::{
    capture_framebuffer, rect, ClearValues, Framebuffer, FrameOutcome, RenderManager,
    RenderManagerConfig, RenderPassAction, SwapchainImages, VulkanBackend,
};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowId};

use crate::config::DemoConfig;

/// Size of the offscreen scene framebuffer.
const SCENE_SIZE: (u32, u32) = (512, 512);

/// Size of the inset blitted into the scene.
const INSET_SIZE: (u32, u32) = (64, 64);

pub struct DemoApp {
    config: DemoConfig,
    state: Option<DemoState>,
}

impl DemoApp {
    pub fn new(config: DemoConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }
}

struct DemoState {
    window: Arc<Window>,
    gpu: Arc<GpuContext>,
    surface: SurfaceContext,
    swapchain: Option<Swapchain>,
    manager: RenderManager<VulkanBackend>,
    scene: Arc<Framebuffer>,
    inset: Arc<Framebuffer>,
    vsync: bool,
    frame: u64,
    started: Instant,
}

impl ApplicationHandler for DemoApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match DemoState::new(event_loop, &self.config) {
            Ok(state) => {
                self.state = Some(state);
                info!("Demo ready");
            }
            Err(e) => {
                error!("Failed to initialize demo: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.recreate_swapchain(size.width, size.height) {
                        error!("Resize failed: {e:#}");
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.render_frame(&self.config) {
                    Ok(true) => state.window.request_redraw(),
                    Ok(false) => {
                        self.shutdown();
                        event_loop.exit();
                    }
                    Err(e) => {
                        error!("Frame failed: {e:#}");
                        self.shutdown();
                        event_loop.exit();
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl DemoApp {
    fn shutdown(&mut self) {
        if let Some(state) = self.state.take() {
            if let Err(e) = state.shutdown() {
                error!("Shutdown failed: {e:#}");
            }
        }
    }
}

/// Packed RGBA8 color cycling with `frame`.
fn frame_color(frame: u64, phase: u64) -> u32 {
    let step = |offset: u64| -> u32 {
        let t = (frame + phase + offset) % 512;
        (if t < 256 { t } else { 511 - t }) as u32
    };
    step(0) | step(170) << 8 | step(340) << 16 | 0xFF00_0000
}

impl DemoState {
    fn new(event_loop: &ActiveEventLoop, config: &DemoConfig) -> anyhow::Result<Self> {
        let attributes = Window::default_attributes()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height));
        let window = Arc::new(event_loop.create_window(attributes)?);

        let gpu = Arc::new(
            GpuContextBuilder::new()
                .app_name(&config.title)
                .validation(config.validation)
                .inflight_frames(config.frames_in_flight)
                .build()?,
        );
        info!("GPU: {}", gpu.capabilities().summary());

        // SAFETY: the window outlives the surface; both are owned by this state.
        let surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };
        let size = window.inner_size();
        // SAFETY: the context and surface are valid.
        let swapchain = unsafe {
            surface.create_swapchain(&gpu, size.width.max(1), size.height.max(1), config.vsync, None)?
        };

        let manager_config = RenderManagerConfig::new().with_scheduling(config.scheduling);
        let mut manager = RenderManager::new(VulkanBackend::new(gpu.clone()), manager_config)?;
        manager.create_backbuffers(&SwapchainImages::from(&swapchain))?;

        let format = vk::Format::R8G8B8A8_UNORM;
        let scene = manager.create_framebuffer(SCENE_SIZE.0, SCENE_SIZE.1, format)?;
        let inset = manager.create_framebuffer(INSET_SIZE.0, INSET_SIZE.1, format)?;

        if let Some(plan) = &config.screenshots {
            info!(frames = ?plan.frames, pattern = %plan.pattern, "Screenshot capture enabled");
        }

        Ok(Self {
            window,
            gpu,
            surface,
            swapchain: Some(swapchain),
            manager,
            scene,
            inset,
            vsync: config.vsync,
            frame: 0,
            started: Instant::now(),
        })
    }

    /// Record and finish one frame. Returns `false` once the demo should exit.
    fn render_frame(&mut self, config: &DemoConfig) -> anyhow::Result<bool> {
        let frame = self.frame;
        let manager = &mut self.manager;
        manager.begin_frame()?;

        manager.bind_framebuffer_as_render_target(
            Some(&self.inset),
            RenderPassAction::Clear,
            RenderPassAction::DontCare,
            ClearValues::new(frame_color(frame, 256), 1.0, 0),
        );
        manager.bind_framebuffer_as_render_target(
            Some(&self.scene),
            RenderPassAction::Clear,
            RenderPassAction::Clear,
            ClearValues::new(frame_color(frame, 0), 1.0, 0),
        );
        let (scene_w, scene_h) = SCENE_SIZE;
        let (inset_w, inset_h) = INSET_SIZE;
        manager.blit_framebuffer(
            &self.inset,
            rect(0, 0, inset_w, inset_h),
            &self.scene,
            rect(16, 16, inset_w * 2, inset_h * 2),
            vk::ImageAspectFlags::COLOR,
            vk::Filter::LINEAR,
        );
        manager.copy_framebuffer(
            &self.inset,
            rect(0, 0, inset_w, inset_h),
            &self.scene,
            vk::Offset2D {
                x: (scene_w - inset_w - 16) as i32,
                y: (scene_h - inset_h - 16) as i32,
            },
            vk::ImageAspectFlags::COLOR,
        );

        // A sampling pipeline would bind this view; the read still orders the passes.
        let _scene_view =
            manager.bind_framebuffer_as_texture(&self.scene, 0, vk::ImageAspectFlags::COLOR);
        manager.bind_framebuffer_as_render_target(
            None,
            RenderPassAction::Clear,
            RenderPassAction::Clear,
            ClearValues::new(frame_color(frame, 128), 1.0, 0),
        );

        let mut keep_running = true;
        if let Some(plan) = &config.screenshots {
            if plan.wants(frame) {
                capture_framebuffer(manager, &self.scene, plan.path_for(frame))?;
            }
            keep_running = !(plan.exit_after && plan.is_complete(frame + 1));
        }

        let outcome = manager.finish()?;
        self.frame += 1;
        if outcome.needs_recreate() {
            let size = self.window.inner_size();
            self.recreate_swapchain(size.width, size.height)?;
        } else if outcome == FrameOutcome::Offscreen {
            warn!(frame, "Frame rendered without a swapchain");
        }
        Ok(keep_running)
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.manager.destroy_backbuffers()?;
        let Some(old) = self.swapchain.take() else {
            return Ok(());
        };
        // SAFETY: the manager idled the device and detached the old swapchain.
        let swapchain = unsafe {
            self.surface
                .recreate_swapchain(&self.gpu, old, width, height, self.vsync)?
        };
        self.manager
            .create_backbuffers(&SwapchainImages::from(&swapchain))?;
        info!(
            width = swapchain.extent.width,
            height = swapchain.extent.height,
            "Swapchain recreated"
        );
        self.swapchain = Some(swapchain);
        Ok(())
    }

    fn shutdown(self) -> anyhow::Result<()> {
        let Self {
            gpu,
            surface,
            swapchain,
            mut manager,
            scene,
            inset,
            frame,
            started,
            ..
        } = self;

        if let Some(issue) = manager.wait_for_worker()? {
            info!(?issue, "Last queued frame reported a surface issue");
        }
        manager.destroy_framebuffer(scene)?;
        manager.destroy_framebuffer(inset)?;
        manager.destroy_backbuffers()?;
        drop(manager);

        // SAFETY: the device is idle and nothing references the swapchain or surface.
        unsafe {
            if let Some(swapchain) = swapchain {
                swapchain.destroy(gpu.device(), &surface.swapchain_loader);
            }
            surface.destroy();
        }

        let elapsed = started.elapsed().as_secs_f64();
        if frame > 0 && elapsed > 0.0 {
            info!(frames = frame, fps = format!("{:.1}", frame as f64 / elapsed), "Demo finished");
        }
        Ok(())
    }
}
