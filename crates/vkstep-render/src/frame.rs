//! Frame slots and the submit side of a frame.

use crate::backend::{AcquireOutcome, FrameResources, RenderBackend, Submission};
use crate::config::RenderManagerConfig;
use crate::error::Result;
use crate::queue_runner::QueueRunner;
use crate::step::Step;
use parking_lot::Mutex;
use tracing::{debug, error, warn};
use vkstep_gpu::PresentStatus;

/// Lifecycle of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Retired; command buffers may be reused.
    Idle,
    /// Between `begin_frame` and `finish`.
    Recording,
    /// Submitted with the slot fence attached.
    Submitted,
}

/// What happened to a finished frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Presented, but the swapchain should be recreated.
    Suboptimal,
    /// Nothing was presented; the swapchain must be recreated.
    OutOfDate,
    /// Submitted without a backbuffer attached.
    Offscreen,
    /// Handed to the frame worker; the outcome is reported later.
    Queued,
}

impl FrameOutcome {
    /// Whether the caller should recreate the swapchain.
    pub fn needs_recreate(self) -> bool {
        matches!(self, Self::Suboptimal | Self::OutOfDate)
    }
}

impl From<PresentStatus> for FrameOutcome {
    fn from(status: PresentStatus) -> Self {
        match status {
            PresentStatus::Optimal => Self::Presented,
            PresentStatus::Suboptimal => Self::Suboptimal,
            PresentStatus::OutOfDate => Self::OutOfDate,
        }
    }
}

/// One round-robin frame context.
#[derive(Debug)]
pub(crate) struct FrameSlot {
    pub resources: FrameResources,
    /// The setup command buffer is open.
    pub has_setup_commands: bool,
    /// The main command buffer is open and acquisition was attempted.
    pub has_begun: bool,
    /// `image_available` will be signaled and nobody waited on it yet.
    pub acquire_wait_pending: bool,
    pub swapchain_image: Option<u32>,
    pub acquire_out_of_date: bool,
    pub steps: Vec<Step>,
    pub state: FrameState,
}

impl FrameSlot {
    pub fn new(resources: FrameResources) -> Self {
        Self {
            resources,
            has_setup_commands: false,
            has_begun: false,
            acquire_wait_pending: false,
            swapchain_image: None,
            acquire_out_of_date: false,
            steps: Vec::new(),
            state: FrameState::Idle,
        }
    }

    fn reset_submit_state(&mut self) {
        self.has_setup_commands = false;
        self.has_begun = false;
        self.acquire_wait_pending = false;
        self.swapchain_image = None;
        self.acquire_out_of_date = false;
        self.steps.clear();
    }
}

/// State shared between the manager and the frame worker.
///
/// Lock order: a slot before the runner.
pub(crate) struct Shared<B: RenderBackend> {
    pub backend: B,
    pub slots: Vec<Mutex<FrameSlot>>,
    pub runner: Mutex<QueueRunner>,
    pub config: RenderManagerConfig,
}

impl<B: RenderBackend> Shared<B> {
    pub fn new(backend: B, slots: Vec<FrameSlot>, config: RenderManagerConfig) -> Self {
        Self {
            backend,
            slots: slots.into_iter().map(Mutex::new).collect(),
            runner: Mutex::new(QueueRunner::new()),
            config,
        }
    }
}

impl<B: RenderBackend> Drop for Shared<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            error!("Failed to wait for device idle during shutdown: {e}");
        }
        for slot in &mut self.slots {
            self.backend.destroy_frame_resources(&slot.get_mut().resources);
        }
        if let Some(backbuffer) = self.runner.get_mut().set_backbuffer(None) {
            self.backend.queue_delete_image(backbuffer.depth);
        }
    }
}

/// Acquire a swapchain image and open the main command buffer, once per frame.
fn begin_submit<B: RenderBackend>(shared: &Shared<B>, slot: &mut FrameSlot) -> Result<()> {
    if slot.has_begun {
        return Ok(());
    }
    let backend = &shared.backend;
    let resources = slot.resources;

    let has_backbuffer = shared.runner.lock().has_backbuffer();
    if has_backbuffer {
        let acquired = backend.acquire_next_image(
            resources.sync.image_available,
            shared.config.acquire_timeout_ns,
        )?;
        match acquired {
            AcquireOutcome::Image(index) => {
                slot.swapchain_image = Some(index);
                slot.acquire_wait_pending = true;
            }
            AcquireOutcome::OutOfDate => {
                warn!("Swapchain out of date at acquire; frame will not be presented");
                slot.acquire_out_of_date = true;
            }
        }
    }

    backend.begin_command_buffer(resources.main_cmd)?;
    if let Some(index) = slot.swapchain_image {
        let mut encoder = backend.encoder(resources.main_cmd);
        shared.runner.lock().begin_backbuffer(&mut encoder, index);
    }
    slot.has_begun = true;
    Ok(())
}

/// Translate the slot's steps into its main command buffer.
fn translate<B: RenderBackend>(shared: &Shared<B>, slot: &mut FrameSlot, end: bool) -> Result<()> {
    let mut encoder = shared.backend.encoder(slot.resources.main_cmd);
    let mut runner = shared.runner.lock();
    runner.run_steps(
        &shared.backend,
        &mut encoder,
        &mut slot.steps,
        slot.swapchain_image,
    )?;
    if end {
        if let Some(index) = slot.swapchain_image {
            runner.end_backbuffer(&mut encoder, index);
        }
    }
    Ok(())
}

/// Close and submit the setup command buffer if it was opened.
fn submit_setup<B: RenderBackend>(shared: &Shared<B>, slot: &mut FrameSlot) -> Result<()> {
    if !slot.has_setup_commands {
        return Ok(());
    }
    let cmd = slot.resources.setup_cmd;
    shared.backend.end_command_buffer(cmd)?;
    shared.backend.submit(&Submission {
        command_buffers: &[cmd],
        wait: None,
        signal: None,
        fence: None,
    })?;
    slot.has_setup_commands = false;
    Ok(())
}

/// Translate, submit and present the frame recorded in `slot_index`.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub(crate) fn run_frame<B: RenderBackend>(
    shared: &Shared<B>,
    slot_index: usize,
) -> Result<FrameOutcome> {
    let mut guard = shared.slots[slot_index].lock();
    let slot = &mut *guard;
    let result = submit_frame(shared, slot);
    slot.reset_submit_state();
    // A frame that failed after its fenced submit still has work in flight.
    if slot.state != FrameState::Submitted {
        slot.state = FrameState::Idle;
    }
    debug!(slot = slot_index, outcome = ?result.as_ref().ok(), "Frame submitted");
    result
}

fn submit_frame<B: RenderBackend>(shared: &Shared<B>, slot: &mut FrameSlot) -> Result<FrameOutcome> {
    begin_submit(shared, slot)?;
    translate(shared, slot, true)?;

    let backend = &shared.backend;
    let resources = slot.resources;
    backend.end_command_buffer(resources.main_cmd)?;
    submit_setup(shared, slot)?;

    let presenting = slot.swapchain_image;
    backend.submit(&Submission {
        command_buffers: &[resources.main_cmd],
        wait: slot
            .acquire_wait_pending
            .then_some(resources.sync.image_available),
        signal: presenting.map(|_| resources.sync.render_finished),
        fence: Some(resources.sync.in_flight),
    })?;
    slot.state = FrameState::Submitted;
    slot.acquire_wait_pending = false;

    Ok(match presenting {
        Some(index) => backend.present(index, resources.sync.render_finished)?.into(),
        None if slot.acquire_out_of_date => FrameOutcome::OutOfDate,
        None => FrameOutcome::Offscreen,
    })
}

/// Submit everything recorded so far in `slot_index` and wait for the device.
///
/// The main command buffer is reopened so the frame continues normally.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub(crate) fn flush<B: RenderBackend>(shared: &Shared<B>, slot_index: usize) -> Result<()> {
    let mut guard = shared.slots[slot_index].lock();
    let slot = &mut *guard;
    begin_submit(shared, slot)?;
    translate(shared, slot, false)?;

    let backend = &shared.backend;
    let resources = slot.resources;
    backend.end_command_buffer(resources.main_cmd)?;
    submit_setup(shared, slot)?;

    // Consume the acquire signal here so the semaphore is unsignaled again.
    let wait = slot
        .acquire_wait_pending
        .then_some(resources.sync.image_available);
    slot.acquire_wait_pending = false;
    backend.submit(&Submission {
        command_buffers: &[resources.main_cmd],
        wait,
        signal: None,
        fence: None,
    })?;
    backend.wait_idle()?;
    backend.begin_command_buffer(resources.main_cmd)?;
    debug!(slot = slot_index, "Synchronous flush complete");
    Ok(())
}
