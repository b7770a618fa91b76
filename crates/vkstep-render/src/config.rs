//! Render manager configuration.

/// Where recorded frames are translated and submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulingMode {
    /// `finish` translates, submits and presents on the calling thread.
    #[default]
    Inline,
    /// `finish` hands the frame to a dedicated worker thread.
    Threaded,
}

/// Render manager configuration.
#[derive(Debug, Clone)]
pub struct RenderManagerConfig {
    /// Inline or threaded submission.
    pub scheduling: SchedulingMode,
    /// Timeout for frame fence waits, in nanoseconds.
    pub fence_timeout_ns: u64,
    /// Timeout for swapchain image acquisition, in nanoseconds.
    pub acquire_timeout_ns: u64,
    /// Name given to the worker thread in threaded mode.
    pub worker_name: String,
}

impl Default for RenderManagerConfig {
    fn default() -> Self {
        Self {
            scheduling: SchedulingMode::Inline,
            fence_timeout_ns: u64::MAX,
            acquire_timeout_ns: u64::MAX,
            worker_name: "vkstep-frame-worker".to_string(),
        }
    }
}

impl RenderManagerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheduling mode.
    pub fn with_scheduling(mut self, scheduling: SchedulingMode) -> Self {
        self.scheduling = scheduling;
        self
    }

    /// Set the fence wait timeout.
    pub fn with_fence_timeout(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Set the image acquisition timeout.
    pub fn with_acquire_timeout(mut self, timeout_ns: u64) -> Self {
        self.acquire_timeout_ns = timeout_ns;
        self
    }

    /// Set the worker thread name.
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Whether frames are submitted from a worker thread.
    pub fn is_threaded(&self) -> bool {
        self.scheduling == SchedulingMode::Threaded
    }
}
