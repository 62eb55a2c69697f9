//! Configuration types for softrma.

/// Domain configuration.
///
/// Controls queue sizing, progress batching, and the optional background
/// progress thread.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Default completion queue depth (free-list size).
    /// Default: 1024
    pub cq_depth: usize,
    /// Default event queue depth.
    /// Default: 256
    pub eq_depth: usize,
    /// Maximum number of in-flight requests.
    /// Default: 1024
    pub max_requests: usize,
    /// Maximum substrate messages claimed per progress call.
    /// Default: 64
    pub poll_batch: usize,
    /// Maximum outbound/serving streams advanced per progress call.
    /// Default: 8
    pub pump_batch: usize,
    /// Maximum buffered unexpected messages before new ones are dropped.
    /// Default: 256
    pub max_unexpected: usize,
    /// Run a background thread that drives progress.
    /// Default: false
    pub progress_thread: bool,
    /// Background progress interval in microseconds.
    /// Default: 100
    pub prog_interval_us: u64,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            cq_depth: 1024,
            eq_depth: 256,
            max_requests: 1024,
            poll_batch: 64,
            pump_batch: 8,
            max_unexpected: 256,
            progress_thread: false,
            prog_interval_us: 100,
        }
    }
}

impl DomainConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default completion queue depth.
    pub fn with_cq_depth(mut self, cq_depth: usize) -> Self {
        self.cq_depth = cq_depth;
        self
    }

    /// Set the default event queue depth.
    pub fn with_eq_depth(mut self, eq_depth: usize) -> Self {
        self.eq_depth = eq_depth;
        self
    }

    /// Set the maximum number of in-flight requests.
    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Set the substrate poll batch size.
    pub fn with_poll_batch(mut self, poll_batch: usize) -> Self {
        self.poll_batch = poll_batch;
        self
    }

    /// Set the stream pump batch size.
    pub fn with_pump_batch(mut self, pump_batch: usize) -> Self {
        self.pump_batch = pump_batch;
        self
    }

    /// Set the unexpected-message buffering limit.
    pub fn with_max_unexpected(mut self, max_unexpected: usize) -> Self {
        self.max_unexpected = max_unexpected;
        self
    }

    /// Enable or disable the background progress thread.
    pub fn with_progress_thread(mut self, progress_thread: bool) -> Self {
        self.progress_thread = progress_thread;
        self
    }

    /// Set the background progress interval in microseconds.
    pub fn with_prog_interval_us(mut self, prog_interval_us: u64) -> Self {
        self.prog_interval_us = prog_interval_us;
        self
    }
}
