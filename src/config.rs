//! Scheduler configuration.

use crate::poller::EventMultiplexer;

/// Configuration consumed by [`crate::scheduler::Scheduler::with_config`].
pub struct Config {
    /// Size of each fiber stack, rounded up to the page size. Default 16 KiB.
    pub stack_size: usize,
    /// Number of stacks carved out of a single pool mapping before another
    /// mapping is made. Default 128.
    pub stacks_per_pool: usize,
    /// Number of OS threads in the blocking-I/O worker pool. Default is
    /// `available_parallelism() - 1`, floored at 1.
    pub worker_pool_size: usize,
    /// An event multiplexer to use instead of the default `polling`-backed
    /// one. Exists so tests can inject a fake multiplexer.
    pub multiplexer: Option<Box<dyn EventMultiplexer>>,
}

impl Default for Config {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            stack_size: 16 * 1024,
            stacks_per_pool: 128,
            worker_pool_size: (parallelism.saturating_sub(1)).max(1),
            multiplexer: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("stack_size", &self.stack_size)
            .field("stacks_per_pool", &self.stacks_per_pool)
            .field("worker_pool_size", &self.worker_pool_size)
            .field("multiplexer", &self.multiplexer.is_some())
            .finish()
    }
}
