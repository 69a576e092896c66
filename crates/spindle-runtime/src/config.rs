//! Runtime configuration

use spindle_core::constants::DEFAULT_STACK_SIZE;
use spindle_core::{SchedError, SchedResult};

/// Configuration consumed by `Scheduler::new` and `IoManager::new`
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Total worker count. With `use_caller` the constructing thread is one
    /// of them and only `worker_threads - 1` OS threads are spawned.
    pub worker_threads: usize,

    /// Count the constructing thread as a worker; its dispatch loop runs
    /// inside `stop()`
    pub use_caller: bool,

    /// Name used for worker thread names and log lines
    pub name: String,

    /// Default stack size for fibers the scheduler creates (idle fibers,
    /// wrapped plain callables)
    pub stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            use_caller: true,
            name: "spindle".to_string(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Config with `n` workers on dedicated OS threads (caller not enrolled)
    pub fn with_threads(n: usize) -> Self {
        Self {
            worker_threads: n,
            use_caller: false,
            ..Self::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Check the configuration for nonsense values
    pub fn validate(&self) -> SchedResult<()> {
        if self.worker_threads == 0 {
            return Err(SchedError::InvalidConfig("worker_threads must be > 0"));
        }
        if self.stack_size < 4096 {
            return Err(SchedError::InvalidConfig("stack_size below one page"));
        }
        if self.name.is_empty() {
            return Err(SchedError::InvalidConfig("name must not be empty"));
        }
        Ok(())
    }
}
