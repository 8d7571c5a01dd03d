//! Runtime configuration objects.
//!
//! Configuration is passed explicitly at construction time. Each type carries a
//! [`Default`] implementation with the same values the runtime falls back to when
//! a caller supplies nothing, so there is no process-wide mutable state.

use crate::watchdog::WatchdogAction;
use std::time::Duration;

/// Per-module event loop configuration.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Capacity of the inbound call queue. Must be non-zero.
    pub call_queue_len: usize,
    /// Capacity of the timer firing queue. Zero disables timers for the module.
    pub timer_queue_len: usize,
    /// Capacity of the completion callback queue. Zero disables callbacks.
    pub callback_queue_len: usize,
    /// Executions slower than this are logged as warnings. Zero disables the check.
    pub exec_warn_timeout: Duration,
    /// Watchdog budget for a single execution. Zero disables the watchdog.
    pub block_timeout: Duration,
    /// Time between the fatal watchdog report and the watchdog action.
    pub exit_grace: Duration,
    /// What the watchdog does once an execution overruns its budget.
    pub watchdog_action: WatchdogAction,
    /// Enables fail-fast draining of a persistently full call queue.
    pub fail_fast: bool,
    /// How long the call queue must stay full before it is drained.
    pub fail_fast_grace: Duration,
    /// Answer drained synchronous and async callers with an error instead of
    /// silently dropping their calls.
    pub fail_pending_on_drain: bool,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            call_queue_len: 1000,
            timer_queue_len: 2048,
            callback_queue_len: 2048,
            exec_warn_timeout: Duration::from_millis(10),
            block_timeout: Duration::from_secs(10),
            exit_grace: Duration::from_secs(3),
            watchdog_action: WatchdogAction::default(),
            fail_fast: false,
            fail_fast_grace: Duration::from_secs(30),
            fail_pending_on_drain: true,
        }
    }
}

/// Task pool configuration.
#[derive(Debug, Clone)]
pub struct TaskPoolConfig {
    /// Worker thread count. Zero means one worker per CPU.
    pub workers: usize,
    /// Per-worker queue capacity. Zero falls back to the default.
    pub queue_len: usize,
}

impl TaskPoolConfig {
    pub const DEFAULT_QUEUE_LEN: usize = 10_000;

    pub(crate) fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub(crate) fn resolved_queue_len(&self) -> usize {
        if self.queue_len == 0 {
            Self::DEFAULT_QUEUE_LEN
        } else {
            self.queue_len
        }
    }
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_len: Self::DEFAULT_QUEUE_LEN,
        }
    }
}

/// Application level runtime configuration, owned by [`crate::App`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub module: ModuleConfig,
    pub task_pool: TaskPoolConfig,
}
