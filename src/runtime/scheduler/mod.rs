//! Cooperative job scheduler
//!
//! This module provides the job [`Manager`]: a fixed set of role-pinned
//! threads (main, file IO, render) plus a pool of general-purpose workers
//! that run [`Job`]s cooperatively. A job runs in turns on a pooled
//! [`runner`](self::runner) context, so it can yield or wait on another job
//! without blocking the OS thread it was dispatched on.

pub mod error;
pub mod function;
pub mod job;
mod manager;
pub mod queue;
mod runner;
pub mod thread;

#[cfg(test)]
mod tests;

pub use error::{JobsError, Result};
pub use function::{
    async_function, async_function_with_args, await_function, await_function_with_args,
    make_function, make_function_with_args, FunctionHook,
};
pub use job::{Job, JobBuilder, JobHook, JobId, JobState, Turn};
pub use manager::{Handle, Manager};
pub(crate) use manager::Shared;
pub use queue::Quantum;
pub use thread::{ThreadId, ThreadRole};

use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Upper bound on threads a single manager may own.
pub const MAX_THREADS: usize = 1024;

static PROCESSOR_COUNT: Lazy<usize> = Lazy::new(|| {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
});

/// Number of processors, queried once.
#[inline]
pub fn processor_count() -> usize {
    *PROCESSOR_COUNT
}

/// Manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Exact number of general-purpose workers. Derived from the processor
    /// count when unset.
    pub general_purpose_threads: Option<usize>,
    /// Lower bound on derived general-purpose workers.
    pub min_general_purpose_threads: usize,
    /// Whether to spawn a dedicated render thread. When unset, one is
    /// spawned on machines with at least two processors; otherwise the
    /// main thread doubles as the render thread.
    pub separate_render_thread: Option<bool>,
    /// Idle runners kept per thread; extra runners are destroyed.
    pub max_pooled_runners: usize,
    /// Stack size of runner contexts, in bytes.
    pub runner_stack_size: Option<usize>,
    /// Stack size of managed threads, in bytes.
    pub thread_stack_size: Option<usize>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            general_purpose_threads: None,
            min_general_purpose_threads: 2,
            separate_render_thread: None,
            max_pooled_runners: 64,
            runner_stack_size: None,
            thread_stack_size: None,
        }
    }
}

impl ManagerConfig {
    /// Minimum accepted stack size.
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Check the configuration for values the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.general_purpose_threads == Some(0) {
            return Err(JobsError::InvalidConfig(
                "general_purpose_threads must be at least 1".to_string(),
            ));
        }
        if self.min_general_purpose_threads == 0 {
            return Err(JobsError::InvalidConfig(
                "min_general_purpose_threads must be at least 1".to_string(),
            ));
        }
        if self.general_purpose_threads.unwrap_or(0) > MAX_THREADS
            || self.min_general_purpose_threads > MAX_THREADS
        {
            return Err(JobsError::InvalidConfig(format!(
                "at most {} general-purpose threads are supported",
                MAX_THREADS
            )));
        }
        for (field, size) in [
            ("runner_stack_size", self.runner_stack_size),
            ("thread_stack_size", self.thread_stack_size),
        ] {
            if size.is_some_and(|s| s < Self::MIN_STACK_SIZE) {
                return Err(JobsError::InvalidConfig(format!(
                    "{} must be at least {} bytes",
                    field,
                    Self::MIN_STACK_SIZE
                )));
            }
        }
        Ok(())
    }

    /// Whether a dedicated render thread is spawned.
    pub fn wants_render_thread(&self) -> bool {
        self.separate_render_thread
            .unwrap_or_else(|| processor_count() >= 2)
    }

    /// Number of general-purpose workers to spawn.
    pub fn worker_count(&self) -> usize {
        if let Some(n) = self.general_purpose_threads {
            return n;
        }
        let named = 1 + usize::from(self.wants_render_thread());
        processor_count()
            .saturating_sub(named)
            .max(self.min_general_purpose_threads)
    }
}

/// Manager statistics.
#[derive(Debug, Default)]
pub struct ManagerStats {
    /// Runs started through `start_job`.
    pub jobs_scheduled: AtomicUsize,
    /// Hook invocations.
    pub turns_executed: AtomicUsize,
    /// Runs that ended in `Complete`.
    pub jobs_completed: AtomicUsize,
    /// Runs that ended in `Error`.
    pub jobs_failed: AtomicUsize,
    /// Runner contexts created.
    pub runners_created: AtomicUsize,
    /// Runner contexts destroyed.
    pub runners_destroyed: AtomicUsize,
    /// Peak number of jobs being executed at once.
    pub peak_executing: AtomicUsize,
}

impl ManagerStats {
    #[inline]
    pub fn record_scheduled(&self) {
        self.jobs_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_turn(&self) {
        self.turns_executed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_finished(
        &self,
        state: JobState,
    ) {
        match state {
            JobState::Complete => self.jobs_completed.fetch_add(1, Ordering::Relaxed),
            _ => self.jobs_failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub fn record_runner_created(&self) {
        self.runners_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_runner_destroyed(&self) {
        self.runners_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Update peak executing.
    #[inline]
    pub fn update_executing(
        &self,
        current: usize,
    ) {
        self.peak_executing.fetch_max(current, Ordering::Relaxed);
    }

    /// Runs that reached a terminal state.
    pub fn jobs_finished(&self) -> usize {
        self.jobs_completed.load(Ordering::Relaxed) + self.jobs_failed.load(Ordering::Relaxed)
    }
}
