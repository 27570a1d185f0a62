//! Run plain closures as jobs.
//!
//! Each helper wraps a closure in a one-shot [`Job`] with `Default` quantum
//! that completes after a single call. Restarting the job with
//! `start_job(true)` calls the closure again.

use std::sync::Arc;

use super::job::{Job, JobHook, Turn};
use super::manager::Handle;
use super::thread::ThreadId;

/// Hook that calls a closure once and completes.
pub struct FunctionHook<F> {
    func: F,
}

impl<F> FunctionHook<F>
where
    F: FnMut() + Send + 'static,
{
    #[inline]
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> JobHook for FunctionHook<F>
where
    F: FnMut() + Send + 'static,
{
    fn execute(
        &mut self,
        turn: &mut Turn<'_>,
    ) {
        (self.func)();
        turn.complete();
    }
}

/// Wrap `func` in a job without starting it.
///
/// `thread` selects the thread to run on; `None` runs on any
/// general-purpose worker.
pub fn make_function<F>(
    handle: &Handle,
    thread: Option<ThreadId>,
    func: F,
) -> Arc<Job>
where
    F: FnMut() + Send + 'static,
{
    Job::builder()
        .affinity(thread)
        .build(handle, FunctionHook::new(func))
}

/// Like [`make_function`], binding `args`. The arguments are cloned for
/// every call. Use a tuple to bind several.
pub fn make_function_with_args<F, A>(
    handle: &Handle,
    thread: Option<ThreadId>,
    mut func: F,
    args: A,
) -> Arc<Job>
where
    F: FnMut(A) + Send + 'static,
    A: Clone + Send + 'static,
{
    make_function(handle, thread, move || func(args.clone()))
}

/// Wrap `func` in a job and start it.
///
/// The closure is always queued, even when `thread` is the calling thread,
/// so returning from here says nothing about the job having run.
pub fn async_function<F>(
    handle: &Handle,
    thread: Option<ThreadId>,
    func: F,
) -> Arc<Job>
where
    F: FnMut() + Send + 'static,
{
    let job = make_function(handle, thread, func);
    job.start_job(false);
    job
}

pub fn async_function_with_args<F, A>(
    handle: &Handle,
    thread: Option<ThreadId>,
    func: F,
    args: A,
) -> Arc<Job>
where
    F: FnMut(A) + Send + 'static,
    A: Clone + Send + 'static,
{
    let job = make_function_with_args(handle, thread, func, args);
    job.start_job(false);
    job
}

/// Wrap `func` in a job, start it and wait until it finished.
///
/// The returned job is `Complete` or `Error`, unless the manager shut down
/// during the wait.
pub fn await_function<F>(
    handle: &Handle,
    thread: Option<ThreadId>,
    func: F,
) -> Arc<Job>
where
    F: FnMut() + Send + 'static,
{
    let job = async_function(handle, thread, func);
    job.wait_until_job_is_not_running();
    job
}

pub fn await_function_with_args<F, A>(
    handle: &Handle,
    thread: Option<ThreadId>,
    func: F,
    args: A,
) -> Arc<Job>
where
    F: FnMut(A) + Send + 'static,
    A: Clone + Send + 'static,
{
    let job = async_function_with_args(handle, thread, func, args);
    job.wait_until_job_is_not_running();
    job
}
