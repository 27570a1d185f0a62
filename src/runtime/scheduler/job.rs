//! Job definitions for the manager.
//!
//! A [`Job`] is the unit of cooperative work. Client code supplies the body as
//! a [`JobHook`]; the manager calls it once per turn and reads back, through
//! the [`Turn`], what should happen next.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::error::{JobsError, Result};
use super::queue::Quantum;
use super::runner::{self, Runner};
use super::thread::ThreadId;
use super::{Handle, Shared};

static NEXT_JOB_ID: AtomicUsize = AtomicUsize::new(0);

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub usize);

impl JobId {
    fn next() -> Self {
        JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Job({})", self.0)
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JobState {
    /// Created or reset, not handed to the manager.
    NotStarted = 0,
    /// Queued or executing a turn.
    ScheduledOrRunning = 1,
    /// Finished successfully.
    Complete = 2,
    /// Finished unsuccessfully. Never reset automatically.
    Error = 3,
}

impl JobState {
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => JobState::NotStarted,
            1 => JobState::ScheduledOrRunning,
            2 => JobState::Complete,
            _ => JobState::Error,
        }
    }

    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }
}

/// Body of a job, invoked once per turn.
///
/// The hook has exclusive access to its own fields for the duration of the
/// turn. It reports what happens next through `turn`; leaving it untouched
/// keeps the job scheduled on its current affinity.
pub trait JobHook: Send + 'static {
    fn execute(
        &mut self,
        turn: &mut Turn<'_>,
    );
}

impl<F> JobHook for F
where
    F: FnMut(&mut Turn<'_>) + Send + 'static,
{
    fn execute(
        &mut self,
        turn: &mut Turn<'_>,
    ) {
        self(turn)
    }
}

/// Per-turn view handed to a [`JobHook`].
pub struct Turn<'a> {
    job: &'a Arc<Job>,
    handle: Handle,
    thread: ThreadId,
    next_state: JobState,
    next_thread: Option<ThreadId>,
}

impl<'a> Turn<'a> {
    fn new(
        job: &'a Arc<Job>,
        handle: Handle,
        thread: ThreadId,
    ) -> Self {
        Self {
            job,
            handle,
            thread,
            next_state: JobState::ScheduledOrRunning,
            next_thread: job.affinity(),
        }
    }

    /// The job being run.
    #[inline]
    pub fn job(&self) -> &Arc<Job> {
        self.job
    }

    /// Manager running this turn.
    #[inline]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Thread the turn runs on.
    #[inline]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    #[inline]
    pub fn next_state(&self) -> JobState {
        self.next_state
    }

    #[inline]
    pub fn next_thread(&self) -> Option<ThreadId> {
        self.next_thread
    }

    /// Must be `ScheduledOrRunning`, `Complete` or `Error`.
    #[inline]
    pub fn set_next_state(
        &mut self,
        state: JobState,
    ) {
        self.next_state = state;
    }

    /// Thread for the next turn. `None` lets any worker pick it up.
    #[inline]
    pub fn set_next_thread(
        &mut self,
        thread: Option<ThreadId>,
    ) {
        self.next_thread = thread;
    }

    #[inline]
    pub fn complete(&mut self) {
        self.next_state = JobState::Complete;
    }

    #[inline]
    pub fn fail(&mut self) {
        self.next_state = JobState::Error;
    }

    /// Schedule another turn on `thread`.
    #[inline]
    pub fn continue_on(
        &mut self,
        thread: Option<ThreadId>,
    ) {
        self.next_state = JobState::ScheduledOrRunning;
        self.next_thread = thread;
    }
}

/// What a finished turn asked for.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TurnOutcome {
    pub(crate) state: JobState,
    pub(crate) thread: Option<ThreadId>,
}

/// A schedulable unit of cooperative work.
///
/// Jobs are shared as `Arc<Job>`; the manager holds its own reference only
/// while the job is queued or bound to a runner.
pub struct Job {
    id: JobId,
    name: String,
    state: AtomicU8,
    quantum: AtomicU8,
    affinity: Mutex<Option<ThreadId>>,
    run_count: AtomicUsize,
    manager: Weak<Shared>,
    hook: Mutex<Box<dyn JobHook>>,
    runner: Mutex<Option<Arc<Runner>>>,
    outcome: Mutex<Option<TurnOutcome>>,
}

impl fmt::Debug for Job {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.job_state())
            .field("quantum", &self.job_quantum())
            .field("affinity", &self.affinity())
            .finish()
    }
}

impl Job {
    /// Create a job with default quantum.
    pub fn new<H: JobHook>(
        handle: &Handle,
        affinity: Option<ThreadId>,
        hook: H,
    ) -> Arc<Job> {
        JobBuilder::new().affinity(affinity).build(handle, hook)
    }

    #[inline]
    pub fn builder() -> JobBuilder {
        JobBuilder::new()
    }

    #[inline]
    pub fn id(&self) -> JobId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn job_state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_job_running(&self) -> bool {
        self.job_state() == JobState::ScheduledOrRunning
    }

    #[inline]
    pub fn was_job_started(&self) -> bool {
        self.job_state() != JobState::NotStarted
    }

    #[inline]
    pub fn job_quantum(&self) -> Quantum {
        Quantum::from_u8(self.quantum.load(Ordering::Acquire))
    }

    /// Applies from the next scheduling decision on.
    #[inline]
    pub fn set_job_quantum(
        &self,
        quantum: Quantum,
    ) {
        self.quantum.store(quantum.as_u8(), Ordering::Release);
    }

    /// Thread the job runs on next; `None` is any worker.
    #[inline]
    pub fn affinity(&self) -> Option<ThreadId> {
        *self.affinity.lock()
    }

    /// Number of runs started so far.
    #[inline]
    pub fn run_count(&self) -> usize {
        self.run_count.load(Ordering::Acquire)
    }

    /// Hand the job to its manager.
    ///
    /// With `force_restart`, a running job is first waited on, then reset and
    /// started afresh. Without it, only a `NotStarted` job is scheduled.
    ///
    /// # Panics
    ///
    /// If the manager is gone, or when a job force-restarts itself from
    /// inside its own turn.
    pub fn start_job(
        self: &Arc<Self>,
        force_restart: bool,
    ) {
        let shared = self
            .manager
            .upgrade()
            .unwrap_or_else(|| panic!("{} started after its manager was destroyed", self.id));

        if force_restart {
            if self.is_job_running() {
                assert!(
                    !self.is_current_job(),
                    "{} cannot restart itself from its own turn",
                    self.id
                );
                self.wait_until_job_is_not_running();
            }
            for from in [JobState::Complete, JobState::Error] {
                let _ = self.state.compare_exchange(
                    from.as_u8(),
                    JobState::NotStarted.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }

        if self
            .state
            .compare_exchange(
                JobState::NotStarted.as_u8(),
                JobState::ScheduledOrRunning.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let run = self.run_count.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("{} ({}) starting run {}", self.id, self.name, run);
        if shared.is_shutting_down() {
            warn!("{} started while the job manager is shutting down", self.id);
        }
        shared.start(self.clone());
    }

    /// Block until the job is no longer running.
    ///
    /// The caller keeps the manager busy while it waits: every iteration
    /// yields thread time, so on a managed thread other jobs make progress.
    /// The target is boosted to `TimeCritical` for the duration and restored
    /// afterwards unless someone else changed its quantum meanwhile.
    ///
    /// Returns early, with the job still running, once the manager has shut
    /// down.
    pub fn wait_until_job_is_not_running(&self) {
        if !self.is_job_running() {
            return;
        }
        assert!(
            !self.is_current_job(),
            "{} cannot wait on itself from its own turn",
            self.id
        );

        let Some(shared) = self.manager.upgrade() else {
            return;
        };

        let _wait = WaitGuard::begin(self, &shared);
        while self.is_job_running() && !shared.is_shutting_down() {
            shared.yield_thread_time();
        }
    }

    /// Wait until not running, then return to `NotStarted`.
    pub fn reset_job(&self) -> Result<()> {
        self.wait_until_job_is_not_running();
        match self.job_state() {
            JobState::NotStarted => Ok(()),
            JobState::Error => Err(JobsError::ResetFromError(self.id)),
            JobState::ScheduledOrRunning => Err(JobsError::StillRunning(self.id)),
            JobState::Complete => {
                let _ = self.state.compare_exchange(
                    JobState::Complete.as_u8(),
                    JobState::NotStarted.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                Ok(())
            },
        }
    }

    /// Whether the caller is executing this job's turn.
    fn is_current_job(&self) -> bool {
        runner::current_context()
            .and_then(|ctx| ctx.runner)
            .and_then(|r| r.job())
            .is_some_and(|job| std::ptr::eq(Arc::as_ptr(&job), self))
    }

    /// Run one turn. Called on a runner context only.
    pub(crate) fn run_turn(
        self: &Arc<Self>,
        handle: Handle,
        thread: ThreadId,
    ) {
        let mut turn = Turn::new(self, handle, thread);
        self.hook.lock().execute(&mut turn);

        assert!(
            turn.next_state != JobState::NotStarted,
            "{} ({}) reported NotStarted from its hook",
            self.id,
            self.name
        );

        *self.outcome.lock() = Some(TurnOutcome {
            state: turn.next_state,
            thread: turn.next_thread,
        });
    }

    pub(crate) fn take_outcome(&self) -> Option<TurnOutcome> {
        self.outcome.lock().take()
    }

    pub(crate) fn set_affinity(
        &self,
        thread: Option<ThreadId>,
    ) {
        *self.affinity.lock() = thread;
    }

    /// Make a terminal state visible to observers.
    pub(crate) fn publish_state(
        &self,
        state: JobState,
    ) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn bound_runner(&self) -> Option<Arc<Runner>> {
        self.runner.lock().clone()
    }

    pub(crate) fn bind_runner(
        &self,
        runner: Arc<Runner>,
    ) {
        let mut slot = self.runner.lock();
        debug_assert!(slot.is_none(), "{} is already bound to a runner", self.id);
        *slot = Some(runner);
    }

    pub(crate) fn unbind_runner(&self) -> Option<Arc<Runner>> {
        self.runner.lock().take()
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        // The manager holds a reference while the job runs, so this only
        // trips if that ownership is broken.
        if !std::thread::panicking() && self.manager.strong_count() > 0 {
            debug_assert!(
                !self.is_job_running(),
                "{} ({}) dropped while running",
                self.id,
                self.name
            );
        }
    }
}

/// Elevates a waited-on job and restores it when the wait ends, unwinding
/// included.
struct WaitGuard<'a> {
    job: &'a Job,
    shared: &'a Shared,
    prior: Quantum,
}

impl<'a> WaitGuard<'a> {
    fn begin(
        job: &'a Job,
        shared: &'a Shared,
    ) -> Self {
        shared.begin_wait();
        let prior = job.job_quantum();
        job.set_job_quantum(Quantum::TimeCritical);
        Self { job, shared, prior }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        // Someone else changed the quantum meanwhile: keep theirs.
        let _ = self.job.quantum.compare_exchange(
            Quantum::TimeCritical.as_u8(),
            self.prior.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shared.end_wait();
    }
}

/// Builder for [`Job`].
#[derive(Debug, Default)]
pub struct JobBuilder {
    name: Option<String>,
    quantum: Quantum,
    affinity: Option<ThreadId>,
}

impl JobBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    #[inline]
    pub fn quantum(
        mut self,
        quantum: Quantum,
    ) -> Self {
        self.quantum = quantum;
        self
    }

    #[inline]
    pub fn affinity(
        mut self,
        affinity: Option<ThreadId>,
    ) -> Self {
        self.affinity = affinity;
        self
    }

    /// Build the job. It is not started.
    pub fn build<H: JobHook>(
        self,
        handle: &Handle,
        hook: H,
    ) -> Arc<Job> {
        let id = JobId::next();
        let name = self.name.unwrap_or_else(|| id.to_string());

        Arc::new(Job {
            id,
            name,
            state: AtomicU8::new(JobState::NotStarted.as_u8()),
            quantum: AtomicU8::new(self.quantum.as_u8()),
            affinity: Mutex::new(self.affinity),
            run_count: AtomicUsize::new(0),
            manager: Arc::downgrade(handle.shared()),
            hook: Mutex::new(Box::new(hook)),
            runner: Mutex::new(None),
            outcome: Mutex::new(None),
        })
    }
}
