//! The job manager and its dispatch loop.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::error::{JobsError, Result};
use super::job::{Job, JobState, TurnOutcome};
use super::queue::{Quantum, QueueSet};
use super::runner::{self, Context, Runner};
use super::thread::{PerThreadData, Resume, ThreadId, ThreadRole};
use super::{ManagerConfig, ManagerStats};

static NEXT_INSTANCE: AtomicU32 = AtomicU32::new(1);

/// State shared by the manager, its threads, its runners and its jobs.
pub(crate) struct Shared {
    instance: u32,
    pub(crate) config: ManagerConfig,
    threads: Vec<PerThreadData>,
    /// Jobs without affinity, serviced by general-purpose threads.
    general: Mutex<QueueSet<Arc<Job>>>,
    general_purpose: Vec<ThreadId>,
    next_general_purpose: AtomicUsize,
    main: ThreadId,
    file_io: ThreadId,
    render: ThreadId,
    executing_jobs: AtomicUsize,
    wait_count: AtomicUsize,
    shutting_down: AtomicBool,
    in_background: AtomicBool,
    pub(crate) stats: ManagerStats,
    /// Hook panics caught on spawned threads, resumed on teardown.
    worker_panics: Mutex<Vec<Box<dyn Any + Send>>>,
}

impl Shared {
    fn new(config: ManagerConfig) -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);

        let mut roles = vec![ThreadRole::Main, ThreadRole::FileIo];
        if config.wants_render_thread() {
            roles.push(ThreadRole::Render);
        }
        roles.extend((0..config.worker_count()).map(ThreadRole::Worker));

        let threads: Vec<PerThreadData> = roles
            .into_iter()
            .enumerate()
            .map(|(index, role)| PerThreadData::new(ThreadId::new(instance, index as u16), role))
            .collect();

        let find = |wanted: ThreadRole| threads.iter().find(|t| t.role == wanted).map(|t| t.id);
        let main = ThreadId::new(instance, 0);
        let file_io = find(ThreadRole::FileIo).unwrap_or(main);
        let render = find(ThreadRole::Render).unwrap_or(main);
        let general_purpose = threads
            .iter()
            .filter(|t| !t.is_thread_specific_only())
            .map(|t| t.id)
            .collect();

        Self {
            instance,
            config,
            threads,
            general: Mutex::new(QueueSet::new()),
            general_purpose,
            next_general_purpose: AtomicUsize::new(0),
            main,
            file_io,
            render,
            executing_jobs: AtomicUsize::new(0),
            wait_count: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            in_background: AtomicBool::new(false),
            stats: ManagerStats::default(),
            worker_panics: Mutex::new(Vec::new()),
        }
    }

    /// Map `id` to a thread of this manager. Unknown ids fall back to the
    /// file IO thread.
    fn resolve(
        &self,
        id: ThreadId,
    ) -> ThreadId {
        if id.instance() == self.instance && id.index() < self.threads.len() {
            id
        } else {
            trace!("{} is not managed here, using the file IO thread", id);
            self.file_io
        }
    }

    #[inline]
    pub(crate) fn thread_data(
        &self,
        id: ThreadId,
    ) -> &PerThreadData {
        &self.threads[self.resolve(id).index()]
    }

    #[inline]
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Context of the caller, if it belongs to this manager.
    fn own_context(self: &Arc<Self>) -> Option<Context> {
        runner::current_context().filter(|ctx| Arc::ptr_eq(&ctx.shared, self))
    }

    /// Begin a new run of `job`.
    pub(crate) fn start(
        &self,
        job: Arc<Job>,
    ) {
        self.stats.record_scheduled();
        self.enqueue(job);
    }

    /// Queue `job` according to its runner, affinity and quantum, then wake
    /// whoever should pick it up.
    pub(crate) fn enqueue(
        &self,
        job: Arc<Job>,
    ) {
        let quantum = job.job_quantum();
        let target = match job.bound_runner() {
            // A suspended turn resumes where it started.
            Some(runner) => Some(runner.home),
            None => job.affinity().map(|t| self.resolve(t)),
        };

        match target {
            Some(thread) => {
                trace!("Queue {} on {} as {:?}", job.id(), thread, quantum);
                let data = self.thread_data(thread);
                data.queues.lock().push(job, quantum);
                data.signal.activate();
            },
            None => {
                trace!("Queue {} on the general queue as {:?}", job.id(), quantum);
                self.general.lock().push(job, quantum);
                self.wake_up_next_general_purpose();
            },
        }
    }

    /// Run at most one ready job on the calling thread.
    pub(crate) fn yield_thread_time(self: &Arc<Self>) -> bool {
        if let Some(ctx) = self.own_context() {
            let data = self.thread_data(ctx.thread);
            if self
                .dispatch_one(&ctx, data)
                .is_some_and(|q| q <= Quantum::Default)
            {
                return true;
            }

            // A main thread job with nothing else to run hands control back
            // to the host loop.
            if ctx.thread == self.main && ctx.runner.is_some() {
                self.suspend_to_dispatcher(&ctx, data);
                return true;
            }
        }

        thread::yield_now();
        false
    }

    /// Alternate between the thread's own queues and the general queue.
    fn dispatch_one(
        self: &Arc<Self>,
        ctx: &Context,
        data: &PerThreadData,
    ) -> Option<Quantum> {
        let specific_only = data.is_thread_specific_only();

        if !specific_only && data.last_job_was_thread_specific.load(Ordering::Relaxed) {
            if let Some(q) = self.execute_from(ctx, &self.general, |q, now| q.pop_ready(now)) {
                data.last_job_was_thread_specific.store(false, Ordering::Relaxed);
                return Some(q);
            }
            let q = self.execute_from(ctx, &data.queues, |q, now| q.pop_ready(now))?;
            data.last_job_was_thread_specific.store(true, Ordering::Relaxed);
            return Some(q);
        }

        if let Some(q) = self.execute_from(ctx, &data.queues, |q, now| q.pop_ready(now)) {
            data.last_job_was_thread_specific.store(true, Ordering::Relaxed);
            return Some(q);
        }
        if specific_only {
            return None;
        }
        self.execute_from(ctx, &self.general, |q, now| q.pop_ready(now))
    }

    /// Pop a job with `pop` and run it on the calling thread.
    ///
    /// Returns the quantum of the job that ran, or `None` when nothing was
    /// popped or no runner could be acquired.
    fn execute_from(
        self: &Arc<Self>,
        ctx: &Context,
        queues: &Mutex<QueueSet<Arc<Job>>>,
        pop: impl FnOnce(&mut QueueSet<Arc<Job>>, Instant) -> Option<(Arc<Job>, Quantum)>,
    ) -> Option<Quantum> {
        // Counted before the queue unlocks, so a popped job is never
        // invisible to the shutdown drain.
        let (job, quantum, executing) = {
            let mut queue = queues.lock();
            let (job, quantum) = pop(&mut queue, Instant::now())?;
            let executing = self.executing_jobs.fetch_add(1, Ordering::AcqRel) + 1;
            (job, quantum, executing)
        };
        self.stats.update_executing(executing);

        let runner = match job.bound_runner() {
            Some(runner) => runner,
            None => match self.acquire_runner(ctx.thread) {
                Ok(runner) => {
                    runner.bind(job.clone());
                    job.bind_runner(runner.clone());
                    runner
                },
                Err(err) => {
                    warn!("No runner available for {}: {}", job.id(), err);
                    self.enqueue(job);
                    self.executing_jobs.fetch_sub(1, Ordering::AcqRel);
                    return None;
                },
            },
        };
        debug_assert_eq!(runner.home, ctx.thread, "runner resumed off its home thread");
        drop(job);

        let data = self.thread_data(ctx.thread);
        *data.last_runner.lock() = ctx.runner.clone();
        runner.switch_from(ctx.baton(&data.dispatcher));
        self.after_context_switch(ctx.thread);

        if ctx.runner.is_none() {
            self.resume_hook_panic(data);
        }
        Some(quantum)
    }

    /// Suspend the calling runner and return control to the thread's own
    /// dispatch context.
    fn suspend_to_dispatcher(
        &self,
        ctx: &Context,
        data: &PerThreadData,
    ) {
        let Some(current) = &ctx.runner else {
            return;
        };
        *data.last_runner.lock() = Some(current.clone());
        if data.dispatcher.tx.send(Resume::Run).is_err() {
            *data.last_runner.lock() = None;
            return;
        }
        let _ = current.baton.rx.recv();
        self.after_context_switch(ctx.thread);
    }

    /// Settle the runner that just switched away on `thread`.
    ///
    /// Runs on whichever context received control. A runner still inside its
    /// hook keeps its job and the job is queued to resume there; a finished
    /// turn releases the runner and applies the turn's outcome.
    pub(crate) fn after_context_switch(
        &self,
        thread: ThreadId,
    ) {
        let data = self.thread_data(thread);
        let Some(last) = data.last_runner.lock().take() else {
            return;
        };
        let Some(job) = last.job() else {
            error!("Runner {} switched away without a job", last.id());
            return;
        };

        if last.in_execute() {
            debug_assert!(job.is_job_running());
            self.enqueue(job);
        } else {
            last.unbind();
            job.unbind_runner();
            self.release_runner(thread, last);

            // No outcome means the hook panicked.
            let outcome = job.take_outcome().unwrap_or(TurnOutcome {
                state: JobState::Error,
                thread: job.affinity(),
            });
            match outcome.state {
                JobState::ScheduledOrRunning => {
                    job.set_affinity(outcome.thread);
                    self.enqueue(job);
                },
                state => {
                    trace!("{} finished as {:?}", job.id(), state);
                    self.stats.record_finished(state);
                    job.publish_state(state);
                },
            }
        }

        self.executing_jobs.fetch_sub(1, Ordering::AcqRel);
    }

    fn resume_hook_panic(
        &self,
        data: &PerThreadData,
    ) {
        let payload = data.panic.lock().take();
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
    }

    fn acquire_runner(
        self: &Arc<Self>,
        thread: ThreadId,
    ) -> Result<Arc<Runner>> {
        let pooled = self.thread_data(thread).pool.lock().pop();
        if let Some(runner) = pooled {
            return Ok(runner);
        }
        let runner = Runner::spawn(self, thread)?;
        self.stats.record_runner_created();
        Ok(runner)
    }

    fn release_runner(
        &self,
        thread: ThreadId,
        runner: Arc<Runner>,
    ) {
        let mut pool = self.thread_data(thread).pool.lock();
        if pool.len() < self.config.max_pooled_runners {
            pool.push(runner);
            return;
        }
        drop(pool);
        runner.destroy();
        self.stats.record_runner_destroyed();
    }

    /// How long an idle thread may sleep before periodic work is due.
    fn wake_up_time(
        &self,
        data: &PerThreadData,
    ) -> Option<Duration> {
        let now = Instant::now();
        let own = data.queues.lock().next_due(now);
        if data.is_thread_specific_only() {
            return own;
        }
        let general = self.general.lock().next_due(now);
        match (own, general) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Poke general-purpose threads round-robin until a waiting one was hit
    /// or every one was poked.
    pub(crate) fn wake_up_next_general_purpose(&self) {
        let size = self.general_purpose.len();
        for _ in 0..size {
            let next = self.next_general_purpose.fetch_add(1, Ordering::Relaxed) % size;
            let data = self.thread_data(self.general_purpose[next]);
            let was_waiting = data.waiting.load(Ordering::SeqCst);
            data.signal.activate();
            if was_waiting {
                break;
            }
        }
    }

    pub(crate) fn wake_up_all(&self) {
        for data in &self.threads {
            data.signal.activate();
        }
    }

    pub(crate) fn begin_wait(&self) {
        let count = self.wait_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count == 1 && self.in_background.load(Ordering::Acquire) {
            self.wake_up_all();
        }
    }

    pub(crate) fn end_wait(&self) {
        self.wait_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_paused(&self) -> bool {
        self.in_background.load(Ordering::Acquire) && self.wait_count.load(Ordering::Acquire) == 0
    }

    fn any_queued(&self) -> bool {
        !self.general.lock().is_empty() || self.threads.iter().any(|t| !t.queues.lock().is_empty())
    }

    /// Body of every spawned managed thread.
    fn thread_main(
        self: Arc<Self>,
        id: ThreadId,
    ) {
        let data = self.thread_data(id);
        debug!("Thread {} ({}) running", data.role, id);
        runner::enter_context(Context {
            shared: self.clone(),
            thread: id,
            runner: None,
        });

        while !self.is_shutting_down() {
            let paused = self.is_paused();
            let ran = !paused && self.yield_guarded(data);

            if !ran && !self.is_shutting_down() {
                let timeout = if paused { None } else { self.wake_up_time(data) };
                if timeout != Some(Duration::ZERO) {
                    data.wait(timeout);
                }
            }
        }

        runner::leave_context();
        debug!("Thread {} ({}) stopped", data.role, id);
    }

    /// Yield on a spawned thread, keeping it alive across hook panics.
    fn yield_guarded(
        self: &Arc<Self>,
        data: &PerThreadData,
    ) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| self.yield_thread_time())) {
            Ok(ran) => ran,
            Err(payload) => {
                error!("A job panicked on the {} thread", data.role);
                self.worker_panics.lock().push(payload);
                true
            },
        }
    }

    fn destroy_pooled_runners(&self) {
        for data in &self.threads {
            let pooled: Vec<_> = data.pool.lock().drain(..).collect();
            for runner in pooled {
                runner.destroy();
                self.stats.record_runner_destroyed();
            }
        }
    }
}

/// Cheap, clonable access to a manager.
///
/// Handles keep the manager's shared state alive but not its threads: once
/// the owning [`Manager`] is dropped, jobs created through a stale handle
/// are never dispatched.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl fmt::Debug for Handle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Handle")
            .field("instance", &self.shared.instance)
            .field("threads", &self.shared.threads.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl Handle {
    #[inline]
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Handle of the manager owning the calling thread.
    pub fn current() -> Option<Handle> {
        runner::current_context().map(|ctx| Handle::from_shared(ctx.shared))
    }

    /// Start `job` if it was not started yet; otherwise do nothing.
    pub fn schedule(
        &self,
        job: &Arc<Job>,
    ) {
        if job.job_state() == JobState::NotStarted {
            job.start_job(false);
        }
    }

    /// Run at most one ready job on the calling thread.
    ///
    /// Returns true if a job of `Default` urgency or higher ran. Called from
    /// a job on the main thread with nothing else to run, it suspends that
    /// job and returns control to the host loop; the call returns true once
    /// the job is resumed. On threads the manager does not know, it just
    /// yields the OS thread and returns false.
    pub fn yield_thread_time(&self) -> bool {
        self.shared.yield_thread_time()
    }

    /// Stop dispatching on spawned threads until the foreground returns or
    /// someone waits on a job.
    pub fn on_enter_background(&self) {
        info!("Job manager entering background");
        self.shared.in_background.store(true, Ordering::Release);
    }

    pub fn on_leave_background(&self) {
        info!("Job manager leaving background");
        if self.shared.in_background.swap(false, Ordering::AcqRel) {
            self.shared.wake_up_all();
        }
    }

    #[inline]
    pub fn is_in_background(&self) -> bool {
        self.shared.in_background.load(Ordering::Acquire)
    }

    #[inline]
    pub fn wake_up_next_general_purpose(&self) {
        self.shared.wake_up_next_general_purpose();
    }

    #[inline]
    pub fn wake_up_all(&self) {
        self.shared.wake_up_all();
    }

    #[inline]
    pub fn main_thread_id(&self) -> ThreadId {
        self.shared.main
    }

    #[inline]
    pub fn file_io_thread_id(&self) -> ThreadId {
        self.shared.file_io
    }

    /// Equal to the main thread id when no render thread was spawned.
    #[inline]
    pub fn render_thread_id(&self) -> ThreadId {
        self.shared.render
    }

    #[inline]
    pub fn general_purpose_thread_ids(&self) -> &[ThreadId] {
        &self.shared.general_purpose
    }

    /// Every managed thread with its role.
    pub fn threads(&self) -> Vec<(ThreadId, ThreadRole)> {
        self.shared.threads.iter().map(|t| (t.id, t.role)).collect()
    }

    /// Managed thread the caller runs on, if it belongs to this manager.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.shared.own_context().map(|ctx| ctx.thread)
    }

    #[inline]
    pub fn is_main_thread(&self) -> bool {
        self.current_thread() == Some(self.shared.main)
    }

    #[inline]
    pub fn is_file_io_thread(&self) -> bool {
        self.current_thread() == Some(self.shared.file_io)
    }

    #[inline]
    pub fn is_render_thread(&self) -> bool {
        self.current_thread() == Some(self.shared.render)
    }

    /// Job whose turn the caller is executing.
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.shared.own_context()?.runner?.job()
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Jobs executing a turn right now, across all threads.
    #[inline]
    pub fn executing_jobs(&self) -> usize {
        self.shared.executing_jobs.load(Ordering::Acquire)
    }

    #[inline]
    pub fn stats(&self) -> &ManagerStats {
        &self.shared.stats
    }

    #[inline]
    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }
}

/// Owner of the managed threads.
///
/// Construct it on the thread that will act as the main thread and drop it
/// there. Dropping drains every queue, waits for running jobs to finish and
/// joins all threads.
pub struct Manager {
    handle: Handle,
    threads: Vec<JoinHandle<()>>,
    // Bound to the main thread.
    _main: PhantomData<*const ()>,
}

impl fmt::Debug for Manager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Manager")
            .field("handle", &self.handle)
            .field("spawned", &self.threads.len())
            .finish()
    }
}

impl Deref for Manager {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Manager {
    /// Create a manager with the default configuration.
    #[inline]
    pub fn new() -> Result<Self> {
        Self::with_config(ManagerConfig::default())
    }

    /// Create a manager, registering the calling thread as its main thread.
    pub fn with_config(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        if runner::has_context() {
            return Err(JobsError::AlreadyRegistered);
        }

        let shared = Arc::new(Shared::new(config));
        runner::enter_context(Context {
            shared: shared.clone(),
            thread: shared.main,
            runner: None,
        });

        let mut manager = Manager {
            handle: Handle::from_shared(shared.clone()),
            threads: Vec::with_capacity(shared.threads.len()),
            _main: PhantomData,
        };

        for data in shared.threads.iter().filter(|t| t.role != ThreadRole::Main) {
            let name = data.role.thread_name();
            let mut builder = thread::Builder::new().name(name.clone());
            if let Some(size) = shared.config.thread_stack_size {
                builder = builder.stack_size(size);
            }

            let id = data.id;
            let thread_shared = shared.clone();
            match builder.spawn(move || thread_shared.thread_main(id)) {
                Ok(handle) => manager.threads.push(handle),
                // Dropping the partial manager stops what was spawned.
                Err(source) => return Err(JobsError::Spawn { name, source }),
            }
        }

        info!(
            "Job manager started: {} threads, {} general purpose",
            shared.threads.len(),
            shared.general_purpose.len()
        );
        Ok(manager)
    }

    /// Handle of the manager owning the calling thread.
    #[inline]
    pub fn current() -> Option<Handle> {
        Handle::current()
    }

    /// A clonable handle to this manager.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    fn shutdown(&mut self) {
        let shared = self.handle.shared.clone();
        info!("Job manager shutting down");
        shared.in_background.store(false, Ordering::Release);

        let ctx = Context {
            shared: shared.clone(),
            thread: shared.main,
            runner: None,
        };
        let main = shared.thread_data(shared.main);

        loop {
            // Main has no loop of its own; pump it here, timers ignored.
            for quantum in Quantum::ALL {
                shared.execute_from(&ctx, &main.queues, |q, now| {
                    q.pop_quantum(quantum, now).map(|job| (job, quantum))
                });
            }

            // A turn requeues before it stops counting as executing, so
            // look at the queues again once nothing executes.
            if shared.any_queued() {
                shared.wake_up_all();
            } else if shared.executing_jobs.load(Ordering::Acquire) == 0 && !shared.any_queued() {
                break;
            }
            thread::yield_now();
        }

        shared.shutting_down.store(true, Ordering::Release);
        shared.wake_up_all();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("A managed thread panicked during shutdown");
            }
        }
        shared.destroy_pooled_runners();
        runner::leave_context();

        info!(
            "Job manager stopped: {} runs finished, {} turns",
            shared.stats.jobs_finished(),
            shared.stats.turns_executed.load(Ordering::Relaxed)
        );

        let first = shared.worker_panics.lock().drain(..).next();
        if let Some(payload) = first {
            panic::resume_unwind(payload);
        }
    }

    /// Stop everything without draining. Used while unwinding.
    fn abandon(&mut self) {
        let shared = &self.handle.shared;
        shared.shutting_down.store(true, Ordering::Release);
        shared.wake_up_all();
        runner::leave_context();
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if thread::panicking() {
            self.abandon();
        } else {
            self.shutdown();
        }
    }
}
