//! Resumable execution contexts.
//!
//! A [`Runner`] owns a carrier OS thread with its own stack. A job bound to a
//! runner can suspend in the middle of its turn (by yielding thread time) and
//! later resume exactly where it left off.
//!
//! Control moves between the contexts of one managed thread by handing a
//! baton: the switching context sends `Resume::Run` to its target and then
//! blocks on its own channel. At any moment exactly one context per managed
//! thread is executing, so from the point of view of job code the carrier
//! threads behave like a single logical thread.

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use super::error::{JobsError, Result};
use super::job::Job;
use super::thread::{Baton, Resume, ThreadId};
use super::{Handle, Shared};

static NEXT_RUNNER_ID: AtomicUsize = AtomicUsize::new(0);

/// Execution context of the calling OS thread.
#[derive(Clone)]
pub(crate) struct Context {
    pub(crate) shared: Arc<Shared>,
    /// Managed thread this context belongs to.
    pub(crate) thread: ThreadId,
    /// `None` for a thread's own dispatch context.
    pub(crate) runner: Option<Arc<Runner>>,
}

impl Context {
    /// Channel this context blocks on while switched away.
    #[inline]
    pub(crate) fn baton<'a>(
        &'a self,
        dispatcher: &'a Baton,
    ) -> &'a Baton {
        match &self.runner {
            Some(runner) => &runner.baton,
            None => dispatcher,
        }
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

pub(crate) fn current_context() -> Option<Context> {
    CONTEXT.with(|c| c.borrow().clone())
}

pub(crate) fn has_context() -> bool {
    CONTEXT.with(|c| c.borrow().is_some())
}

pub(crate) fn enter_context(ctx: Context) {
    CONTEXT.with(|c| *c.borrow_mut() = Some(ctx));
}

pub(crate) fn leave_context() {
    // Take first so the drop runs outside the borrow.
    let ctx = CONTEXT.with(|c| c.borrow_mut().take());
    drop(ctx);
}

/// A pooled, resumable context that executes job turns.
pub(crate) struct Runner {
    id: usize,
    pub(crate) home: ThreadId,
    pub(crate) baton: Baton,
    job: Mutex<Option<Arc<Job>>>,
    in_execute: AtomicBool,
    carrier: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Runner {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.id)
            .field("home", &self.home)
            .field("in_execute", &self.in_execute())
            .finish()
    }
}

impl Runner {
    /// Start a new runner bound to the managed thread `home`.
    pub(crate) fn spawn(
        shared: &Arc<Shared>,
        home: ThreadId,
    ) -> Result<Arc<Runner>> {
        let id = NEXT_RUNNER_ID.fetch_add(1, Ordering::Relaxed);
        let runner = Arc::new(Runner {
            id,
            home,
            baton: Baton::new(),
            job: Mutex::new(None),
            in_execute: AtomicBool::new(false),
            carrier: Mutex::new(None),
        });

        let name = format!("coopjobs-runner-{}", id);
        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(size) = shared.config.runner_stack_size {
            builder = builder.stack_size(size);
        }

        let carrier = {
            let runner = runner.clone();
            let shared = shared.clone();
            builder
                .spawn(move || runner.carrier_main(shared))
                .map_err(|source| JobsError::Spawn { name, source })?
        };
        *runner.carrier.lock() = Some(carrier);

        debug!("Spawned runner {} for {}", id, home);
        Ok(runner)
    }

    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub(crate) fn in_execute(&self) -> bool {
        self.in_execute.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn job(&self) -> Option<Arc<Job>> {
        self.job.lock().clone()
    }

    pub(crate) fn bind(
        &self,
        job: Arc<Job>,
    ) {
        let mut slot = self.job.lock();
        debug_assert!(slot.is_none(), "runner {} is already bound", self.id);
        *slot = Some(job);
    }

    pub(crate) fn unbind(&self) -> Option<Arc<Job>> {
        self.job.lock().take()
    }

    /// Hand control to this runner and block `from` until control returns.
    pub(crate) fn switch_from(
        &self,
        from: &Baton,
    ) {
        debug_assert!(
            self.carrier
                .lock()
                .as_ref()
                .is_some_and(|carrier| !carrier.is_finished()),
            "runner {} switched to after its carrier exited",
            self.id
        );
        // Both ends live in `self.baton`, so the send cannot fail.
        let _ = self.baton.tx.send(Resume::Run);
        let _ = from.rx.recv();
    }

    /// Stop the carrier thread. The runner must be idle.
    pub(crate) fn destroy(&self) {
        debug_assert!(self.job.lock().is_none(), "runner {} destroyed while bound", self.id);
        let _ = self.baton.tx.send(Resume::Exit);
        let carrier = self.carrier.lock().take();
        if let Some(carrier) = carrier {
            if carrier.thread().id() != thread::current().id() && carrier.join().is_err() {
                error!("Runner {} carrier thread panicked", self.id);
            }
        }
        trace!("Destroyed runner {}", self.id);
    }

    fn carrier_main(
        self: Arc<Self>,
        shared: Arc<Shared>,
    ) {
        enter_context(Context {
            shared: shared.clone(),
            thread: self.home,
            runner: Some(self.clone()),
        });

        while let Ok(Resume::Run) = self.baton.rx.recv() {
            shared.after_context_switch(self.home);

            match self.job() {
                Some(job) => self.execute(&shared, &job),
                None => error!("Runner {} resumed without a job", self.id),
            }

            let data = shared.thread_data(self.home);
            *data.last_runner.lock() = Some(self.clone());
            if data.dispatcher.tx.send(Resume::Run).is_err() {
                break;
            }
        }

        leave_context();
    }

    fn execute(
        &self,
        shared: &Arc<Shared>,
        job: &Arc<Job>,
    ) {
        shared.stats.record_turn();
        self.in_execute.store(true, Ordering::Release);
        let handle = Handle::from_shared(shared.clone());
        let result = panic::catch_unwind(AssertUnwindSafe(|| job.run_turn(handle, self.home)));
        self.in_execute.store(false, Ordering::Release);

        if let Err(payload) = result {
            error!("{} ({}) panicked during its turn", job.id(), job.name());
            *shared.thread_data(self.home).panic.lock() = Some(payload);
        }
    }
}
