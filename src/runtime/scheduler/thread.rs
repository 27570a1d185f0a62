//! Managed thread identity and per-thread scheduling state.
//!
//! Every OS thread owned (or adopted) by a [`Manager`](super::Manager) gets a
//! [`ThreadId`]: an opaque, comparable token allocated at startup. Jobs use it
//! as their affinity; the manager uses it to find the thread's queues.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use super::job::Job;
use super::queue::QueueSet;
use super::runner::{self, Runner};

/// Opaque identifier of a thread managed by a job manager.
///
/// Only equality is meaningful. Identifiers from one manager never compare
/// equal to identifiers from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    instance: u32,
    index: u16,
}

impl ThreadId {
    #[inline]
    pub(crate) fn new(
        instance: u32,
        index: u16,
    ) -> Self {
        Self { instance, index }
    }

    #[inline]
    pub(crate) fn instance(&self) -> u32 {
        self.instance
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }

    /// Identifier of the managed thread the caller is executing on.
    ///
    /// Inside a job's hook this is the thread the turn was dispatched on, and
    /// it stays the same across any yields made during that turn. Returns
    /// `None` on threads no manager knows about.
    pub fn current() -> Option<ThreadId> {
        runner::current_context().map(|ctx| ctx.thread)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Thread({}:{})", self.instance, self.index)
    }
}

/// Role a managed thread plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadRole {
    /// The thread that constructed the manager.
    Main,
    /// Dedicated file input/output thread.
    FileIo,
    /// Dedicated graphics submission thread.
    Render,
    /// General-purpose worker, accepts jobs without affinity.
    Worker(usize),
}

impl ThreadRole {
    /// Named threads only run jobs explicitly assigned to them.
    #[inline]
    pub fn is_thread_specific_only(&self) -> bool {
        !matches!(self, ThreadRole::Worker(_))
    }

    pub(crate) fn thread_name(&self) -> String {
        match self {
            ThreadRole::Main => "coopjobs-main".to_string(),
            ThreadRole::FileIo => "coopjobs-file-io".to_string(),
            ThreadRole::Render => "coopjobs-render".to_string(),
            ThreadRole::Worker(n) => format!("coopjobs-worker-{}", n),
        }
    }
}

impl fmt::Display for ThreadRole {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ThreadRole::Main => write!(f, "main"),
            ThreadRole::FileIo => write!(f, "file-io"),
            ThreadRole::Render => write!(f, "render"),
            ThreadRole::Worker(n) => write!(f, "worker-{}", n),
        }
    }
}

/// Auto-reset wake event.
///
/// `activate` before `wait` is never lost: the next wait returns immediately.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn activate(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_one();
    }

    pub(crate) fn wait(
        &self,
        timeout: Option<Duration>,
    ) {
        let mut flag = self.flag.lock();
        if !*flag {
            match timeout {
                Some(timeout) => {
                    let _ = self.cond.wait_for(&mut flag, timeout);
                },
                None => self.cond.wait(&mut flag),
            }
        }
        *flag = false;
    }
}

/// Message used to hand execution between the contexts of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resume {
    Run,
    Exit,
}

/// One-slot hand-off channel owned by an execution context.
#[derive(Debug)]
pub(crate) struct Baton {
    pub(crate) tx: Sender<Resume>,
    pub(crate) rx: Receiver<Resume>,
}

impl Baton {
    pub(crate) fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }
}

/// Scheduling state the manager keeps for every managed thread.
pub(crate) struct PerThreadData {
    pub(crate) id: ThreadId,
    pub(crate) role: ThreadRole,
    pub(crate) queues: Mutex<QueueSet<Arc<Job>>>,
    pub(crate) signal: Signal,
    /// Set while the thread is parked on `signal`.
    pub(crate) waiting: AtomicBool,
    pub(crate) last_job_was_thread_specific: AtomicBool,
    /// The OS thread's own context (the dispatch loop).
    pub(crate) dispatcher: Baton,
    /// Runner that most recently switched away on this thread.
    pub(crate) last_runner: Mutex<Option<Arc<Runner>>>,
    pub(crate) pool: Mutex<Vec<Arc<Runner>>>,
    /// Panic raised by a hook, waiting to be resumed on the dispatcher.
    pub(crate) panic: Mutex<Option<Box<dyn std::any::Any + Send>>>,
}

impl PerThreadData {
    pub(crate) fn new(
        id: ThreadId,
        role: ThreadRole,
    ) -> Self {
        Self {
            id,
            role,
            queues: Mutex::new(QueueSet::new()),
            signal: Signal::default(),
            waiting: AtomicBool::new(false),
            last_job_was_thread_specific: AtomicBool::new(false),
            dispatcher: Baton::new(),
            last_runner: Mutex::new(None),
            pool: Mutex::new(Vec::new()),
            panic: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn is_thread_specific_only(&self) -> bool {
        self.role.is_thread_specific_only()
    }

    /// Park until signalled or until `timeout` elapses.
    pub(crate) fn wait(
        &self,
        timeout: Option<Duration>,
    ) {
        self.waiting.store(true, Ordering::SeqCst);
        self.signal.wait(timeout);
        self.waiting.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for PerThreadData {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PerThreadData")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("queued", &self.queues.lock().len())
            .field("pooled_runners", &self.pool.lock().len())
            .finish()
    }
}
