//! Quantum classes and the per-thread queue set.
//!
//! Every managed thread (and the shared general queue) owns one FIFO lane per
//! [`Quantum`]. Immediate lanes are strictly ordered; periodic lanes carry
//! their own last-dispatch timestamp and are only eligible once their
//! interval has elapsed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Scheduling class of a job, from most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Quantum {
    /// Must run as soon as possible.
    TimeCritical = 0,
    /// Round-robin with other default jobs.
    #[default]
    Default = 1,
    /// Runs at most once per millisecond.
    Periodic1Ms = 2,
    /// Runs at most once every 4 milliseconds.
    Periodic4Ms = 3,
    /// Runs at most once every 16 milliseconds.
    Periodic16Ms = 4,
    /// Runs at most once every 32 milliseconds.
    Periodic32Ms = 5,
}

impl Quantum {
    /// Number of quantum classes.
    pub const COUNT: usize = 6;

    /// All classes in priority order.
    pub const ALL: [Quantum; Quantum::COUNT] = [
        Quantum::TimeCritical,
        Quantum::Default,
        Quantum::Periodic1Ms,
        Quantum::Periodic4Ms,
        Quantum::Periodic16Ms,
        Quantum::Periodic32Ms,
    ];

    /// Periodic classes, shortest interval first.
    pub const PERIODIC: [Quantum; 4] = [
        Quantum::Periodic1Ms,
        Quantum::Periodic4Ms,
        Quantum::Periodic16Ms,
        Quantum::Periodic32Ms,
    ];

    /// For jobs that poll another job or resource until it is ready.
    pub const WAITING_FOR_DEPENDENCY: Quantum = Quantum::Periodic1Ms;

    /// For jobs that want to tick roughly once per displayed frame.
    pub const DISPLAY_REFRESH_PERIODIC: Quantum = Quantum::Periodic16Ms;

    /// Minimum interval between two dispatches from this class.
    #[inline]
    pub fn interval(self) -> Option<Duration> {
        match self {
            Quantum::TimeCritical | Quantum::Default => None,
            Quantum::Periodic1Ms => Some(Duration::from_millis(1)),
            Quantum::Periodic4Ms => Some(Duration::from_millis(4)),
            Quantum::Periodic16Ms => Some(Duration::from_millis(16)),
            Quantum::Periodic32Ms => Some(Duration::from_millis(32)),
        }
    }

    #[inline]
    pub fn is_periodic(self) -> bool {
        self.interval().is_some()
    }

    #[inline]
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    /// Out of range values sanitize to `Default`.
    #[inline]
    pub(crate) fn from_u8(val: u8) -> Self {
        Quantum::ALL
            .get(val as usize)
            .copied()
            .unwrap_or(Quantum::Default)
    }
}

#[derive(Debug)]
struct Lane<T> {
    items: VecDeque<T>,
    last_dispatch: Option<Instant>,
}

impl<T> Lane<T> {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            last_dispatch: None,
        }
    }

    /// `None` means due right away.
    fn due_at(
        &self,
        quantum: Quantum,
    ) -> Option<Instant> {
        match (self.last_dispatch, quantum.interval()) {
            (Some(last), Some(interval)) => Some(last + interval),
            _ => None,
        }
    }
}

/// One FIFO lane per quantum, plus periodic bookkeeping.
#[derive(Debug)]
pub(crate) struct QueueSet<T> {
    lanes: [Lane<T>; Quantum::COUNT],
}

impl<T> QueueSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            lanes: std::array::from_fn(|_| Lane::new()),
        }
    }

    #[inline]
    pub(crate) fn push(
        &mut self,
        item: T,
        quantum: Quantum,
    ) {
        self.lanes[quantum as usize].items.push_back(item);
    }

    /// Pop the most urgent ready item.
    ///
    /// Time-critical, then default, then the due periodic lane with the
    /// earliest due time. Periodic lanes that are not yet due are skipped.
    pub(crate) fn pop_ready(
        &mut self,
        now: Instant,
    ) -> Option<(T, Quantum)> {
        for quantum in [Quantum::TimeCritical, Quantum::Default] {
            if let Some(item) = self.pop_quantum(quantum, now) {
                return Some((item, quantum));
            }
        }

        let mut best: Option<(Option<Instant>, Quantum)> = None;
        for quantum in Quantum::PERIODIC {
            let lane = &self.lanes[quantum as usize];
            if lane.items.is_empty() {
                continue;
            }
            let due = lane.due_at(quantum);
            if due.is_some_and(|at| at > now) {
                continue;
            }
            // `None` (never dispatched) sorts before any instant.
            if best.map_or(true, |(best_due, _)| due < best_due) {
                best = Some((due, quantum));
            }
        }

        let (_, quantum) = best?;
        self.pop_quantum(quantum, now).map(|item| (item, quantum))
    }

    /// Pop from one lane regardless of its timer.
    pub(crate) fn pop_quantum(
        &mut self,
        quantum: Quantum,
        now: Instant,
    ) -> Option<T> {
        let lane = &mut self.lanes[quantum as usize];
        let item = lane.items.pop_front()?;
        lane.last_dispatch = Some(now);
        Some(item)
    }

    /// Time until the earliest non-empty periodic lane becomes due.
    ///
    /// `None` when no periodic lane holds work.
    pub(crate) fn next_due(
        &self,
        now: Instant,
    ) -> Option<Duration> {
        Quantum::PERIODIC
            .iter()
            .filter(|q| !self.lanes[**q as usize].items.is_empty())
            .map(|q| match self.lanes[*q as usize].due_at(*q) {
                Some(at) => at.saturating_duration_since(now),
                None => Duration::ZERO,
            })
            .min()
    }

    pub(crate) fn len(&self) -> usize {
        self.lanes.iter().map(|l| l.items.len()).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lanes.iter().all(|l| l.items.is_empty())
    }
}

impl<T> Default for QueueSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
