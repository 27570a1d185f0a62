//! End-to-end scheduling scenarios
//!
//! Mixed affinities, multi-thread stage walks and jobs that depend on jobs.

use crate::common;
use coopjobs::{async_function, Job, JobState, Quantum, ThreadId, Turn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const BATCHES: usize = 1024;
const STAGES: usize = 4;

#[test]
fn test_mixed_affinity_batches_complete_after_teardown() {
    let manager = common::manager();
    let handle = manager.handle();
    let main = manager.main_thread_id();
    let file_io = manager.file_io_thread_id();
    let workers: Arc<Vec<ThreadId>> = Arc::new(manager.general_purpose_thread_ids().to_vec());

    let misplaced = Arc::new(AtomicUsize::new(0));
    let dependents = Arc::new(Mutex::new(Vec::with_capacity(BATCHES)));
    let mut jobs = Vec::with_capacity(BATCHES * 3);

    for _ in 0..BATCHES {
        // File IO job that starts a dependent worker job.
        let spawner = handle.clone();
        let sink = dependents.clone();
        let bad = misplaced.clone();
        let pool = workers.clone();
        jobs.push(async_function(&manager, Some(file_io), move || {
            if ThreadId::current() != Some(file_io) {
                bad.fetch_add(1, Ordering::SeqCst);
            }
            let bad = bad.clone();
            let pool = pool.clone();
            let dependent = async_function(&spawner, None, move || {
                if !ThreadId::current().is_some_and(|t| pool.contains(&t)) {
                    bad.fetch_add(1, Ordering::SeqCst);
                }
            });
            sink.lock().push(dependent);
        }));

        let bad = misplaced.clone();
        jobs.push(async_function(&manager, Some(main), move || {
            if ThreadId::current() != Some(main) {
                bad.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let bad = misplaced.clone();
        let pool = workers.clone();
        let mut stage = 0;
        let staged = Job::builder().build(&manager, move |turn: &mut Turn<'_>| {
            if !pool.contains(&turn.thread()) {
                bad.fetch_add(1, Ordering::SeqCst);
            }
            stage += 1;
            if stage == STAGES {
                turn.complete();
            }
        });
        staged.start_job(false);
        jobs.push(staged);
    }

    drop(manager);

    let dependents = dependents.lock();
    assert_eq!(dependents.len(), BATCHES);
    for job in jobs.iter().chain(dependents.iter()) {
        assert_eq!(job.job_state(), JobState::Complete, "{}", job.name());
        assert_eq!(job.run_count(), 1);
    }
    assert_eq!(misplaced.load(Ordering::SeqCst), 0);

    let stats = handle.stats();
    assert_eq!(stats.jobs_completed.load(Ordering::SeqCst), BATCHES * 4);
    assert_eq!(
        stats.turns_executed.load(Ordering::SeqCst),
        BATCHES * (3 + STAGES)
    );
    assert_eq!(stats.jobs_failed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stage_walk_across_threads() {
    let manager = common::manager();
    let main = manager.main_thread_id();
    let file_io = manager.file_io_thread_id();
    let workers = manager.general_purpose_thread_ids().to_vec();

    let visited = Arc::new(Mutex::new(Vec::new()));
    let record = visited.clone();
    let mut stage = 0;
    let job = Job::builder()
        .name("walker")
        .build(&manager, move |turn: &mut Turn<'_>| {
            record.lock().push(turn.thread());
            stage += 1;
            match stage {
                1 => turn.continue_on(Some(main)),
                2 => turn.continue_on(Some(file_io)),
                3 => turn.continue_on(None),
                _ => turn.complete(),
            }
        });

    job.start_job(false);
    job.wait_until_job_is_not_running();

    assert_eq!(job.job_state(), JobState::Complete);
    let visited = visited.lock();
    assert_eq!(visited.len(), 4);
    assert!(workers.contains(&visited[0]));
    assert_eq!(visited[1], main);
    assert_eq!(visited[2], file_io);
    assert!(workers.contains(&visited[3]));
    assert_eq!(job.affinity(), None);
}

#[test]
fn test_parent_waits_on_dependent_within_turn() {
    let manager = common::manager();
    let handle = manager.handle();
    let flag = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(AtomicBool::new(false));

    let set = flag.clone();
    let seen = observed.clone();
    let parent = async_function(&manager, None, move || {
        let mark = set.clone();
        let dependent = async_function(&handle, None, move || {
            mark.store(true, Ordering::SeqCst);
        });
        dependent.wait_until_job_is_not_running();
        if dependent.job_state() == JobState::Complete && set.load(Ordering::SeqCst) {
            seen.store(true, Ordering::SeqCst);
        }
    });

    parent.wait_until_job_is_not_running();
    assert_eq!(parent.job_state(), JobState::Complete);
    assert!(flag.load(Ordering::SeqCst));
    assert!(observed.load(Ordering::SeqCst));
}

#[test]
fn test_parent_polls_dependent_across_turns() {
    let manager = common::manager();
    let flag = Arc::new(AtomicBool::new(false));
    let polls = Arc::new(AtomicUsize::new(0));

    let set = flag.clone();
    let counter = polls.clone();
    let mut dependent: Option<Arc<Job>> = None;
    let parent = Job::builder()
        .name("parent")
        .quantum(Quantum::WAITING_FOR_DEPENDENCY)
        .build(&manager, move |turn: &mut Turn<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            let child = dependent.get_or_insert_with(|| {
                let mark = set.clone();
                Job::builder()
                    .name("dependent")
                    .affinity(Some(turn.handle().file_io_thread_id()))
                    .build(turn.handle(), move |turn: &mut Turn<'_>| {
                        mark.store(true, Ordering::SeqCst);
                        turn.complete();
                    })
            });
            child.start_job(false);
            if child.job_state() == JobState::Complete && set.load(Ordering::SeqCst) {
                turn.complete();
            }
        });

    parent.start_job(false);
    parent.wait_until_job_is_not_running();

    assert_eq!(parent.job_state(), JobState::Complete);
    assert!(flag.load(Ordering::SeqCst));
    assert!(polls.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_failed_dependent_reported_as_error() {
    let manager = common::manager();
    let handle = manager.handle();
    let outcome = Arc::new(Mutex::new(None));

    let record = outcome.clone();
    let parent = async_function(&manager, Some(manager.render_thread_id()), move || {
        let dependent = Job::builder().build(&handle, |turn: &mut Turn<'_>| turn.fail());
        dependent.start_job(false);
        dependent.wait_until_job_is_not_running();
        *record.lock() = Some(dependent.job_state());
    });

    parent.wait_until_job_is_not_running();
    assert_eq!(parent.job_state(), JobState::Complete);
    assert_eq!(*outcome.lock(), Some(JobState::Error));
    assert_eq!(manager.stats().jobs_failed.load(Ordering::SeqCst), 1);
}
