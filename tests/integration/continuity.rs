//! Thread continuity and main thread hand-back
//!
//! A turn that yields resumes on the thread it started on, and a main
//! thread job that yields gives control back to the host loop.

use crate::common;
use coopjobs::{async_function, Job, JobState, ThreadId, Turn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const JOBS: usize = 32;
const YIELDS: usize = 64;

#[test]
fn test_nested_yields_keep_thread() {
    let manager = common::manager();
    let handle = manager.handle();
    let moved = Arc::new(AtomicUsize::new(0));
    let yields = Arc::new(AtomicUsize::new(0));

    let jobs: Vec<_> = (0..JOBS)
        .map(|_| {
            let handle = handle.clone();
            let moved = moved.clone();
            let yields = yields.clone();
            async_function(&manager, None, move || {
                let start = ThreadId::current();
                for _ in 0..YIELDS {
                    handle.yield_thread_time();
                    yields.fetch_add(1, Ordering::SeqCst);
                    if ThreadId::current() != start {
                        moved.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for job in &jobs {
        job.wait_until_job_is_not_running();
        assert_eq!(job.job_state(), JobState::Complete);
    }
    assert_eq!(yields.load(Ordering::SeqCst), JOBS * YIELDS);
    assert_eq!(moved.load(Ordering::SeqCst), 0);
}

#[test]
fn test_turn_thread_matches_current_across_yields() {
    let manager = common::manager();
    let mismatches = Arc::new(AtomicUsize::new(0));

    let jobs: Vec<_> = manager
        .threads()
        .into_iter()
        .map(|(thread, _)| {
            let bad = mismatches.clone();
            let mut turns = 0;
            let job = Job::builder()
                .affinity(Some(thread))
                .build(&manager, move |turn: &mut Turn<'_>| {
                    for _ in 0..8 {
                        turn.handle().yield_thread_time();
                        if ThreadId::current() != Some(turn.thread()) || turn.thread() != thread {
                            bad.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    turns += 1;
                    if turns == 3 {
                        turn.complete();
                    }
                });
            job.start_job(false);
            job
        })
        .collect();

    for job in &jobs {
        job.wait_until_job_is_not_running();
        assert_eq!(job.job_state(), JobState::Complete);
    }
    assert_eq!(mismatches.load(Ordering::SeqCst), 0);
}

#[test]
fn test_main_job_yield_hands_back_to_host() {
    let manager = common::manager();
    let handle = manager.handle();
    let job_progress = Arc::new(AtomicUsize::new(0));
    let job_yields = Arc::new(AtomicUsize::new(0));

    let progress = job_progress.clone();
    let yields = job_yields.clone();
    let job = async_function(&manager, Some(manager.main_thread_id()), move || {
        for _ in 0..1000 {
            progress.fetch_add(1, Ordering::SeqCst);
            if handle.yield_thread_time() {
                yields.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    // Every host yield either starts or resumes the job.
    let mut host_yields = 0;
    let mut host_steps = Vec::new();
    while job.is_job_running() {
        if manager.yield_thread_time() {
            host_yields += 1;
            host_steps.push(job_progress.load(Ordering::SeqCst));
        }
    }

    assert_eq!(job.job_state(), JobState::Complete);
    assert_eq!(job_progress.load(Ordering::SeqCst), 1000);
    assert_eq!(host_yields, 1001);
    assert_eq!(host_yields + job_yields.load(Ordering::SeqCst), 2001);
    // The host saw the job advance one step at a time.
    assert_eq!(host_steps[0], 1);
    assert!(host_steps.windows(2).all(|w| w[1] == w[0] + 1 || w[1] == w[0]));
}

#[test]
fn test_force_restart_blocks_then_runs_again() {
    let manager = common::manager();
    let runs = Arc::new(Mutex::new(Vec::new()));

    let record = runs.clone();
    let mut turns = 0;
    let job = Job::builder()
        .name("restartable")
        .affinity(Some(manager.main_thread_id()))
        .build(&manager, move |turn: &mut Turn<'_>| {
            record.lock().push(turn.job().run_count());
            turns += 1;
            if turns % 3 == 0 {
                turn.complete();
            }
        });

    job.start_job(false);
    assert!(job.is_job_running());

    // Main jobs only run when the host pumps, so the first run is still
    // pending here.
    job.start_job(true);
    job.wait_until_job_is_not_running();

    assert_eq!(job.job_state(), JobState::Complete);
    assert_eq!(job.run_count(), 2);
    assert_eq!(*runs.lock(), vec![1, 1, 1, 2, 2, 2]);
}
