//! coopjobs - CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coopjobs::util::{config, logger};
use coopjobs::{
    async_function, Job, JobState, Manager, ManagerStats, Quantum, Turn, NAME, VERSION,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Cooperative multi-threaded job scheduler
#[derive(Parser, Debug)]
#[command(name = "coopjobs")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file, overriding project and user configuration
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run batches of file IO, main thread and worker jobs
    Stress {
        /// Number of batches
        #[arg(short, long, default_value_t = 1024)]
        batches: usize,

        /// Turns taken by each staged worker job
        #[arg(short, long, default_value_t = 4)]
        stages: usize,
    },

    /// Walk a single job across worker, main and file IO threads
    Chain {
        /// Laps around the three threads
        #[arg(short, long, default_value_t = 8)]
        laps: usize,
    },

    /// Print the effective configuration
    Config,

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let cwd = std::env::current_dir().context("Failed to read the working directory")?;
    let config = config::resolve_config(args.config.as_deref(), &cwd)
        .context("Failed to load configuration")?;

    let level = if args.verbose {
        logger::LogLevel::Debug
    } else {
        config.log.level
    };
    logger::try_init_with_level(level);

    match args.command {
        Commands::Stress { batches, stages } => {
            let manager = Manager::with_config(config.jobs).context("Failed to start jobs")?;
            run_stress(&manager, batches, stages)?;
        },
        Commands::Chain { laps } => {
            let manager = Manager::with_config(config.jobs).context("Failed to start jobs")?;
            run_chain(&manager, laps)?;
        },
        Commands::Config => {
            print!("{}", config::to_toml(&config)?);
        },
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        },
    }

    Ok(())
}

/// Each batch starts a file IO job that spawns a dependent worker job, a
/// main thread job and a worker job that takes several turns.
fn run_stress(
    manager: &Manager,
    batches: usize,
    stages: usize,
) -> Result<()> {
    let started = Instant::now();
    let handle = manager.handle();
    let dependents = Arc::new(Mutex::new(Vec::with_capacity(batches)));
    let mut jobs = Vec::with_capacity(batches * 3);

    for batch in 0..batches {
        let spawner = handle.clone();
        let sink = dependents.clone();
        jobs.push(async_function(
            manager,
            Some(manager.file_io_thread_id()),
            move || {
                let dependent = async_function(&spawner, None, move || {
                    debug!("Dependent of batch {} ran", batch);
                });
                sink.lock().push(dependent);
            },
        ));

        jobs.push(async_function(manager, Some(manager.main_thread_id()), || {}));

        let staged = Job::builder()
            .name(format!("staged-{}", batch))
            .build(manager, staged_hook(stages));
        staged.start_job(false);
        jobs.push(staged);
    }

    for job in &jobs {
        job.wait_until_job_is_not_running();
    }
    let dependents: Vec<_> = dependents.lock().drain(..).collect();
    for job in &dependents {
        job.wait_until_job_is_not_running();
    }

    let failed = jobs
        .iter()
        .chain(&dependents)
        .filter(|job| job.job_state() != JobState::Complete)
        .count();
    info!(
        "{} jobs finished in {:?}",
        jobs.len() + dependents.len(),
        started.elapsed()
    );
    print_stats(manager.stats());

    if failed > 0 {
        anyhow::bail!("{} jobs did not complete", failed);
    }
    Ok(())
}

fn staged_hook(stages: usize) -> impl FnMut(&mut Turn<'_>) + Send + 'static {
    let mut stage = 0;
    move |turn: &mut Turn<'_>| {
        stage += 1;
        if stage >= stages {
            turn.complete();
        }
    }
}

/// Walk one job worker → main → file IO → worker, `laps` times.
fn run_chain(
    manager: &Manager,
    laps: usize,
) -> Result<()> {
    let handle = manager.handle();
    let route = [
        None,
        Some(handle.main_thread_id()),
        Some(handle.file_io_thread_id()),
    ];
    let steps = Arc::new(AtomicUsize::new(0));
    let counter = steps.clone();

    let job = Job::builder()
        .name("chain")
        .quantum(Quantum::TimeCritical)
        .build(manager, move |turn: &mut Turn<'_>| {
            let step = counter.fetch_add(1, Ordering::SeqCst);
            debug!("{} step {} on {}", turn.job().name(), step, turn.thread());
            if step + 1 >= laps * route.len() {
                turn.complete();
            } else {
                turn.continue_on(route[(step + 1) % route.len()]);
            }
        });
    job.start_job(false);
    job.wait_until_job_is_not_running();

    println!(
        "{} finished as {:?} after {} steps",
        job.name(),
        job.job_state(),
        steps.load(Ordering::SeqCst)
    );
    print_stats(manager.stats());
    Ok(())
}

fn print_stats(stats: &ManagerStats) {
    println!("Jobs scheduled:    {}", stats.jobs_scheduled.load(Ordering::Relaxed));
    println!("Turns executed:    {}", stats.turns_executed.load(Ordering::Relaxed));
    println!("Jobs completed:    {}", stats.jobs_completed.load(Ordering::Relaxed));
    println!("Jobs failed:       {}", stats.jobs_failed.load(Ordering::Relaxed));
    println!("Runners created:   {}", stats.runners_created.load(Ordering::Relaxed));
    println!("Runners destroyed: {}", stats.runners_destroyed.load(Ordering::Relaxed));
    println!("Peak executing:    {}", stats.peak_executing.load(Ordering::Relaxed));
}
