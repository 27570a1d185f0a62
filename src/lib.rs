//! coopjobs
//!
//! A cooperative multi-threaded job scheduler. Jobs are small units of work
//! that run in turns on a fixed set of threads: a main thread owned by the
//! host, a file IO thread, an optional render thread and a pool of
//! general-purpose workers.
//!
//! # Example
//!
//! ```no_run
//! use coopjobs::{await_function, JobState, Manager, Result};
//!
//! fn main() -> Result<()> {
//!     let manager = Manager::new()?;
//!     let job = await_function(&manager, None, || println!("Hello from a worker"));
//!     assert_eq!(job.job_state(), JobState::Complete);
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/coopjobs")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use runtime::scheduler::{
    async_function, async_function_with_args, await_function, await_function_with_args,
    make_function, make_function_with_args, Handle, Job, JobBuilder, JobHook, JobId, JobState,
    JobsError, Manager, ManagerConfig, ManagerStats, Quantum, ThreadId, ThreadRole, Turn,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "coopjobs";
