//! Shared helpers for integration scenarios

use coopjobs::{Manager, ManagerConfig};

/// Main, file IO, render and three workers, independent of the host.
pub fn manager() -> Manager {
    Manager::with_config(ManagerConfig {
        general_purpose_threads: Some(3),
        separate_render_thread: Some(true),
        ..ManagerConfig::default()
    })
    .unwrap()
}
