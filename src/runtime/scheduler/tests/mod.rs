//! Scheduler unit tests
//!
//! Covers quantum queues, the job state machine, the manager's dispatch
//! behaviour and the function adapter.


use crate::runtime::scheduler::{JobId, JobState, Manager, ManagerConfig, Quantum, ThreadRole};

/// Small, deterministic layout: main, file IO, render and two workers.
pub(super) fn test_config() -> ManagerConfig {
    ManagerConfig {
        general_purpose_threads: Some(2),
        separate_render_thread: Some(true),
        ..ManagerConfig::default()
    }
}

pub(super) fn test_manager() -> Manager {
    Manager::with_config(test_config()).unwrap()
}

#[cfg(test)]
mod job_id_tests {
    use super::*;

    #[test]
    fn test_job_id_display() {
        assert_eq!(JobId(7).to_string(), "Job(7)");
        assert_eq!(JobId(7).inner(), 7);
    }

    #[test]
    fn test_job_id_ord() {
        assert!(JobId(1) < JobId(2));
        assert_eq!(JobId(3), JobId(3));
    }
}

#[cfg(test)]
mod job_state_tests {
    use super::*;

    #[test]
    fn test_job_state_values() {
        assert_eq!(JobState::NotStarted as u8, 0);
        assert_eq!(JobState::ScheduledOrRunning as u8, 1);
        assert_eq!(JobState::Complete as u8, 2);
        assert_eq!(JobState::Error as u8, 3);
    }

    #[test]
    fn test_job_state_from_u8() {
        for state in [
            JobState::NotStarted,
            JobState::ScheduledOrRunning,
            JobState::Complete,
            JobState::Error,
        ] {
            assert_eq!(JobState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(!JobState::NotStarted.is_terminal());
        assert!(!JobState::ScheduledOrRunning.is_terminal());
        assert!(JobState::Complete.is_terminal());
        assert!(JobState::Error.is_terminal());
    }
}

#[cfg(test)]
mod quantum_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_quantum_order() {
        for pair in Quantum::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_quantum_intervals_increase() {
        let intervals: Vec<Duration> = Quantum::PERIODIC
            .iter()
            .map(|q| q.interval().unwrap())
            .collect();
        assert!(intervals.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(Quantum::TimeCritical.interval(), None);
        assert_eq!(Quantum::Default.interval(), None);
    }

    #[test]
    fn test_quantum_aliases() {
        assert_eq!(Quantum::WAITING_FOR_DEPENDENCY, Quantum::PERIODIC[0]);
        assert_eq!(Quantum::DISPLAY_REFRESH_PERIODIC, Quantum::Periodic16Ms);
        assert!(Quantum::DISPLAY_REFRESH_PERIODIC.is_periodic());
    }

    #[test]
    fn test_quantum_from_u8_sanitizes() {
        assert_eq!(Quantum::from_u8(0), Quantum::TimeCritical);
        assert_eq!(Quantum::from_u8(5), Quantum::Periodic32Ms);
        assert_eq!(Quantum::from_u8(6), Quantum::Default);
        assert_eq!(Quantum::from_u8(u8::MAX), Quantum::Default);
        assert_eq!(Quantum::default(), Quantum::Default);
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use crate::runtime::scheduler::JobsError;

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();
        assert_eq!(config.general_purpose_threads, None);
        assert_eq!(config.min_general_purpose_threads, 2);
        assert_eq!(config.max_pooled_runners, 64);
        assert!(config.validate().is_ok());
        assert!(config.worker_count() >= 2);
    }

    #[test]
    fn test_manager_config_exact_workers() {
        let config = ManagerConfig {
            general_purpose_threads: Some(3),
            ..ManagerConfig::default()
        };
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn test_manager_config_render_override() {
        let config = ManagerConfig {
            separate_render_thread: Some(false),
            ..ManagerConfig::default()
        };
        assert!(!config.wants_render_thread());
    }

    #[test]
    fn test_manager_config_rejects_zero_workers() {
        let config = ManagerConfig {
            general_purpose_threads: Some(0),
            ..ManagerConfig::default()
        };
        assert!(matches!(config.validate(), Err(JobsError::InvalidConfig(_))));

        let config = ManagerConfig {
            min_general_purpose_threads: 0,
            ..ManagerConfig::default()
        };
        assert!(matches!(config.validate(), Err(JobsError::InvalidConfig(_))));
    }

    #[test]
    fn test_manager_config_rejects_tiny_stacks() {
        let config = ManagerConfig {
            runner_stack_size: Some(1024),
            ..ManagerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("runner_stack_size"));
    }
}

#[cfg(test)]
mod thread_role_tests {
    use super::*;

    #[test]
    fn test_thread_role_specific_only() {
        assert!(ThreadRole::Main.is_thread_specific_only());
        assert!(ThreadRole::FileIo.is_thread_specific_only());
        assert!(ThreadRole::Render.is_thread_specific_only());
        assert!(!ThreadRole::Worker(0).is_thread_specific_only());
    }

    #[test]
    fn test_thread_role_display() {
        assert_eq!(ThreadRole::FileIo.to_string(), "file-io");
        assert_eq!(ThreadRole::Worker(3).to_string(), "worker-3");
        assert_eq!(ThreadRole::Worker(3).thread_name(), "coopjobs-worker-3");
    }
}
