//! Command line tests
//!
//! Runs the built binary with a throwaway configuration file.

use std::fs;
use std::process::{Command, Output};
use std::time::Duration;

fn coopjobs(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_coopjobs"))
        .args(args)
        .output()
        .expect("Failed to spawn coopjobs")
}

fn write_config(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("coopjobs.toml");
    fs::write(
        &path,
        r#"
[jobs]
general_purpose_threads = 2
separate_render_thread = false
max_pooled_runners = 4

[log]
level = "warn"
"#,
    )
    .unwrap();
    path.display().to_string()
}

#[test]
fn test_cli_config_prints_effective_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir);
    let output = coopjobs(&["--config", &path, "config"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("general_purpose_threads = 2"), "{}", stdout);
    assert!(stdout.contains("max_pooled_runners = 4"), "{}", stdout);
    assert!(stdout.contains("level = \"warn\""), "{}", stdout);
}

#[test]
fn test_cli_chain_reports_steps() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir);
    let output = coopjobs(&["--config", &path, "chain", "--laps", "3"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("chain finished as Complete after 9 steps"), "{}", stdout);
}

#[test]
fn test_cli_stress_small_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir);
    let started = std::time::Instant::now();
    let output = coopjobs(&["--config", &path, "stress", "--batches", "64", "--stages", "3"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Jobs completed:    256"), "{}", stdout);
    assert!(stdout.contains("Jobs failed:       0"), "{}", stdout);
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[test]
fn test_cli_missing_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml").display().to_string();
    let output = coopjobs(&["--config", &missing, "config"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load configuration"), "{}", stderr);
}
