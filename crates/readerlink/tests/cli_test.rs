//! Integration tests for the `readerlink` CLI binary.
//!
//! Searches run against the simulated reader SDK with `--auto`, so no
//! terminal or hardware is needed.
#![allow(clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a [`Command`] for the `readerlink` binary with env isolation.
///
/// Clears all `READERLINK_*` env vars and points config directories at a
/// nonexistent path so tests never touch the user's real configuration.
fn readerlink_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("readerlink");
    cmd.env("HOME", "/tmp/readerlink-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/readerlink-cli-test-nonexistent")
        .env("NO_COLOR", "1")
        .env_remove("READERLINK_PROFILE")
        .env_remove("READERLINK_CONFIG")
        .env_remove("READERLINK_DEFAULT_PROFILE")
        .env_remove("RUST_LOG");
    cmd
}

/// `readerlink simulate --auto --json` plus `extra`, parsed from stdout.
fn simulate_json(extra: &[&str]) -> serde_json::Value {
    let output = readerlink_cmd()
        .args(["simulate", "--auto", "--json", "--timeout", "20s"])
        .args(extra)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "simulate failed:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn write_config(dir: &Path, contents: &str) -> String {
    let path = dir.join("config.toml");
    std::fs::write(&path, contents).unwrap();
    path.display().to_string()
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    readerlink_cmd()
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_help_lists_commands() {
    readerlink_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("simulate")
            .and(predicate::str::contains("config"))
            .and(predicate::str::contains("completions")),
    );
}

#[test]
fn test_completions_bash() {
    readerlink_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("readerlink"));
}

#[test]
fn test_unknown_fail_kind_is_a_usage_error() {
    readerlink_cmd()
        .args(["simulate", "--fail-connect", "meteor"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("incomplete-address"));
}

// ── Config commands ─────────────────────────────────────────────────

#[test]
fn test_config_path_honours_flag() {
    readerlink_cmd()
        .args(["config", "path", "--config", "/tmp/elsewhere/readerlink.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/tmp/elsewhere/readerlink.toml"));
}

#[test]
fn test_config_show_resolves_profile() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        "default_profile = \"counter\"\n\n[profiles.counter]\nsite_id = 4242\n",
    );
    readerlink_cmd()
        .args(["config", "show", "--config", &path])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("# active profile: counter")
                .and(predicate::str::contains("# site_id = 4242"))
                .and(predicate::str::contains("bluetooth_scan")),
        );
}

#[test]
fn test_unknown_profile_lists_available() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[profiles.counter]\nsite_id = 1\n");
    readerlink_cmd()
        .args(["config", "show", "--config", &path, "--profile", "ghost"])
        .assert()
        .code(3)
        .stderr(
            predicate::str::contains("Profile 'ghost' not found")
                .and(predicate::str::contains("counter")),
        );
}

#[test]
fn test_invalid_threshold_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        "[profiles.shop]\nsite_id = 1\nupdate_cancel_threshold = 2.0\n",
    );
    readerlink_cmd()
        .args(["simulate", "--auto", "--reader", "R1", "--config", &path, "-p", "shop"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("update_cancel_threshold"));
}

// ── Simulated searches ──────────────────────────────────────────────

#[test]
fn test_single_reader_connects() {
    readerlink_cmd()
        .args(["simulate", "--auto", "--reader", "CHB-1:Front counter"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Connected to Front counter (CHB-1)"))
        .stderr(predicate::str::contains("Found reader Front counter"));
}

#[test]
fn test_known_reader_is_preferred() {
    let report = simulate_json(&["--reader", "A", "--reader", "B", "--known", "B"]);
    assert_eq!(report["outcome"], "connected");
    assert_eq!(report["detail"]["id"], "B");
}

#[test]
fn test_list_choice_connects_first_reader() {
    let report = simulate_json(&["--reader", "A:Alpha", "--reader", "B:Bravo"]);
    assert_eq!(report["detail"]["id"], "A");
    assert_eq!(report["detail"]["name"], "Alpha");
}

#[test]
fn test_reader_arriving_later_is_found() {
    let report = simulate_json(&["--later", "LATE-1", "--later-after", "100ms", "--known", "LATE-1"]);
    assert_eq!(report["detail"]["id"], "LATE-1");
}

#[test]
fn test_connect_failures_recover() {
    for kind in [
        "generic",
        "incomplete-address",
        "postal-code",
        "low-battery",
        "update-battery",
        "update",
    ] {
        let report = simulate_json(&["--reader", "R1", "--fail-connect", kind]);
        assert_eq!(report["outcome"], "connected", "after {kind}");
    }
}

#[test]
fn test_mandatory_update_then_connect() {
    let output = readerlink_cmd()
        .args(["simulate", "--auto", "--json", "--update", "--reader", "R1"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["detail"]["id"], "R1");
    // Held back after the update finished.
    assert!(report["elapsed_ms"].as_u64().unwrap() >= 1000);
}

#[test]
fn test_discovery_failure_exit_code() {
    readerlink_cmd()
        .args(["simulate", "--auto", "--fail-discovery", "bluetooth is off"])
        .assert()
        .code(4)
        .stderr(
            predicate::str::contains("Searching for card readers failed")
                .and(predicate::str::contains("bluetooth is off")),
        );
}

#[test]
fn test_timeout_without_readers() {
    readerlink_cmd()
        .args(["simulate", "--auto", "--timeout", "300ms"])
        .assert()
        .code(8)
        .stderr(predicate::str::contains("No reader was connected within 300ms"));
}
