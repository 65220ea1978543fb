//! End-to-end CLI tests for the civitai-dl binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn civitai_dl(config_home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("civitai-dl").unwrap();
    cmd.env("XDG_CONFIG_HOME", config_home.path())
        .env_remove("CIVITAI_API_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    let home = TempDir::new().unwrap();
    civitai_dl(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Bulk download CivitAI models"))
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("config"));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    let home = TempDir::new().unwrap();
    civitai_dl(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("civitai-dl"));
}

/// Test that a subcommand is required.
#[test]
fn test_binary_without_subcommand_fails() {
    let home = TempDir::new().unwrap();
    civitai_dl(&home).assert().failure().stderr(predicate::str::contains("Usage"));
}

/// Test that invalid flags cause non-zero exit.
#[test]
fn test_binary_invalid_flag_returns_error() {
    let home = TempDir::new().unwrap();
    civitai_dl(&home)
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

/// Test that the config subcommand prints defaults when no file exists.
#[test]
fn test_config_prints_default_toml() {
    let home = TempDir::new().unwrap();
    civitai_dl(&home)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[retry]"))
        .stdout(predicate::str::contains("[bulk]"))
        .stdout(predicate::str::contains("batch_size = 10"));
}

/// Test that values from --config override defaults and tokens are redacted.
#[test]
fn test_config_reads_file_and_redacts_token() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("custom.toml");
    std::fs::write(
        &config,
        "[bulk]\nbatch_size = 4\nstrategy = \"sequential\"\n\n[transfer]\napi_token = \"hunter2\"\n",
    )
    .unwrap();

    civitai_dl(&home)
        .args(["config", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("batch_size = 4"))
        .stdout(predicate::str::contains("sequential"))
        .stdout(predicate::str::contains("hunter2").not());
}

/// Test that an invalid config file is reported with its path.
#[test]
fn test_invalid_config_fails_with_path() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("broken.toml");
    std::fs::write(&config, "[bulk]\nbatch_size = 0\n").unwrap();

    civitai_dl(&home)
        .args(["config", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("bulk.batch_size"));
}

/// Test that a missing results file fails before any download starts.
#[test]
fn test_download_missing_results_file_fails() {
    let home = TempDir::new().unwrap();
    civitai_dl(&home)
        .args(["download", "-q"])
        .arg(home.path().join("nope.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.json"));
}

/// Test that malformed search results are rejected.
#[test]
fn test_download_rejects_malformed_results() {
    let home = TempDir::new().unwrap();
    let results = home.path().join("results.json");
    std::fs::write(&results, r#"{"unexpected": true}"#).unwrap();

    civitai_dl(&home)
        .args(["download", "-q"])
        .arg(&results)
        .assert()
        .failure()
        .stderr(predicate::str::contains("parsing search results"));
}

/// Test that an empty result set completes and prints a JSON report.
#[test]
fn test_download_empty_results_prints_report() {
    let home = TempDir::new().unwrap();
    let results = home.path().join("empty.json");
    std::fs::write(&results, r#"{"items": []}"#).unwrap();

    civitai_dl(&home)
        .args(["download", "-q", "--strategy", "sequential", "--output-dir"])
        .arg(home.path().join("out"))
        .arg(&results)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status": "COMPLETED""#))
        .stdout(predicate::str::contains(r#""name": "empty""#));
}

/// Test that concurrency outside 1-100 is rejected by the parser.
#[test]
fn test_download_concurrency_out_of_range() {
    let home = TempDir::new().unwrap();
    civitai_dl(&home)
        .args(["download", "results.json", "-c", "101"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("101"));
}

/// Test that --analytics-db creates the SQLite database.
#[test]
fn test_download_creates_analytics_database() {
    let home = TempDir::new().unwrap();
    let results = home.path().join("empty.json");
    let database = home.path().join("analytics.db");
    std::fs::write(&results, "[]").unwrap();

    civitai_dl(&home)
        .args(["download", "-q", "--analytics-db"])
        .arg(&database)
        .arg("--output-dir")
        .arg(home.path().join("out"))
        .arg(&results)
        .assert()
        .success();

    assert!(database.exists());
}
