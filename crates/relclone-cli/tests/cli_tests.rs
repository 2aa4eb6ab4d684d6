//! CLI integration tests for relclone.
//!
//! These tests verify command-line argument parsing, help output, and exit
//! codes for error conditions that never reach a database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the relclone binary.
fn cmd() -> Command {
    Command::cargo_bin("relclone").unwrap()
}

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("upload"))
        .stdout(predicate::str::contains("merge"))
        .stdout(predicate::str::contains("schema"));
}

#[test]
fn test_download_subcommand_help() {
    cmd()
        .args(["download", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--table"))
        .stdout(predicate::str::contains("--column"))
        .stdout(predicate::str::contains("--value"))
        .stdout(predicate::str::contains("--output"));
}

#[test]
fn test_merge_subcommand_help() {
    cmd()
        .args(["merge", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--base"))
        .stdout(predicate::str::contains("--branch"))
        .stdout(predicate::str::contains("--mapping"))
        .stdout(predicate::str::contains("--apply"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("relclone"));
}

#[test]
fn test_missing_config_fails() {
    cmd()
        .args(["--config", "/nonexistent/config.yaml", "schema"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_invalid_config_fails_with_config_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "database:\n  host: ''\n  database: x\n  user: u").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "schema"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("host"));
}

#[test]
fn test_invalid_verbosity_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "database:\n  host: localhost\n  database: x\n  user: u"
    )
    .unwrap();

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--verbosity",
            "loud",
            "schema",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("verbosity"));
}
