//! CLI integration tests for pg-linkage.
//!
//! These tests verify argument parsing, help output, offline planning and
//! exit codes for error conditions. None of them need a database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

/// Get a command for the pg-linkage binary.
fn cmd() -> Command {
    Command::cargo_bin("pg-linkage").unwrap()
}

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// Jobs declare every column, so planning needs no connection. The port is
/// chosen so that any accidental connection attempt fails.
const OFFLINE_CONFIG: &str = r#"
database:
  host: 127.0.0.1
  port: 1
  database: voters
  user: linkage
extensions: [pg_trgm]
jobs:
  - name: load-voters
    source:
      table: staging.voters
      columns: [id, ssn, email, name]
      primary_key: id
    target:
      table: public.voters
      columns: [id, ssn, email, name, updated_at]
      primary_key: id
    matching:
      exact:
        - [ssn]
      fuzzy: [name]
    merge:
      preserve: [updated_at]
  - name: dedup-voters
    kind: dedup
    target:
      table: public.voters
      columns: [id, ssn, email, name, updated_at]
      primary_key: id
    matching:
      exact:
        - [ssn]
"#;

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("audit"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--job"));
}

#[test]
fn test_plan_subcommand_help() {
    cmd()
        .args(["plan", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--job"))
        .stdout(predicate::str::contains("--audit"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pg-linkage"));
}

#[test]
fn test_default_config_path() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: linkage.yaml]"));
}

// =============================================================================
// Error Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_file() {
    cmd()
        .args(["--config", "/nonexistent/linkage.yaml", "plan"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_invalid_yaml() {
    let file = config_file("database: [unclosed");
    cmd()
        .arg("--config")
        .arg(file.path())
        .arg("plan")
        .assert()
        .code(1);
}

#[test]
fn test_invalid_config_values() {
    let file = config_file(&OFFLINE_CONFIG.replace("host: 127.0.0.1", "host: \"\""));
    cmd()
        .arg("--config")
        .arg(file.path())
        .arg("plan")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("database.host is required"));
}

#[test]
fn test_unknown_extension() {
    let file = config_file(&OFFLINE_CONFIG.replace("[pg_trgm]", "[fuzzystrmatch]"));
    cmd()
        .arg("--config")
        .arg(file.path())
        .arg("plan")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("fuzzystrmatch"));
}

#[test]
fn test_missing_capability() {
    let file = config_file(&OFFLINE_CONFIG.replace("[pg_trgm]", "[]"));
    cmd()
        .arg("--config")
        .arg(file.path())
        .args(["plan", "--job", "load-voters"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("trigram"));
}

#[test]
fn test_unknown_job() {
    let file = config_file(OFFLINE_CONFIG);
    cmd()
        .arg("--config")
        .arg(file.path())
        .args(["plan", "--job", "nope"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no job named 'nope'"));
}

#[test]
fn test_invalid_verbosity() {
    let file = config_file(OFFLINE_CONFIG);
    cmd()
        .arg("--config")
        .arg(file.path())
        .args(["--verbosity", "loud", "plan"])
        .assert()
        .code(1);
}

#[test]
fn test_run_without_database_fails() {
    let file = config_file(OFFLINE_CONFIG);
    cmd()
        .arg("--config")
        .arg(file.path())
        .arg("run")
        .assert()
        .code(3);
}

// =============================================================================
// Offline Planning Tests
// =============================================================================

#[test]
fn test_plan_prints_statements() {
    let file = config_file(OFFLINE_CONFIG);
    cmd()
        .arg("--config")
        .arg(file.path())
        .args(["plan", "--job", "load-voters"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-- merge 'load-voters'"))
        .stdout(predicate::str::contains("CREATE TEMPORARY TABLE"))
        .stdout(predicate::str::contains("<->"))
        .stdout(predicate::str::contains("UPDATE \"public\".\"voters\" t SET"))
        .stdout(predicate::str::contains("INSERT INTO \"public\".\"voters\""))
        .stdout(predicate::str::contains("DROP TABLE"));
}

#[test]
fn test_plan_dedup_includes_gate() {
    let file = config_file(OFFLINE_CONFIG);
    cmd()
        .arg("--config")
        .arg(file.path())
        .args(["plan", "--job", "dedup-voters"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(reflexive)"))
        .stdout(predicate::str::contains("(symmetric)"))
        .stdout(predicate::str::contains("next_duplicates"));
}

#[test]
fn test_plan_audit_is_read_only() {
    let file = config_file(OFFLINE_CONFIG);
    cmd()
        .arg("--config")
        .arg(file.path())
        .args(["plan", "--audit"])
        .assert()
        .success()
        .stdout(predicate::str::contains("working_exact_match_group"))
        .stdout(predicate::str::contains("UPDATE \"public\"").not())
        .stdout(predicate::str::contains("INSERT INTO \"public\"").not())
        .stdout(predicate::str::contains("next_duplicates").not());
}

#[test]
fn test_plan_json_output() {
    let file = config_file(OFFLINE_CONFIG);
    let output = cmd()
        .arg("--config")
        .arg(file.path())
        .args(["--output-json", "plan"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let plans: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let plans = plans.as_array().unwrap();
    assert_eq!(plans.len(), 2);
    assert_eq!(plans[0]["job"], "load-voters");
    assert_eq!(plans[0]["kind"], "merge");
    assert_eq!(plans[1]["kind"], "dedup");
    assert_eq!(plans[1]["gate"].as_array().unwrap().len(), 2);
}
