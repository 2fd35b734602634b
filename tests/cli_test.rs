//! Binary-level tests for the `dfs` command line

use assert_cmd::Command;
use predicates::prelude::*;

/// Four `--node` flags pointing at ports nothing listens on
fn unreachable_nodes() -> Vec<String> {
    let mut args = Vec::new();
    for n in 1..=4 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        args.push("--node".to_string());
        args.push(format!("DFS{}=127.0.0.1:{}", n, port));
    }
    args
}

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("dfs")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("node"))
        .stdout(predicate::str::contains("client"));
}

#[test]
fn test_node_help_shows_options() {
    Command::cargo_bin("dfs")
        .unwrap()
        .args(["node", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--listen-port"))
        .stdout(predicate::str::contains("--backend"));
}

#[test]
fn test_client_rejects_incomplete_registry() {
    Command::cargo_bin("dfs")
        .unwrap()
        .args(["client", "--node", "DFS1=127.0.0.1:10001"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("WrongNodeCount"));
}

#[test]
fn test_client_missing_credentials_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("dfc_passwords.conf");

    Command::cargo_bin("dfs")
        .unwrap()
        .arg("client")
        .arg("--credentials")
        .arg(&missing)
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("NotFound"));
}

#[test]
fn test_client_login_and_commands() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = dir.path().join("dfc_passwords.conf");
    std::fs::write(&credentials, "alice secret\nbob hunter2\n").unwrap();

    Command::cargo_bin("dfs")
        .unwrap()
        .arg("client")
        .arg("--credentials")
        .arg(&credentials)
        .args(unreachable_nodes())
        .args(["--connect-timeout-ms", "500"])
        .write_stdin("alice wrong\nalice secret\nfrobnicate\nlist\nget nothing.txt\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Username & password combination not found!"))
        .stdout(predicate::str::contains("Login successful!"))
        .stdout(predicate::str::contains("Invalid input. Try list, put, or get"))
        .stdout(predicate::str::contains("Directory Items:"))
        .stdout(predicate::str::contains("File not found!"));
}
