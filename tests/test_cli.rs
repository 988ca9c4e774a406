//! CLI surface tests: argument parsing, `check`, and `log` run without
//! privileges, so they are exercised against the real binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn acp() -> Command {
    Command::cargo_bin("acp").unwrap()
}

#[test]
fn help_names_the_subcommands() {
    acp()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("log"));
}

#[test]
fn check_accepts_a_valid_policy() {
    let tmp = tempfile::TempDir::new().unwrap();
    let policy = tmp.path().join("policy.yml");
    std::fs::write(
        &policy,
        r#"
default: ask
rules:
  - match: { kind: http, host: "api.anthropic.com" }
    action: allow
  - match: { host: "*.evil.com" }
    action: deny
"#,
    )
    .unwrap();

    acp()
        .arg("check")
        .arg(&policy)
        .assert()
        .success()
        .stdout(predicate::str::contains("Policy is valid"))
        .stdout(predicate::str::contains("allow:kind=http,host=api.anthropic.com"));
}

#[test]
fn check_rejects_unknown_keys() {
    let tmp = tempfile::TempDir::new().unwrap();
    let policy = tmp.path().join("policy.yml");
    std::fs::write(&policy, "default: ask\nrules:\n  - actoin: allow\n").unwrap();

    acp()
        .arg("check")
        .arg(&policy)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("✗"));
}

#[test]
fn check_rejects_out_of_range_port() {
    let tmp = tempfile::TempDir::new().unwrap();
    let policy = tmp.path().join("policy.yml");
    std::fs::write(
        &policy,
        "default: ask\nrules:\n  - match: { port: 65536 }\n    action: allow\n",
    )
    .unwrap();

    acp().arg("check").arg(&policy).assert().failure().code(1);
}

#[test]
fn log_on_missing_file_reports_empty() {
    let tmp = tempfile::TempDir::new().unwrap();
    acp()
        .arg("log")
        .arg("--audit")
        .arg(tmp.path().join("audit.jsonl"))
        .assert()
        .success()
        .stdout(predicate::str::contains("No audit entries"));
}

#[test]
fn start_requires_a_preset() {
    acp().arg("start").assert().failure();
}
