#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn stepwise(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("stepwise").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("STEPWISE_CONFIG")
        .env_remove("STEPWISE_WEBHOOK_SECRET");
    cmd
}

fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

const KYC_YAML: &str = r#"
name: kyc
steps:
  - id: national_id
    template: tpl-pid
  - id: address
    template: tpl-address
    dependsOn: [national_id]
  - id: wallet
    template: tpl-payment
    dependsOn: [national_id]
"#;

// ---------------------------------------------------------------------------
// stepwise validate
// ---------------------------------------------------------------------------

#[test]
fn validate_accepts_yaml_definition() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "kyc.yaml", KYC_YAML);
    stepwise(&dir)
        .arg("validate")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("'kyc' is valid (3 steps)"));
}

#[test]
fn validate_accepts_json_definition() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "one.json",
        r#"{"name":"one","steps":[{"id":"a","template":"t"}]}"#,
    );
    stepwise(&dir)
        .args(["validate", "--json"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"isValid\": true"));
}

#[test]
fn validate_reports_cycle_and_fails() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "loop.yaml",
        r#"
name: loop
steps:
  - id: a
    template: t
    dependsOn: [b]
  - id: b
    template: t
    dependsOn: [a]
"#,
    );
    stepwise(&dir)
        .arg("validate")
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains("cycle"))
        .stderr(predicate::str::contains("error: definition is invalid"));
}

#[test]
fn validate_json_output_carries_error() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "dup.yaml",
        "name: dup\nsteps:\n  - {id: a, template: t}\n  - {id: a, template: t}\n",
    );
    let output = stepwise(&dir)
        .args(["validate", "--json"])
        .arg(&file)
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["isValid"], false);
    assert!(json["error"].as_str().unwrap().contains("a"));
}

#[test]
fn validate_reads_stdin() {
    let dir = TempDir::new().unwrap();
    stepwise(&dir)
        .args(["validate", "-"])
        .write_stdin(KYC_YAML)
        .assert()
        .success();
}

#[test]
fn validate_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    stepwise(&dir)
        .args(["validate", "nope.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

// ---------------------------------------------------------------------------
// stepwise config
// ---------------------------------------------------------------------------

#[test]
fn config_check_defaults_are_clean() {
    let dir = TempDir::new().unwrap();
    stepwise(&dir)
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_check_picks_up_working_directory_file() {
    let dir = TempDir::new().unwrap();
    write(&dir, "stepwise.yaml", "sessions:\n  ttl_secs: 0\n");
    stepwise(&dir)
        .args(["config", "check"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] sessions.ttl_secs must be > 0"));
}

#[test]
fn config_check_warnings_do_not_fail() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "custom.yaml",
        "webhooks:\n  retry_delays_ms: [5000, 1000]\n",
    );
    stepwise(&dir)
        .args(["config", "check", "--config"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("[warning]"));
}

#[test]
fn config_missing_explicit_file_fails() {
    let dir = TempDir::new().unwrap();
    stepwise(&dir)
        .args(["config", "check", "--config", "absent.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config not found"));
}

#[test]
fn config_show_masks_seeded_secrets() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "stepwise.yaml",
        r#"
webhooks:
  subscriptions:
    - url: https://rp.example/hook
      secret: super-secret
      events: [orchestration.completed]
"#,
    );
    stepwise(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rp.example"))
        .stdout(predicate::str::contains("super-secret").not());
}

// ---------------------------------------------------------------------------
// stepwise sign
// ---------------------------------------------------------------------------

#[test]
fn sign_matches_known_signature() {
    let dir = TempDir::new().unwrap();
    stepwise(&dir)
        .args([
            "sign",
            "--secret",
            "whsec_test",
            "--timestamp",
            "1700000000",
            r#"{"event":"orchestration.completed"}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("x-webhook-timestamp: 1700000000"))
        .stdout(predicate::str::contains(
            "x-webhook-signature: dba887c41fbfbcc1f8f39b24d277b56e11289662983ee3cdd13c34eb9ec98dd6",
        ));
}

#[test]
fn sign_rejects_empty_secret() {
    let dir = TempDir::new().unwrap();
    stepwise(&dir)
        .args(["sign", "--secret", "", "body"])
        .assert()
        .failure();
}
