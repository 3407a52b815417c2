use chrono::{Duration, Utc};
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

const FLAG_ENV: &str = "IDSHIFT_FLAG_IDENTITY_FUNCTION_PATHWAY";

fn bin(tmp: &TempDir) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("idshift").expect("binary");
    cmd.current_dir(tmp.path())
        .env("IDSHIFT_STATE_DIR", tmp.path().join("state"))
        .env("RUST_LOG", "warn")
        .env_remove("IDSHIFT_CONFIG")
        .env_remove("IDSHIFT_AUDIT_LOG_ROLL")
        .env_remove(FLAG_ENV);
    cmd
}

fn json_stdout(cmd: &mut assert_cmd::Command) -> Value {
    let output = cmd.arg("--json").output().expect("run");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json stdout")
}

/// One sample per minute starting now, so it falls inside the current stage.
fn write_metrics(dir: &Path, error_rate: f64) -> std::path::PathBuf {
    let start = Utc::now();
    let samples: Vec<Value> = (0..=6)
        .map(|m| {
            json!({
                "at": (start + Duration::minutes(m)).to_rfc3339(),
                "errorRate": error_rate,
                "p95LatencyMs": 200.0,
                "conflictRate": 0.01,
            })
        })
        .collect();
    let path = dir.join(format!("metrics-{error_rate}.json"));
    fs::write(
        &path,
        serde_json::to_vec(&json!({"conflictBaseline": 0.01, "samples": samples})).expect("ser"),
    )
    .expect("write metrics");
    path
}

#[test]
fn duplicate_username_is_rejected_with_specific_message() {
    let tmp = tempdir().expect("tmpdir");
    bin(&tmp)
        .args(["identity", "create", "rbcanary1", "--display-name", "RB Canary", "--owner", "u-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rbcanary1@identity.local"));

    bin(&tmp)
        .args(["identity", "create", "rbcanary1", "--display-name", "Again", "--owner", "u-2"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("username `rbcanary1` is already taken"));
}

#[test]
fn invalid_username_fails_before_storage() {
    let tmp = tempdir().expect("tmpdir");
    bin(&tmp)
        .args(["identity", "create", "Bad Name!", "--display-name", "Bad", "--owner", "u-1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid username"));
    bin(&tmp)
        .args(["identity", "validate", "ab"])
        .assert()
        .code(2);
    bin(&tmp)
        .args(["identity", "validate", "first.last"])
        .assert()
        .success();
}

#[test]
fn env_override_beats_stored_value() {
    let tmp = tempdir().expect("tmpdir");
    let v = json_stdout(bin(&tmp).args(["flag", "resolve"]));
    assert_eq!(v["value"], false);

    let v = json_stdout(bin(&tmp).args(["flag", "ensure"]));
    assert_eq!(v["enabled"], false);
    assert_eq!(v["lastModifiedBy"], "bootstrap");

    let v = json_stdout(bin(&tmp).env(FLAG_ENV, "true").args(["flag", "explain"]));
    assert_eq!(v["value"], true);
    assert_eq!(v["source"]["kind"], "override");

    let v = json_stdout(bin(&tmp).env(FLAG_ENV, "yes").args(["flag", "resolve"]));
    assert_eq!(v["value"], false, "only `true` enables");
}

#[test]
fn flag_set_records_operator() {
    let tmp = tempdir().expect("tmpdir");
    bin(&tmp)
        .args(["flag", "set", "--enabled", "--by", "alice"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("not found"));

    bin(&tmp).args(["flag", "ensure"]).assert().success();
    let v = json_stdout(bin(&tmp).args(["flag", "set", "--enabled", "--by", "alice"]));
    assert_eq!(v["enabled"], true);
    assert_eq!(v["lastModifiedBy"], "alice");

    let v = json_stdout(bin(&tmp).args(["events", "tail", "--kind-prefix", "flags.updated"]));
    let rows = v.as_array().expect("event rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["payload"]["by"], "alice");
    assert_eq!(rows[0]["payload"]["enabled"], true);
}

#[test]
fn rollout_rolls_back_on_sustained_breach() {
    let tmp = tempdir().expect("tmpdir");
    let v = json_stdout(bin(&tmp).args(["rollout", "status"]));
    assert_eq!(v["state"]["stage"], "validation");
    assert_eq!(v["promotable"], false);

    bin(&tmp)
        .args(["rollout", "advance", "promote"])
        .assert()
        .code(5)
        .stderr(predicate::str::contains("rejected in stage"));

    let v = json_stdout(bin(&tmp).args(["rollout", "advance", "checks-passed", "--by", "ops"]));
    assert_eq!(v["stage"], "canary");
    assert_eq!(v["canaryPercentage"], 10);
    let v = json_stdout(bin(&tmp).args(["rollout", "advance", "canary-enabled", "--by", "ops"]));
    assert_eq!(v["stage"], "monitoring");

    let healthy = write_metrics(tmp.path(), 0.001);
    let v = json_stdout(bin(&tmp).args(["rollout", "observe", "--metrics"]).arg(&healthy));
    assert_eq!(v["rolledBack"], false);
    assert_eq!(v["state"]["stage"], "monitoring");

    let breaching = write_metrics(tmp.path(), 0.2);
    let v = json_stdout(bin(&tmp).args(["rollout", "observe", "--metrics"]).arg(&breaching));
    assert_eq!(v["rolledBack"], true);
    assert_eq!(v["state"]["stage"], "rolled_back");
    assert_eq!(v["state"]["lastReason"], "sustained breach: error_rate");

    let v = json_stdout(bin(&tmp).args(["flag", "show"]));
    assert_eq!(v["enabled"], false);
    assert_eq!(v["lastModifiedBy"], "monitor");

    bin(&tmp)
        .args(["events", "tail", "--kind-prefix", "rollout."])
        .assert()
        .success()
        .stdout(predicate::str::contains("rollout.rolled_back"));

    let v = json_stdout(bin(&tmp).args(["rollout", "restart", "--by", "ops"]));
    assert_eq!(v["stage"], "validation");
    assert_eq!(v["cycle"], 2);
}

#[test]
fn monitor_evaluate_ignores_a_single_spike() {
    let tmp = tempdir().expect("tmpdir");
    let path = tmp.path().join("spike.json");
    let samples: Vec<Value> = (0..=6)
        .map(|m| {
            json!({
                "at": format!("2026-03-01T12:{:02}:00Z", m),
                "errorRate": if m == 5 { 0.9 } else { 0.001 },
                "p95LatencyMs": 200.0,
                "conflictRate": 0.0,
            })
        })
        .collect();
    fs::write(&path, json!({"samples": samples}).to_string()).expect("write");
    let v = json_stdout(bin(&tmp).args(["monitor", "evaluate", "--metrics"]).arg(&path));
    assert_eq!(v["healthy"], true);
}

#[test]
fn config_schema_and_bad_config() {
    let tmp = tempdir().expect("tmpdir");
    bin(&tmp)
        .args(["config", "schema"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"rollout\""));

    let cfg = tmp.path().join("idshift.toml");
    fs::write(&cfg, "[rollout]\ncanary_percentage = 0\n").expect("write cfg");
    bin(&tmp)
        .args(["config", "show"])
        .assert()
        .code(8)
        .stderr(predicate::str::contains("canary_percentage"));
}
