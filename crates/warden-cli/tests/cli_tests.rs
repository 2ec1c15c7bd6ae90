use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const PASS: &str = "correct horse battery staple";

fn write_fast_config(dir: &Path) {
    let config = serde_json::json!({
        "session": { "timeout_secs": 300 },
        "kdf": { "iterations": 100000 },
        "password_hash": { "memory_kib": 8192, "time_cost": 1, "parallelism": 1 },
        "vault": { "service_namespace": "warden-cli-test" }
    });
    fs::write(dir.join("config.json"), serde_json::to_vec_pretty(&config).unwrap()).unwrap();
}

fn warden(dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("warden").unwrap();
    cmd.env("WARDEN_PASSPHRASE", PASS)
        .env_remove("WARDEN_PASSPHRASE_CONFIRM")
        .env_remove("WARDEN_NEW_PASSPHRASE")
        .arg("--data-dir")
        .arg(dir);
    cmd
}

fn initialized() -> tempfile::TempDir {
    let dir = tempdir().unwrap();
    write_fast_config(dir.path());
    warden(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Master credential created"));
    dir
}

#[test]
fn init_refuses_weak_or_repeated_setup() {
    let dir = tempdir().unwrap();
    write_fast_config(dir.path());
    warden(dir.path())
        .env("WARDEN_PASSPHRASE", "short")
        .arg("init")
        .assert()
        .failure();
    assert!(!dir.path().join("master.json").exists());

    warden(dir.path()).arg("init").assert().success();
    warden(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn status_reports_locked_after_init() {
    let dir = initialized();
    warden(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"locked\""))
        .stdout(predicate::str::contains("\"has_master_credential\": true"));
}

#[test]
fn wrong_passphrase_is_rejected() {
    let dir = initialized();
    warden(dir.path())
        .env("WARDEN_PASSPHRASE", "not the right passphrase")
        .args(["setting", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unlock failed"));
}

#[test]
fn passwords_roundtrip_and_listing_hides_values() {
    let dir = initialized();
    warden(dir.path())
        .args(["password", "add", "mail", "alice", "--password", "pw-one-secret"])
        .assert()
        .success();
    warden(dir.path())
        .args(["password", "add", "mail", "alice", "--password", "pw-two-secret"])
        .args(["--url", "https://mail.example"])
        .assert()
        .success();

    warden(dir.path())
        .args(["password", "get", "mail", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pw-two-secret"));
    warden(dir.path())
        .args(["password", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice"))
        .stdout(predicate::str::contains("pw-").not());

    let db = fs::read(dir.path().join("warden.db")).unwrap();
    assert!(!db.windows(13).any(|w| w == b"pw-two-secret"));

    warden(dir.path())
        .args(["password", "delete", "mail"])
        .assert()
        .success();
    warden(dir.path())
        .args(["password", "get", "mail"])
        .assert()
        .failure();
}

#[test]
fn settings_and_history() {
    let dir = initialized();
    warden(dir.path())
        .args(["setting", "set", "theme", "\"dark\""])
        .assert()
        .success();
    warden(dir.path())
        .args(["setting", "set", "limits", "{\"max\": 3}"])
        .assert()
        .success();
    warden(dir.path())
        .args(["setting", "get", "limits"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"max\": 3"));
    warden(dir.path())
        .args(["setting", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("theme"));

    for (role, content) in [("user", "first question"), ("assistant", "first answer"), ("user", "second")] {
        warden(dir.path())
            .args(["history", "add", "c1", role, content])
            .assert()
            .success();
    }
    let out = warden(dir.path())
        .args(["history", "show", "c1", "--limit", "2"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let msgs: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let msgs = msgs.as_array().unwrap();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0]["content"], "first answer");
    assert_eq!(msgs[1]["content"], "second");
}

#[test]
fn passwd_keeps_data_readable() {
    let dir = initialized();
    let new_pass = "an entirely new passphrase";
    warden(dir.path())
        .args(["apikey", "add", "openai", "--key", "sk-abc123"])
        .assert()
        .success();
    warden(dir.path())
        .env("WARDEN_NEW_PASSPHRASE", new_pass)
        .arg("passwd")
        .assert()
        .success();

    warden(dir.path())
        .args(["apikey", "get", "openai"])
        .assert()
        .failure();
    warden(dir.path())
        .env("WARDEN_PASSPHRASE", new_pass)
        .args(["apikey", "get", "openai"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sk-abc123"));
}

#[test]
fn backup_and_restore() {
    let dir = initialized();
    warden(dir.path())
        .args(["password", "add", "bank", "bob", "--password", "original-pw"])
        .assert()
        .success();
    let dest = dir.path().join("warden.bak");
    warden(dir.path())
        .arg("backup")
        .arg(&dest)
        .assert()
        .success();
    let raw = fs::read(&dest).unwrap();
    assert!(raw.starts_with(b"WRDNFILE"));

    warden(dir.path())
        .args(["password", "add", "bank", "bob", "--password", "changed-pw"])
        .assert()
        .success();
    warden(dir.path()).arg("restore").arg(&dest).assert().success();
    warden(dir.path())
        .args(["password", "get", "bank", "bob"])
        .assert()
        .success()
        .stdout(predicate::str::contains("original-pw"));
}
