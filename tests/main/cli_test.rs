//! CLI exit-code contract: 0 = ok, 2 = config failure.

use std::io::Write;

use assert_cmd::Command;

#[test]
fn check_config_accepts_an_empty_config_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"").expect("write");

    Command::cargo_bin("straylight")
        .expect("binary exists")
        .args(["check-config", "--config"])
        .arg(file.path())
        .assert()
        .success();
}

#[test]
fn check_config_rejects_invalid_toml_with_exit_code_2() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"this is {{ not toml").expect("write");

    Command::cargo_bin("straylight")
        .expect("binary exists")
        .args(["check-config", "--config"])
        .arg(file.path())
        .assert()
        .code(2);
}

#[test]
fn check_config_rejects_unknown_default_provider_with_exit_code_2() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"[behaviour]\ndefault_provider = \"ghost\"\n")
        .expect("write");

    Command::cargo_bin("straylight")
        .expect("binary exists")
        .args(["check-config", "--config"])
        .arg(file.path())
        .assert()
        .code(2);
}
