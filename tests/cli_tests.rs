//! Command line interface tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn mipack() -> Command {
    Command::cargo_bin("mipack").unwrap()
}

#[test]
fn help_lists_the_build_operation() {
    mipack()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("bundle catalog"));
}

#[test]
fn build_help_documents_the_flags() {
    mipack()
        .args(["build", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--official"))
        .stdout(predicate::str::contains("--jobs"));
}

#[test]
fn missing_catalog_argument_is_a_usage_error() {
    mipack()
        .arg("build")
        .assert()
        .failure()
        .stderr(predicate::str::contains("CATALOG"));
}

#[test]
fn unknown_operation_is_rejected() {
    mipack()
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized"));
}

#[test]
fn missing_deployment_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bundles.catalog"), "").unwrap();

    mipack()
        .current_dir(dir.path())
        .args(["build", "bundles.catalog"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reading deployment config"));
}

#[test]
fn malformed_catalog_record_names_the_line() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("mipack.toml"), "stub = \"stub.exe\"\n").unwrap();
    std::fs::write(
        dir.path().join("bundles.catalog"),
        "# offline bundles\nnot a json record\n",
    )
    .unwrap();

    mipack()
        .current_dir(dir.path())
        .args(["build", "bundles.catalog"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("bundles.catalog:2:"));
}
