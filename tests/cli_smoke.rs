//! Behavioural tests for the `vigil` CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("vigil");
    cmd.assert().failure().code(2).stderr(contains("Usage"));
}

#[test]
fn cli_help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("vigil");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(contains("exec"))
        .stdout(contains("boot-id"))
        .stdout(contains("wait"))
        .stdout(contains("reboot"))
        .stdout(contains("launch"));
}

#[test]
fn cli_exec_requires_a_host() {
    let mut cmd = cargo_bin_cmd!("vigil");
    cmd.args(["exec", "--", "true"]);

    cmd.assert().failure().code(2).stderr(contains("--host"));
}

#[test]
fn cli_exec_reports_missing_ssh_client() {
    let mut cmd = cargo_bin_cmd!("vigil");
    cmd.env("VIGIL_SSH_BIN", "/nonexistent/vigil-ssh");
    cmd.env("VIGIL_CONNECT_ATTEMPTS", "1");
    cmd.env("VIGIL_CONNECT_RETRY_INTERVAL_SECS", "0");
    cmd.env_remove("VIGIL_CONFIG_PATH");
    cmd.args(["exec", "--host", "192.0.2.1", "--", "true"]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("failed to launch ssh client"));
}

#[test]
fn cli_launch_rejects_conflicting_user_data() {
    let mut cmd = cargo_bin_cmd!("vigil");
    cmd.args([
        "launch",
        "--user-data",
        "#cloud-config",
        "--user-data-file",
        "user-data.yaml",
    ]);

    cmd.assert()
        .failure()
        .code(2)
        .stderr(contains("cannot be used with"));
}

#[test]
fn cli_launch_reports_unreadable_user_data_before_provisioning() {
    let mut cmd = cargo_bin_cmd!("vigil");
    cmd.env("SCW_SECRET_KEY", "SCWSECRETKEYEXAMPLE");
    cmd.env("SCW_DEFAULT_PROJECT_ID", "11111111-2222-3333-4444-555555555555");
    cmd.env("SCW_DEFAULT_IMAGE_ID", "img-example");
    cmd.env_remove("VIGIL_CONFIG_PATH");
    cmd.args(["launch", "--user-data-file", "/nonexistent/vigil/user-data"]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("failed to read user-data"));
}
