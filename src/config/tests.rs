//! Configuration defaults, validation, and conversion tests.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::test_support::EnvGuard;

#[fixture]
fn base_config() -> HarnessConfig {
    HarnessConfig {
        ssh_bin: String::from("ssh"),
        ssh_user: String::from("ubuntu"),
        ssh_port: 22,
        ssh_identity_file: None,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        connect_timeout_secs: 60,
        connect_attempts: 30,
        connect_retry_interval_secs: 10,
        boot_timeout_secs: 2400,
        restart_timeout_secs: 900,
        power_state_timeout_secs: 1200,
        power_state_poll_interval_secs: 5,
        first_boot_target_attempts: 300,
        stop_timeout_secs: 600,
        delete_timeout_secs: 600,
        teardown_poll_interval_secs: 5,
        fail_on_first_boot_error: false,
    }
}

#[fixture]
fn scaleway_config() -> ScalewayConfig {
    ScalewayConfig {
        access_key: None,
        secret_key: String::from("secret"),
        default_organization_id: None,
        default_project_id: String::from("proj"),
        default_zone: String::from("fr-par-1"),
        default_instance_type: String::from("DEV1-S"),
        default_image_id: String::new(),
    }
}

#[rstest]
fn defaults_validate(base_config: HarnessConfig) {
    assert!(base_config.validate().is_ok());
}

#[rstest]
fn empty_identity_file_is_rejected_with_guidance(base_config: HarnessConfig) {
    let cfg = HarnessConfig {
        ssh_identity_file: Some(String::from("  ")),
        ..base_config
    };
    let err = cfg.validate().expect_err("blank identity");
    let message = err.to_string();
    assert!(message.contains("VIGIL_SSH_IDENTITY_FILE"), "{message}");
    assert!(message.contains("vigil.toml"), "{message}");
}

#[rstest]
fn zero_connect_attempts_are_invalid(base_config: HarnessConfig) {
    let cfg = HarnessConfig {
        connect_attempts: 0,
        ..base_config
    };
    assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
}

#[rstest]
fn settings_carry_configured_budgets(base_config: HarnessConfig) {
    let cfg = HarnessConfig {
        boot_timeout_secs: 60,
        connect_attempts: 3,
        fail_on_first_boot_error: true,
        ..base_config
    };

    let readiness = cfg.readiness_settings();
    assert_eq!(readiness.boot_timeout, Duration::from_secs(60));
    assert_eq!(readiness.identity_poll_interval, Duration::from_secs(1));
    assert!(readiness.fail_on_first_boot_error);
    assert_eq!(cfg.channel_settings().connect_attempts, 3);
    assert_eq!(cfg.instance_settings().user, "ubuntu");
    assert_eq!(cfg.ssh_options().known_hosts_file, "/dev/null");
}

#[rstest]
fn identity_file_becomes_a_key_pair(base_config: HarnessConfig) {
    let cfg = HarnessConfig {
        ssh_identity_file: Some(String::from("/keys/id_ed25519")),
        ..base_config
    };
    let key = cfg.key_pair().expect("key configured");
    assert_eq!(key.private_key_path().as_str(), "/keys/id_ed25519");
    assert_eq!(key.public_key_path().as_str(), "/keys/id_ed25519.pub");
}

#[test]
fn environment_overrides_defaults() {
    let _guard = EnvGuard::apply(&[
        ("VIGIL_SSH_USER", Some("cloud")),
        ("VIGIL_CONNECT_ATTEMPTS", Some("7")),
        ("VIGIL_CONFIG_PATH", None),
    ]);

    let cfg = HarnessConfig::load_without_cli_args().expect("config loads");

    assert_eq!(cfg.ssh_user, "cloud");
    assert_eq!(cfg.connect_attempts, 7);
    assert_eq!(cfg.boot_timeout_secs, 2400);
}

#[rstest]
fn scaleway_secret_is_required(scaleway_config: ScalewayConfig) {
    let cfg = ScalewayConfig {
        secret_key: String::new(),
        ..scaleway_config
    };
    let err = cfg.validate().expect_err("secret missing");
    assert!(err.to_string().contains("SCW_SECRET_KEY"));
}

#[rstest]
fn scaleway_defaults_validate(scaleway_config: ScalewayConfig) {
    assert!(scaleway_config.validate().is_ok());
}
