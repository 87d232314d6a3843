//! Configuration loading via `ortho-config`.
//!
//! [`HarnessConfig`] carries SSH and timing settings under the `VIGIL_`
//! prefix and is discovered from `vigil.toml`. [`ScalewayConfig`] carries
//! provider credentials under the conventional `SCW_` prefix.

mod scaleway;

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::channel::{ChannelSettings, SshOptions, default_control_dir};
use crate::instance::{InstanceSettings, LifecycleSettings};
use crate::key::KeyPair;
use crate::readiness::ReadinessSettings;

pub use scaleway::ScalewayConfig;

/// Harness settings loaded from defaults, `vigil.toml`, and `VIGIL_*`
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VIGIL",
    discovery(
        app_name = "vigil",
        env_var = "VIGIL_CONFIG_PATH",
        config_file_name = "vigil.toml",
        dotfile_name = ".vigil.toml",
        project_file_name = "vigil.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggle settings that are naturally expressed as booleans"
)]
pub struct HarnessConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "ubuntu".to_owned())]
    pub ssh_user: String,
    /// SSH port on the guest.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Private key used for authentication. Supports tilde expansion. When
    /// unset the SSH client falls back to its default keys and agent.
    pub ssh_identity_file: Option<String>,
    /// Whether to enforce host key checking; disabled by default for
    /// ephemeral hosts.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null` for ephemeral hosts.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Per-attempt TCP connect timeout in seconds.
    #[ortho_config(default = 60)]
    pub connect_timeout_secs: u64,
    /// Connection attempts before a guest is declared unreachable.
    #[ortho_config(default = 30)]
    pub connect_attempts: u32,
    /// Pause between connection attempts in seconds.
    #[ortho_config(default = 10)]
    pub connect_retry_interval_secs: u64,
    /// Budget for a fresh boot in seconds.
    #[ortho_config(default = 2400)]
    pub boot_timeout_secs: u64,
    /// Budget for a restart in seconds.
    #[ortho_config(default = 900)]
    pub restart_timeout_secs: u64,
    /// Budget for the provider to report the instance running, in seconds.
    #[ortho_config(default = 1200)]
    pub power_state_timeout_secs: u64,
    /// Pause between power-state probes in seconds.
    #[ortho_config(default = 5)]
    pub power_state_poll_interval_secs: u64,
    /// Maximum polls of `cloud-init.target`.
    #[ortho_config(default = 300)]
    pub first_boot_target_attempts: u32,
    /// Budget for a stop to take effect, in seconds.
    #[ortho_config(default = 600)]
    pub stop_timeout_secs: u64,
    /// Budget for a delete to take effect, in seconds.
    #[ortho_config(default = 600)]
    pub delete_timeout_secs: u64,
    /// Pause between stop/delete checks in seconds.
    #[ortho_config(default = 5)]
    pub teardown_poll_interval_secs: u64,
    /// Whether a failed first-boot agent fails the wait.
    #[ortho_config(default = false)]
    pub fail_on_first_boot_error: bool,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata, file: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {}",
            metadata.description, metadata.env_var, metadata.toml_key, file
        )));
    }
    Ok(())
}

fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!(
            "{} must be greater than zero (check {} / {})",
            metadata.description, metadata.env_var, metadata.toml_key
        )));
    }
    Ok(())
}

impl HarnessConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("vigil")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and file key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for empty strings and
    /// [`ConfigError::Invalid`] for zero budgets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.ssh_bin,
            &FieldMetadata::new("SSH executable", "VIGIL_SSH_BIN", "ssh_bin"),
            "vigil.toml",
        )?;
        require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH user", "VIGIL_SSH_USER", "ssh_user"),
            "vigil.toml",
        )?;
        if let Some(identity) = &self.ssh_identity_file {
            require_field(
                identity,
                &FieldMetadata::new(
                    "SSH identity file",
                    "VIGIL_SSH_IDENTITY_FILE",
                    "ssh_identity_file",
                ),
                "vigil.toml",
            )?;
        }
        require_positive(
            u64::from(self.connect_attempts),
            &FieldMetadata::new("connect attempts", "VIGIL_CONNECT_ATTEMPTS", "connect_attempts"),
        )?;
        require_positive(
            self.boot_timeout_secs,
            &FieldMetadata::new("boot timeout", "VIGIL_BOOT_TIMEOUT_SECS", "boot_timeout_secs"),
        )?;
        require_positive(
            self.restart_timeout_secs,
            &FieldMetadata::new(
                "restart timeout",
                "VIGIL_RESTART_TIMEOUT_SECS",
                "restart_timeout_secs",
            ),
        )?;
        require_positive(
            u64::from(self.first_boot_target_attempts),
            &FieldMetadata::new(
                "first-boot target attempts",
                "VIGIL_FIRST_BOOT_TARGET_ATTEMPTS",
                "first_boot_target_attempts",
            ),
        )?;
        Ok(())
    }

    /// SSH client options.
    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            control_dir: default_control_dir(),
        }
    }

    /// Connection retry settings.
    #[must_use]
    pub const fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            connect_attempts: self.connect_attempts,
            connect_interval: Duration::from_secs(self.connect_retry_interval_secs),
        }
    }

    /// Readiness budgets.
    #[must_use]
    pub fn readiness_settings(&self) -> ReadinessSettings {
        ReadinessSettings {
            boot_timeout: Duration::from_secs(self.boot_timeout_secs),
            restart_timeout: Duration::from_secs(self.restart_timeout_secs),
            power_timeout: Duration::from_secs(self.power_state_timeout_secs),
            power_poll_interval: Duration::from_secs(self.power_state_poll_interval_secs),
            first_boot_target_attempts: self.first_boot_target_attempts,
            fail_on_first_boot_error: self.fail_on_first_boot_error,
            ..ReadinessSettings::default()
        }
    }

    /// Stop and delete budgets.
    #[must_use]
    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            delete_timeout: Duration::from_secs(self.delete_timeout_secs),
            poll_interval: Duration::from_secs(self.teardown_poll_interval_secs),
            ..LifecycleSettings::default()
        }
    }

    /// Settings for an [`Instance`](crate::instance::Instance).
    #[must_use]
    pub fn instance_settings(&self) -> InstanceSettings {
        InstanceSettings {
            user: self.ssh_user.clone(),
            channel: self.channel_settings(),
            readiness: self.readiness_settings(),
            lifecycle: self.lifecycle_settings(),
        }
    }

    /// Credential built from `ssh_identity_file`, if configured.
    #[must_use]
    pub fn key_pair(&self) -> Option<Arc<KeyPair>> {
        self.ssh_identity_file
            .as_deref()
            .map(|path| Arc::new(KeyPair::from_private_key(path)))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests;
