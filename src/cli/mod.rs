//! Command-line interface definitions for the `vigil` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `vigil` binary.
#[derive(Debug, Parser)]
#[command(
    name = "vigil",
    about = "Run commands on cloud-init test instances and wait for them to be ready",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run a command on a reachable host and exit with its status.
    #[command(name = "exec", about = "Run a command on a host over SSH")]
    Exec(ExecCommand),
    /// Print the host's kernel boot identity.
    #[command(name = "boot-id", about = "Print the host's kernel boot identity")]
    BootId(HostArgs),
    /// Wait until the host is reachable and first boot has finished.
    #[command(
        name = "wait",
        about = "Wait for SSH and cloud-init to finish on a host"
    )]
    Wait(HostArgs),
    /// Reboot the host from inside the guest and wait for the new boot.
    #[command(name = "reboot", about = "Reboot a host and wait for the new boot")]
    Reboot(RebootCommand),
    /// Launch a Scaleway server, wait for it, and optionally run a command.
    #[command(
        name = "launch",
        about = "Launch a Scaleway server, wait for first boot, and run a command"
    )]
    Launch(LaunchCommand),
}

/// Connection arguments shared by the static host subcommands.
#[derive(Debug, Args)]
pub(crate) struct HostArgs {
    /// Address or hostname of the guest.
    #[arg(long, value_name = "HOST")]
    pub(crate) host: String,
    /// SSH port; defaults to `ssh_port` from configuration.
    #[arg(long, value_name = "PORT")]
    pub(crate) port: Option<u16>,
    /// Remote user; defaults to `ssh_user` from configuration.
    #[arg(long, value_name = "USER")]
    pub(crate) user: Option<String>,
    /// Private key to authenticate with; defaults to `ssh_identity_file`.
    #[arg(long, value_name = "PATH")]
    pub(crate) key: Option<String>,
}

/// Arguments for `vigil exec`.
#[derive(Debug, Parser)]
pub(crate) struct ExecCommand {
    #[command(flatten)]
    pub(crate) host: HostArgs,
    /// Run the command through `sudo`.
    #[arg(long)]
    pub(crate) sudo: bool,
    /// Command to execute on the remote host (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `vigil reboot`.
#[derive(Debug, Parser)]
pub(crate) struct RebootCommand {
    #[command(flatten)]
    pub(crate) host: HostArgs,
    /// Return once the reboot is issued instead of waiting for the new boot.
    #[arg(long)]
    pub(crate) no_wait: bool,
}

/// Arguments for `vigil launch`.
#[derive(Debug, Parser)]
pub(crate) struct LaunchCommand {
    /// Image identifier; defaults to `SCW_DEFAULT_IMAGE_ID`.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Override the Scaleway instance type (commercial type).
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Override the availability zone.
    #[arg(long, value_name = "ZONE")]
    pub(crate) zone: Option<String>,
    /// Provide cloud-init user-data inline (cloud-config YAML or script).
    #[arg(long, value_name = "USER_DATA", conflicts_with = "user_data_file")]
    pub(crate) user_data: Option<String>,
    /// Provide cloud-init user-data from a local file.
    #[arg(long, value_name = "PATH", conflicts_with = "user_data")]
    pub(crate) user_data_file: Option<String>,
    /// Keep the server instead of deleting it afterwards.
    #[arg(long)]
    pub(crate) keep: bool,
    /// Optional command to run once the server is ready.
    #[arg(trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}
