//! Binary entry point for the `vigil` CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8Path;
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::{Cli, ExecCommand, HostArgs, LaunchCommand, RebootCommand};
use vigil::{
    Backend, CommandOutcome, HarnessConfig, Instance, KeyPair, LaunchRequest,
    OpenSshConnector, ReadinessReport, RemoteCommand, ScalewayBackend, ScalewayConfig, StaticHost,
    SystemClock,
};

const LOG_ENV: &str = "VIGIL_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("{0}")]
    Instance(String),
    #[error("failed to read user-data from {path}: {message}")]
    UserData { path: String, message: String },
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[derive(Debug, Serialize)]
struct CommandSummary {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl From<CommandOutcome> for CommandSummary {
    fn from(outcome: CommandOutcome) -> Self {
        Self {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        }
    }
}

#[derive(Debug, Serialize)]
struct LaunchSummary {
    id: String,
    address: String,
    zone: Option<String>,
    boot_id: String,
    identity_polls: u32,
    first_boot: CommandSummary,
    command: Option<CommandSummary>,
    deleted: bool,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Exec(command) => exec_command(command),
        Cli::BootId(host) => boot_id_command(&host),
        Cli::Wait(host) => wait_command(&host),
        Cli::Reboot(command) => reboot_command(&command),
        Cli::Launch(command) => launch_command(command),
    }
}

fn load_harness() -> Result<HarnessConfig, CliError> {
    let config =
        HarnessConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(config)
}

fn static_instance(args: &HostArgs) -> Result<Instance<StaticHost, OpenSshConnector>, CliError> {
    let config = load_harness()?;
    let mut settings = config.instance_settings();
    if let Some(user) = &args.user {
        settings.user.clone_from(user);
    }
    let key = args
        .key
        .as_deref()
        .map(|path| Arc::new(KeyPair::from_private_key(path)))
        .or_else(|| config.key_pair());
    let handle = StaticHost::handle(&args.host, args.port.unwrap_or(config.ssh_port));
    Ok(Instance::new(
        StaticHost,
        handle,
        OpenSshConnector::new(config.ssh_options()),
        key,
        settings,
        Arc::new(SystemClock),
    ))
}

fn instance_error(err: impl std::error::Error) -> CliError {
    CliError::Instance(err.to_string())
}

fn exec_command(args: ExecCommand) -> Result<i32, CliError> {
    let mut instance = static_instance(&args.host)?;
    let packed = RemoteCommand::from(args.command);
    let command = if args.sudo { packed.sudo() } else { packed };
    let outcome = instance.execute(command, None).map_err(instance_error)?;
    write_outcome(&outcome)?;
    Ok(outcome.exit_code)
}

fn boot_id_command(args: &HostArgs) -> Result<i32, CliError> {
    let mut instance = static_instance(args)?;
    let id = instance.get_boot_id().map_err(instance_error)?;
    writeln!(io::stdout(), "{id}")?;
    Ok(0)
}

fn wait_command(args: &HostArgs) -> Result<i32, CliError> {
    let mut instance = static_instance(args)?;
    let report = instance.wait().map_err(instance_error)?;
    write_report(&report)?;
    Ok(report.first_boot.exit_code)
}

fn reboot_command(args: &RebootCommand) -> Result<i32, CliError> {
    let mut instance = static_instance(&args.host)?;
    if let Some(report) = instance.restart(!args.no_wait).map_err(instance_error)? {
        write_report(&report)?;
    }
    Ok(0)
}

fn launch_command(args: LaunchCommand) -> Result<i32, CliError> {
    let harness = load_harness()?;
    let scaleway =
        ScalewayConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let backend = ScalewayBackend::new(scaleway)
        .map_err(|err| CliError::Backend(err.to_string()))?
        .with_ssh_port(harness.ssh_port);
    let request = launch_request(&backend, &args)?;
    let handle = backend
        .launch(&request)
        .map_err(|err| CliError::Backend(err.to_string()))?;
    info!(instance = %handle, "server launched");

    let mut instance = Instance::new(
        backend,
        handle,
        OpenSshConnector::new(harness.ssh_options()),
        harness.key_pair(),
        harness.instance_settings(),
        Arc::new(SystemClock),
    );
    let result = drive_launched(&mut instance, args.command);

    let deleted = if args.keep {
        info!(instance = %instance.handle(), "keeping server");
        false
    } else {
        match instance.delete(true) {
            Ok(()) => true,
            Err(err) => {
                error!(instance = %instance.handle(), error = %err, "failed to delete server");
                false
            }
        }
    };

    let (report, command) = result?;
    let exit_code = command.as_ref().map_or(0, |outcome| outcome.exit_code);
    let summary = LaunchSummary {
        id: instance.handle().id.clone(),
        address: instance.handle().address.clone(),
        zone: instance.handle().zone.clone(),
        boot_id: report.boot_id.to_string(),
        identity_polls: report.identity_polls,
        first_boot: report.first_boot.into(),
        command: command.map(CommandSummary::from),
        deleted,
    };
    let rendered = serde_json::to_string_pretty(&summary)
        .map_err(|err| CliError::Output(io::Error::other(err)))?;
    writeln!(io::stdout(), "{rendered}")?;
    Ok(exit_code)
}

fn launch_request(
    backend: &ScalewayBackend,
    args: &LaunchCommand,
) -> Result<LaunchRequest, CliError> {
    let mut request = LaunchRequest::from_config(backend.config());
    if let Some(image) = &args.image {
        request.image_id.clone_from(image);
    }
    if let Some(instance_type) = &args.instance_type {
        request.instance_type.clone_from(instance_type);
    }
    if let Some(zone) = &args.zone {
        request.zone.clone_from(zone);
    }
    request.user_data = match (&args.user_data, &args.user_data_file) {
        (Some(inline), _) => Some(inline.clone()),
        (None, Some(path)) => Some(read_user_data(path)?),
        (None, None) => None,
    };
    Ok(request)
}

fn read_user_data(path: &str) -> Result<String, CliError> {
    let expanded = vigil::fs::expand_tilde(path);
    vigil::fs::read_to_string(Utf8Path::new(&expanded)).map_err(|err| CliError::UserData {
        path: expanded.clone(),
        message: err.to_string(),
    })
}

fn drive_launched<B: Backend>(
    instance: &mut Instance<B, OpenSshConnector>,
    command: Vec<String>,
) -> Result<(ReadinessReport, Option<CommandOutcome>), CliError> {
    let report = instance.wait().map_err(instance_error)?;
    if command.is_empty() {
        return Ok((report, None));
    }
    let outcome = instance
        .execute(RemoteCommand::from(command), None)
        .map_err(instance_error)?;
    Ok((report, Some(outcome)))
}

fn write_outcome(outcome: &CommandOutcome) -> io::Result<()> {
    if !outcome.stdout.is_empty() {
        writeln!(io::stdout(), "{}", outcome.stdout)?;
    }
    if !outcome.stderr.is_empty() {
        writeln!(io::stderr(), "{}", outcome.stderr)?;
    }
    Ok(())
}

fn write_report(report: &ReadinessReport) -> io::Result<()> {
    writeln!(
        io::stdout(),
        "ready boot_id={} identity_polls={} first_boot_exit={}",
        report.boot_id,
        report.identity_polls,
        report.first_boot.exit_code
    )
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
