//! Session transport backed by the system `ssh` client.
//!
//! Each session is an OpenSSH control master running in the background.
//! Commands are multiplexed over its control socket, so authentication
//! happens once per session and a dead master is detected with `-O check`.

use std::ffi::OsString;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::fs;
use crate::key::KeyPair;

use super::error::{ConnectError, ConnectFailureKind, SessionError};
use super::process::{CommandRunner, ProcessCommandRunner};
use super::session::{Connector, Destination, RawOutput, Session};

/// Exit status `ssh` uses for its own failures.
const SSH_ERROR_STATUS: i32 = 255;

/// Options passed to every `ssh` invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Per-attempt TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whether unknown host keys are rejected.
    pub strict_host_key_checking: bool,
    /// Known hosts file; empty leaves the client default in place.
    pub known_hosts_file: String,
    /// Directory holding control sockets and client logs.
    pub control_dir: Utf8PathBuf,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            connect_timeout: Duration::from_secs(60),
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            control_dir: default_control_dir(),
        }
    }
}

/// Temporary directory for control sockets.
#[must_use]
pub fn default_control_dir() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(std::env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

impl SshOptions {
    fn common_args(&self, destination: &Destination, key: Option<&Utf8Path>) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            )),
        ];

        if !self.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.known_hosts_file
            )));
        }

        if let Some(path) = key {
            args.push(OsString::from("-i"));
            args.push(OsString::from(path.as_str()));
        }

        args.push(OsString::from("-p"));
        args.push(OsString::from(destination.port.to_string()));
        args
    }
}

/// Connector that starts an OpenSSH control master per session.
#[derive(Clone, Debug, Default)]
pub struct OpenSshConnector<R: CommandRunner + Clone = ProcessCommandRunner> {
    options: SshOptions,
    runner: R,
}

impl OpenSshConnector<ProcessCommandRunner> {
    /// Connector using the real process runner.
    #[must_use]
    pub const fn new(options: SshOptions) -> Self {
        Self::with_runner(options, ProcessCommandRunner)
    }
}

impl<R: CommandRunner + Clone> OpenSshConnector<R> {
    /// Connector driven by a custom runner.
    #[must_use]
    pub const fn with_runner(options: SshOptions, runner: R) -> Self {
        Self { options, runner }
    }

    /// Options applied to every invocation.
    #[must_use]
    pub const fn options(&self) -> &SshOptions {
        &self.options
    }

    fn master_args(
        &self,
        destination: &Destination,
        key: Option<&Utf8Path>,
        control_path: &Utf8Path,
        log_path: &Utf8Path,
    ) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-o"),
            OsString::from("ControlMaster=yes"),
            OsString::from("-o"),
            OsString::from(format!("ControlPath={control_path}")),
            OsString::from("-o"),
            OsString::from("ControlPersist=yes"),
        ];
        args.extend(self.options.common_args(destination, key));
        args.extend([
            OsString::from("-N"),
            OsString::from("-f"),
            OsString::from("-E"),
            OsString::from(log_path.as_str()),
            OsString::from(destination.login()),
        ]);
        args
    }
}

impl<R: CommandRunner + Clone> Connector for OpenSshConnector<R> {
    type Session = OpenSshSession<R>;

    fn connect(
        &self,
        destination: &Destination,
        key: Option<&KeyPair>,
    ) -> Result<Self::Session, ConnectError> {
        let token = Uuid::new_v4().simple().to_string();
        let control_path = self.options.control_dir.join(format!("vigil-{token}.sock"));
        let log_path = self.options.control_dir.join(format!("vigil-{token}.log"));
        let key_path = key.map(KeyPair::private_key_path);
        let args = self.master_args(destination, key_path, &control_path, &log_path);

        let code = self
            .runner
            .run_detached(&self.options.ssh_bin, &args)
            .map_err(|err| ConnectError::new(ConnectFailureKind::Launch, err.to_string()))?;
        let log = fs::read_to_string(&log_path).unwrap_or_default();
        fs::remove_file(&log_path).ok();

        if code == Some(0) {
            debug!(%destination, %control_path, "control master established");
            return Ok(OpenSshSession {
                options: self.options.clone(),
                runner: self.runner.clone(),
                destination: destination.clone(),
                key_path: key_path.map(Utf8Path::to_path_buf),
                control_path,
                closed: false,
            });
        }

        let message = match log.trim() {
            "" => format!("ssh exited with status {code:?}"),
            text => text.to_owned(),
        };
        Err(ConnectError::new(classify_connect_failure(&message), message))
    }

    fn agent_available(&self) -> bool {
        std::env::var_os("SSH_AUTH_SOCK").is_some_and(|value| !value.is_empty())
    }
}

/// Maps SSH client diagnostics to a failure kind.
#[must_use]
pub fn classify_connect_failure(message: &str) -> ConnectFailureKind {
    const PATTERNS: &[(&str, ConnectFailureKind)] = &[
        ("Connection refused", ConnectFailureKind::Refused),
        ("Connection reset", ConnectFailureKind::Reset),
        ("kex_exchange_identification", ConnectFailureKind::Reset),
        ("Connection closed", ConnectFailureKind::Reset),
        ("Host key verification failed", ConnectFailureKind::HostKey),
        (
            "REMOTE HOST IDENTIFICATION HAS CHANGED",
            ConnectFailureKind::HostKey,
        ),
        ("Permission denied", ConnectFailureKind::Authentication),
        (
            "Too many authentication failures",
            ConnectFailureKind::Authentication,
        ),
        ("timed out", ConnectFailureKind::Timeout),
    ];

    PATTERNS
        .iter()
        .find(|(needle, _)| message.contains(needle))
        .map_or(ConnectFailureKind::Network, |(_, kind)| *kind)
}

/// A live control master.
#[derive(Debug)]
pub struct OpenSshSession<R: CommandRunner + Clone = ProcessCommandRunner> {
    options: SshOptions,
    runner: R,
    destination: Destination,
    key_path: Option<Utf8PathBuf>,
    control_path: Utf8PathBuf,
    closed: bool,
}

impl<R: CommandRunner + Clone> OpenSshSession<R> {
    /// Control socket path of this session.
    #[must_use]
    pub fn control_path(&self) -> &Utf8Path {
        &self.control_path
    }

    fn control_args(&self, operation: &str) -> Vec<OsString> {
        vec![
            OsString::from("-o"),
            OsString::from(format!("ControlPath={}", self.control_path)),
            OsString::from("-O"),
            OsString::from(operation),
            OsString::from("-p"),
            OsString::from(self.destination.port.to_string()),
            OsString::from(self.destination.login()),
        ]
    }

    fn exec_args(&self, line: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-o"),
            OsString::from(format!("ControlPath={}", self.control_path)),
            OsString::from("-o"),
            OsString::from("ControlMaster=no"),
            OsString::from("-T"),
        ];
        args.extend(
            self.options
                .common_args(&self.destination, self.key_path.as_deref()),
        );
        args.push(OsString::from(self.destination.login()));
        args.push(OsString::from(line));
        args
    }
}

impl<R: CommandRunner + Clone> Session for OpenSshSession<R> {
    fn is_active(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.runner
            .run(&self.options.ssh_bin, &self.control_args("check"), None)
            .is_ok_and(|output| output.is_success())
    }

    fn exec(&mut self, line: &str, stdin: Option<&[u8]>) -> Result<RawOutput, SessionError> {
        if self.closed {
            return Err(SessionError::Lost(String::from("session already closed")));
        }
        let output = self
            .runner
            .run(&self.options.ssh_bin, &self.exec_args(line), stdin)
            .map_err(|err| SessionError::Launch(err.to_string()))?;

        let stderr_text = || String::from_utf8_lossy(&output.stderr).trim().to_owned();
        let Some(exit_code) = output.code else {
            return Err(SessionError::Lost(format!(
                "ssh terminated by signal: {}",
                stderr_text()
            )));
        };
        if exit_code == SSH_ERROR_STATUS && !self.is_active() {
            return Err(SessionError::Lost(stderr_text()));
        }

        Ok(RawOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let exited = self
            .runner
            .run(&self.options.ssh_bin, &self.control_args("exit"), None)
            .is_ok_and(|output| output.is_success());
        debug!(destination = %self.destination, exited, "control master closed");
    }
}

impl<R: CommandRunner + Clone> Drop for OpenSshSession<R> {
    fn drop(&mut self) {
        self.close();
    }
}
