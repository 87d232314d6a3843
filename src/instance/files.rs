//! Guest file transfer and housekeeping helpers.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8Path;
use tracing::debug;

use crate::backend::Backend;
use crate::channel::Connector;
use crate::fs;
use crate::outcome::CommandOutcome;
use crate::shell::RemoteCommand;

use super::{Instance, InstanceError, Outcome};

/// `$0` for helper scripts run through `sh -c`.
const SCRIPT_NAME: &str = "vigil";
const WRITE_FILE: &str = "cat >\"$1\" && wc -c <\"$1\"";
const READ_FILE: &str = "base64 <\"$1\"";
const RUN_SCRIPT: &str =
    "set -e; s=\"$1\"; shift; cat >\"$s\"; trap 'rm -f \"$s\"' EXIT; chmod +x \"$s\"; \"$s\" \"$@\"";

impl<B: Backend, C: Connector> Instance<B, C> {
    fn next_tmpfile(&mut self) -> String {
        let path = format!("/tmp/vigil-{:04}", self.tmp_count);
        self.tmp_count = self.tmp_count.saturating_add(1);
        path
    }

    /// Uploads `script` to a temporary path, runs it, and removes it.
    ///
    /// # Errors
    ///
    /// Returns an error when the guest cannot be reached. The script's own
    /// exit status is returned as data.
    pub fn run_script(&mut self, script: &str) -> Outcome<CommandOutcome, B> {
        let path = self.next_tmpfile();
        debug!(%path, "running script");
        self.execute(
            ["sh", "-c", RUN_SCRIPT, SCRIPT_NAME, path.as_str()],
            Some(script.as_bytes()),
        )
    }

    /// Copies a local file to `remote` and checks the byte count written.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Transfer`] when the local file cannot be
    /// read, the write fails, or the remote size differs.
    pub fn push_file(&mut self, local: &Utf8Path, remote: &str) -> Outcome<(), B> {
        let contents = fs::read(local)
            .map_err(|err| InstanceError::transfer(local.as_str(), err.to_string()))?;
        let outcome = self.execute(
            ["sh", "-c", WRITE_FILE, SCRIPT_NAME, remote],
            Some(contents.as_slice()),
        )?;
        if outcome.failed() {
            return Err(InstanceError::transfer(remote, outcome.to_string()));
        }
        let written: Option<usize> = outcome.stdout.trim().parse().ok();
        if written != Some(contents.len()) {
            return Err(InstanceError::transfer(
                remote,
                format!(
                    "wrote {} bytes, expected {}",
                    outcome.stdout.trim(),
                    contents.len()
                ),
            ));
        }
        debug!(%local, remote, bytes = contents.len(), "pushed file");
        Ok(())
    }

    /// Copies `remote` from the guest to a local file.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Transfer`] when the read fails, the data
    /// cannot be decoded, or the local write fails.
    pub fn pull_file(&mut self, remote: &str, local: &Utf8Path) -> Outcome<(), B> {
        let outcome = self.execute(["sh", "-c", READ_FILE, SCRIPT_NAME, remote], None)?;
        if outcome.failed() {
            return Err(InstanceError::transfer(remote, outcome.to_string()));
        }
        let encoded: String = outcome.stdout.split_whitespace().collect();
        let contents = STANDARD
            .decode(encoded)
            .map_err(|err| InstanceError::transfer(remote, err.to_string()))?;
        fs::write(local, &contents)
            .map_err(|err| InstanceError::transfer(local.as_str(), err.to_string()))?;
        debug!(remote, %local, bytes = contents.len(), "pulled file");
        Ok(())
    }

    /// Removes cloud-init state and logs so the next boot looks like a
    /// first boot.
    ///
    /// # Errors
    ///
    /// Returns an error when the guest cannot be reached.
    pub fn clean(&mut self) -> Outcome<CommandOutcome, B> {
        let outcome = self.execute(
            RemoteCommand::from(["cloud-init", "clean", "--logs"]).sudo(),
            None,
        )?;
        if outcome.failed() {
            return Ok(outcome);
        }
        self.execute(
            RemoteCommand::from(["rm", "-f", "/var/log/syslog"]).sudo(),
            None,
        )
    }

    /// Installs packages with apt-get after refreshing the index.
    ///
    /// # Errors
    ///
    /// Returns an error when the guest cannot be reached.
    pub fn install(&mut self, packages: &[&str]) -> Outcome<CommandOutcome, B> {
        let refreshed = self.apt(&["update"])?;
        if refreshed.failed() {
            return Ok(refreshed);
        }
        let mut args = vec!["install", "--yes"];
        args.extend_from_slice(packages);
        self.apt(&args)
    }

    /// Refreshes the package index and upgrades every package.
    ///
    /// # Errors
    ///
    /// Returns an error when the guest cannot be reached.
    pub fn update(&mut self) -> Outcome<CommandOutcome, B> {
        let refreshed = self.apt(&["update"])?;
        if refreshed.failed() {
            return Ok(refreshed);
        }
        self.apt(&["--yes", "upgrade"])
    }

    fn apt(&mut self, args: &[&str]) -> Outcome<CommandOutcome, B> {
        let mut argv = vec!["env", "DEBIAN_FRONTEND=noninteractive", "apt-get"];
        argv.extend_from_slice(args);
        self.execute(RemoteCommand::from(argv.as_slice()).sudo(), None)
    }
}
