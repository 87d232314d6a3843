//! Test support utilities shared across unit and integration tests.
//!
//! Provides a virtual clock, a scripted local process runner, an in-memory
//! guest reachable through the [`Connector`] seam, and a scripted backend.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::backend::{Backend, InstanceHandle, PendingPolicy, PowerState, RebootRequest};
use crate::channel::{
    CommandOutput, CommandRunner, ConnectError, ConnectFailureKind, Connector, Destination,
    RawOutput, Session, SessionError,
};
use crate::key::KeyPair;
use crate::retry::Clock;
use crate::shell;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Virtual clock: `sleep` advances time instantly and is recorded.
#[derive(Debug)]
pub struct FakeClock {
    origin: Instant,
    state: Mutex<ClockState>,
}

#[derive(Debug, Default)]
struct ClockState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    /// Creates a clock at virtual time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Virtual time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        lock(&self.state).elapsed
    }

    /// Every sleep requested, in order.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.state).sleeps.clone()
    }

    /// Moves virtual time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut state = lock(&self.state);
        state.elapsed = state.elapsed.saturating_add(duration);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.origin + lock(&self.state).elapsed
    }

    fn sleep(&self, duration: Duration) {
        let mut state = lock(&self.state);
        state.elapsed = state.elapsed.saturating_add(duration);
        state.sleeps.push(duration);
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Bytes fed to standard input, if any.
    pub stdin: Option<Vec<u8>>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_exit_code(0);
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(&self, code: Option<i32>, stdout: &str, stderr: &str) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        });
    }

    fn next(
        &self,
        program: &str,
        args: &[OsString],
        stdin: Option<&[u8]>,
    ) -> io::Result<CommandOutput> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            stdin: stdin.map(<[u8]>::to_vec),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| io::Error::other("no scripted response available"))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        stdin: Option<&[u8]>,
    ) -> io::Result<CommandOutput> {
        self.next(program, args, stdin)
    }

    fn run_detached(&self, program: &str, args: &[OsString]) -> io::Result<Option<i32>> {
        self.next(program, args, None).map(|output| output.code)
    }
}

/// In-memory guest that answers the commands the readiness machine and the
/// orchestrator send.
///
/// Clones share state, so a test keeps one handle for assertions while the
/// connector owns another.
#[derive(Clone, Debug, Default)]
pub struct FakeGuest {
    state: Arc<Mutex<GuestState>>,
}

#[derive(Debug)]
struct GuestState {
    refuse_connects: u32,
    refusal: ConnectFailureKind,
    connect_attempts: u32,
    agent: bool,
    generation: u64,
    boot_ids: VecDeque<String>,
    current_boot_id: String,
    boot_id_reads: u32,
    unreachable_boot_id_reads: u32,
    failing_boot_id_reads: u32,
    systemd: bool,
    target_inactive_polls: u32,
    target_polls: u32,
    status_wait: bool,
    status_exit: i32,
    status_hangs: bool,
    fallback_exit: i32,
    lose_next_exec: bool,
    lose_on: Option<(String, u32)>,
    executed: Vec<Vec<String>>,
    files: BTreeMap<String, Vec<u8>>,
    responses: BTreeMap<String, (i32, String)>,
    short_writes: bool,
}

impl Default for GuestState {
    fn default() -> Self {
        Self {
            refuse_connects: 0,
            refusal: ConnectFailureKind::Refused,
            connect_attempts: 0,
            agent: false,
            generation: 0,
            boot_ids: VecDeque::new(),
            current_boot_id: String::from("00000000-0000-4000-8000-000000000001"),
            boot_id_reads: 0,
            unreachable_boot_id_reads: 0,
            failing_boot_id_reads: 0,
            systemd: true,
            target_inactive_polls: 0,
            target_polls: 0,
            status_wait: true,
            status_exit: 0,
            status_hangs: false,
            fallback_exit: 0,
            lose_next_exec: false,
            lose_on: None,
            executed: Vec::new(),
            files: BTreeMap::new(),
            responses: BTreeMap::new(),
            short_writes: false,
        }
    }
}

impl FakeGuest {
    /// Creates a reachable guest with a fixed boot identity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GuestState> {
        lock(&self.state)
    }

    /// Connector reaching this guest.
    #[must_use]
    pub fn connector(&self) -> GuestConnector {
        GuestConnector {
            guest: self.clone(),
        }
    }

    /// Fails the next `count` connection attempts with `kind`.
    #[must_use]
    pub fn refusing(self, count: u32, kind: ConnectFailureKind) -> Self {
        {
            let mut state = self.state();
            state.refuse_connects = count;
            state.refusal = kind;
        }
        self
    }

    /// Reports an SSH agent as available.
    #[must_use]
    pub fn with_agent(self) -> Self {
        self.state().agent = true;
        self
    }

    /// Answers successive boot identity reads with `ids`; the last value
    /// repeats once the script runs out.
    #[must_use]
    pub fn with_boot_ids<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().boot_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Drops the session during the next `count` boot identity reads.
    #[must_use]
    pub fn unreachable_for(self, count: u32) -> Self {
        self.state().unreachable_boot_id_reads = count;
        self
    }

    /// Makes the next `count` boot identity reads exit non-zero.
    #[must_use]
    pub fn boot_id_failing_for(self, count: u32) -> Self {
        self.state().failing_boot_id_reads = count;
        self
    }

    /// Simulates a guest without systemd.
    #[must_use]
    pub fn without_systemd(self) -> Self {
        self.state().systemd = false;
        self
    }

    /// Keeps `cloud-init.target` inactive for `count` polls.
    #[must_use]
    pub fn target_inactive_for(self, count: u32) -> Self {
        self.state().target_inactive_polls = count;
        self
    }

    /// Simulates a cloud-init release without `status --wait`.
    #[must_use]
    pub fn without_status_wait(self) -> Self {
        self.state().status_wait = false;
        self
    }

    /// Exit code of `cloud-init status --wait --long`.
    #[must_use]
    pub fn with_status_exit(self, code: i32) -> Self {
        self.state().status_exit = code;
        self
    }

    /// Makes `cloud-init status --wait` outlive any guest-side time limit.
    #[must_use]
    pub fn with_hung_status_wait(self) -> Self {
        self.state().status_hangs = true;
        self
    }

    /// Drops the session the next `count` times a command containing
    /// `needle` runs.
    #[must_use]
    pub fn losing_session_on(self, needle: &str, count: u32) -> Self {
        self.state().lose_on = Some((needle.to_owned(), count));
        self
    }

    /// Exit code of the fallback completion loop.
    #[must_use]
    pub fn with_fallback_exit(self, code: i32) -> Self {
        self.state().fallback_exit = code;
        self
    }

    /// Makes uploads store one byte fewer than received.
    #[must_use]
    pub fn with_short_writes(self) -> Self {
        self.state().short_writes = true;
        self
    }

    /// Answers a command, matched on its shell-quoted argv, with a fixed
    /// outcome.
    #[must_use]
    pub fn respond(self, argv: &[&str], exit_code: i32, stdout: &str) -> Self {
        self.state()
            .responses
            .insert(shell::shell_quote(argv), (exit_code, stdout.to_owned()));
        self
    }

    /// Places a file on the guest.
    #[must_use]
    pub fn with_file(self, path: &str, contents: &[u8]) -> Self {
        self.state().files.insert(path.to_owned(), contents.to_vec());
        self
    }

    /// Loses the session on the next command.
    pub fn lose_next_exec(&self) {
        self.state().lose_next_exec = true;
    }

    /// Kills every open session without telling the client.
    pub fn drop_sessions(&self) {
        let mut state = self.state();
        state.generation = state.generation.saturating_add(1);
    }

    /// Connection attempts made so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Boot identity reads served so far, failed ones included.
    #[must_use]
    pub fn boot_id_reads(&self) -> u32 {
        self.state().boot_id_reads
    }

    /// Polls of `cloud-init.target` served so far.
    #[must_use]
    pub fn target_polls(&self) -> u32 {
        self.state().target_polls
    }

    /// Every argv executed, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<Vec<String>> {
        self.state().executed.clone()
    }

    /// Returns `true` when any executed argv contains `needle` as an
    /// element.
    #[must_use]
    pub fn ran(&self, needle: &str) -> bool {
        self.state()
            .executed
            .iter()
            .any(|argv| argv.iter().any(|arg| arg.contains(needle)))
    }

    /// Contents of a file on the guest.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    fn run(&self, argv: Vec<String>, stdin: Option<&[u8]>) -> Result<RawOutput, SessionError> {
        let mut state = self.state();
        state.executed.push(argv.clone());
        if std::mem::take(&mut state.lose_next_exec) {
            state.generation = state.generation.saturating_add(1);
            return Err(SessionError::Lost(String::from("connection reset by peer")));
        }
        if state.take_scripted_loss(&argv) {
            state.generation = state.generation.saturating_add(1);
            return Err(SessionError::Lost(String::from("connection reset by peer")));
        }

        let (limited, unprivileged) = strip_time_limit(strip_sudo(&argv));
        let words: Vec<&str> = unprivileged.iter().map(String::as_str).collect();
        if let Some((code, stdout)) = state.responses.get(&shell::shell_quote(&words)) {
            return Ok(raw(*code, stdout));
        }

        match words.as_slice() {
            ["cat", "/proc/sys/kernel/random/boot_id"] => state.read_boot_id(),
            ["sh", "-c", "command -v systemctl"] => {
                Ok(raw(if state.systemd { 0 } else { 1 }, "/usr/bin/systemctl"))
            }
            ["systemctl", "is-active", "cloud-init.target"] => {
                state.target_polls = state.target_polls.saturating_add(1);
                if state.target_polls > state.target_inactive_polls {
                    Ok(raw(0, "active"))
                } else {
                    Ok(raw(3, "inactive"))
                }
            }
            ["cloud-init", "status", "--help"] => Ok(raw(
                0,
                if state.status_wait {
                    "usage: cloud-init status [-h] [--format FORMAT] [--long] [--wait]"
                } else {
                    "usage: cloud-init status [-h] [--long]"
                },
            )),
            ["cloud-init", "status", "--wait", "--long"] if limited && state.status_hangs => {
                Ok(raw(124, "status: running"))
            }
            ["cloud-init", "status", "--wait", "--long"] => {
                Ok(raw(state.status_exit, "status: done"))
            }
            ["sh", "-c", script] if script.contains("is-system-running") => {
                Ok(raw(state.fallback_exit, ""))
            }
            ["shutdown", "-r", "now"] | ["reboot"] => {
                state.generation = state.generation.saturating_add(1);
                Err(SessionError::Lost(String::from("connection closed by remote host")))
            }
            ["sh", "-c", script, _, path] if script.contains("cat >") => {
                let mut bytes = stdin.unwrap_or_default().to_vec();
                if state.short_writes {
                    bytes.pop();
                }
                let written = bytes.len();
                state.files.insert((*path).to_owned(), bytes);
                Ok(raw(0, &written.to_string()))
            }
            ["sh", "-c", script, _, path] if script.contains("base64") => {
                match state.files.get(*path) {
                    Some(bytes) => Ok(raw(0, &STANDARD.encode(bytes))),
                    None => Ok(RawOutput {
                        stdout: Vec::new(),
                        stderr: format!("{path}: No such file or directory").into_bytes(),
                        exit_code: 1,
                    }),
                }
            }
            _ => Ok(raw(0, "")),
        }
    }
}

impl GuestState {
    fn take_scripted_loss(&mut self, argv: &[String]) -> bool {
        let Some((needle, remaining)) = self.lose_on.as_mut() else {
            return false;
        };
        if *remaining == 0 || !argv.iter().any(|arg| arg.contains(needle.as_str())) {
            return false;
        }
        *remaining = remaining.saturating_sub(1);
        true
    }

    fn read_boot_id(&mut self) -> Result<RawOutput, SessionError> {
        self.boot_id_reads = self.boot_id_reads.saturating_add(1);
        if self.unreachable_boot_id_reads > 0 {
            self.unreachable_boot_id_reads = self.unreachable_boot_id_reads.saturating_sub(1);
            self.generation = self.generation.saturating_add(1);
            return Err(SessionError::Lost(String::from("connection reset by peer")));
        }
        if self.failing_boot_id_reads > 0 {
            self.failing_boot_id_reads = self.failing_boot_id_reads.saturating_sub(1);
            return Ok(RawOutput {
                stdout: Vec::new(),
                stderr: b"cat: /proc/sys/kernel/random/boot_id: No such file".to_vec(),
                exit_code: 1,
            });
        }
        if let Some(next) = self.boot_ids.pop_front() {
            self.current_boot_id = next;
        }
        Ok(raw(0, &format!("{}\n", self.current_boot_id)))
    }
}

fn strip_sudo(argv: &[String]) -> Vec<String> {
    match argv {
        [sudo, separator, rest @ ..] if sudo == "sudo" && separator == "--" => rest.to_vec(),
        _ => argv.to_vec(),
    }
}

fn strip_time_limit(argv: Vec<String>) -> (bool, Vec<String>) {
    let limited = matches!(
        argv.as_slice(),
        [timeout, seconds, _, ..] if timeout == "timeout" && seconds.parse::<u64>().is_ok()
    );
    if limited {
        (true, argv.into_iter().skip(2).collect())
    } else {
        (false, argv)
    }
}

fn raw(exit_code: i32, stdout: &str) -> RawOutput {
    RawOutput {
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
        exit_code,
    }
}

/// Connector reaching a [`FakeGuest`].
#[derive(Clone, Debug)]
pub struct GuestConnector {
    guest: FakeGuest,
}

impl Connector for GuestConnector {
    type Session = GuestSession;

    fn connect(
        &self,
        _destination: &Destination,
        _key: Option<&KeyPair>,
    ) -> Result<Self::Session, ConnectError> {
        let mut state = self.guest.state();
        state.connect_attempts = state.connect_attempts.saturating_add(1);
        if state.refuse_connects > 0 {
            state.refuse_connects = state.refuse_connects.saturating_sub(1);
            return Err(ConnectError::new(state.refusal, "scripted refusal"));
        }
        Ok(GuestSession {
            guest: self.guest.clone(),
            generation: state.generation,
            closed: false,
        })
    }

    fn agent_available(&self) -> bool {
        self.guest.state().agent
    }
}

/// Session on a [`FakeGuest`]. Dies when the guest reboots.
#[derive(Debug)]
pub struct GuestSession {
    guest: FakeGuest,
    generation: u64,
    closed: bool,
}

impl Session for GuestSession {
    fn is_active(&mut self) -> bool {
        !self.closed && self.guest.state().generation == self.generation
    }

    fn exec(&mut self, line: &str, stdin: Option<&[u8]>) -> Result<RawOutput, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Lost(String::from("broken pipe")));
        }
        let argv = shell::unpack(line)
            .ok_or_else(|| SessionError::Lost(format!("guest received unpacked line: {line}")))?;
        self.guest.run(argv, stdin)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Error raised by [`ScriptedBackend`] when a failure is injected.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("scripted backend failure during {0}")]
pub struct ScriptedBackendError(pub String);

/// Backend operations recorded by [`ScriptedBackend`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendCall {
    /// `resolve_address`
    ResolveAddress,
    /// `request_start`
    Start,
    /// `request_stop`
    Stop,
    /// `request_reboot`
    Reboot,
    /// `request_delete`
    Delete,
    /// `power_state`
    PowerState,
    /// `is_stopped`
    IsStopped,
    /// `is_deleted`
    IsDeleted,
}

/// Backend double with scripted answers and a call log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<BackendState>>,
}

#[derive(Debug)]
struct BackendState {
    address: String,
    power_states: VecDeque<PowerState>,
    last_power_state: Option<PowerState>,
    stop_pending_polls: u32,
    delete_pending_polls: u32,
    reboot: RebootRequest,
    delete_policy: PendingPolicy,
    failing: BTreeSet<&'static str>,
    calls: Vec<BackendCall>,
    guest: Option<FakeGuest>,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            address: String::from("192.0.2.10"),
            power_states: VecDeque::new(),
            last_power_state: None,
            stop_pending_polls: 0,
            delete_pending_polls: 0,
            reboot: RebootRequest::Issued,
            delete_policy: PendingPolicy::Fail,
            failing: BTreeSet::new(),
            calls: Vec::new(),
            guest: None,
        }
    }
}

impl ScriptedBackend {
    /// Backend with no power-state signal and immediate stop/delete.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        lock(&self.state)
    }

    fn record(&self, call: BackendCall, operation: &'static str) -> Result<(), ScriptedBackendError> {
        let mut state = self.state();
        state.calls.push(call);
        if state.failing.contains(operation) {
            return Err(ScriptedBackendError(operation.to_owned()));
        }
        Ok(())
    }

    /// Address returned by `resolve_address`.
    #[must_use]
    pub fn with_address(self, address: &str) -> Self {
        self.state().address = address.to_owned();
        self
    }

    /// Answers successive power-state probes; the last value repeats.
    #[must_use]
    pub fn with_power_states<I>(self, states: I) -> Self
    where
        I: IntoIterator<Item = PowerState>,
    {
        self.state().power_states = states.into_iter().collect();
        self
    }

    /// Reports the instance as still stopping for `polls` checks.
    #[must_use]
    pub fn stop_pending_for(self, polls: u32) -> Self {
        self.state().stop_pending_polls = polls;
        self
    }

    /// Reports the instance as still present for `polls` checks.
    #[must_use]
    pub fn delete_pending_for(self, polls: u32) -> Self {
        self.state().delete_pending_polls = polls;
        self
    }

    /// How reboot requests are answered.
    #[must_use]
    pub fn with_reboot(self, reboot: RebootRequest) -> Self {
        self.state().reboot = reboot;
        self
    }

    /// Policy for resources still pending after delete.
    #[must_use]
    pub fn with_delete_policy(self, policy: PendingPolicy) -> Self {
        self.state().delete_policy = policy;
        self
    }

    /// Makes `operation` (for example `"request_delete"`) fail.
    #[must_use]
    pub fn failing(self, operation: &'static str) -> Self {
        self.state().failing.insert(operation);
        self
    }

    /// Drops the guest's sessions whenever a reboot is requested.
    #[must_use]
    pub fn rebooting(self, guest: &FakeGuest) -> Self {
        self.state().guest = Some(guest.clone());
        self
    }

    /// Every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Number of calls of one kind.
    #[must_use]
    pub fn count(&self, call: BackendCall) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|recorded| **recorded == call)
            .count()
    }
}

impl Backend for ScriptedBackend {
    type Error = ScriptedBackendError;

    fn resolve_address(&self, _handle: &InstanceHandle) -> Result<String, Self::Error> {
        self.record(BackendCall::ResolveAddress, "resolve_address")?;
        Ok(self.state().address.clone())
    }

    fn request_start(&self, _handle: &InstanceHandle) -> Result<(), Self::Error> {
        self.record(BackendCall::Start, "request_start")
    }

    fn request_stop(&self, _handle: &InstanceHandle) -> Result<(), Self::Error> {
        self.record(BackendCall::Stop, "request_stop")
    }

    fn request_reboot(&self, _handle: &InstanceHandle) -> Result<RebootRequest, Self::Error> {
        self.record(BackendCall::Reboot, "request_reboot")?;
        let state = self.state();
        if let Some(guest) = &state.guest {
            guest.drop_sessions();
        }
        Ok(state.reboot)
    }

    fn request_delete(&self, _handle: &InstanceHandle) -> Result<(), Self::Error> {
        self.record(BackendCall::Delete, "request_delete")
    }

    fn power_state(&self, _handle: &InstanceHandle) -> Result<Option<PowerState>, Self::Error> {
        self.record(BackendCall::PowerState, "power_state")?;
        let mut state = self.state();
        if let Some(next) = state.power_states.pop_front() {
            state.last_power_state = Some(next);
        }
        Ok(state.last_power_state)
    }

    fn is_stopped(&self, _handle: &InstanceHandle) -> Result<bool, Self::Error> {
        self.record(BackendCall::IsStopped, "is_stopped")?;
        let mut state = self.state();
        if state.stop_pending_polls > 0 {
            state.stop_pending_polls = state.stop_pending_polls.saturating_sub(1);
            return Ok(false);
        }
        Ok(true)
    }

    fn is_deleted(&self, _handle: &InstanceHandle) -> Result<bool, Self::Error> {
        self.record(BackendCall::IsDeleted, "is_deleted")?;
        let mut state = self.state();
        if state.delete_pending_polls > 0 {
            state.delete_pending_polls = state.delete_pending_polls.saturating_sub(1);
            return Ok(false);
        }
        Ok(true)
    }

    fn delete_policy(&self) -> PendingPolicy {
        self.state().delete_policy
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets or removes environment variables while holding a global mutex.
    /// `None` removes the variable.
    #[must_use]
    pub fn apply(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::apply"
        );

        let guard = lock(&ENV_LOCK);
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Sets multiple environment variables while holding a global mutex.
    #[must_use]
    pub fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let mapped: Vec<(&str, Option<&str>)> =
            pairs.iter().map(|(key, value)| (*key, Some(*value))).collect();
        Self::apply(&mapped)
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
