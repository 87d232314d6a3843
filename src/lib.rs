//! Core library for the Vigil remote execution and readiness engine.
//!
//! The crate drives short-lived test instances through one lifecycle:
//! execute commands over a lazily opened SSH session, detect reboots through
//! the kernel boot identity, and wait in bounded phases until the provider
//! reports the instance running, the shell answers with a fresh boot, and
//! cloud-init has finished. Providers plug in through the [`Backend`] trait;
//! a static host and a Scaleway implementation are included.

pub mod backend;
pub mod channel;
pub mod config;
pub mod fs;
pub mod instance;
pub mod key;
pub mod outcome;
pub mod readiness;
pub mod retry;
pub mod scaleway;
pub mod shell;
pub mod static_host;
pub mod test_support;

pub use backend::{Backend, InstanceHandle, PendingPolicy, PowerState, RebootRequest};
pub use channel::{
    ChannelError, ChannelSettings, Connector, Destination, ExecutionChannel, OpenSshConnector,
    Session, SshOptions,
};
pub use config::{ConfigError, HarnessConfig, ScalewayConfig};
pub use instance::{Instance, InstanceError, InstanceSettings, LifecycleSettings};
pub use key::{KeyError, KeyPair};
pub use outcome::{CommandFailed, CommandOutcome};
pub use readiness::{
    BootId, BootIdError, BootKind, ReadinessError, ReadinessMachine, ReadinessPhase,
    ReadinessReport, ReadinessSettings,
};
pub use retry::{Backoff, Clock, PollError, PollPolicy, RetryError, SystemClock};
pub use scaleway::{LaunchRequest, ScalewayBackend, ScalewayBackendError};
pub use shell::RemoteCommand;
pub use static_host::{StaticHost, StaticHostError};
