//! Scaleway backend.
//!
//! Wraps the Scaleway Instances API behind the blocking [`Backend`] trait.
//! The backend owns a current-thread `tokio` runtime and blocks on each
//! request; control-plane calls are retried with jittered exponential
//! backoff when the provider reports a transient failure.

mod create;
mod error;
mod types;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use scaleway_rs::ScalewayApi;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, InstanceHandle, PowerState, RebootRequest};
use crate::config::ScalewayConfig;
use crate::retry::{Backoff, Clock, PollError, PollPolicy, RetryError, SystemClock, poll_until};
use types::{InstanceSnapshot, Zone};

pub use error::{ScalewayBackendError, ScalewayFailureKind};

const DEFAULT_SSH_PORT: u16 = 22;
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Parameters for a new server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Image identifier. Catalog search is out of scope, so this must be an
    /// explicit id.
    pub image_id: String,
    /// Commercial type, for example `DEV1-S`.
    pub instance_type: String,
    /// Availability zone.
    pub zone: String,
    /// Project used for billing.
    pub project_id: String,
    /// Optional organisation scope.
    pub organization_id: Option<String>,
    /// Cloud-init user-data consumed on first boot.
    pub user_data: Option<String>,
}

impl LaunchRequest {
    /// Builds a request from configured defaults.
    #[must_use]
    pub fn from_config(config: &ScalewayConfig) -> Self {
        Self {
            image_id: config.default_image_id.clone(),
            instance_type: config.default_instance_type.clone(),
            zone: config.default_zone.clone(),
            project_id: config.default_project_id.clone(),
            organization_id: config.default_organization_id.clone(),
            user_data: None,
        }
    }

    /// Checks that every required field is present.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Validation`] naming the first empty
    /// field.
    pub fn validate(&self) -> Result<(), ScalewayBackendError> {
        for (field, value) in [
            ("image_id", &self.image_id),
            ("instance_type", &self.instance_type),
            ("zone", &self.zone),
            ("project_id", &self.project_id),
        ] {
            if value.trim().is_empty() {
                return Err(ScalewayBackendError::Validation(field.to_owned()));
            }
        }
        Ok(())
    }
}

/// Backend that drives servers through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayBackend {
    api: ScalewayApi,
    config: ScalewayConfig,
    runtime: Arc<Runtime>,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    ssh_port: u16,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl fmt::Debug for ScalewayBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalewayBackend")
            .field("zone", &self.config.default_zone)
            .field("project", &self.config.default_project_id)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl ScalewayBackend {
    /// Constructs a new backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when the configuration fails
    /// validation and [`ScalewayBackendError::Runtime`] when the runtime
    /// cannot be built.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayBackendError> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ScalewayBackendError::Runtime(err.to_string()))?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            runtime: Arc::new(runtime),
            clock: Arc::new(SystemClock),
            backoff: Backoff::exponential(4, Duration::from_secs(2))
                .with_max_time(Duration::from_secs(120)),
            ssh_port: DEFAULT_SSH_PORT,
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        })
    }

    /// Sets the SSH port recorded on launched handles.
    #[must_use]
    pub const fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Replaces the clock used for retries and waits.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Configuration this backend was built from.
    #[must_use]
    pub const fn config(&self) -> &ScalewayConfig {
        &self.config
    }

    /// Creates a server, powers it on, and waits for a public address.
    ///
    /// A server that was created but never came up is destroyed before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError`] when the request is invalid, the
    /// provider rejects it, or no public IP appears in time.
    pub fn launch(&self, request: &LaunchRequest) -> Result<InstanceHandle, ScalewayBackendError> {
        request.validate()?;
        let snapshot = self
            .runtime
            .block_on(self.create_instance_stopped(request))?;
        info!(id = %snapshot.id.as_str(), zone = %request.zone, "server created");

        let zone = Zone::from(request.zone.as_str());
        let handle = InstanceHandle::new(snapshot.id.as_str(), "")
            .in_zone(request.zone.as_str())
            .with_ssh_port(self.ssh_port);
        let address = bring_up_or_destroy(
            &handle.id,
            || {
                self.power_on_if_needed(&zone, &snapshot)?;
                self.wait_for_public_ip(&handle)
            },
            || self.request_delete(&handle),
        )?;
        Ok(InstanceHandle { address, ..handle })
    }

    fn zone(&self, handle: &InstanceHandle) -> Zone {
        Zone::from(
            handle
                .zone
                .as_deref()
                .unwrap_or(self.config.default_zone.as_str()),
        )
    }

    fn call<T, F>(&self, operation: &str, mut op: F) -> Result<T, ScalewayBackendError>
    where
        F: FnMut() -> Result<T, ScalewayBackendError>,
    {
        debug!(operation, "scaleway request");
        self.backoff
            .retry_on(
                self.clock.as_ref(),
                &[ScalewayFailureKind::Transient],
                |_| op(),
            )
            .map_err(RetryError::into_last)
    }

    fn block<T, Fut>(
        &self,
        operation: &str,
        make: impl Fn() -> Fut,
    ) -> Result<T, ScalewayBackendError>
    where
        Fut: Future<Output = Result<T, scaleway_rs::ScalewayError>>,
    {
        self.call(operation, || {
            self.runtime
                .block_on(make())
                .map_err(ScalewayBackendError::from)
        })
    }

    fn fetch_instance(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<InstanceSnapshot>, ScalewayBackendError> {
        let zone = self.zone(handle);
        let mut servers = self.block("list servers", || {
            self.api
                .list_instances(zone.as_str())
                .servers(&handle.id)
                .per_page(1)
                .run_async()
        })?;
        Ok(servers.pop().map(InstanceSnapshot::from))
    }

    fn require_instance(
        &self,
        handle: &InstanceHandle,
    ) -> Result<InstanceSnapshot, ScalewayBackendError> {
        self.fetch_instance(handle)?
            .ok_or_else(|| ScalewayBackendError::NotFound {
                instance_id: handle.id.clone(),
                zone: self.zone(handle).as_str().to_owned(),
            })
    }

    fn perform(
        &self,
        zone: &Zone,
        snapshot: &InstanceSnapshot,
        action: &str,
    ) -> Result<(), ScalewayBackendError> {
        if !snapshot.allows(action) {
            return Err(ScalewayBackendError::ActionNotAllowed {
                instance_id: snapshot.id.as_str().to_owned(),
                action: action.to_owned(),
                state: snapshot.state.as_str().to_owned(),
            });
        }
        info!(id = %snapshot.id.as_str(), action, "performing server action");
        self.block(action, || {
            self.api
                .perform_instance_action_async(zone.as_str(), snapshot.id.as_str(), action)
        })?;
        Ok(())
    }

    fn power_on_if_needed(
        &self,
        zone: &Zone,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), ScalewayBackendError> {
        if snapshot.state.as_str() == "running" {
            return Ok(());
        }
        self.perform(zone, snapshot, "poweron")
    }

    fn wait_for_public_ip(&self, handle: &InstanceHandle) -> Result<String, ScalewayBackendError> {
        let mut saw_running = false;
        let mut address = None;
        let result = poll_until(
            self.clock.as_ref(),
            PollPolicy::new(self.wait_timeout, self.poll_interval),
            "public ip",
            || -> Result<bool, ScalewayBackendError> {
                let Some(server) = self.fetch_instance(handle)? else {
                    return Ok(false);
                };
                if server.state.power_state() != PowerState::Running {
                    return Ok(false);
                }
                saw_running = true;
                address = server.public_ip;
                Ok(address.is_some())
            },
        );
        match (result, address) {
            (Ok(_), Some(ip)) => Ok(ip),
            (Err(PollError::Check(err)), _) => Err(err),
            _ if saw_running => Err(ScalewayBackendError::MissingPublicIp {
                instance_id: handle.id.clone(),
            }),
            _ => Err(ScalewayBackendError::Timeout {
                action: String::from("public ip"),
                instance_id: handle.id.clone(),
            }),
        }
    }
}

/// Runs `bring_up` for a freshly created server and destroys the server if
/// it fails. The bring-up error is returned either way.
fn bring_up_or_destroy<T>(
    id: &str,
    bring_up: impl FnOnce() -> Result<T, ScalewayBackendError>,
    destroy: impl FnOnce() -> Result<(), ScalewayBackendError>,
) -> Result<T, ScalewayBackendError> {
    let err = match bring_up() {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    match destroy() {
        Ok(()) => warn!(id, error = %err, "launch failed; server destroyed"),
        Err(cleanup) => error!(
            id,
            error = %err,
            cleanup_error = %cleanup,
            "launch failed and the server could not be destroyed"
        ),
    }
    Err(err)
}

impl Backend for ScalewayBackend {
    type Error = ScalewayBackendError;

    fn resolve_address(&self, handle: &InstanceHandle) -> Result<String, Self::Error> {
        self.require_instance(handle)?
            .public_ip
            .ok_or_else(|| ScalewayBackendError::MissingPublicIp {
                instance_id: handle.id.clone(),
            })
    }

    fn request_start(&self, handle: &InstanceHandle) -> Result<(), Self::Error> {
        let snapshot = self.require_instance(handle)?;
        self.power_on_if_needed(&self.zone(handle), &snapshot)
    }

    fn request_stop(&self, handle: &InstanceHandle) -> Result<(), Self::Error> {
        let snapshot = self.require_instance(handle)?;
        if snapshot.state.power_state() == PowerState::Stopped {
            return Ok(());
        }
        self.perform(&self.zone(handle), &snapshot, "poweroff")
    }

    fn request_reboot(&self, handle: &InstanceHandle) -> Result<RebootRequest, Self::Error> {
        let snapshot = self.require_instance(handle)?;
        self.perform(&self.zone(handle), &snapshot, "reboot")?;
        Ok(RebootRequest::Issued)
    }

    fn request_delete(&self, handle: &InstanceHandle) -> Result<(), Self::Error> {
        let Some(snapshot) = self.fetch_instance(handle)? else {
            return Ok(());
        };
        let zone = self.zone(handle);
        if snapshot.allows("terminate") {
            return self.perform(&zone, &snapshot, "terminate");
        }
        self.block("delete server", || {
            self.api
                .delete_instance_async(zone.as_str(), snapshot.id.as_str())
        })
    }

    fn power_state(&self, handle: &InstanceHandle) -> Result<Option<PowerState>, Self::Error> {
        Ok(Some(self.fetch_instance(handle)?.map_or(PowerState::Gone, |server| {
            server.state.power_state()
        })))
    }
}
