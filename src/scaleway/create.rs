//! Instance creation for the Scaleway backend.
//!
//! Scaleway instances must receive cloud-init user-data before first boot.
//! The creation request sets `stopped: true` so the payload is available when
//! the instance is powered on.

use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::InstanceSnapshot;
use super::{LaunchRequest, ScalewayBackend, ScalewayBackendError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

#[derive(Debug, Serialize)]
pub(super) struct CreateServerRequest {
    name: String,
    commercial_type: String,
    image: String,
    project: String,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: Vec<String>,
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_init: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<String>,
}

impl CreateServerRequest {
    pub(super) fn new(request: &LaunchRequest) -> Self {
        Self {
            name: format!("vigil-{}", Uuid::new_v4().simple()),
            commercial_type: request.instance_type.clone(),
            image: request.image_id.clone(),
            project: request.project_id.clone(),
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: vec![String::from("vigil"), String::from("ephemeral")],
            stopped: true,
            cloud_init: request.user_data.clone(),
            organization: request.organization_id.clone(),
        }
    }
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: scaleway_rs::ScalewayInstance,
}

pub(super) fn is_instance_type_error(
    api_err: &scaleway_rs::ScalewayApiError,
    instance_type: &str,
) -> bool {
    matches!(api_err.resource.as_deref(), Some("commercial_type"))
        || api_err
            .resource_id
            .as_deref()
            .is_some_and(|id| id == instance_type)
        || (api_err.etype == "invalid_arguments"
            && api_err
                .message
                .to_ascii_lowercase()
                .contains("commercial_type"))
}

impl ScalewayBackend {
    /// Creates a stopped server carrying the request's user-data.
    pub(super) async fn create_instance_stopped(
        &self,
        request: &LaunchRequest,
    ) -> Result<InstanceSnapshot, ScalewayBackendError> {
        let url = format!(
            "{SCALEWAY_INSTANCE_API_BASE}/zones/{}/servers",
            request.zone
        );
        let payload = CreateServerRequest::new(request);

        let response = HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.config.secret_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| ScalewayBackendError::provider(err.to_string(), true))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ScalewayBackendError::provider(err.to_string(), true))?;

        if status.is_success() {
            let parsed: CreateServerResponse = serde_json::from_slice(&body)
                .map_err(|err| ScalewayBackendError::provider(err.to_string(), false))?;
            return Ok(parsed.server.into());
        }

        let message = String::from_utf8_lossy(&body).into_owned();
        if let Ok(api_err) = serde_json::from_slice::<scaleway_rs::ScalewayApiError>(&body)
            && is_instance_type_error(&api_err, &request.instance_type)
        {
            return Err(ScalewayBackendError::InstanceTypeUnavailable {
                instance_type: request.instance_type.clone(),
                zone: request.zone.clone(),
            });
        }

        Err(ScalewayBackendError::provider(
            message,
            status.is_server_error(),
        ))
    }
}

