//! Azure Resource Manager and Storage clients
//!
//! Thin REST clients over `reqwest` for the resources an asset scan creates
//! in the scanner resource group: snapshots, managed disks, network
//! interfaces, scanner VMs and staged blobs.
//!
//! Every request carries a fresh `x-ms-client-request-id` so failures can be
//! matched against Azure activity logs.

pub mod compute;
pub mod identity;
pub mod network;
pub mod storage;

use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use crate::agents::asset_scan::errors::ProviderError;
use crate::agents::asset_scan::types::{Observation, ResourceHandle, ResourceState};

pub use compute::{AzureDisks, AzureScannerVms, AzureSnapshots, AzureVmDiscovery};
pub use identity::{AzureCredential, AzureIdentity, TokenScope};
pub use network::AzureNetworkInterfaces;
pub use storage::AzureBlobStore;

const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

/// Polls of a long-running ARM operation before giving up on this call
const MAX_OPERATION_POLLS: usize = 30;
const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Marketplace image the scanner VM boots from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

/// Scanner-side Azure configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConfig {
    pub subscription_id: String,
    /// Resource group holding every ephemeral scan resource
    pub resource_group: String,
    pub storage_account: String,
    pub storage_container: String,
    /// Subnet the scanner network interfaces join
    pub subnet_id: String,
    /// SSH public key installed on scanner VMs
    pub public_key: String,
    pub admin_username: String,
    pub image: ImageReference,
}

impl AzureConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup (environment, test map)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| lookup(key).with_context(|| format!("{} must be set", key));
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            subscription_id: required("AZURE_SUBSCRIPTION_ID")?,
            resource_group: required("AZURE_SCANNER_RESOURCE_GROUP")?,
            storage_account: required("AZURE_SCANNER_STORAGE_ACCOUNT")?,
            storage_container: required("AZURE_SCANNER_STORAGE_CONTAINER")?,
            subnet_id: required("AZURE_SCANNER_SUBNET_ID")?,
            public_key: required("AZURE_SCANNER_PUBLIC_KEY")?,
            admin_username: or_default("AZURE_SCANNER_ADMIN_USERNAME", "scanner"),
            image: ImageReference {
                publisher: or_default("AZURE_SCANNER_IMAGE_PUBLISHER", "Canonical"),
                offer: or_default("AZURE_SCANNER_IMAGE_OFFER", "0001-com-ubuntu-server-jammy"),
                sku: or_default("AZURE_SCANNER_IMAGE_SKU", "22_04-lts-gen2"),
                version: or_default("AZURE_SCANNER_IMAGE_VERSION", "latest"),
            },
        })
    }

    /// ARM id of a resource in the scanner resource group
    pub fn resource_id(&self, resource_type: &str, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}",
            self.subscription_id, self.resource_group, resource_type, name
        )
    }

    pub fn storage_account_id(&self) -> String {
        self.resource_id("Microsoft.Storage/storageAccounts", &self.storage_account)
    }
}

#[derive(Debug, Deserialize)]
struct ArmErrorResponse {
    error: ArmErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ArmErrorDetail {
    code: String,
    #[serde(default)]
    message: String,
}

/// Outcome of one poll of an `Azure-AsyncOperation` status endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Running,
    Succeeded(Option<Value>),
}

struct ApiInner {
    http: Client,
    identity: AzureIdentity,
    config: AzureConfig,
    management_endpoint: String,
}

/// Shared, cheaply cloneable handle to the Azure REST APIs
#[derive(Clone)]
pub struct AzureApi {
    inner: Arc<ApiInner>,
}

impl AzureApi {
    pub fn new(config: AzureConfig, credential: AzureCredential) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            subscription = %config.subscription_id,
            resource_group = %config.resource_group,
            "Azure API client initialized"
        );

        Ok(Self {
            inner: Arc::new(ApiInner {
                identity: AzureIdentity::new(http.clone(), credential),
                http,
                config,
                management_endpoint: MANAGEMENT_ENDPOINT.to_string(),
            }),
        })
    }

    pub fn config(&self) -> &AzureConfig {
        &self.inner.config
    }

    pub(crate) fn http(&self) -> &Client {
        &self.inner.http
    }

    fn arm_url(&self, path: &str, api_version: &str) -> String {
        format!(
            "{}{}?api-version={}",
            self.inner.management_endpoint, path, api_version
        )
    }

    /// Authorize, tag and send a request. Non-success statuses become
    /// [`ProviderError::Api`].
    pub(crate) async fn send(
        &self,
        operation: &str,
        scope: TokenScope,
        request: RequestBuilder,
    ) -> Result<Response, ProviderError> {
        let token = self.inner.identity.token(scope).await?;
        let request_id = Uuid::new_v4();

        let response = request
            .bearer_auth(token)
            .header("x-ms-client-request-id", request_id.to_string())
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(operation, e))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let hint = retry_after(response.headers());
        let header_code = header_str(response.headers(), "x-ms-error-code");
        let body = response.text().await.unwrap_or_default();

        let err = match scope {
            TokenScope::Management => parse_arm_error(operation, status, &body),
            TokenScope::Storage => {
                storage::parse_storage_error(operation, status, header_code.as_deref(), &body)
            }
        }
        .with_retry_after(hint);

        debug!(
            operation = %operation,
            status,
            request_id = %request_id,
            error = %err,
            "Azure request failed"
        );
        Err(err)
    }

    pub async fn get_json(
        &self,
        operation: &str,
        path: &str,
        api_version: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ProviderError> {
        let request = self
            .inner
            .http
            .get(self.arm_url(path, api_version))
            .query(query);
        let response = self.send(operation, TokenScope::Management, request).await?;

        response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(operation, e.to_string()))
    }

    /// Start a create-or-update. Does not wait for provisioning.
    pub async fn put_json(
        &self,
        operation: &str,
        path: &str,
        api_version: &str,
        body: &Value,
    ) -> Result<(), ProviderError> {
        let request = self
            .inner
            .http
            .put(self.arm_url(path, api_version))
            .json(body);
        self.send(operation, TokenScope::Management, request).await?;
        Ok(())
    }

    /// Request deletion. Does not wait for it.
    pub async fn delete(
        &self,
        operation: &str,
        path: &str,
        api_version: &str,
    ) -> Result<(), ProviderError> {
        let request = self.inner.http.delete(self.arm_url(path, api_version));
        self.send(operation, TokenScope::Management, request).await?;
        Ok(())
    }

    /// Follow `nextLink` pages of a list operation
    pub async fn list(
        &self,
        operation: &str,
        path: &str,
        api_version: &str,
    ) -> Result<Vec<Value>, ProviderError> {
        let mut items = Vec::new();
        let mut next = Some(self.arm_url(path, api_version));

        while let Some(url) = next.take() {
            let response = self
                .send(operation, TokenScope::Management, self.inner.http.get(&url))
                .await?;
            let mut page: Value = response
                .json()
                .await
                .map_err(|e| ProviderError::malformed(operation, e.to_string()))?;

            if let Some(Value::Array(values)) = page.get_mut("value").map(Value::take) {
                items.extend(values);
            }
            next = page
                .get("nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        Ok(items)
    }

    /// POST a resource action and wait for its long-running operation.
    ///
    /// Returns the operation output, if any. The wait is bounded; an
    /// operation still running afterwards is reported as a timed-out
    /// transport error so the caller retries later.
    pub async fn post_action(
        &self,
        operation: &str,
        path: &str,
        action: &str,
        api_version: &str,
        body: &Value,
    ) -> Result<Option<Value>, ProviderError> {
        let url = self.arm_url(&format!("{}/{}", path, action), api_version);
        let request = self.inner.http.post(url).json(body);
        let response = self.send(operation, TokenScope::Management, request).await?;

        self.await_operation(operation, response).await
    }

    async fn await_operation(
        &self,
        operation: &str,
        response: Response,
    ) -> Result<Option<Value>, ProviderError> {
        if response.status() != StatusCode::ACCEPTED {
            return read_optional_json(operation, response).await;
        }

        let headers = response.headers();
        let mut delay = retry_after(headers).unwrap_or(OPERATION_POLL_INTERVAL);
        let (url, async_operation) = match (
            header_str(headers, "azure-asyncoperation"),
            header_str(headers, "location"),
        ) {
            (Some(url), _) => (url, true),
            (None, Some(url)) => (url, false),
            (None, None) => return Ok(None),
        };

        for _ in 0..MAX_OPERATION_POLLS {
            sleep(delay).await;

            let response = self
                .send(operation, TokenScope::Management, self.inner.http.get(&url))
                .await?;
            delay = retry_after(response.headers()).unwrap_or(OPERATION_POLL_INTERVAL);

            if async_operation {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::malformed(operation, e.to_string()))?;

                match parse_operation_status(operation, &body)? {
                    OperationStatus::Running => continue,
                    OperationStatus::Succeeded(output) => return Ok(output),
                }
            }

            if response.status() == StatusCode::ACCEPTED {
                continue;
            }
            return read_optional_json(operation, response).await;
        }

        Err(ProviderError::Transport {
            operation: operation.to_string(),
            message: format!(
                "operation still running after {} status polls",
                MAX_OPERATION_POLLS
            ),
            timed_out: true,
        })
    }
}

async fn read_optional_json(
    operation: &str,
    response: Response,
) -> Result<Option<Value>, ProviderError> {
    let text = response
        .text()
        .await
        .map_err(|e| ProviderError::from_reqwest(operation, e))?;

    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| ProviderError::malformed(operation, e.to_string()))
}

pub(crate) fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// `Retry-After` in seconds
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, "retry-after")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

pub(crate) fn parse_arm_error(operation: &str, status: u16, body: &str) -> ProviderError {
    match serde_json::from_str::<ArmErrorResponse>(body) {
        Ok(err) => ProviderError::api(operation, status, Some(&err.error.code), err.error.message),
        Err(_) => ProviderError::api(operation, status, None, body.to_string()),
    }
}

/// Interpret an `Azure-AsyncOperation` status body.
///
/// A failed or canceled operation is reported as a server-side failure
/// carrying the operation's error code, so the classifier decides.
pub fn parse_operation_status(
    operation: &str,
    body: &Value,
) -> Result<OperationStatus, ProviderError> {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::malformed(operation, "operation status missing"))?;

    match status {
        "Succeeded" => Ok(OperationStatus::Succeeded(
            body.pointer("/properties/output")
                .or_else(|| body.get("properties"))
                .cloned(),
        )),
        "Failed" | "Canceled" => {
            let code = body.pointer("/error/code").and_then(Value::as_str);
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or(status);
            Err(ProviderError::api(operation, 500, code, message))
        }
        _ => Ok(OperationStatus::Running),
    }
}

/// Lifecycle state from an ARM `provisioningState`
pub fn provisioning_state(value: &Value) -> (ResourceState, String) {
    let raw = value
        .pointer("/properties/provisioningState")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");

    let state = match raw {
        "Succeeded" => ResourceState::Ready,
        "Failed" | "Canceled" => ResourceState::Failed,
        _ => ResourceState::Provisioning,
    };

    (state, raw.to_string())
}

/// Observation of an ARM resource from its GET body
pub fn observe_resource(
    operation: &str,
    name: &str,
    value: &Value,
) -> Result<Observation, ProviderError> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::malformed(operation, "resource id missing"))?;
    let (state, status) = provisioning_state(value);

    Ok(Observation::new(ResourceHandle::new(name, id), state, status))
}

#[cfg(test)]
pub(crate) fn test_config() -> AzureConfig {
    let vars: std::collections::HashMap<&str, &str> = std::collections::HashMap::from([
        ("AZURE_SUBSCRIPTION_ID", "sub-1"),
        ("AZURE_SCANNER_RESOURCE_GROUP", "scanner-rg"),
        ("AZURE_SCANNER_STORAGE_ACCOUNT", "scannerstore"),
        ("AZURE_SCANNER_STORAGE_CONTAINER", "snapshots"),
        ("AZURE_SCANNER_SUBNET_ID", "/subscriptions/sub-1/resourceGroups/net/providers/Microsoft.Network/virtualNetworks/vnet/subnets/scanners"),
        ("AZURE_SCANNER_PUBLIC_KEY", "ssh-ed25519 AAAA scanner"),
    ]);
    AzureConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::asset_scan::errors::{classify, Classification};
    use serde_json::json;

    #[test]
    fn test_config_defaults_and_ids() {
        let config = test_config();

        assert_eq!(config.admin_username, "scanner");
        assert_eq!(config.image.publisher, "Canonical");
        assert_eq!(
            config.resource_id("Microsoft.Compute/snapshots", "s1"),
            "/subscriptions/sub-1/resourceGroups/scanner-rg/providers/Microsoft.Compute/snapshots/s1"
        );
        assert!(config.storage_account_id().ends_with("storageAccounts/scannerstore"));
    }

    #[test]
    fn test_config_requires_subscription() {
        let err = AzureConfig::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains("AZURE_SUBSCRIPTION_ID"));
    }

    #[test]
    fn test_arm_error_parsing() {
        let body = r#"{"error":{"code":"ResourceGroupNotFound","message":"Resource group 'scanner-rg' could not be found."}}"#;
        let err = parse_arm_error("getting snapshot", 404, body);
        assert!(matches!(classify(&err), Classification::Fatal { .. }));

        let body = r#"{"error":{"code":"ResourceNotFound","message":"not found"}}"#;
        assert_eq!(
            classify(&parse_arm_error("getting snapshot", 404, body)),
            Classification::NotFound
        );

        let err = parse_arm_error("getting snapshot", 502, "<html>bad gateway</html>");
        assert!(err.to_string().contains("bad gateway"));
    }

    #[test]
    fn test_provisioning_state_mapping() {
        let state = |raw: &str| provisioning_state(&json!({"properties": {"provisioningState": raw}})).0;

        assert_eq!(state("Succeeded"), ResourceState::Ready);
        assert_eq!(state("Creating"), ResourceState::Provisioning);
        assert_eq!(state("Updating"), ResourceState::Provisioning);
        assert_eq!(state("Failed"), ResourceState::Failed);
        assert_eq!(provisioning_state(&json!({})).0, ResourceState::Provisioning);
    }

    #[test]
    fn test_observe_resource_requires_id() {
        let body = json!({"name": "d1", "properties": {"provisioningState": "Succeeded"}});
        assert!(observe_resource("getting disk", "d1", &body).is_err());

        let body = json!({"id": "/subscriptions/s/disks/d1", "properties": {"provisioningState": "Succeeded"}});
        let observation = observe_resource("getting disk", "d1", &body).unwrap();
        assert_eq!(observation.handle.id, "/subscriptions/s/disks/d1");
        assert_eq!(observation.state, ResourceState::Ready);
    }

    #[test]
    fn test_operation_status_parsing() {
        let running = json!({"status": "InProgress"});
        assert_eq!(
            parse_operation_status("granting", &running).unwrap(),
            OperationStatus::Running
        );

        let done = json!({
            "status": "Succeeded",
            "properties": {"output": {"accessSAS": "https://md.blob/abc?sig=x"}}
        });
        assert_eq!(
            parse_operation_status("granting", &done).unwrap(),
            OperationStatus::Succeeded(Some(json!({"accessSAS": "https://md.blob/abc?sig=x"})))
        );

        let failed = json!({"status": "Failed", "error": {"code": "InternalExecutionError", "message": "boom"}});
        let err = parse_operation_status("granting", &failed).unwrap_err();
        assert!(classify(&err).into_error().is_retryable());

        assert!(parse_operation_status("granting", &json!({})).is_err());
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", "17".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(17)));

        headers.insert("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
