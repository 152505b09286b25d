//! Docker Engine Tool
//!
//! Asset scans against a local or remote Docker daemon, spoken to over the
//! Engine REST API on a TCP endpoint.
//!
//! ## Resource mapping
//!
//! - **Snapshot**: image committed from the asset container
//! - **Volume**: named volume filled by a short-lived populate container
//!   started from the snapshot image
//! - **Scanner**: container from the scanner image with the volume mounted
//!   read-only at `/mnt/snapshot`
//!
//! Commits and image pulls can take minutes, so they run as background
//! tasks. Later reconcile calls see them through `observe` and `create`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::env;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agents::asset_scan::errors::ProviderError;
use crate::agents::asset_scan::naming::is_scan_resource;
use crate::agents::asset_scan::provider::AssetDiscovery;
use crate::agents::asset_scan::reconciler::ResourceClient;
use crate::agents::asset_scan::scanner::ScannerSpec;
use crate::agents::asset_scan::snapshot::SnapshotSpec;
use crate::agents::asset_scan::types::{
    AssetInfo, Observation, ResourceHandle, ResourceKind, ResourceState,
};
use crate::agents::asset_scan::volume::{VolumeSource, VolumeSpec};

const API_VERSION: &str = "v1.43";

/// Mount point of the volume inside the populate container
const POPULATE_MOUNT: &str = "/scan-volume";

/// Mount point of the volume inside the scanner container
const SCANNER_MOUNT: &str = "/mnt/snapshot";

/// Suggested wait while a scanner image is being pulled
const PULL_RETRY_AFTER: Duration = Duration::from_secs(10);

/// Copies the committed filesystem into the volume
const POPULATE_SCRIPT: &str = "tar -C / --exclude=./proc --exclude=./sys --exclude=./dev \
     --exclude=./scan-volume -cf - . | tar -C /scan-volume -xf -";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerConfig {
    /// HTTP base of the Engine API (`http://host:port`)
    pub endpoint: String,
    /// Location reported for discovered containers and accepted in jobs
    pub location: String,
}

impl DockerConfig {
    /// Reads `DOCKER_HOST` (default `tcp://127.0.0.1:2375`) and
    /// `DOCKER_LOCATION` (default `local`).
    pub fn from_env() -> Result<Self> {
        let host = env::var("DOCKER_HOST").unwrap_or_else(|_| "tcp://127.0.0.1:2375".to_string());

        Ok(Self {
            endpoint: parse_docker_host(&host)?,
            location: env::var("DOCKER_LOCATION").unwrap_or_else(|_| "local".to_string()),
        })
    }
}

/// Engine endpoint from a `DOCKER_HOST` value
pub fn parse_docker_host(raw: &str) -> Result<String> {
    let raw = raw.trim().trim_end_matches('/');

    if let Some(address) = raw.strip_prefix("tcp://") {
        return Ok(format!("http://{}", address));
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(raw.to_string());
    }
    if raw.starts_with("unix://") {
        bail!("DOCKER_HOST {} is a unix socket; expose the daemon on tcp://", raw);
    }
    bail!("Unsupported DOCKER_HOST {}", raw)
}

#[derive(Debug, Deserialize)]
struct EngineError {
    message: String,
}

fn parse_engine_error(operation: &str, status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<EngineError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.to_string());
    let code = match status {
        404 => Some("NotFound"),
        409 => Some("Conflict"),
        _ => None,
    };
    ProviderError::api(operation, status, code, message)
}

#[derive(Debug, Clone)]
enum BackgroundState {
    Running,
    Failed(ProviderError),
}

/// Image pulls and commits outlive the reconcile call that starts them.
/// Entries are keyed by what they produce and dropped once they succeed.
#[derive(Debug, Clone, Default)]
struct BackgroundOps {
    ops: Arc<Mutex<HashMap<String, BackgroundState>>>,
}

impl BackgroundOps {
    async fn state(&self, key: &str) -> Option<BackgroundState> {
        self.ops.lock().await.get(key).cloned()
    }

    async fn clear(&self, key: &str) {
        self.ops.lock().await.remove(key);
    }

    /// Run `work` detached unless `key` is already running. Returns whether
    /// it was started.
    async fn spawn<F>(&self, key: String, work: F) -> bool
    where
        F: Future<Output = Result<(), ProviderError>> + Send + 'static,
    {
        let mut ops = self.ops.lock().await;
        if matches!(ops.get(&key), Some(BackgroundState::Running)) {
            return false;
        }
        ops.insert(key.clone(), BackgroundState::Running);
        drop(ops);

        let tracker = self.ops.clone();
        tokio::spawn(async move {
            let result = work.await;
            let mut ops = tracker.lock().await;
            match result {
                Ok(()) => {
                    ops.remove(&key);
                }
                Err(e) => {
                    warn!(operation = %key, error = %e, "Background Docker operation failed");
                    ops.insert(key, BackgroundState::Failed(e));
                }
            }
        });
        true
    }
}

/// Shared handle to one Docker daemon
#[derive(Debug, Clone)]
pub struct DockerApi {
    http: Client,
    config: DockerConfig,
    background: BackgroundOps,
}

impl DockerApi {
    pub fn new(config: DockerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        info!(endpoint = %config.endpoint, "Docker API client initialized");
        Ok(Self {
            http,
            config,
            background: BackgroundOps::default(),
        })
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(
            method,
            format!("{}/{}{}", self.config.endpoint, API_VERSION, path),
        )
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response, ProviderError> {
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(operation, e))?;

        // 304: already started / already stopped
        if response.status().is_success() || response.status() == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let err = parse_engine_error(operation, status, &body);
        debug!(operation = %operation, status, error = %err, "Docker request failed");
        Err(err)
    }

    async fn get_json(&self, operation: &str, path: &str) -> Result<Value, ProviderError> {
        self.send(operation, self.request(Method::GET, path))
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::malformed(operation, e.to_string()))
    }

    async fn delete(&self, operation: &str, path: &str) -> Result<(), ProviderError> {
        let request = self.request(Method::DELETE, path).query(&[("force", "true")]);
        self.send(operation, request).await?;
        Ok(())
    }

    async fn create_container(
        &self,
        operation: &str,
        name: &str,
        body: &Value,
    ) -> Result<(), ProviderError> {
        let request = self
            .request(Method::POST, "/containers/create")
            .query(&[("name", name)])
            .json(body);
        self.send(operation, request).await?;
        Ok(())
    }

    async fn start_container(&self, operation: &str, name: &str) -> Result<(), ProviderError> {
        let path = format!("/containers/{}/start", name);
        self.send(operation, self.request(Method::POST, &path)).await?;
        Ok(())
    }

    /// Remove a container whose start failed; left alone it would sit in
    /// `created` and look provisioning forever
    async fn discard_unstarted(&self, name: &str) {
        if let Err(e) = self
            .delete("removing unstarted container", &format!("/containers/{}", name))
            .await
        {
            warn!(name = %name, error = %e, "Failed to remove unstarted container");
        }
    }

    async fn commit(&self, container: &str, repo: &str) -> Result<(), ProviderError> {
        let request = self
            .request(Method::POST, "/commit")
            .query(&[
                ("container", container),
                ("repo", repo),
                ("tag", "latest"),
                ("pause", "false"),
            ])
            .timeout(Duration::from_secs(300));

        self.send("committing snapshot image", request).await?;
        info!(name = %repo, container = %container, "Committed snapshot image");
        Ok(())
    }

    /// Start pulling `image` without waiting for it. The returned error asks
    /// the caller to come back later, or carries the failure of the last pull.
    async fn pull_in_background(&self, image: &str) -> ProviderError {
        let key = format!("pull:{}", image);

        if let Some(BackgroundState::Failed(err)) = self.background.state(&key).await {
            self.background.clear(&key).await;
            return err;
        }

        let api = self.clone();
        let target = image.to_string();
        if self
            .background
            .spawn(key, async move { api.pull_image(&target).await })
            .await
        {
            info!(image = %image, "Pulling scanner image");
        }

        ProviderError::api(
            "pulling scanner image",
            409,
            Some("ImagePullInProgress"),
            format!("image {} is being pulled", image),
        )
        .with_retry_after(Some(PULL_RETRY_AFTER))
    }

    /// Pull an image, waiting for the pull stream to finish
    async fn pull_image(&self, image: &str) -> Result<(), ProviderError> {
        let operation = "pulling scanner image";
        let request = self
            .request(Method::POST, "/images/create")
            .query(&[("fromImage", image)])
            .timeout(Duration::from_secs(600));

        let response = match self.send(operation, request).await {
            // Unknown repository or tag
            Err(ProviderError::Api {
                status: 404,
                message,
                ..
            }) => {
                return Err(ProviderError::api(
                    operation,
                    400,
                    Some("ImagePullFailed"),
                    message,
                ))
            }
            other => other?,
        };
        let stream = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(operation, e))?;

        if let Some(message) = pull_stream_error(&stream) {
            return Err(ProviderError::api(
                operation,
                400,
                Some("ImagePullFailed"),
                message,
            ));
        }

        info!(image = %image, "Pulled scanner image");
        Ok(())
    }
}

/// First error reported in a newline-delimited pull progress stream
fn pull_stream_error(stream: &str) -> Option<String> {
    stream
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find_map(|event| event.get("error").and_then(Value::as_str).map(str::to_string))
}

/// Lifecycle state from a container inspect body
fn container_state(value: &Value) -> (ResourceState, String) {
    let status = value
        .pointer("/State/Status")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let exit_code = value
        .pointer("/State/ExitCode")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    let state = match status {
        "running" => ResourceState::Ready,
        "exited" if exit_code == 0 => ResourceState::Ready,
        "exited" | "dead" => ResourceState::Failed,
        _ => ResourceState::Provisioning,
    };

    let described = if status == "exited" {
        format!("exited ({})", exit_code)
    } else {
        status.to_string()
    };
    (state, described)
}

fn string_field<'a>(operation: &str, value: &'a Value, field: &str) -> Result<&'a str, ProviderError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::malformed(operation, format!("{} missing", field)))
}

/// Images committed from asset containers
pub struct DockerSnapshots {
    api: DockerApi,
}

impl DockerSnapshots {
    pub fn new(api: DockerApi) -> Self {
        Self { api }
    }
}

fn commit_key(name: &str) -> String {
    format!("commit:{}", name)
}

#[async_trait]
impl ResourceClient<SnapshotSpec> for DockerSnapshots {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Snapshot
    }

    async fn observe(&self, name: &str) -> Result<Observation, ProviderError> {
        let operation = "inspecting snapshot image";
        match self.api.background.state(&commit_key(name)).await {
            Some(BackgroundState::Running) => {
                return Ok(Observation::new(
                    ResourceHandle::new(name, name),
                    ResourceState::Provisioning,
                    "committing",
                ))
            }
            Some(BackgroundState::Failed(err)) => {
                return Ok(Observation::new(
                    ResourceHandle::new(name, name),
                    ResourceState::Failed,
                    format!("commit failed: {}", err),
                ))
            }
            None => {}
        }

        let body = self
            .api
            .get_json(operation, &format!("/images/{}/json", name))
            .await?;
        let id = string_field(operation, &body, "Id")?;

        // The image only appears once its commit has finished
        Ok(Observation::new(
            ResourceHandle::new(name, id),
            ResourceState::Ready,
            "committed",
        ))
    }

    async fn create(&self, name: &str, spec: &SnapshotSpec) -> Result<(), ProviderError> {
        let api = self.api.clone();
        let container = spec.source_volume.clone();
        let repo = name.to_string();

        if self
            .api
            .background
            .spawn(commit_key(name), async move { api.commit(&container, &repo).await })
            .await
        {
            info!(name = %name, container = %spec.source_volume, "Committing snapshot image");
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        let operation = "removing snapshot image";
        let key = commit_key(name);

        match self.api.background.state(&key).await {
            // The image would appear after the delete
            Some(BackgroundState::Running) => {
                return Err(ProviderError::api(
                    operation,
                    409,
                    Some("CommitInProgress"),
                    format!("{} is still being committed", name),
                ))
            }
            Some(BackgroundState::Failed(_)) => self.api.background.clear(&key).await,
            None => {}
        }

        self.api
            .delete(operation, &format!("/images/{}", name))
            .await
    }
}

/// Named volumes holding a copy of the snapshot filesystem
pub struct DockerVolumes {
    api: DockerApi,
}

impl DockerVolumes {
    pub fn new(api: DockerApi) -> Self {
        Self { api }
    }
}

fn populate_container_name(volume: &str) -> String {
    format!("{}-populate", volume)
}

fn populate_container_body(volume: &str, snapshot_image: &str) -> Value {
    json!({
        "Image": snapshot_image,
        "User": "0",
        "Entrypoint": ["/bin/sh", "-c"],
        "Cmd": [POPULATE_SCRIPT],
        "Labels": { "asset-scan.resource": "volume-populate" },
        "HostConfig": {
            "Binds": [format!("{}:{}", volume, POPULATE_MOUNT)]
        }
    })
}

#[async_trait]
impl ResourceClient<VolumeSpec> for DockerVolumes {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Volume
    }

    async fn observe(&self, name: &str) -> Result<Observation, ProviderError> {
        let operation = "inspecting volume";
        self.api
            .get_json(operation, &format!("/volumes/{}", name))
            .await?;

        let handle = ResourceHandle::new(name, name);
        let populate = self
            .api
            .get_json(
                operation,
                &format!("/containers/{}/json", populate_container_name(name)),
            )
            .await;

        match populate {
            Ok(body) => {
                let (state, status) = container_state(&body);
                Ok(Observation::new(handle, state, format!("populate {}", status)))
            }
            // Create re-runs population; teardown still removes the volume
            Err(ProviderError::Api { status: 404, .. }) => Ok(Observation::new(
                handle,
                ResourceState::Absent,
                "not populated",
            )),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, name: &str, spec: &VolumeSpec) -> Result<(), ProviderError> {
        let operation = "creating volume";
        let snapshot = match &spec.source {
            VolumeSource::Snapshot(snapshot) => snapshot,
            VolumeSource::StagedCopy(_) => {
                return Err(ProviderError::unsupported(
                    operation,
                    "docker volumes cannot be imported from a staged copy",
                ))
            }
        };

        let request = self.api.request(Method::POST, "/volumes/create").json(&json!({
            "Name": name,
            "Labels": { "asset-scan.resource": "volume" }
        }));
        self.api.send(operation, request).await?;

        let populate = populate_container_name(name);
        match self
            .api
            .create_container(operation, &populate, &populate_container_body(name, &snapshot.id))
            .await
        {
            Ok(()) | Err(ProviderError::Api { status: 409, .. }) => {}
            Err(e) => return Err(e),
        }
        if let Err(e) = self.api.start_container(operation, &populate).await {
            self.api.discard_unstarted(&populate).await;
            return Err(e);
        }

        info!(name = %name, snapshot = %snapshot.name, "Populating volume");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        let populate = populate_container_name(name);
        match self
            .api
            .delete("removing populate container", &format!("/containers/{}", populate))
            .await
        {
            Ok(()) | Err(ProviderError::Api { status: 404, .. }) => {}
            Err(e) => return Err(e),
        }

        self.api
            .delete("removing volume", &format!("/volumes/{}", name))
            .await
    }
}

/// Scanner containers
pub struct DockerScanners {
    api: DockerApi,
}

impl DockerScanners {
    pub fn new(api: DockerApi) -> Self {
        Self { api }
    }
}

fn scanner_container_body(spec: &ScannerSpec) -> Value {
    let mut env = vec![format!("ASSET_SCAN_ID={}", spec.asset_scan_id)];
    if let Some(config) = &spec.cli_config {
        env.push(format!("SCANNER_CONFIG={}", config));
    }
    if let Some(server) = &spec.server_address {
        env.push(format!("SCAN_SERVER_ADDRESS={}", server));
    }

    json!({
        "Image": spec.image,
        "Env": env,
        "Labels": {
            "asset-scan.resource": "scanner",
            "asset-scan.id": spec.asset_scan_id.as_str()
        },
        "HostConfig": {
            "Binds": [format!("{}:{}:ro", spec.volume.name, SCANNER_MOUNT)]
        }
    })
}

#[async_trait]
impl ResourceClient<ScannerSpec> for DockerScanners {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Scanner
    }

    async fn observe(&self, name: &str) -> Result<Observation, ProviderError> {
        let operation = "inspecting scanner container";
        let body = self
            .api
            .get_json(operation, &format!("/containers/{}/json", name))
            .await?;
        let id = string_field(operation, &body, "Id")?;
        let (state, status) = container_state(&body);

        Ok(Observation::new(ResourceHandle::new(name, id), state, status))
    }

    async fn create(&self, name: &str, spec: &ScannerSpec) -> Result<(), ProviderError> {
        let operation = "creating scanner container";
        let body = scanner_container_body(spec);

        match self.api.create_container(operation, name, &body).await {
            Ok(()) => {}
            // No such image
            Err(ProviderError::Api { status: 404, .. }) => {
                return Err(self.api.pull_in_background(&spec.image).await)
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.api.start_container(operation, name).await {
            self.api.discard_unstarted(name).await;
            return Err(e);
        }

        info!(name = %name, image = %spec.image, "Started scanner container");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        self.api
            .delete("removing scanner container", &format!("/containers/{}", name))
            .await
    }
}

/// Containers of the daemon
pub struct DockerDiscovery {
    api: DockerApi,
}

impl DockerDiscovery {
    pub fn new(api: DockerApi) -> Self {
        Self { api }
    }
}

fn parse_container_asset(value: &Value, location: &str) -> Option<AssetInfo> {
    let name = value
        .get("Names")
        .and_then(Value::as_array)
        .and_then(|names| names.first())
        .and_then(Value::as_str)?
        .trim_start_matches('/');
    if is_scan_resource(name) {
        return None;
    }

    Some(AssetInfo::Container {
        container_id: value.get("Id").and_then(Value::as_str)?.to_string(),
        name: name.to_string(),
        image: value
            .get("Image")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        location: location.to_string(),
    })
}

#[async_trait]
impl AssetDiscovery for DockerDiscovery {
    async fn list_assets(&self) -> Result<Vec<AssetInfo>, ProviderError> {
        let body = self
            .api
            .get_json("listing containers", "/containers/json")
            .await?;
        let containers = body
            .as_array()
            .ok_or_else(|| ProviderError::malformed("listing containers", "expected an array"))?;

        Ok(containers
            .iter()
            .filter_map(|c| parse_container_asset(c, &self.api.config().location))
            .collect())
    }
}
