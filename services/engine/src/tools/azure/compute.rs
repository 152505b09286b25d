//! Microsoft.Compute clients: snapshots, managed disks, scanner VMs

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use super::{observe_resource, AzureApi, AzureConfig};
use crate::agents::asset_scan::errors::ProviderError;
use crate::agents::asset_scan::naming::is_scan_resource;
use crate::agents::asset_scan::provider::AssetDiscovery;
use crate::agents::asset_scan::reconciler::ResourceClient;
use crate::agents::asset_scan::scanner::ScannerSpec;
use crate::agents::asset_scan::snapshot::SnapshotSpec;
use crate::agents::asset_scan::transfer::{AccessUrl, SnapshotAccess};
use crate::agents::asset_scan::types::{AssetInfo, Observation, ResourceKind, ResourceState};
use crate::agents::asset_scan::volume::{VolumeSource, VolumeSpec};

const DISK_API_VERSION: &str = "2023-04-02";
const VM_API_VERSION: &str = "2023-09-01";

const SNAPSHOT_TYPE: &str = "Microsoft.Compute/snapshots";
const DISK_TYPE: &str = "Microsoft.Compute/disks";
const VM_TYPE: &str = "Microsoft.Compute/virtualMachines";

/// Where the scanner config lands on the VM
const SCANNER_CONFIG_DIR: &str = "/etc/asset-scan";

/// Managed snapshots of asset OS disks, plus their SAS grants
pub struct AzureSnapshots {
    api: AzureApi,
}

impl AzureSnapshots {
    pub fn new(api: AzureApi) -> Self {
        Self { api }
    }

    fn id(&self, name: &str) -> String {
        self.api.config().resource_id(SNAPSHOT_TYPE, name)
    }
}

fn snapshot_body(spec: &SnapshotSpec) -> Value {
    json!({
        "location": spec.location,
        "properties": {
            "creationData": {
                "createOption": "Copy",
                "sourceResourceId": spec.source_volume
            }
        }
    })
}

#[async_trait]
impl ResourceClient<SnapshotSpec> for AzureSnapshots {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Snapshot
    }

    async fn observe(&self, name: &str) -> Result<Observation, ProviderError> {
        let body = self
            .api
            .get_json("getting snapshot", &self.id(name), DISK_API_VERSION, &[])
            .await?;
        observe_resource("getting snapshot", name, &body)
    }

    async fn create(&self, name: &str, spec: &SnapshotSpec) -> Result<(), ProviderError> {
        self.api
            .put_json(
                "creating snapshot",
                &self.id(name),
                DISK_API_VERSION,
                &snapshot_body(spec),
            )
            .await
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        self.api
            .delete("deleting snapshot", &self.id(name), DISK_API_VERSION)
            .await
    }
}

/// Access URL from a completed `beginGetAccess` operation
fn extract_access_sas(output: &Value) -> Option<&str> {
    output
        .get("accessSAS")
        .or_else(|| output.pointer("/output/accessSAS"))
        .or_else(|| output.pointer("/properties/output/accessSAS"))
        .and_then(Value::as_str)
}

#[async_trait]
impl SnapshotAccess for AzureSnapshots {
    async fn grant_read_access(
        &self,
        snapshot: &str,
        ttl: Duration,
    ) -> Result<AccessUrl, ProviderError> {
        let operation = "granting snapshot access";
        let output = self
            .api
            .post_action(
                operation,
                &self.id(snapshot),
                "beginGetAccess",
                DISK_API_VERSION,
                &json!({
                    "access": "Read",
                    "durationInSeconds": ttl.as_secs()
                }),
            )
            .await?;

        let sas = output
            .as_ref()
            .and_then(extract_access_sas)
            .ok_or_else(|| ProviderError::malformed(operation, "no accessSAS in grant result"))?;

        Ok(AccessUrl::new(sas))
    }

    async fn revoke_access(&self, snapshot: &str) -> Result<(), ProviderError> {
        self.api
            .post_action(
                "revoking snapshot access",
                &self.id(snapshot),
                "endGetAccess",
                DISK_API_VERSION,
                &json!({}),
            )
            .await?;
        Ok(())
    }
}

/// Managed disks materialized for scanning
pub struct AzureDisks {
    api: AzureApi,
}

impl AzureDisks {
    pub fn new(api: AzureApi) -> Self {
        Self { api }
    }

    fn id(&self, name: &str) -> String {
        self.api.config().resource_id(DISK_TYPE, name)
    }
}

fn disk_body(spec: &VolumeSpec) -> Value {
    let creation_data = match &spec.source {
        VolumeSource::Snapshot(snapshot) => json!({
            "createOption": "Copy",
            "sourceResourceId": snapshot.id
        }),
        VolumeSource::StagedCopy(staged) => json!({
            "createOption": "Import",
            "sourceUri": staged.url,
            "storageAccountId": staged.storage_account_id
        }),
    };

    json!({
        "location": spec.location,
        "sku": { "name": spec.storage_class },
        "properties": { "creationData": creation_data }
    })
}

#[async_trait]
impl ResourceClient<VolumeSpec> for AzureDisks {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Volume
    }

    async fn observe(&self, name: &str) -> Result<Observation, ProviderError> {
        let body = self
            .api
            .get_json("getting disk", &self.id(name), DISK_API_VERSION, &[])
            .await?;
        observe_resource("getting disk", name, &body)
    }

    async fn create(&self, name: &str, spec: &VolumeSpec) -> Result<(), ProviderError> {
        self.api
            .put_json("creating disk", &self.id(name), DISK_API_VERSION, &disk_body(spec))
            .await
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        self.api
            .delete("deleting disk", &self.id(name), DISK_API_VERSION)
            .await
    }
}

/// Scanner virtual machines
pub struct AzureScannerVms {
    api: AzureApi,
}

impl AzureScannerVms {
    pub fn new(api: AzureApi) -> Self {
        Self { api }
    }

    fn id(&self, name: &str) -> String {
        self.api.config().resource_id(VM_TYPE, name)
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Boot script that runs the scanner image against the attached volume
pub fn cloud_init_script(spec: &ScannerSpec) -> String {
    let config = STANDARD.encode(spec.cli_config.as_deref().unwrap_or_default());

    let mut scan_args = vec![
        "scan".to_string(),
        "--config".to_string(),
        format!("{}/config.yaml", SCANNER_CONFIG_DIR),
        "--asset-scan-id".to_string(),
        shell_quote(spec.asset_scan_id.as_str()),
        "--mount-attached-volume".to_string(),
    ];
    if let Some(server) = &spec.server_address {
        scan_args.push("--server".to_string());
        scan_args.push(shell_quote(server));
    }

    format!(
        r#"#!/bin/bash
set -euo pipefail

mkdir -p {dir}
echo '{config}' | base64 -d > {dir}/config.yaml

if ! command -v docker >/dev/null; then
  apt-get update -y
  apt-get install -y docker.io
fi
systemctl start docker

docker pull {image}
docker run --rm --privileged --net host -v /dev:/dev -v {dir}:{dir} {image} {args}
"#,
        dir = SCANNER_CONFIG_DIR,
        config = config,
        image = shell_quote(&spec.image),
        args = scan_args.join(" "),
    )
}

fn scanner_vm_body(
    config: &AzureConfig,
    name: &str,
    spec: &ScannerSpec,
) -> Result<Value, ProviderError> {
    let nic = spec.network_interface.as_ref().ok_or_else(|| {
        ProviderError::unsupported("creating scanner vm", "scanner vm needs a network interface")
    })?;

    let mut properties = json!({
        "hardwareProfile": { "vmSize": spec.compute_size },
        "storageProfile": {
            "imageReference": {
                "publisher": config.image.publisher,
                "offer": config.image.offer,
                "sku": config.image.sku,
                "version": config.image.version
            },
            "osDisk": {
                "createOption": "FromImage",
                "diskSizeGB": spec.os_disk_size_gb,
                "managedDisk": { "storageAccountType": spec.storage_class },
                "deleteOption": "Delete"
            },
            "dataDisks": [{
                "lun": 0,
                "createOption": "Attach",
                "managedDisk": { "id": spec.volume.id },
                "deleteOption": "Detach"
            }]
        },
        "osProfile": {
            "computerName": name,
            "adminUsername": config.admin_username,
            "customData": STANDARD.encode(cloud_init_script(spec)),
            "linuxConfiguration": {
                "disablePasswordAuthentication": true,
                "ssh": {
                    "publicKeys": [{
                        "path": format!("/home/{}/.ssh/authorized_keys", config.admin_username),
                        "keyData": config.public_key
                    }]
                }
            }
        },
        "networkProfile": {
            "networkInterfaces": [{
                "id": nic.id,
                "properties": { "primary": true, "deleteOption": "Delete" }
            }]
        }
    });

    if spec.use_spot {
        properties["priority"] = json!("Spot");
        properties["evictionPolicy"] = json!("Delete");
        // -1 caps at the on-demand price
        properties["billingProfile"] = json!({ "maxPrice": spec.max_spot_price.unwrap_or(-1.0) });
    }

    Ok(json!({
        "location": spec.location,
        "tags": { "asset-scan-id": spec.asset_scan_id.as_str() },
        "properties": properties
    }))
}

/// Ready once provisioned and powered on
fn vm_observation(name: &str, value: &Value) -> Result<Observation, ProviderError> {
    let mut observation = observe_resource("getting scanner vm", name, value)?;
    if observation.state != ResourceState::Ready {
        return Ok(observation);
    }

    let power_state = value
        .pointer("/properties/instanceView/statuses")
        .and_then(Value::as_array)
        .and_then(|statuses| {
            statuses
                .iter()
                .filter_map(|s| s.get("code").and_then(Value::as_str))
                .find(|code| code.starts_with("PowerState/"))
        })
        .unwrap_or("PowerState/unknown");

    if power_state != "PowerState/running" {
        observation.state = ResourceState::Provisioning;
        observation.status = power_state.to_string();
    }

    Ok(observation)
}

#[async_trait]
impl ResourceClient<ScannerSpec> for AzureScannerVms {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Scanner
    }

    async fn observe(&self, name: &str) -> Result<Observation, ProviderError> {
        let body = self
            .api
            .get_json(
                "getting scanner vm",
                &self.id(name),
                VM_API_VERSION,
                &[("$expand", "instanceView")],
            )
            .await?;
        vm_observation(name, &body)
    }

    async fn create(&self, name: &str, spec: &ScannerSpec) -> Result<(), ProviderError> {
        let body = scanner_vm_body(self.api.config(), name, spec)?;
        info!(
            name = %name,
            size = %spec.compute_size,
            spot = spec.use_spot,
            "Creating scanner vm"
        );
        self.api
            .put_json("creating scanner vm", &self.id(name), VM_API_VERSION, &body)
            .await
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        self.api
            .delete("deleting scanner vm", &self.id(name), VM_API_VERSION)
            .await
    }
}

/// Virtual machines of the subscription
pub struct AzureVmDiscovery {
    api: AzureApi,
}

impl AzureVmDiscovery {
    pub fn new(api: AzureApi) -> Self {
        Self { api }
    }
}

fn parse_vm_asset(value: &Value) -> Option<AssetInfo> {
    let name = value.get("name").and_then(Value::as_str)?;
    if is_scan_resource(name) {
        return None;
    }

    Some(AssetInfo::VirtualMachine {
        instance_id: value.get("id").and_then(Value::as_str)?.to_string(),
        name: name.to_string(),
        location: value.get("location").and_then(Value::as_str)?.to_string(),
        root_volume_id: value
            .pointer("/properties/storageProfile/osDisk/managedDisk/id")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[async_trait]
impl AssetDiscovery for AzureVmDiscovery {
    async fn list_assets(&self) -> Result<Vec<AssetInfo>, ProviderError> {
        let path = format!(
            "/subscriptions/{}/providers/{}",
            self.api.config().subscription_id,
            VM_TYPE
        );
        let vms = self
            .api
            .list("listing virtual machines", &path, VM_API_VERSION)
            .await?;

        let assets: Vec<AssetInfo> = vms.iter().filter_map(parse_vm_asset).collect();
        debug!(listed = vms.len(), assets = assets.len(), "Listed Azure virtual machines");
        Ok(assets)
    }
}
