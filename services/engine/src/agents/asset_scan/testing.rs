//! In-memory provider doubles for reconciler tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::errors::ProviderError;
use super::provider::{AssetDiscovery, ProviderClients, TransferClients};
use super::reconciler::{AssetScanReconciler, ReconcileTiming, ResourceClient};
use super::scanner::{NetworkSpec, ScannerSpec};
use super::snapshot::SnapshotSpec;
use super::transfer::{AccessUrl, CopyProgress, CopyStatus, SnapshotAccess, StagedCopyStore};
use super::types::{
    AssetInfo, AssetKind, AssetScanId, AssetTarget, Observation, ResourceHandle, ResourceKind,
    ResourceState, ScanJobDescriptor, ScannerResources, ScannerSettings,
};
use super::volume::VolumeSpec;

/// Job descriptor for tests, optionally crossing regions
pub fn sample_job(cross_region: bool) -> ScanJobDescriptor {
    ScanJobDescriptor {
        asset_scan_id: AssetScanId::parse("scan-0001").unwrap(),
        asset: AssetTarget {
            kind: AssetKind::VirtualMachine,
            id: "/subscriptions/sub/resourceGroups/prod/providers/Microsoft.Compute/virtualMachines/web-1".to_string(),
            volume: "/subscriptions/sub/resourceGroups/prod/providers/Microsoft.Compute/disks/web-1-os".to_string(),
        },
        source_region: "eastus".to_string(),
        destination_region: if cross_region { "westeurope" } else { "eastus" }.to_string(),
        resources: ScannerResources {
            volume_storage_class: "StandardSSD_LRS".to_string(),
            compute_size: "Standard_D2s_v3".to_string(),
            os_disk_size_gb: 30,
            use_spot_instances: false,
            max_spot_price: None,
        },
        scanner: ScannerSettings {
            image: "ghcr.io/openclarity/vmclarity-cli:latest".to_string(),
            cli_config: Some("analyzers: [syft]".to_string()),
            server_address: None,
        },
    }
}

#[derive(Debug, Clone, Copy)]
enum SimState {
    Provisioning(usize),
    Ready,
    Failed,
    Partial,
    Deleting(usize),
}

/// Resource client keeping resources in memory.
///
/// A created resource reports `Provisioning` for `provisioning_polls`
/// observations before turning ready. A deleted one stays visible for
/// `deletion_polls` observations.
pub struct SimResourceClient<S> {
    kind: ResourceKind,
    provisioning_polls: usize,
    deletion_polls: AtomicUsize,
    resources: Mutex<HashMap<String, SimState>>,
    specs: Mutex<Vec<S>>,
    observes: AtomicUsize,
    creates: AtomicUsize,
    deletes: AtomicUsize,
    observe_error: Mutex<Option<ProviderError>>,
    create_error: Mutex<Option<ProviderError>>,
}

impl<S: Clone> SimResourceClient<S> {
    pub fn new(kind: ResourceKind, provisioning_polls: usize) -> Self {
        Self {
            kind,
            provisioning_polls,
            deletion_polls: AtomicUsize::new(0),
            resources: Mutex::new(HashMap::new()),
            specs: Mutex::new(Vec::new()),
            observes: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            observe_error: Mutex::new(None),
            create_error: Mutex::new(None),
        }
    }

    pub fn set_deletion_polls(&self, polls: usize) {
        self.deletion_polls.store(polls, Ordering::SeqCst);
    }

    pub fn insert_ready(&self, name: &str) {
        self.resources
            .lock()
            .unwrap()
            .insert(name.to_string(), SimState::Ready);
    }

    pub fn insert_failed(&self, name: &str) {
        self.resources
            .lock()
            .unwrap()
            .insert(name.to_string(), SimState::Failed);
    }

    /// A resource whose create stopped halfway; observed as `Absent`
    pub fn insert_partial(&self, name: &str) {
        self.resources
            .lock()
            .unwrap()
            .insert(name.to_string(), SimState::Partial);
    }

    /// Every observation fails with `err` from now on
    pub fn fail_observe(&self, err: ProviderError) {
        *self.observe_error.lock().unwrap() = Some(err);
    }

    /// Every create fails with `err` from now on
    pub fn fail_create(&self, err: ProviderError) {
        *self.create_error.lock().unwrap() = Some(err);
    }

    pub fn last_spec(&self) -> Option<S> {
        self.specs.lock().unwrap().last().cloned()
    }

    pub fn observes(&self) -> usize {
        self.observes.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Resources currently visible, including ones being deleted
    pub fn live(&self) -> usize {
        self.resources.lock().unwrap().len()
    }

    fn handle(&self, name: &str) -> ResourceHandle {
        ResourceHandle::new(name, format!("sim://{}/{}", self.kind, name))
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> ResourceClient<S> for SimResourceClient<S> {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn observe(&self, name: &str) -> Result<Observation, ProviderError> {
        self.observes.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.observe_error.lock().unwrap().clone() {
            return Err(err);
        }

        let mut resources = self.resources.lock().unwrap();
        let (state, status) = match resources.get(name).copied() {
            None => return Err(ProviderError::not_found(format!("getting {}", self.kind))),
            Some(SimState::Provisioning(0)) => {
                resources.insert(name.to_string(), SimState::Ready);
                (ResourceState::Ready, "Succeeded")
            }
            Some(SimState::Provisioning(left)) => {
                resources.insert(name.to_string(), SimState::Provisioning(left - 1));
                (ResourceState::Provisioning, "Creating")
            }
            Some(SimState::Ready) => (ResourceState::Ready, "Succeeded"),
            Some(SimState::Failed) => (ResourceState::Failed, "Failed"),
            Some(SimState::Partial) => (ResourceState::Absent, "Incomplete"),
            Some(SimState::Deleting(0)) => {
                resources.remove(name);
                return Err(ProviderError::not_found(format!("getting {}", self.kind)));
            }
            Some(SimState::Deleting(left)) => {
                resources.insert(name.to_string(), SimState::Deleting(left - 1));
                (ResourceState::Provisioning, "Deleting")
            }
        };

        Ok(Observation::new(self.handle(name), state, status))
    }

    async fn create(&self, name: &str, spec: &S) -> Result<(), ProviderError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.create_error.lock().unwrap().clone() {
            return Err(err);
        }

        self.specs.lock().unwrap().push(spec.clone());
        let mut resources = self.resources.lock().unwrap();
        if matches!(resources.get(name), None | Some(SimState::Partial)) {
            resources.insert(
                name.to_string(),
                SimState::Provisioning(self.provisioning_polls),
            );
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);

        let polls = self.deletion_polls.load(Ordering::SeqCst);
        let mut resources = self.resources.lock().unwrap();
        match resources.get(name).copied() {
            None => Err(ProviderError::not_found(format!("deleting {}", self.kind))),
            Some(SimState::Deleting(_)) => Ok(()),
            Some(_) => {
                resources.insert(name.to_string(), SimState::Deleting(polls));
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SimCopy {
    remaining_polls: usize,
    fails: bool,
}

const SIM_COPY_BYTES: u64 = 30 * 1024 * 1024 * 1024;

/// Snapshot grants and staged copies in memory.
///
/// A started copy reports `Pending` for `copy_polls` observations, then
/// `Success` (or `Failed` after [`SimTransfer::fail_next_copy`]).
pub struct SimTransfer {
    copy_polls: usize,
    objects: Mutex<HashMap<String, SimCopy>>,
    grants: AtomicUsize,
    revokes: AtomicUsize,
    active_grants: AtomicUsize,
    deletes: AtomicUsize,
    start_error: Mutex<Option<ProviderError>>,
    revoke_error: Mutex<Option<ProviderError>>,
    fail_next: Mutex<bool>,
}

impl SimTransfer {
    pub fn new(copy_polls: usize) -> Self {
        Self {
            copy_polls,
            objects: Mutex::new(HashMap::new()),
            grants: AtomicUsize::new(0),
            revokes: AtomicUsize::new(0),
            active_grants: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            start_error: Mutex::new(None),
            revoke_error: Mutex::new(None),
            fail_next: Mutex::new(false),
        }
    }

    pub fn fail_start(&self, err: ProviderError) {
        *self.start_error.lock().unwrap() = Some(err);
    }

    /// The next revoke fails with `err`
    pub fn fail_next_revoke(&self, err: ProviderError) {
        *self.revoke_error.lock().unwrap() = Some(err);
    }

    pub fn fail_next_copy(&self) {
        *self.fail_next.lock().unwrap() = true;
    }

    pub fn grants(&self) -> usize {
        self.grants.load(Ordering::SeqCst)
    }

    /// Revocations that closed an open grant
    pub fn revokes(&self) -> usize {
        self.revokes.load(Ordering::SeqCst)
    }

    /// Grants issued and not yet revoked
    pub fn active_grants(&self) -> usize {
        self.active_grants.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotAccess for SimTransfer {
    async fn grant_read_access(
        &self,
        snapshot: &str,
        ttl: Duration,
    ) -> Result<AccessUrl, ProviderError> {
        self.grants.fetch_add(1, Ordering::SeqCst);
        self.active_grants.fetch_add(1, Ordering::SeqCst);
        Ok(AccessUrl::new(format!(
            "https://md-sim.blob.example/{}/abcd?se={}&sig=secret",
            snapshot,
            ttl.as_secs()
        )))
    }

    async fn revoke_access(&self, _snapshot: &str) -> Result<(), ProviderError> {
        if let Some(err) = self.revoke_error.lock().unwrap().take() {
            return Err(err);
        }
        if self.active_grants.swap(0, Ordering::SeqCst) > 0 {
            self.revokes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl StagedCopyStore for SimTransfer {
    async fn copy_status(&self, name: &str) -> Result<CopyProgress, ProviderError> {
        let mut objects = self.objects.lock().unwrap();
        let copy = objects
            .get_mut(name)
            .ok_or_else(|| ProviderError::api("getting blob", 404, Some("BlobNotFound"), "missing"))?;

        let status = match (copy.remaining_polls, copy.fails) {
            (0, true) => CopyStatus::Failed,
            (0, false) => CopyStatus::Success,
            _ => {
                copy.remaining_polls -= 1;
                CopyStatus::Pending
            }
        };

        let copied = SIM_COPY_BYTES / (copy.remaining_polls as u64 + 1);
        Ok(CopyProgress {
            status,
            bytes_copied: Some(copied),
            total_bytes: Some(SIM_COPY_BYTES),
        })
    }

    async fn start_copy(&self, name: &str, source: AccessUrl) -> Result<(), ProviderError> {
        if let Some(err) = self.start_error.lock().unwrap().clone() {
            return Err(err);
        }
        assert!(source.expose().contains("sig="));

        let fails = std::mem::take(&mut *self.fail_next.lock().unwrap());
        self.objects.lock().unwrap().insert(
            name.to_string(),
            SimCopy {
                remaining_polls: self.copy_polls,
                fails,
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        match self.objects.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(ProviderError::api("deleting blob", 404, Some("BlobNotFound"), "missing")),
        }
    }

    fn object_url(&self, name: &str) -> String {
        format!("https://scanner.blob.example/scans/{}", name)
    }

    fn storage_account_id(&self) -> String {
        "/subscriptions/sub/resourceGroups/scanner/providers/Microsoft.Storage/storageAccounts/scanner"
            .to_string()
    }
}

/// Discovery double returning a fixed asset list
pub struct SimDiscovery(pub Vec<AssetInfo>);

#[async_trait]
impl AssetDiscovery for SimDiscovery {
    async fn list_assets(&self) -> Result<Vec<AssetInfo>, ProviderError> {
        Ok(self.0.clone())
    }
}

/// A whole provider account in memory
pub struct SimulatedCloud {
    pub snapshots: Arc<SimResourceClient<SnapshotSpec>>,
    pub volumes: Arc<SimResourceClient<VolumeSpec>>,
    pub network: Arc<SimResourceClient<NetworkSpec>>,
    pub scanners: Arc<SimResourceClient<ScannerSpec>>,
    pub transfer: Arc<SimTransfer>,
}

impl SimulatedCloud {
    pub fn new(provisioning_polls: usize) -> Self {
        Self {
            snapshots: Arc::new(SimResourceClient::new(
                ResourceKind::Snapshot,
                provisioning_polls,
            )),
            volumes: Arc::new(SimResourceClient::new(ResourceKind::Volume, provisioning_polls)),
            network: Arc::new(SimResourceClient::new(
                ResourceKind::NetworkInterface,
                provisioning_polls,
            )),
            scanners: Arc::new(SimResourceClient::new(ResourceKind::Scanner, provisioning_polls)),
            transfer: Arc::new(SimTransfer::new(provisioning_polls)),
        }
    }

    pub fn with_deletion_polls(self, polls: usize) -> Self {
        self.snapshots.set_deletion_polls(polls);
        self.volumes.set_deletion_polls(polls);
        self.network.set_deletion_polls(polls);
        self.scanners.set_deletion_polls(polls);
        self
    }

    pub fn clients(&self, with_network: bool) -> ProviderClients {
        let network: Option<Arc<dyn ResourceClient<NetworkSpec>>> = if with_network {
            Some(self.network.clone())
        } else {
            None
        };

        ProviderClients {
            snapshots: self.snapshots.clone(),
            volumes: self.volumes.clone(),
            network,
            scanners: self.scanners.clone(),
            transfer: Some(TransferClients {
                access: self.transfer.clone(),
                store: self.transfer.clone(),
            }),
        }
    }

    pub fn reconciler(&self, with_network: bool) -> AssetScanReconciler {
        AssetScanReconciler::new(self.clients(with_network), ReconcileTiming::default())
    }
}
