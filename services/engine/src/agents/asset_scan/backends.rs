//! Provider Back Ends
//!
//! Azure and Docker implementations of [`AssetScanProvider`], each composing
//! the shared reconciler over its own resource clients.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::errors::{surface, ScanError, ScanResult};
use super::provider::{AssetDiscovery, AssetScanProvider, ProviderClients, TransferClients};
use super::reconciler::{AssetScanReconciler, ReconcileTiming};
use super::types::{AssetInfo, AssetKind, ProviderKind, ScanJobDescriptor};
use crate::tools::azure::{
    AzureApi, AzureBlobStore, AzureConfig, AzureCredential, AzureDisks, AzureNetworkInterfaces,
    AzureScannerVms, AzureSnapshots, AzureVmDiscovery,
};
use crate::tools::docker::{
    DockerApi, DockerConfig, DockerDiscovery, DockerScanners, DockerSnapshots, DockerVolumes,
};

fn require_asset_kind(job: &ScanJobDescriptor, provider: ProviderKind, kind: AssetKind) -> ScanResult<()> {
    if job.asset.kind != kind {
        return Err(ScanError::fatal(format!(
            "{} provider cannot scan {} assets",
            provider, job.asset.kind
        )));
    }
    Ok(())
}

/// Virtual machines in an Azure subscription
pub struct AzureProvider {
    reconciler: AssetScanReconciler,
    discovery: Arc<dyn AssetDiscovery>,
}

impl AzureProvider {
    pub fn from_env() -> Result<Self> {
        let config = AzureConfig::from_env()?;
        let credential = AzureCredential::from_env()?;
        Ok(Self::new(AzureApi::new(config, credential)?))
    }

    pub fn new(api: AzureApi) -> Self {
        let snapshots = Arc::new(AzureSnapshots::new(api.clone()));
        let clients = ProviderClients {
            snapshots: snapshots.clone(),
            volumes: Arc::new(AzureDisks::new(api.clone())),
            network: Some(Arc::new(AzureNetworkInterfaces::new(api.clone()))),
            scanners: Arc::new(AzureScannerVms::new(api.clone())),
            transfer: Some(TransferClients {
                access: snapshots,
                store: Arc::new(AzureBlobStore::new(api.clone())),
            }),
        };

        Self::from_clients(
            clients,
            Arc::new(AzureVmDiscovery::new(api)),
            ReconcileTiming::default(),
        )
    }

    pub fn from_clients(
        clients: ProviderClients,
        discovery: Arc<dyn AssetDiscovery>,
        timing: ReconcileTiming,
    ) -> Self {
        Self {
            reconciler: AssetScanReconciler::new(clients, timing),
            discovery,
        }
    }
}

#[async_trait]
impl AssetScanProvider for AzureProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    async fn discover_assets(&self) -> ScanResult<Vec<AssetInfo>> {
        self.discovery.list_assets().await.map_err(|e| surface(&e))
    }

    async fn run_asset_scan(&self, job: &ScanJobDescriptor) -> ScanResult<()> {
        require_asset_kind(job, ProviderKind::Azure, AssetKind::VirtualMachine)?;
        self.reconciler.run(job).await
    }

    async fn remove_asset_scan(&self, job: &ScanJobDescriptor) -> ScanResult<()> {
        self.reconciler.remove(job).await
    }
}

/// Containers on one Docker daemon
pub struct DockerProvider {
    reconciler: AssetScanReconciler,
    discovery: Arc<dyn AssetDiscovery>,
}

impl DockerProvider {
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(DockerApi::new(DockerConfig::from_env()?)?))
    }

    pub fn new(api: DockerApi) -> Self {
        let clients = ProviderClients {
            snapshots: Arc::new(DockerSnapshots::new(api.clone())),
            volumes: Arc::new(DockerVolumes::new(api.clone())),
            network: None,
            scanners: Arc::new(DockerScanners::new(api.clone())),
            transfer: None,
        };

        Self::from_clients(
            clients,
            Arc::new(DockerDiscovery::new(api)),
            ReconcileTiming::local(),
        )
    }

    pub fn from_clients(
        clients: ProviderClients,
        discovery: Arc<dyn AssetDiscovery>,
        timing: ReconcileTiming,
    ) -> Self {
        Self {
            reconciler: AssetScanReconciler::new(clients, timing),
            discovery,
        }
    }

    fn validate(job: &ScanJobDescriptor) -> ScanResult<()> {
        require_asset_kind(job, ProviderKind::Docker, AssetKind::Container)?;
        if job.is_cross_region() {
            return Err(ScanError::fatal(format!(
                "docker provider cannot move snapshots from {} to {}",
                job.source_region, job.destination_region
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AssetScanProvider for DockerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }

    async fn discover_assets(&self) -> ScanResult<Vec<AssetInfo>> {
        self.discovery.list_assets().await.map_err(|e| surface(&e))
    }

    async fn run_asset_scan(&self, job: &ScanJobDescriptor) -> ScanResult<()> {
        Self::validate(job)?;
        self.reconciler.run(job).await
    }

    async fn remove_asset_scan(&self, job: &ScanJobDescriptor) -> ScanResult<()> {
        Self::validate(job)?;
        self.reconciler.remove(job).await
    }
}

/// Provider for `kind`, configured from the environment
pub fn build_provider(kind: ProviderKind) -> Result<Arc<dyn AssetScanProvider>> {
    info!(provider = %kind, "Configuring asset scan provider");

    let provider: Arc<dyn AssetScanProvider> = match kind {
        ProviderKind::Azure => Arc::new(AzureProvider::from_env()?),
        ProviderKind::Docker => Arc::new(DockerProvider::from_env()?),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::asset_scan::errors::ProviderError;
    use crate::agents::asset_scan::testing::{sample_job, SimDiscovery, SimulatedCloud};

    fn container_job(cross_region: bool) -> ScanJobDescriptor {
        let mut job = sample_job(cross_region);
        job.asset.kind = AssetKind::Container;
        job.asset.id = "abc123".to_string();
        job.asset.volume = "abc123".to_string();
        job
    }

    fn docker_provider(cloud: &SimulatedCloud) -> DockerProvider {
        let mut clients = cloud.clients(false);
        clients.transfer = None;
        DockerProvider::from_clients(
            clients,
            Arc::new(SimDiscovery(Vec::new())),
            ReconcileTiming::local(),
        )
    }

    #[tokio::test]
    async fn test_docker_rejects_cross_region_jobs() {
        let cloud = SimulatedCloud::new(0);
        let provider = docker_provider(&cloud);

        let err = provider.run_asset_scan(&container_job(true)).await.unwrap_err();

        assert!(err.is_fatal());
        assert!(err.reason().contains("eastus"));
        assert_eq!(cloud.snapshots.observes(), 0);
        assert_eq!(cloud.transfer.grants(), 0);
    }

    #[tokio::test]
    async fn test_docker_rejects_vm_assets() {
        let cloud = SimulatedCloud::new(0);
        let provider = docker_provider(&cloud);

        let err = provider.run_asset_scan(&sample_job(false)).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.reason().contains("virtual_machine"));
    }

    #[tokio::test]
    async fn test_docker_converges_without_network() {
        let cloud = SimulatedCloud::new(0);
        let provider = docker_provider(&cloud);
        let job = container_job(false);

        let mut calls = 0;
        while provider.run_asset_scan(&job).await.is_err() {
            calls += 1;
            assert!(calls < 10, "did not converge");
        }

        assert_eq!(cloud.network.creates(), 0);
        assert_eq!(cloud.scanners.creates(), 1);

        provider.remove_asset_scan(&job).await.unwrap();
        assert_eq!(cloud.snapshots.live(), 0);
    }

    #[tokio::test]
    async fn test_azure_rejects_container_assets() {
        let cloud = SimulatedCloud::new(0);
        let provider = AzureProvider::from_clients(
            cloud.clients(true),
            Arc::new(SimDiscovery(Vec::new())),
            ReconcileTiming::default(),
        );

        let err = provider.run_asset_scan(&container_job(false)).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(cloud.snapshots.creates(), 0);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_classified() {
        struct Unauthorized;

        #[async_trait]
        impl AssetDiscovery for Unauthorized {
            async fn list_assets(&self) -> Result<Vec<AssetInfo>, ProviderError> {
                Err(ProviderError::api(
                    "listing virtual machines",
                    403,
                    Some("AuthorizationFailed"),
                    "no access",
                ))
            }
        }

        let cloud = SimulatedCloud::new(0);
        let provider =
            AzureProvider::from_clients(cloud.clients(true), Arc::new(Unauthorized), ReconcileTiming::default());

        let err = provider.discover_assets().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.reason().contains("AuthorizationFailed"));
    }
}
