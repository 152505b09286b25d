//! Asset Scan Provider Contract
//!
//! One implementation per provider family. Each composes the shared ensure
//! steps over its own resource clients.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use super::errors::{ProviderError, ScanResult};
use super::reconciler::ResourceClient;
use super::scanner::{NetworkSpec, ScannerSpec};
use super::snapshot::SnapshotSpec;
use super::transfer::{SnapshotAccess, StagedCopyStore};
use super::types::{AssetInfo, DiscoveredAsset, ProviderKind, ScanJobDescriptor};
use super::volume::VolumeSpec;

/// Capability set every provider family offers
#[async_trait]
pub trait AssetScanProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// List the scannable assets visible to this provider
    async fn discover_assets(&self) -> ScanResult<Vec<AssetInfo>>;

    /// One reconcile pass towards a ready scanner. `Ok(())` means every
    /// resource is ready and the scanner is running.
    async fn run_asset_scan(&self, job: &ScanJobDescriptor) -> ScanResult<()>;

    /// One teardown pass. `Ok(())` means every resource of the job is gone.
    async fn remove_asset_scan(&self, job: &ScanJobDescriptor) -> ScanResult<()>;
}

/// Provider-side asset listing
#[async_trait]
pub trait AssetDiscovery: Send + Sync {
    async fn list_assets(&self) -> Result<Vec<AssetInfo>, ProviderError>;
}

/// Snapshot grant plus destination store used for cross-region staging
#[derive(Clone)]
pub struct TransferClients {
    pub access: Arc<dyn SnapshotAccess>,
    pub store: Arc<dyn StagedCopyStore>,
}

/// Resource clients of one provider
#[derive(Clone)]
pub struct ProviderClients {
    pub snapshots: Arc<dyn ResourceClient<SnapshotSpec>>,
    pub volumes: Arc<dyn ResourceClient<VolumeSpec>>,
    /// Providers whose compute needs a separate network interface
    pub network: Option<Arc<dyn ResourceClient<NetworkSpec>>>,
    pub scanners: Arc<dyn ResourceClient<ScannerSpec>>,
    /// `None` when the provider cannot cross regions
    pub transfer: Option<TransferClients>,
}

/// Discover assets from every provider concurrently.
///
/// A failing provider is logged and skipped so one unreachable account does
/// not hide the others.
pub async fn discover_all(providers: &[Arc<dyn AssetScanProvider>]) -> Vec<DiscoveredAsset> {
    let results = join_all(providers.iter().map(|provider| async move {
        (provider.kind(), provider.discover_assets().await)
    }))
    .await;

    let mut discovered = Vec::new();
    for (kind, result) in results {
        match result {
            Ok(assets) => {
                info!(provider = %kind, count = assets.len(), "Discovered assets");
                let now = chrono::Utc::now();
                discovered.extend(assets.into_iter().map(|asset| DiscoveredAsset {
                    provider: kind,
                    asset,
                    discovered_at: now,
                }));
            }
            Err(e) => warn!(provider = %kind, error = %e, "Failed to discover assets"),
        }
    }

    discovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::asset_scan::errors::ScanError;

    struct FixedProvider {
        kind: ProviderKind,
        assets: ScanResult<Vec<AssetInfo>>,
    }

    #[async_trait]
    impl AssetScanProvider for FixedProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn discover_assets(&self) -> ScanResult<Vec<AssetInfo>> {
            self.assets.clone()
        }

        async fn run_asset_scan(&self, _job: &ScanJobDescriptor) -> ScanResult<()> {
            Ok(())
        }

        async fn remove_asset_scan(&self, _job: &ScanJobDescriptor) -> ScanResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_discover_all_skips_failing_provider() {
        let container = AssetInfo::Container {
            container_id: "abc".to_string(),
            name: "web".to_string(),
            image: "nginx".to_string(),
            location: "local".to_string(),
        };
        let providers: Vec<Arc<dyn AssetScanProvider>> = vec![
            Arc::new(FixedProvider {
                kind: ProviderKind::Azure,
                assets: Err(ScanError::fatal("AuthorizationFailed")),
            }),
            Arc::new(FixedProvider {
                kind: ProviderKind::Docker,
                assets: Ok(vec![container.clone()]),
            }),
        ];

        let discovered = discover_all(&providers).await;

        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].provider, ProviderKind::Docker);
        assert_eq!(discovered[0].asset, container);
    }
}
