//! Volume Ensurer

use std::future::Future;
use tracing::debug;

use super::errors::ScanResult;
use super::reconciler::{ensure, ReconcileTiming, ResourceClient};
use super::transfer::StagedCopy;
use super::types::{ResourceHandle, ScanJobDescriptor};

/// Where the scannable volume is materialized from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    /// Same-region snapshot
    Snapshot(ResourceHandle),
    /// Import of a staged copy in the destination region
    StagedCopy(StagedCopy),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Destination (scanner) region
    pub location: String,
    pub storage_class: String,
    pub source: VolumeSource,
}

/// Ensure the scannable volume exists and is ready.
///
/// `resolve_source` only runs when the volume does not exist yet, so a
/// cross-region transfer is never re-entered after its import started.
pub async fn ensure_volume<F, Fut>(
    client: &dyn ResourceClient<VolumeSpec>,
    job: &ScanJobDescriptor,
    timing: &ReconcileTiming,
    resolve_source: F,
) -> ScanResult<ResourceHandle>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = ScanResult<VolumeSource>> + Send,
{
    let name = job.names().volume;
    debug!(asset_scan_id = %job.asset_scan_id, name = %name, "Ensuring volume");

    ensure(client, &name, timing.volume_estimate, move || async move {
        let source = resolve_source().await?;
        Ok(VolumeSpec {
            location: job.destination_region.clone(),
            storage_class: job.resources.volume_storage_class.clone(),
            source,
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::asset_scan::errors::ScanError;
    use crate::agents::asset_scan::testing::{sample_job, SimResourceClient};
    use crate::agents::asset_scan::types::ResourceKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_source_resolved_only_while_absent() {
        let client = SimResourceClient::<VolumeSpec>::new(ResourceKind::Volume, 1);
        let job = sample_job(false);
        let timing = ReconcileTiming::default();
        let counter = AtomicUsize::new(0);
        let resolved = &counter;

        for _ in 0..3 {
            let _ = ensure_volume(&client, &job, &timing, move || async move {
                resolved.fetch_add(1, Ordering::SeqCst);
                Ok(VolumeSource::Snapshot(ResourceHandle::new("snap", "sim://snap")))
            })
            .await;
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(client.creates(), 1);

        let spec = client.last_spec().unwrap();
        assert_eq!(spec.location, job.destination_region);
        assert_eq!(spec.storage_class, "StandardSSD_LRS");
    }

    #[tokio::test]
    async fn test_unready_source_blocks_creation() {
        let client = SimResourceClient::<VolumeSpec>::new(ResourceKind::Volume, 0);
        let job = sample_job(true);

        let err = ensure_volume(&client, &job, &ReconcileTiming::default(), || async {
            Err::<VolumeSource, _>(ScanError::retryable(Duration::from_secs(60), "still copying"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.reason(), "still copying");
        assert_eq!(client.creates(), 0);
    }

    #[tokio::test]
    async fn test_import_from_staged_copy() {
        let client = SimResourceClient::<VolumeSpec>::new(ResourceKind::Volume, 0);
        let job = sample_job(true);
        let staged = StagedCopy {
            url: "https://scanner.blob.example/scans/x.vhd".to_string(),
            storage_account_id: "/subscriptions/s/storageAccounts/scanner".to_string(),
        };

        let source = staged.clone();
        assert!(ensure_volume(&client, &job, &ReconcileTiming::default(), move || async move {
            Ok(VolumeSource::StagedCopy(source))
        })
        .await
        .is_err());

        assert_eq!(
            client.last_spec().unwrap().source,
            VolumeSource::StagedCopy(staged)
        );
    }
}
