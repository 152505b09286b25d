//! Snapshot Ensurer

use tracing::debug;

use super::errors::ScanResult;
use super::reconciler::{ensure, ReconcileTiming, ResourceClient};
use super::types::{ResourceHandle, ScanJobDescriptor};

/// What a provider needs to snapshot the asset's volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSpec {
    /// Region of the asset; the snapshot is created next to its source
    pub location: String,
    /// Provider reference of the volume to snapshot
    pub source_volume: String,
}

impl SnapshotSpec {
    pub fn for_job(job: &ScanJobDescriptor) -> Self {
        Self {
            location: job.source_region.clone(),
            source_volume: job.asset.volume.clone(),
        }
    }
}

/// Ensure the point-in-time snapshot of the asset's volume exists and is ready.
pub async fn ensure_snapshot(
    client: &dyn ResourceClient<SnapshotSpec>,
    job: &ScanJobDescriptor,
    timing: &ReconcileTiming,
) -> ScanResult<ResourceHandle> {
    let name = job.names().snapshot;
    debug!(asset_scan_id = %job.asset_scan_id, name = %name, "Ensuring snapshot");

    ensure(client, &name, timing.snapshot_estimate, move || async move {
        Ok(SnapshotSpec::for_job(job))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::asset_scan::errors::ProviderError;
    use crate::agents::asset_scan::testing::{sample_job, SimResourceClient};
    use crate::agents::asset_scan::types::ResourceKind;

    #[tokio::test]
    async fn test_snapshot_created_then_polled_until_ready() {
        let client = SimResourceClient::<SnapshotSpec>::new(ResourceKind::Snapshot, 1);
        let job = sample_job(false);
        let timing = ReconcileTiming::default();

        let err = ensure_snapshot(&client, &job, &timing).await.unwrap_err();
        assert_eq!(err.suggested_delay(), Some(timing.snapshot_estimate));

        let spec = client.last_spec().unwrap();
        assert_eq!(spec.source_volume, job.asset.volume);
        assert_eq!(spec.location, job.source_region);

        assert!(ensure_snapshot(&client, &job, &timing).await.is_err());

        let handle = ensure_snapshot(&client, &job, &timing).await.unwrap();
        assert_eq!(handle.name, job.names().snapshot);
        assert_eq!(client.creates(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_lookup_throttled() {
        let client = SimResourceClient::<SnapshotSpec>::new(ResourceKind::Snapshot, 0);
        client.fail_observe(ProviderError::api("getting snapshot", 429, None, "slow down"));

        let err = ensure_snapshot(&client, &sample_job(false), &ReconcileTiming::default())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(client.creates(), 0);
    }
}
