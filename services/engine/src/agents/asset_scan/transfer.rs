//! Cross-Region Transfer
//!
//! Stages a snapshot into the destination region's object store through a
//! short-lived read grant and an asynchronous copy-from-URL. The grant is
//! revoked on the call that observes the copy succeed.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::errors::{classify, surface, Classification, ProviderError, ScanError, ScanResult};
use super::reconciler::ReconcileTiming;
use super::types::{ResourceHandle, ScanJobDescriptor};

const MIN_COPY_DELAY: Duration = Duration::from_secs(30);
const MAX_COPY_DELAY: Duration = Duration::from_secs(600);

/// One-time read URL returned by a snapshot access grant.
///
/// Only the grant call produces one. It cannot be cloned or serialized, and
/// handing it to [`StagedCopyStore::start_copy`] consumes it.
pub struct AccessUrl(String);

impl AccessUrl {
    pub(crate) fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessUrl(<redacted>)")
    }
}

/// Copy status reported by the destination object store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Failed,
    Aborted,
}

impl CopyStatus {
    /// Parse a storage copy status (`x-ms-copy-status`)
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "pending" => Some(CopyStatus::Pending),
            "success" => Some(CopyStatus::Success),
            "failed" => Some(CopyStatus::Failed),
            "aborted" => Some(CopyStatus::Aborted),
            _ => None,
        }
    }
}

/// Observed state of a staged object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyProgress {
    pub status: CopyStatus,
    pub bytes_copied: Option<u64>,
    pub total_bytes: Option<u64>,
}

impl CopyProgress {
    /// Parse a storage copy progress value (`"<copied>/<total>"`)
    pub fn with_progress(status: CopyStatus, raw: Option<&str>) -> Self {
        let parsed = raw.and_then(|raw| {
            let (copied, total) = raw.split_once('/')?;
            Some((copied.trim().parse().ok()?, total.trim().parse().ok()?))
        });

        Self {
            status,
            bytes_copied: parsed.map(|(copied, _)| copied),
            total_bytes: parsed.map(|(_, total)| total),
        }
    }
}

/// A completed staged copy, usable as an import source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedCopy {
    /// Stable URL of the staged object (carries no credential)
    pub url: String,
    /// Provider id of the storage account holding the object
    pub storage_account_id: String,
}

/// Temporary read access to a snapshot
#[async_trait]
pub trait SnapshotAccess: Send + Sync {
    async fn grant_read_access(
        &self,
        snapshot: &str,
        ttl: Duration,
    ) -> Result<AccessUrl, ProviderError>;

    /// Revoke every outstanding grant on the snapshot. Revoking when no grant
    /// exists succeeds.
    async fn revoke_access(&self, snapshot: &str) -> Result<(), ProviderError>;
}

/// Destination-region object store receiving staged copies
#[async_trait]
pub trait StagedCopyStore: Send + Sync {
    /// Copy state of the named object; not-found when it does not exist.
    async fn copy_status(&self, name: &str) -> Result<CopyProgress, ProviderError>;

    /// Start an asynchronous copy from the granted URL.
    async fn start_copy(&self, name: &str, source: AccessUrl) -> Result<(), ProviderError>;

    async fn delete(&self, name: &str) -> Result<(), ProviderError>;

    fn object_url(&self, name: &str) -> String;

    fn storage_account_id(&self) -> String;
}

/// Delay until the copy is likely to have made meaningful progress
pub fn estimate_copy_delay(progress: &CopyProgress, timing: &ReconcileTiming) -> Duration {
    match (progress.bytes_copied, progress.total_bytes) {
        (Some(copied), Some(total)) if total > 0 && timing.copy_throughput_bytes_per_sec > 0 => {
            let remaining = total.saturating_sub(copied);
            let secs = remaining.div_ceil(timing.copy_throughput_bytes_per_sec);
            Duration::from_secs(secs).clamp(MIN_COPY_DELAY, MAX_COPY_DELAY)
        }
        _ => timing.copy_estimate,
    }
}

/// Ensure the snapshot has been staged into the destination region.
pub async fn ensure_staged_copy(
    access: &dyn SnapshotAccess,
    store: &dyn StagedCopyStore,
    job: &ScanJobDescriptor,
    snapshot: &ResourceHandle,
    timing: &ReconcileTiming,
) -> ScanResult<StagedCopy> {
    let name = job.names().staged_copy;

    let progress = match store.copy_status(&name).await {
        Ok(progress) => progress,
        Err(err) => match classify(&err) {
            Classification::NotFound => {
                return start_transfer(access, store, job, snapshot, &name, timing).await
            }
            other => {
                return Err(other
                    .into_error()
                    .context(format!("looking up staged copy {}", name)))
            }
        },
    };

    match progress.status {
        CopyStatus::Pending => {
            let delay = estimate_copy_delay(&progress, timing);
            Err(ScanError::retryable(
                delay,
                format!(
                    "staged copy {} still copying ({}/{} bytes)",
                    name,
                    progress.bytes_copied.unwrap_or_default(),
                    progress.total_bytes.unwrap_or_default()
                ),
            ))
        }
        CopyStatus::Success => {
            revoke_grant(access, &snapshot.name).await?;
            info!(
                asset_scan_id = %job.asset_scan_id,
                name = %name,
                snapshot = %snapshot.name,
                "Staged copy complete, snapshot access revoked"
            );

            Ok(StagedCopy {
                url: store.object_url(&name),
                storage_account_id: store.storage_account_id(),
            })
        }
        CopyStatus::Failed | CopyStatus::Aborted => {
            warn!(
                asset_scan_id = %job.asset_scan_id,
                name = %name,
                status = ?progress.status,
                "Staged copy did not complete, restarting transfer"
            );

            revoke_grant(access, &snapshot.name).await?;
            delete_object(store, &name).await?;

            Err(ScanError::retryable(
                timing.copy_estimate,
                format!("staged copy {} ended {:?}, restarting", name, progress.status),
            ))
        }
    }
}

async fn start_transfer(
    access: &dyn SnapshotAccess,
    store: &dyn StagedCopyStore,
    job: &ScanJobDescriptor,
    snapshot: &ResourceHandle,
    name: &str,
    timing: &ReconcileTiming,
) -> ScanResult<StagedCopy> {
    let url = access
        .grant_read_access(&snapshot.name, timing.grant_ttl)
        .await
        .map_err(|err| surface(&err).context(format!("granting access to {}", snapshot.name)))?;

    info!(
        asset_scan_id = %job.asset_scan_id,
        snapshot = %snapshot.name,
        ttl_secs = timing.grant_ttl.as_secs(),
        "Snapshot read access granted"
    );

    if let Err(err) = store.start_copy(name, url).await {
        // The url is gone with the failed call, so the grant is useless now
        if let Err(revoke_err) = access.revoke_access(&snapshot.name).await {
            warn!(
                snapshot = %snapshot.name,
                error = %revoke_err,
                "Failed to revoke snapshot access after copy start failure, grant expires with its ttl"
            );
        }
        return Err(surface(&err).context(format!("starting copy into {}", name)));
    }

    info!(asset_scan_id = %job.asset_scan_id, name = %name, "Staged copy started");

    Err(ScanError::retryable(
        timing.copy_estimate,
        format!("staged copy {} started", name),
    ))
}

/// Tear down the staged copy, revoking any grant on the snapshot first.
pub async fn remove_staged_copy(
    access: &dyn SnapshotAccess,
    store: &dyn StagedCopyStore,
    job: &ScanJobDescriptor,
    timing: &ReconcileTiming,
) -> ScanResult<()> {
    let names = job.names();
    let name = names.staged_copy;

    let progress = match store.copy_status(&name).await {
        Ok(progress) => progress,
        Err(err) => match classify(&err) {
            Classification::NotFound => return Ok(()),
            other => {
                return Err(other
                    .into_error()
                    .context(format!("looking up staged copy {}", name)))
            }
        },
    };

    debug!(
        asset_scan_id = %job.asset_scan_id,
        name = %name,
        status = ?progress.status,
        "Removing staged copy"
    );

    // The success-path revoke may never have gone through
    revoke_grant(access, &names.snapshot).await?;

    delete_object(store, &name).await?;

    match store.copy_status(&name).await {
        Ok(_) => Err(ScanError::retryable(
            timing.deletion_estimate,
            format!("staged copy {} deletion in progress", name),
        )),
        Err(err) => match classify(&err) {
            Classification::NotFound => {
                info!(asset_scan_id = %job.asset_scan_id, name = %name, "Staged copy deleted");
                Ok(())
            }
            other => Err(other
                .into_error()
                .context(format!("looking up staged copy {}", name))),
        },
    }
}

async fn revoke_grant(access: &dyn SnapshotAccess, snapshot: &str) -> ScanResult<()> {
    match access.revoke_access(snapshot).await {
        Ok(()) => Ok(()),
        Err(err) => match classify(&err) {
            Classification::NotFound => Ok(()),
            other => Err(other
                .into_error()
                .context(format!("revoking access to {}", snapshot))),
        },
    }
}

async fn delete_object(store: &dyn StagedCopyStore, name: &str) -> ScanResult<()> {
    match store.delete(name).await {
        Ok(()) => Ok(()),
        Err(err) => match classify(&err) {
            Classification::NotFound => Ok(()),
            other => Err(other
                .into_error()
                .context(format!("deleting staged copy {}", name))),
        },
    }
}
