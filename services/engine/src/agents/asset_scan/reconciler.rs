//! Asset Scan Reconciler
//!
//! Stateless ensure/poll logic shared by every provider. Each call derives
//! resource state from the provider by deterministic name, issues at most one
//! asynchronous action, and returns either the ready resource or a
//! [`ScanError`] telling the driving loop when to call again.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::errors::{classify, surface, Classification, ProviderError, ScanError, ScanResult};
use super::provider::ProviderClients;
use super::scanner::{ensure_network_interface, ensure_scanner};
use super::snapshot::ensure_snapshot;
use super::transfer::{ensure_staged_copy, remove_staged_copy};
use super::types::{Observation, ResourceHandle, ResourceKind, ResourceState, ScanJobDescriptor};
use super::volume::{ensure_volume, VolumeSource};

/// Minimal per-provider capability for one resource kind
#[async_trait]
pub trait ResourceClient<S: Sync>: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Look the resource up by name. A missing resource is reported as a
    /// provider not-found error, which the reconciler turns into `Absent`.
    async fn observe(&self, name: &str) -> Result<Observation, ProviderError>;

    /// Start creating the resource. Must not wait for provisioning to finish.
    async fn create(&self, name: &str, spec: &S) -> Result<(), ProviderError>;

    /// Request deletion. Deleting a missing resource may report not-found.
    async fn delete(&self, name: &str) -> Result<(), ProviderError>;
}

/// Provisioning-delay estimates suggested to the driving loop
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileTiming {
    pub snapshot_estimate: Duration,
    pub copy_estimate: Duration,
    pub volume_estimate: Duration,
    pub network_estimate: Duration,
    pub scanner_estimate: Duration,
    pub deletion_estimate: Duration,
    /// Lifetime of the snapshot read grant used for cross-region copies
    pub grant_ttl: Duration,
    /// Assumed copy throughput for remaining-copy estimates
    pub copy_throughput_bytes_per_sec: u64,
}

impl Default for ReconcileTiming {
    /// Cloud timings: every long-running operation is on the order of minutes.
    fn default() -> Self {
        Self {
            snapshot_estimate: Duration::from_secs(120),
            copy_estimate: Duration::from_secs(120),
            volume_estimate: Duration::from_secs(120),
            network_estimate: Duration::from_secs(15),
            scanner_estimate: Duration::from_secs(120),
            deletion_estimate: Duration::from_secs(30),
            grant_ttl: Duration::from_secs(3600),
            copy_throughput_bytes_per_sec: 64 * 1024 * 1024,
        }
    }
}

impl ReconcileTiming {
    /// Local container runtime timings
    pub fn local() -> Self {
        Self {
            snapshot_estimate: Duration::from_secs(5),
            copy_estimate: Duration::from_secs(5),
            volume_estimate: Duration::from_secs(5),
            network_estimate: Duration::from_secs(1),
            scanner_estimate: Duration::from_secs(5),
            deletion_estimate: Duration::from_secs(2),
            ..Self::default()
        }
    }
}

/// Observe a resource by name; `None` when it does not exist.
pub async fn observe<S: Sync>(
    client: &dyn ResourceClient<S>,
    name: &str,
) -> ScanResult<Option<Observation>> {
    match client.observe(name).await {
        Ok(observation) if observation.state == ResourceState::Absent => Ok(None),
        Ok(observation) => Ok(Some(observation)),
        Err(err) => match classify(&err) {
            Classification::NotFound => Ok(None),
            other => Err(other
                .into_error()
                .context(format!("looking up {} {}", client.kind(), name))),
        },
    }
}

/// Ensure a resource exists and is ready.
///
/// `resolve_spec` only runs when the resource is absent, so upstream steps
/// that produce it (e.g. a cross-region transfer) are not re-entered once the
/// resource has been created.
pub async fn ensure<S, F, Fut>(
    client: &dyn ResourceClient<S>,
    name: &str,
    estimate: Duration,
    resolve_spec: F,
) -> ScanResult<ResourceHandle>
where
    S: Send + Sync,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = ScanResult<S>> + Send,
{
    let kind = client.kind();

    if let Some(observed) = observe(client, name).await? {
        return match observed.state {
            ResourceState::Ready => {
                debug!(resource = %kind, name = %name, "Resource ready");
                Ok(observed.handle)
            }
            ResourceState::Failed => Err(ScanError::fatal(format!(
                "{} {} failed to provision, provisioning state: {}",
                kind, name, observed.status
            ))),
            ResourceState::Provisioning | ResourceState::Absent => {
                debug!(
                    resource = %kind,
                    name = %name,
                    state = %observed.status,
                    "Resource still provisioning"
                );
                Err(ScanError::retryable(
                    estimate,
                    format!(
                        "{} {} is not ready yet, provisioning state: {}",
                        kind, name, observed.status
                    ),
                ))
            }
        };
    }

    let spec = resolve_spec().await?;

    client
        .create(name, &spec)
        .await
        .map_err(|err| surface(&err).context(format!("creating {} {}", kind, name)))?;

    info!(resource = %kind, name = %name, "Resource creation started");

    Err(ScanError::retryable(
        estimate,
        format!("{} {} creation started", kind, name),
    ))
}

/// Whether anything is left under `name`. A partially created resource,
/// observed as `Absent`, still exists.
async fn exists<S: Sync>(client: &dyn ResourceClient<S>, name: &str) -> ScanResult<bool> {
    match client.observe(name).await {
        Ok(_) => Ok(true),
        Err(err) => match classify(&err) {
            Classification::NotFound => Ok(false),
            other => Err(other
                .into_error()
                .context(format!("looking up {} {}", client.kind(), name))),
        },
    }
}

/// Ensure a resource no longer exists. Missing resources are success.
pub async fn ensure_absent<S: Sync>(
    client: &dyn ResourceClient<S>,
    name: &str,
    estimate: Duration,
) -> ScanResult<()> {
    let kind = client.kind();

    if !exists(client, name).await? {
        debug!(resource = %kind, name = %name, "Resource absent");
        return Ok(());
    }

    if let Err(err) = client.delete(name).await {
        match classify(&err) {
            Classification::NotFound => return Ok(()),
            other => {
                return Err(other
                    .into_error()
                    .context(format!("deleting {} {}", kind, name)))
            }
        }
    }

    // Synchronous providers are already done at this point
    if !exists(client, name).await? {
        info!(resource = %kind, name = %name, "Resource deleted");
        return Ok(());
    }

    info!(resource = %kind, name = %name, "Resource deletion in progress");
    Err(ScanError::retryable(
        estimate,
        format!("{} {} deletion in progress", kind, name),
    ))
}

/// Composes the ensure steps of one provider in dependency order.
pub struct AssetScanReconciler {
    clients: ProviderClients,
    timing: ReconcileTiming,
}

impl AssetScanReconciler {
    pub fn new(clients: ProviderClients, timing: ReconcileTiming) -> Self {
        Self { clients, timing }
    }

    pub fn timing(&self) -> &ReconcileTiming {
        &self.timing
    }

    pub fn clients(&self) -> &ProviderClients {
        &self.clients
    }

    /// One reconcile pass towards a running scanner.
    ///
    /// Returns `Ok(())` once every resource is ready, otherwise the first
    /// Retryable/Fatal encountered. Later steps are not attempted.
    pub async fn run(&self, job: &ScanJobDescriptor) -> ScanResult<()> {
        let clients = &self.clients;
        let timing = &self.timing;

        let transfer = if job.is_cross_region() {
            Some(clients.transfer.as_ref().ok_or_else(|| {
                ScanError::fatal(format!(
                    "provider cannot stage snapshots across regions ({} -> {})",
                    job.source_region, job.destination_region
                ))
            })?)
        } else {
            None
        };

        let snapshot = ensure_snapshot(clients.snapshots.as_ref(), job, timing).await?;

        let volume = ensure_volume(clients.volumes.as_ref(), job, timing, move || async move {
            match transfer {
                Some(transfer) => ensure_staged_copy(
                    transfer.access.as_ref(),
                    transfer.store.as_ref(),
                    job,
                    &snapshot,
                    timing,
                )
                .await
                .map(VolumeSource::StagedCopy),
                None => Ok(VolumeSource::Snapshot(snapshot)),
            }
        })
        .await?;

        let network_interface = match &clients.network {
            Some(network) => Some(ensure_network_interface(network.as_ref(), job, timing).await?),
            None => None,
        };

        ensure_scanner(
            clients.scanners.as_ref(),
            job,
            timing,
            &volume,
            network_interface.as_ref(),
        )
        .await?;

        info!(asset_scan_id = %job.asset_scan_id, "Asset scan infrastructure ready");
        Ok(())
    }

    /// One teardown pass, in reverse dependency order.
    pub async fn remove(&self, job: &ScanJobDescriptor) -> ScanResult<()> {
        let clients = &self.clients;
        let timing = &self.timing;
        let names = job.names();

        ensure_absent(clients.scanners.as_ref(), &names.scanner, timing.deletion_estimate).await?;

        if let Some(network) = &clients.network {
            ensure_absent(
                network.as_ref(),
                &names.network_interface,
                timing.deletion_estimate,
            )
            .await?;
        }

        ensure_absent(clients.volumes.as_ref(), &names.volume, timing.deletion_estimate).await?;

        if job.is_cross_region() {
            match &clients.transfer {
                Some(transfer) => {
                    remove_staged_copy(
                        transfer.access.as_ref(),
                        transfer.store.as_ref(),
                        job,
                        timing,
                    )
                    .await?
                }
                None => warn!(
                    asset_scan_id = %job.asset_scan_id,
                    "Cross-region job on a provider without staging, nothing to unstage"
                ),
            }
        }

        ensure_absent(clients.snapshots.as_ref(), &names.snapshot, timing.deletion_estimate)
            .await?;

        info!(asset_scan_id = %job.asset_scan_id, "Asset scan infrastructure removed");
        Ok(())
    }
}
