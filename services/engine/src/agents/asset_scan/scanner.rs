//! Scanner compute ensurer
//!
//! The disposable compute unit that mounts the scan volume and runs the
//! scanner image, plus its network interface where the provider needs one.

use tracing::debug;

use super::errors::ScanResult;
use super::reconciler::{ensure, ReconcileTiming, ResourceClient};
use super::types::{AssetScanId, ResourceHandle, ScanJobDescriptor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub location: String,
}

/// Everything a provider needs to launch the scanner
#[derive(Debug, Clone, PartialEq)]
pub struct ScannerSpec {
    pub asset_scan_id: AssetScanId,
    pub location: String,
    pub compute_size: String,
    pub os_disk_size_gb: u32,
    pub storage_class: String,
    /// Volume to attach read-only
    pub volume: ResourceHandle,
    pub network_interface: Option<ResourceHandle>,
    pub image: String,
    pub cli_config: Option<String>,
    pub server_address: Option<String>,
    pub use_spot: bool,
    pub max_spot_price: Option<f64>,
}

impl ScannerSpec {
    pub fn for_job(
        job: &ScanJobDescriptor,
        volume: &ResourceHandle,
        network_interface: Option<&ResourceHandle>,
    ) -> Self {
        Self {
            asset_scan_id: job.asset_scan_id.clone(),
            location: job.destination_region.clone(),
            compute_size: job.resources.compute_size.clone(),
            os_disk_size_gb: job.resources.os_disk_size_gb,
            storage_class: job.resources.volume_storage_class.clone(),
            volume: volume.clone(),
            network_interface: network_interface.cloned(),
            image: job.scanner.image.clone(),
            cli_config: job.scanner.cli_config.clone(),
            server_address: job.scanner.server_address.clone(),
            use_spot: job.resources.use_spot_instances,
            max_spot_price: job.resources.max_spot_price,
        }
    }
}

pub async fn ensure_network_interface(
    client: &dyn ResourceClient<NetworkSpec>,
    job: &ScanJobDescriptor,
    timing: &ReconcileTiming,
) -> ScanResult<ResourceHandle> {
    let name = job.names().network_interface;

    ensure(client, &name, timing.network_estimate, move || async move {
        Ok(NetworkSpec {
            location: job.destination_region.clone(),
        })
    })
    .await
}

/// Ensure the scanner is running with the volume attached.
pub async fn ensure_scanner(
    client: &dyn ResourceClient<ScannerSpec>,
    job: &ScanJobDescriptor,
    timing: &ReconcileTiming,
    volume: &ResourceHandle,
    network_interface: Option<&ResourceHandle>,
) -> ScanResult<ResourceHandle> {
    let name = job.names().scanner;
    debug!(
        asset_scan_id = %job.asset_scan_id,
        name = %name,
        volume = %volume.name,
        "Ensuring scanner"
    );

    ensure(client, &name, timing.scanner_estimate, move || async move {
        Ok(ScannerSpec::for_job(job, volume, network_interface))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::asset_scan::testing::{sample_job, SimResourceClient};
    use crate::agents::asset_scan::types::ResourceKind;

    #[tokio::test]
    async fn test_scanner_spec_carries_job_settings() {
        let client = SimResourceClient::<ScannerSpec>::new(ResourceKind::Scanner, 0);
        let mut job = sample_job(false);
        job.resources.use_spot_instances = true;
        job.resources.max_spot_price = Some(0.05);
        job.scanner.server_address = Some("http://scan-server:8888".to_string());

        let volume = ResourceHandle::new(job.names().volume, "sim://volume");
        let nic = ResourceHandle::new(job.names().network_interface, "sim://nic");
        let timing = ReconcileTiming::default();

        let err = ensure_scanner(&client, &job, &timing, &volume, Some(&nic))
            .await
            .unwrap_err();
        assert_eq!(err.suggested_delay(), Some(timing.scanner_estimate));

        let spec = client.last_spec().unwrap();
        assert_eq!(spec.volume, volume);
        assert_eq!(spec.network_interface, Some(nic));
        assert_eq!(spec.location, job.destination_region);
        assert!(spec.use_spot);
        assert_eq!(spec.max_spot_price, Some(0.05));
        assert_eq!(spec.server_address.as_deref(), Some("http://scan-server:8888"));

        let handle = ensure_scanner(&client, &job, &timing, &volume, None)
            .await
            .unwrap();
        assert_eq!(handle.name, job.names().scanner);
        assert_eq!(client.creates(), 1);
    }
}
