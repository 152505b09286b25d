//! Agentless Asset Scan
//!
//! Provisions the ephemeral infrastructure that lets a scanner read an
//! asset's disk without touching the asset, and tears it down afterwards.
//!
//! ## Lifecycle
//!
//! - **Run**: snapshot the asset volume, stage a copy into the scanner region
//!   when the regions differ, materialize a volume from it, start the scanner
//!   with the volume attached
//! - **Remove**: the same resources in reverse order
//!
//! Every call is stateless: resource state is observed by deterministic name
//! and a call that cannot finish yet returns a retryable error with a delay.

pub mod backends;
pub mod driver;
pub mod errors;
pub mod naming;
pub mod provider;
pub mod reconciler;
pub mod scanner;
pub mod snapshot;
pub mod transfer;
pub mod types;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

pub use backends::{build_provider, AzureProvider, DockerProvider};
pub use driver::{DriveError, DriveOutcome, RetryPolicy, ScanDriver, ScanPhase};
pub use errors::{ProviderError, ScanError, ScanResult};
pub use provider::{discover_all, AssetScanProvider};
pub use reconciler::{AssetScanReconciler, ReconcileTiming};
pub use types::{AssetInfo, AssetScanId, DiscoveredAsset, ProviderKind, ScanJobDescriptor};
