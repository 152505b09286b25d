//! Asset Scan Engine Library
//!
//! Provisions and tears down the ephemeral infrastructure of agentless
//! asset scans on Azure and Docker.

pub mod agents;
pub mod tools;

pub use agents::asset_scan;
pub use agents::asset_scan::{build_provider, RetryPolicy, ScanDriver, ScanJobDescriptor};
