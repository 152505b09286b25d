//! Agent modules for the asset scan engine
//!
//! - `asset_scan`: ephemeral scan infrastructure lifecycle per provider

pub mod asset_scan;

pub use asset_scan::{AssetScanProvider, ScanDriver};
