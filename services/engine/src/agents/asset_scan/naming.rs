//! Deterministic resource naming
//!
//! Every ephemeral resource of a scan is named from its asset scan id, so a
//! repeated reconcile call finds the resource it started earlier instead of
//! creating a second one.

use serde::Serialize;

use super::types::AssetScanId;

const SNAPSHOT_PREFIX: &str = "asset-scan-snapshot-";
const VOLUME_PREFIX: &str = "asset-scan-volume-";
const NETWORK_INTERFACE_PREFIX: &str = "asset-scan-nic-";
const SCANNER_PREFIX: &str = "asset-scan-scanner-";
const STAGED_COPY_SUFFIX: &str = ".vhd";

/// Names of every ephemeral resource belonging to one scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceNames {
    pub snapshot: String,
    pub volume: String,
    /// Object name of the cross-region staged copy
    pub staged_copy: String,
    pub network_interface: String,
    pub scanner: String,
}

impl ResourceNames {
    /// Fixed prefix (or suffix) per resource kind around the validated id.
    /// The prefixes diverge before any of them ends and ids never contain
    /// `.`, so the mapping is injective across both ids and kinds.
    pub fn for_scan(id: &AssetScanId) -> Self {
        let id = id.as_str();

        Self {
            snapshot: format!("{}{}", SNAPSHOT_PREFIX, id),
            volume: format!("{}{}", VOLUME_PREFIX, id),
            staged_copy: format!("{}{}", id, STAGED_COPY_SUFFIX),
            network_interface: format!("{}{}", NETWORK_INTERFACE_PREFIX, id),
            scanner: format!("{}{}", SCANNER_PREFIX, id),
        }
    }

    #[cfg(test)]
    fn all(&self) -> [&str; 5] {
        [
            &self.snapshot,
            &self.volume,
            &self.staged_copy,
            &self.network_interface,
            &self.scanner,
        ]
    }
}

/// Whether `name` belongs to a scan's ephemeral resources. Discovery uses
/// this to keep scanners from scanning each other.
pub fn is_scan_resource(name: &str) -> bool {
    [
        SNAPSHOT_PREFIX,
        VOLUME_PREFIX,
        NETWORK_INTERFACE_PREFIX,
        SCANNER_PREFIX,
    ]
    .iter()
    .any(|prefix| name.trim_start_matches('/').starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn id(raw: &str) -> AssetScanId {
        AssetScanId::parse(raw).unwrap()
    }

    #[test]
    fn test_names_are_stable() {
        let first = ResourceNames::for_scan(&id("scan-1"));
        let second = ResourceNames::for_scan(&id("scan-1"));

        assert_eq!(first, second);
        assert_eq!(first.snapshot, "asset-scan-snapshot-scan-1");
        assert_eq!(first.volume, "asset-scan-volume-scan-1");
        assert_eq!(first.staged_copy, "scan-1.vhd");
        assert_eq!(first.scanner, "asset-scan-scanner-scan-1");
    }

    #[test]
    fn test_distinct_scans_never_collide() {
        let ids = ["scan-1", "scan-10", "scan-1-0", "1", "0-1", "snapshot-scan-1"];
        let mut seen = HashSet::new();

        for raw in ids {
            for name in ResourceNames::for_scan(&id(raw)).all() {
                assert!(seen.insert(name.to_string()), "collision on {name}");
            }
        }
    }

    #[test]
    fn test_scan_resources_are_recognized() {
        let names = ResourceNames::for_scan(&id("scan-1"));

        assert!(is_scan_resource(&names.scanner));
        assert!(is_scan_resource(&format!("/{}", names.volume)));
        assert!(is_scan_resource(&format!("{}-populate", names.volume)));
        assert!(!is_scan_resource("web-1"));
    }

    #[test]
    fn test_names_fit_provider_limits() {
        let longest = id(&"a".repeat(crate::agents::asset_scan::types::MAX_ASSET_SCAN_ID_LEN));
        let names = ResourceNames::for_scan(&longest);

        assert!(names.scanner.len() <= 64);
        assert!(names.all().iter().all(|n| n.len() <= 80));
    }
}
