//! Asset Scan Types
//!
//! Job descriptors, discovered assets and observed provider resource state
//! shared by every provider back end.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use super::naming::ResourceNames;

/// Longest accepted asset scan id. Keeps every derived resource name inside
/// the strictest provider limit (64 characters for an Azure Linux VM).
pub const MAX_ASSET_SCAN_ID_LEN: usize = 40;

/// Globally unique identifier of one scan attempt against one asset.
///
/// Only lowercase ASCII letters, digits and `-` are accepted, starting and
/// ending with a letter or digit, so the id can be embedded verbatim in every
/// provider's resource names (Docker image repositories are lowercase only).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetScanId(String);

/// Rejected asset scan id
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidAssetScanId {
    #[error("asset scan id is empty")]
    Empty,

    #[error("asset scan id is longer than {max} characters")]
    TooLong { max: usize },

    #[error("asset scan id contains invalid character {0:?}")]
    InvalidCharacter(char),

    #[error("asset scan id must start and end with a letter or digit")]
    InvalidBoundary,
}

impl AssetScanId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidAssetScanId> {
        let raw = raw.into();

        if raw.is_empty() {
            return Err(InvalidAssetScanId::Empty);
        }
        if raw.len() > MAX_ASSET_SCAN_ID_LEN {
            return Err(InvalidAssetScanId::TooLong {
                max: MAX_ASSET_SCAN_ID_LEN,
            });
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(InvalidAssetScanId::InvalidCharacter(c));
        }
        if raw.starts_with('-') || raw.ends_with('-') {
            return Err(InvalidAssetScanId::InvalidBoundary);
        }

        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AssetScanId {
    type Error = InvalidAssetScanId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AssetScanId> for String {
    fn from(id: AssetScanId) -> Self {
        id.0
    }
}

impl std::fmt::Display for AssetScanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of asset a scan targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    VirtualMachine,
    Container,
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetKind::VirtualMachine => write!(f, "virtual_machine"),
            AssetKind::Container => write!(f, "container"),
        }
    }
}

/// The asset being scanned and the storage volume to snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetTarget {
    pub kind: AssetKind,
    /// Provider identity of the asset (VM resource id, container id)
    pub id: String,
    /// Storage volume to snapshot (OS disk resource id, or the container id)
    pub volume: String,
}

/// Sizing and type parameters of the ephemeral scan resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerResources {
    /// Storage class of the scanned volume and the scanner OS disk
    /// (e.g. "StandardSSD_LRS")
    pub volume_storage_class: String,
    /// Scanner compute size (e.g. "Standard_D2s_v3")
    pub compute_size: String,
    /// Scanner OS disk size in GB
    pub os_disk_size_gb: u32,
    /// Run the scanner on spot capacity
    #[serde(default)]
    pub use_spot_instances: bool,
    /// Maximum spot price; provider default (on-demand cap) when unset
    #[serde(default)]
    pub max_spot_price: Option<f64>,
}

/// What the scanner compute unit runs once it is up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Scanner container image
    pub image: String,
    /// Scanner CLI configuration handed to the scanner verbatim
    #[serde(default)]
    pub cli_config: Option<String>,
    /// Address of the scan server the scanner reports results to
    #[serde(default)]
    pub server_address: Option<String>,
}

/// Immutable description of one asset scan job.
///
/// Owned by the driving loop and passed unchanged into every reconcile call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJobDescriptor {
    pub asset_scan_id: AssetScanId,
    pub asset: AssetTarget,
    /// Region the asset and its snapshot live in
    pub source_region: String,
    /// Region the scanner and its volume live in
    pub destination_region: String,
    pub resources: ScannerResources,
    pub scanner: ScannerSettings,
}

impl ScanJobDescriptor {
    /// Load a descriptor from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job descriptor {:?}", path))?;

        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse job descriptor {:?}", path))
    }

    /// Whether the snapshot has to be staged into the destination region.
    pub fn is_cross_region(&self) -> bool {
        !self
            .source_region
            .eq_ignore_ascii_case(&self.destination_region)
    }

    /// Deterministic names of every ephemeral resource of this job.
    pub fn names(&self) -> ResourceNames {
        ResourceNames::for_scan(&self.asset_scan_id)
    }
}

/// An asset found by provider discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssetInfo {
    VirtualMachine {
        instance_id: String,
        name: String,
        location: String,
        root_volume_id: Option<String>,
    },
    Container {
        container_id: String,
        name: String,
        image: String,
        location: String,
    },
}

impl AssetInfo {
    pub fn kind(&self) -> AssetKind {
        match self {
            AssetInfo::VirtualMachine { .. } => AssetKind::VirtualMachine,
            AssetInfo::Container { .. } => AssetKind::Container,
        }
    }

    pub fn location(&self) -> &str {
        match self {
            AssetInfo::VirtualMachine { location, .. } | AssetInfo::Container { location, .. } => {
                location
            }
        }
    }

    /// Scan target for this asset, if it exposes a snapshottable volume.
    pub fn target(&self) -> Option<AssetTarget> {
        match self {
            AssetInfo::VirtualMachine {
                instance_id,
                root_volume_id,
                ..
            } => root_volume_id.as_ref().map(|volume| AssetTarget {
                kind: AssetKind::VirtualMachine,
                id: instance_id.clone(),
                volume: volume.clone(),
            }),
            AssetInfo::Container { container_id, .. } => Some(AssetTarget {
                kind: AssetKind::Container,
                id: container_id.clone(),
                volume: container_id.clone(),
            }),
        }
    }
}

/// Discovery result with the time it was observed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredAsset {
    pub provider: ProviderKind,
    #[serde(flatten)]
    pub asset: AssetInfo,
    pub discovered_at: chrono::DateTime<chrono::Utc>,
}

/// Provider family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Azure,
    Docker,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Azure => write!(f, "azure"),
            ProviderKind::Docker => write!(f, "docker"),
        }
    }
}

/// Ephemeral resource kinds managed per scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Snapshot,
    StagedCopy,
    Volume,
    NetworkInterface,
    Scanner,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Snapshot => write!(f, "snapshot"),
            ResourceKind::StagedCopy => write!(f, "staged copy"),
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::NetworkInterface => write!(f, "network interface"),
            ResourceKind::Scanner => write!(f, "scanner"),
        }
    }
}

/// Lifecycle state of a resource, derived from the provider on every call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Absent,
    Provisioning,
    Ready,
    Failed,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceState::Absent => write!(f, "absent"),
            ResourceState::Provisioning => write!(f, "provisioning"),
            ResourceState::Ready => write!(f, "ready"),
            ResourceState::Failed => write!(f, "failed"),
        }
    }
}

/// Reference to a provider-side resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Deterministic name the resource was created under
    pub name: String,
    /// Provider identifier (ARM resource id, Docker object id)
    pub id: String,
}

impl ResourceHandle {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }
}

/// One observation of a resource that exists on the provider side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub handle: ResourceHandle,
    pub state: ResourceState,
    /// Provider-reported status string, for logs and error reasons
    pub status: String,
}

impl Observation {
    pub fn new(handle: ResourceHandle, state: ResourceState, status: impl Into<String>) -> Self {
        Self {
            handle,
            state,
            status: status.into(),
        }
    }
}
