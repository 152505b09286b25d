//! Provider Tools
//!
//! REST clients for the clouds and runtimes assets are scanned on. Agents
//! only see the resource-level operations; credentials stay inside the tool.

pub mod azure;
pub mod docker;

pub use azure::{AzureApi, AzureConfig, AzureCredential};
pub use docker::{DockerApi, DockerConfig};
