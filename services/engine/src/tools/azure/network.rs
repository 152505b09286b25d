//! Network interfaces for scanner VMs

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{observe_resource, AzureApi};
use crate::agents::asset_scan::errors::ProviderError;
use crate::agents::asset_scan::reconciler::ResourceClient;
use crate::agents::asset_scan::scanner::NetworkSpec;
use crate::agents::asset_scan::types::{Observation, ResourceKind};

const NETWORK_API_VERSION: &str = "2023-09-01";
const NIC_TYPE: &str = "Microsoft.Network/networkInterfaces";

pub struct AzureNetworkInterfaces {
    api: AzureApi,
}

impl AzureNetworkInterfaces {
    pub fn new(api: AzureApi) -> Self {
        Self { api }
    }

    fn id(&self, name: &str) -> String {
        self.api.config().resource_id(NIC_TYPE, name)
    }
}

fn nic_body(subnet_id: &str, spec: &NetworkSpec) -> Value {
    json!({
        "location": spec.location,
        "properties": {
            "ipConfigurations": [{
                "name": "scanner",
                "properties": {
                    "subnet": { "id": subnet_id },
                    "privateIPAllocationMethod": "Dynamic"
                }
            }]
        }
    })
}

#[async_trait]
impl ResourceClient<NetworkSpec> for AzureNetworkInterfaces {
    fn kind(&self) -> ResourceKind {
        ResourceKind::NetworkInterface
    }

    async fn observe(&self, name: &str) -> Result<Observation, ProviderError> {
        let body = self
            .api
            .get_json("getting network interface", &self.id(name), NETWORK_API_VERSION, &[])
            .await?;
        observe_resource("getting network interface", name, &body)
    }

    async fn create(&self, name: &str, spec: &NetworkSpec) -> Result<(), ProviderError> {
        let body = nic_body(&self.api.config().subnet_id, spec);
        self.api
            .put_json("creating network interface", &self.id(name), NETWORK_API_VERSION, &body)
            .await
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        self.api
            .delete("deleting network interface", &self.id(name), NETWORK_API_VERSION)
            .await
    }
}
