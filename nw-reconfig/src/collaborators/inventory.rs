use std::collections::BTreeMap;
use std::path::Path;
use anyhow::{bail, Context};
use async_trait::async_trait;
use nw_reconfig_schemas::inventory::{ClusterInventoryConfig, InterfaceInfo, InventoryNode, VmNetworkConfig};
use crate::collaborators::ClusterInventory;

/// `ClusterInventory` answered from the JSON inventory file.
pub struct ClusterInventoryFile {
    config: ClusterInventoryConfig,
}

impl ClusterInventoryFile {
    pub fn new(config: ClusterInventoryConfig) -> Self {
        Self { config }
    }

    pub async fn read(location: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(ClusterInventoryConfig::read(location).await?))
    }

    fn host(&self, host: &str) -> anyhow::Result<&InventoryNode> {
        self.config.node_by_host(host)
            .with_context(|| format!("host {host} is not in the cluster inventory"))
    }

    fn guest(&self, guest: &str) -> anyhow::Result<&InventoryNode> {
        self.config.node_by_guest(guest)
            .with_context(|| format!("guest {guest} is not in the cluster inventory"))
    }
}

#[async_trait]
impl ClusterInventory for ClusterInventoryFile {
    async fn guest_for_host(&self, host: &str) -> anyhow::Result<String> {
        Ok(self.host(host)?.guest.clone())
    }

    async fn hypervisor_type(&self, host: &str) -> anyhow::Result<String> {
        let node = self.host(host)?;
        node.hypervisor.clone()
            .or_else(|| self.config.hypervisor.clone())
            .with_context(|| format!("no hypervisor recorded for {host}"))
    }

    async fn interface_info(&self, host: &str) -> anyhow::Result<BTreeMap<String, InterfaceInfo>> {
        Ok(self.host(host)?.interfaces.clone())
    }

    async fn vm_network(&self, guest: &str, network: &str) -> anyhow::Result<VmNetworkConfig> {
        self.guest(guest)?.networks.get(network).cloned()
            .with_context(|| format!("no {network} network configured for {guest}"))
    }

    async fn staged_ip_config(&self, guest: &str) -> anyhow::Result<String> {
        match &self.guest(guest)?.staged_ip_config {
            Some(conf) if !conf.trim().is_empty() => Ok(conf.clone()),
            _ => bail!("no staged ip configuration for {guest}"),
        }
    }
}
