use std::collections::BTreeMap;
use std::path::Path;
use anyhow::Context;
use serde::{Deserialize, Serialize};

/// File backed description of the cluster: which guest runs on which host, the bonded interfaces of
/// each host and the network settings each guest is configured with.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ClusterInventoryConfig {
    /// hypervisor used by hosts that do not name one, `kvm` or `xen`
    #[serde(default)]
    pub hypervisor: Option<String>,
    #[serde(default)]
    pub nodes: Vec<InventoryNode>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct InventoryNode {
    pub host: String,
    pub guest: String,
    #[serde(default)]
    pub hypervisor: Option<String>,
    /// bonded interface layout per network name
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceInfo>,
    /// guest network settings per network name
    #[serde(default)]
    pub networks: BTreeMap<String, VmNetworkConfig>,
    /// prepared cell configuration to install on the guest when its addresses change
    #[serde(default)]
    pub staged_ip_config: Option<String>,
}

/// Host side interface layout of one network, e.g. `vmbondeth1` over `eth3 eth4` as `bondeth1`.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct InterfaceInfo {
    pub bridge: String,
    /// space separated slave interface names
    pub bond_slaves: String,
    pub bond_master: String,
}

impl InterfaceInfo {
    pub fn slaves(&self) -> Vec<&str> {
        self.bond_slaves.split_whitespace().collect()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct VmNetworkConfig {
    #[serde(default)]
    pub vlan_tag: Option<String>,
    #[serde(default)]
    pub lacp: bool,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

impl VmNetworkConfig {
    pub fn fqdn(&self) -> Option<String> {
        let host = self.hostname.as_ref()?;
        match &self.domain {
            Some(domain) if !domain.is_empty() => Some(format!("{host}.{domain}")),
            _ => Some(host.clone()),
        }
    }
}

impl ClusterInventoryConfig {
    pub async fn read(location: &Path) -> anyhow::Result<ClusterInventoryConfig> {
        tracing::trace!("reading cluster inventory from {:?}", location);
        let text = tokio::fs::read_to_string(location).await
            .with_context(|| format!("reading cluster inventory {location:?}"))?;
        let inventory = serde_json::from_str(&text)
            .with_context(|| format!("parsing cluster inventory {location:?}"))?;
        Ok(inventory)
    }

    pub fn node_by_host(&self, host: &str) -> Option<&InventoryNode> {
        self.nodes.iter().find(|n| n.host == host)
    }

    pub fn node_by_guest(&self, guest: &str) -> Option<&InventoryNode> {
        self.nodes.iter().find(|n| n.guest == guest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        tokio::fs::write(&path, r#"{
            "hypervisor": "kvm",
            "nodes": [{
                "host": "dom0-a",
                "guest": "vm-a",
                "interfaces": {"backup": {"bridge": "vmbondeth1", "bond_slaves": "eth3 eth4", "bond_master": "bondeth1"}},
                "networks": {"backup": {"vlan_tag": "411", "lacp": true, "hostname": "vm-a-bk", "domain": "example.com"}}
            }]
        }"#).await.unwrap();
        let inventory = ClusterInventoryConfig::read(&path).await.unwrap();
        let node = inventory.node_by_host("dom0-a").unwrap();
        assert_eq!(node.interfaces["backup"].slaves(), vec!["eth3", "eth4"]);
        assert_eq!(node.networks["backup"].fqdn().as_deref(), Some("vm-a-bk.example.com"));
        assert!(inventory.node_by_guest("vm-b").is_none());
    }
}
