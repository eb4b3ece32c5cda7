use std::collections::BTreeMap;
use async_trait::async_trait;
use nw_reconfig_schemas::inventory::{InterfaceInfo, VmNetworkConfig};
use nw_reconfig_schemas::payload::BatchPayload;

pub mod dns;
pub mod inventory;
pub mod store;

/// Topology lookups the engine needs about hosts and the guests they run.
#[async_trait]
pub trait ClusterInventory: Send + Sync {
    async fn guest_for_host(&self, host: &str) -> anyhow::Result<String>;
    /// Hypervisor family of the host as reported by the inventory, e.g. `kvm`.
    async fn hypervisor_type(&self, host: &str) -> anyhow::Result<String>;
    /// Bonded bridge layout of the host, keyed by network name.
    async fn interface_info(&self, host: &str) -> anyhow::Result<BTreeMap<String, InterfaceInfo>>;
    async fn vm_network(&self, guest: &str, network: &str) -> anyhow::Result<VmNetworkConfig>;
    /// Prepared cell configuration to install on the guest.
    async fn staged_ip_config(&self, guest: &str) -> anyhow::Result<String>;
}

/// Maintains the hosts file published by the controller's DNS server.
#[async_trait]
pub trait DnsService: Send + Sync {
    async fn delete_entry(&self, entry: &str) -> anyhow::Result<()>;
    async fn add_entry(&self, fqdn: &str, ip: &str) -> anyhow::Result<()>;
    /// Copies the hosts file to the standby controller, if there is one.
    async fn sync_remote(&self) -> anyhow::Result<()>;
    async fn restart(&self) -> anyhow::Result<()>;
}

/// Persists the annotated payload so the caller can follow progress and read the outcome.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn store(&self, payload: &BatchPayload) -> anyhow::Result<()>;
}
