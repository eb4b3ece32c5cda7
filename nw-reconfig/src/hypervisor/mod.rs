use async_trait::async_trait;
use strum_macros::{Display, EnumString};
use nw_reconfig_schemas::settings::PathSettings;
use crate::error::OperationError;
use crate::executor::session::NodeSession;

pub mod kvm;
pub mod xen;

/// Hypervisor family of the hosts in a batch, resolved once per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum HypervisorKind {
    Kvm,
    Xen,
}

/// Name of the bonded bridge for a VLAN, `vmbondeth1.310`, or the base bridge when untagged.
pub fn bridge_name(base: &str, vlan: Option<&str>) -> String {
    match vlan {
        Some(tag) => format!("{base}.{tag}"),
        None => base.to_string(),
    }
}

/// Parameters for creating a bonded bridge on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedBridge<'a> {
    pub base: &'a str,
    pub first_slave: &'a str,
    pub second_slave: &'a str,
    pub vlan: &'a str,
    pub lacp: bool,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::kvm::KvmAdapter {}
    impl Sealed for super::xen::XenAdapter {}
}

/// Everything that differs between KVM and XEN hosts. Failures come back as `OperationError`s and
/// the caller decides which result entries they are charged to.
#[async_trait]
pub trait HypervisorAdapter: Send + Sync + sealed::Sealed {
    fn kind(&self) -> HypervisorKind;

    fn add_bonded_bridge_command(&self, paths: &PathSettings, bridge: &BondedBridge<'_>) -> String;
    fn remove_bridge_command(&self, paths: &PathSettings, bridge: &str) -> String;
    fn stop_domain_command(&self, paths: &PathSettings, guest: &str) -> String;
    fn start_domain_command(&self, paths: &PathSettings, guest: &str) -> String;

    /// Command printing one domain name per line, all states.
    fn list_domains_command(&self) -> &'static str;
    /// Tool an operator can use to list domains by hand.
    fn list_domains_hint(&self) -> &'static str;
    /// Whether `domain` has an interface on `bridge`.
    async fn domain_uses_bridge(&self, session: &NodeSession<'_>, domain: &str, bridge: &str) -> Result<bool, OperationError>;

    /// Snapshot the guest definition before a bridge is detached from it.
    async fn backup_guest_definition(&self, session: &NodeSession<'_>, old_bridge: &str) -> Result<(), OperationError>;
    /// Put back the guest definition saved by the apply being reverted, which references
    /// `target_bridge` instead of `current_bridge`.
    async fn revert_guest_definition(&self, session: &NodeSession<'_>, current_bridge: &str, target_bridge: &str) -> Result<(), OperationError>;

    async fn allocate_bridge(&self, session: &NodeSession<'_>, base: &str, vlan: &str) -> Result<(), OperationError>;
    async fn detach_bridge(&self, session: &NodeSession<'_>, bridge: &str, tagged: bool) -> Result<(), OperationError>;
    /// Address identifying the guest interface attached to `bridge`, used in the persistent
    /// network rules.
    async fn interface_address(&self, session: &NodeSession<'_>, bridge: &str) -> Result<String, OperationError>;
    fn persistent_rule(&self, address: &str, master: &str) -> String;
}

pub fn adapter_for(kind: HypervisorKind) -> Box<dyn HypervisorAdapter> {
    match kind {
        HypervisorKind::Kvm => Box::new(kvm::KvmAdapter),
        HypervisorKind::Xen => Box::new(xen::XenAdapter),
    }
}

/// Whether any domain on the host other than the session's guest still uses `bridge`. Any failure
/// to find out is an error, a bridge is never removed on a guess.
pub async fn detect_shared_bridge(
    adapter: &dyn HypervisorAdapter,
    session: &NodeSession<'_>,
    bridge: &str,
) -> Result<bool, OperationError> {
    let output = session.run_on_host(adapter.list_domains_command()).await;
    if !output.success() {
        let msg = format!("Couldn't list all domains on {}", session.host);
        tracing::error!("{}", msg);
        return Err(session.direction.stale_bridge_failure(msg));
    }
    let mut domains = output.lines();
    match domains.iter().position(|d| d == &session.guest) {
        Some(index) => {
            domains.remove(index);
        }
        None => {
            let msg = format!(
                "Couldn't remove domain {0} from the list. Please check if {0} exists using '{1}'.",
                session.guest,
                adapter.list_domains_hint()
            );
            tracing::error!("{}", msg);
            return Err(session.direction.stale_bridge_failure(msg));
        }
    }

    for domain in domains {
        if adapter.domain_uses_bridge(session, &domain, bridge).await? {
            tracing::info!("Bridge {} is shared by domain {}", bridge, domain);
            return Ok(true);
        }
    }
    tracing::info!("Bridge {} is not shared by other cluster", bridge);
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::Arc;
    use crate::direction::Direction;
    use crate::error::NetworkErrorCode;
    use crate::testing::{common_with, session, ScriptedGateway};

    #[test]
    fn test_hypervisor_kind_parse() {
        assert_eq!(HypervisorKind::from_str("kvm").unwrap(), HypervisorKind::Kvm);
        assert_eq!(HypervisorKind::from_str("XEN").unwrap(), HypervisorKind::Xen);
        assert!(HypervisorKind::from_str("hyperv").is_err());
        assert_eq!(HypervisorKind::Kvm.to_string(), "KVM");
    }

    #[test]
    fn test_bridge_names() {
        assert_eq!(bridge_name("vmbondeth1", Some("310")), "vmbondeth1.310");
        assert_eq!(bridge_name("vmbondeth1", None), "vmbondeth1");
    }

    #[tokio::test]
    async fn test_bridge_shared_by_sibling_domain() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.respond("virsh list --all", "vm-a\nvm-sibling\n");
        gateway.respond("domiflist vm-sibling", "vmbondeth0.318\nvmbondeth1.411\n");
        let common = common_with(gateway.clone());
        let session = session(&common, Direction::Revert);
        let adapter = adapter_for(HypervisorKind::Kvm);

        assert!(detect_shared_bridge(adapter.as_ref(), &session, "vmbondeth1.411").await.unwrap());
        assert!(!detect_shared_bridge(adapter.as_ref(), &session, "vmbondeth1.412").await.unwrap());
        // own interfaces are never looked at
        assert_eq!(gateway.count("domiflist vm-a "), 0);
    }

    #[tokio::test]
    async fn test_missing_self_is_an_error() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.respond("virsh list --all", "vm-other\n");
        let common = common_with(gateway.clone());
        let session = session(&common, Direction::Revert);
        let err = detect_shared_bridge(&kvm::KvmAdapter, &session, "vmbondeth1.411").await.unwrap_err();
        assert_eq!(err.network_error(), NetworkErrorCode::StaleBridgeDeleteFailed);
        assert!(err.message().starts_with("Couldn't remove domain vm-a from the list."));
    }

    #[tokio::test]
    async fn test_domain_listing_failure_is_an_error() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.fail_on("xm list", 1);
        let common = common_with(gateway.clone());
        let session = session(&common, Direction::Revert);
        let err = detect_shared_bridge(&xen::XenAdapter, &session, "vmbondeth1.411").await.unwrap_err();
        assert_eq!(err.message(), "Couldn't list all domains on dom0-a");
    }
}
