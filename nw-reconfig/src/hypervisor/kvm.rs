use std::collections::BTreeMap;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use nw_reconfig_schemas::settings::PathSettings;
use crate::error::OperationError;
use crate::executor::session::NodeSession;
use crate::hypervisor::{BondedBridge, HypervisorAdapter, HypervisorKind};

lazy_static! {
    static ref ADDRESS_TAG: Regex = Regex::new(r"<address\s[^>]*>").unwrap();
    static ref ADDRESS_ATTRIBUTE: Regex =
        Regex::new(r#"\b(?P<name>\w+)\s*=\s*['"]0x(?P<value>[0-9a-fA-F]+)['"]"#).unwrap();
}

/// KVM hosts, driven through `vm_maker`, `virsh` and the libvirt definition files.
pub struct KvmAdapter;

/// PCI address `domain:bus:slot.function` of the `<address>` element of an interface definition,
/// with the `0x` prefixes dropped.
pub fn pci_address(interface_xml: &str) -> Option<String> {
    let tag = ADDRESS_TAG.find(interface_xml)?.as_str();
    let attributes: BTreeMap<&str, &str> = ADDRESS_ATTRIBUTE.captures_iter(tag)
        .filter_map(|c| Some((c.name("name")?.as_str(), c.name("value")?.as_str())))
        .collect();
    Some(format!(
        "{}:{}:{}.{}",
        attributes.get("domain")?,
        attributes.get("bus")?,
        attributes.get("slot")?,
        attributes.get("function")?
    ))
}

fn fail(session: &NodeSession<'_>, msg: String) -> OperationError {
    tracing::error!("{}", msg);
    session.direction.step_failure(msg)
}

#[async_trait]
impl HypervisorAdapter for KvmAdapter {
    fn kind(&self) -> HypervisorKind {
        HypervisorKind::Kvm
    }

    fn add_bonded_bridge_command(&self, paths: &PathSettings, bridge: &BondedBridge<'_>) -> String {
        let mut cmd = format!(
            "{} --add-bonded-bridge {} --first-slave {} --second-slave {} --vlan {}",
            paths.vm_maker, bridge.base, bridge.first_slave, bridge.second_slave, bridge.vlan
        );
        if bridge.lacp {
            cmd.push_str(" --bond-mode lacp");
        }
        cmd
    }

    fn remove_bridge_command(&self, paths: &PathSettings, bridge: &str) -> String {
        format!("{} --remove-bridge {bridge} --force", paths.vm_maker)
    }

    fn stop_domain_command(&self, paths: &PathSettings, guest: &str) -> String {
        format!("{} --stop-domain {guest}", paths.vm_maker)
    }

    fn start_domain_command(&self, paths: &PathSettings, guest: &str) -> String {
        format!("{} --start-domain {guest}", paths.vm_maker)
    }

    fn list_domains_command(&self) -> &'static str {
        "/usr/bin/virsh list --all | /bin/tail -n+3 | /bin/awk '{print $2}'"
    }

    fn list_domains_hint(&self) -> &'static str {
        "virsh list --all"
    }

    async fn domain_uses_bridge(&self, session: &NodeSession<'_>, domain: &str, bridge: &str) -> Result<bool, OperationError> {
        let cmd = format!("/usr/bin/virsh domiflist {domain} | /bin/tail -n+3 | /bin/awk '{{print $3}}'");
        let output = session.run_on_host(&cmd).await;
        if !output.success() {
            let msg = format!(
                "Couldn't list all interfaces for domain {domain} on {} using 'virsh domiflist'.",
                session.host
            );
            tracing::error!("{}", msg);
            return Err(session.direction.stale_bridge_failure(msg));
        }
        Ok(output.lines().iter().any(|interface| interface == bridge))
    }

    async fn backup_guest_definition(&self, session: &NodeSession<'_>, old_bridge: &str) -> Result<(), OperationError> {
        let xml_dir = &session.paths().libvirt_xml_dir;
        tracing::debug!("Backing up {} on {}", xml_dir, session.host);
        if !session.run_on_host(&format!("/bin/cp -r {xml_dir} {}", session.backup_dir)).await.success() {
            return Err(fail(session, format!("Failed to take backup of {xml_dir} on {}", session.host)));
        }
        let bridge_xml = format!("{}/{old_bridge}.xml", session.guest_dir());
        if !session.run_on_host(&format!("/bin/cp {bridge_xml} {}", session.backup_dir)).await.success() {
            return Err(fail(session, format!("Failed to take backup of {bridge_xml} on {}", session.host)));
        }
        Ok(())
    }

    async fn revert_guest_definition(&self, session: &NodeSession<'_>, current_bridge: &str, target_bridge: &str) -> Result<(), OperationError> {
        let host = &session.host;
        let xml_dir = &session.paths().libvirt_xml_dir;
        let guest_dir = session.guest_dir();

        tracing::debug!("Backing up {} on {}", xml_dir, host);
        if !session.run_on_host(&format!("/bin/cp -r {xml_dir} {}", session.backup_dir)).await.success() {
            return Err(fail(session, format!("Failed to take backup of {xml_dir} on {host}")));
        }

        let saved_xml_dir = format!("{}/qemu", session.restore_dir);
        if !session.run_on_host(&format!("/bin/cp -Tfr {saved_xml_dir} {xml_dir}")).await.success() {
            return Err(fail(session, format!("Failed to revert {saved_xml_dir} on {host}")));
        }

        // the interface definition of the bridge being left may already be gone
        let current_xml = format!("{guest_dir}/{current_bridge}.xml");
        let cmd = format!("/usr/bin/test ! -f {current_xml} || /bin/mv {current_xml} {}", session.backup_dir);
        if !session.run_on_host(&cmd).await.success() {
            return Err(fail(session, format!("Failed to revert {current_xml} on {host}")));
        }

        let saved_xml = format!("{}/{target_bridge}.xml", session.restore_dir);
        let target_xml = format!("{guest_dir}/{target_bridge}.xml");
        if !session.run_on_host(&format!("/bin/cp {saved_xml} {target_xml}")).await.success() {
            return Err(fail(session, format!("Failed to revert {saved_xml} to {target_xml} on {host}")));
        }

        let domain_xml = format!("{xml_dir}/{}.xml", session.guest);
        tracing::debug!("Defining {} on {}", domain_xml, host);
        if !session.run_on_host(&format!("/usr/bin/virsh define {domain_xml}")).await.success() {
            return Err(fail(session, format!("Failed to define {domain_xml} on {host}")));
        }
        Ok(())
    }

    async fn allocate_bridge(&self, session: &NodeSession<'_>, base: &str, vlan: &str) -> Result<(), OperationError> {
        let cmd = format!(
            "{} --allocate-bridge {base} --vlan {vlan} --domain {}",
            session.paths().vm_maker, session.guest
        );
        if !session.run_on_host(&cmd).await.success() {
            return Err(fail(session, format!("Couldn't allocate bridge {base}.{vlan} to domain {}", session.guest)));
        }
        Ok(())
    }

    async fn detach_bridge(&self, session: &NodeSession<'_>, bridge: &str, tagged: bool) -> Result<(), OperationError> {
        let cmd = format!("/bin/virt-xml {} --network source={bridge} --remove-device", session.guest);
        if !session.run_on_host(&cmd).await.success() {
            return Err(fail(session, format!("Failed to update Guest XML for {} on {}", session.guest, session.host)));
        }
        if !tagged {
            tracing::info!("Old vlan is null. Skipping removal of bridge XML.");
            return Ok(());
        }
        let bridge_xml = format!("{}/{bridge}.xml", session.guest_dir());
        if !session.run_on_host(&format!("/bin/rm -f {bridge_xml}")).await.success() {
            return Err(fail(session, format!("Failed to remove {bridge_xml} on {}", session.host)));
        }
        Ok(())
    }

    async fn interface_address(&self, session: &NodeSession<'_>, bridge: &str) -> Result<String, OperationError> {
        let bridge_xml = format!("{}/{bridge}.xml", session.guest_dir());
        let output = session.run_on_host(&format!("/bin/cat {bridge_xml}")).await;
        if !output.success() {
            return Err(fail(session, format!("Failed to read {bridge_xml} on {}", session.host)));
        }
        pci_address(&output.stdout)
            .ok_or_else(|| fail(session, format!("No interface address found in {bridge_xml} on {}", session.host)))
    }

    fn persistent_rule(&self, address: &str, master: &str) -> String {
        format!(r#"SUBSYSTEM=="net", ACTION=="add", DRIVERS=="?*", KERNELS=="{address}", ATTR{{type}}=="1", NAME="{master}""#)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use nw_reconfig_schemas::settings::ReconfigSettings;
    use crate::direction::Direction;
    use crate::testing::{common_with, session, ScriptedGateway};

    const INTERFACE_XML: &str = r#"<interface type='bridge'>
  <mac address='52:54:00:8a:1c:02'/>
  <source bridge='vmbondeth1.411'/>
  <model type='virtio'/>
  <address type='pci' domain='0x0000' bus='0x00' slot='0x0a' function='0x0'/>
</interface>"#;

    #[test]
    fn test_pci_address_from_interface_xml() {
        assert_eq!(pci_address(INTERFACE_XML).unwrap(), "0000:00:0a.0");
        assert!(pci_address("<interface type='bridge'/>").is_none());
        assert_eq!(
            pci_address("<address function=\"0x1\" slot=\"0x03\" type=\"pci\" bus=\"0x00\" domain=\"0x0000\"/>").unwrap(),
            "0000:00:03.1"
        );
        assert!(pci_address("<address type='pci' domain='0x0000' bus='0x00' slot='0x0b'/>").is_none());
    }

    #[test]
    fn test_bridge_commands() {
        let paths = ReconfigSettings::default().paths;
        let bridge = BondedBridge { base: "vmbondeth1", first_slave: "eth3", second_slave: "eth4", vlan: "310", lacp: true };
        assert_eq!(
            KvmAdapter.add_bonded_bridge_command(&paths, &bridge),
            "/opt/exadata_ovm/vm_maker --add-bonded-bridge vmbondeth1 --first-slave eth3 --second-slave eth4 --vlan 310 --bond-mode lacp"
        );
        assert_eq!(
            KvmAdapter.remove_bridge_command(&paths, "vmbondeth1.411"),
            "/opt/exadata_ovm/vm_maker --remove-bridge vmbondeth1.411 --force"
        );
        assert_eq!(KvmAdapter.stop_domain_command(&paths, "vm-a"), "/opt/exadata_ovm/vm_maker --stop-domain vm-a");
    }

    #[tokio::test]
    async fn test_guest_definition_revert_runs_five_commands() {
        let gateway = Arc::new(ScriptedGateway::default());
        let common = common_with(gateway.clone());
        let session = session(&common, Direction::Revert);
        KvmAdapter.revert_guest_definition(&session, "vmbondeth1.411", "vmbondeth1.310").await.unwrap();

        let log = gateway.commands();
        assert_eq!(log.len(), 5);
        assert!(log[0].starts_with("dom0-a: /bin/cp -r /etc/libvirt/qemu "));
        assert!(log[1].contains("/qemu /etc/libvirt/qemu"));
        assert!(log[2].contains("/EXAVMIMAGES/GuestImages/vm-a/vmbondeth1.411.xml"));
        assert!(log[3].ends_with("/vmbondeth1.310.xml /EXAVMIMAGES/GuestImages/vm-a/vmbondeth1.310.xml"));
        assert_eq!(log[4], "dom0-a: /usr/bin/virsh define /etc/libvirt/qemu/vm-a.xml");
    }

    #[tokio::test]
    async fn test_guest_definition_failures_by_step() {
        for (pattern, expected) in [
            ("/bin/cp -r", "Failed to take backup"),
            ("/bin/cp -Tfr", "Failed to revert"),
            ("virsh define", "Failed to define"),
        ] {
            let gateway = Arc::new(ScriptedGateway::default());
            gateway.fail_on(pattern, 1);
            let common = common_with(gateway.clone());
            let session = session(&common, Direction::Revert);
            let err = KvmAdapter.revert_guest_definition(&session, "vmbondeth1.411", "vmbondeth1.310").await.unwrap_err();
            assert!(err.message().starts_with(expected), "{pattern}: {}", err.message());
            assert!(matches!(err, OperationError::RevertFailed { .. }));
        }
    }

    #[tokio::test]
    async fn test_interface_address_reads_bridge_xml() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.respond("/bin/cat /EXAVMIMAGES/GuestImages/vm-a/vmbondeth1.411.xml", INTERFACE_XML);
        let common = common_with(gateway.clone());
        let session = session(&common, Direction::Apply);
        let address = KvmAdapter.interface_address(&session, "vmbondeth1.411").await.unwrap();
        assert_eq!(
            KvmAdapter.persistent_rule(&address, "bondeth1"),
            r#"SUBSYSTEM=="net", ACTION=="add", DRIVERS=="?*", KERNELS=="0000:00:0a.0", ATTR{type}=="1", NAME="bondeth1""#
        );
    }
}
