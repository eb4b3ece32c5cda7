use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use nw_reconfig_schemas::settings::PathSettings;
use crate::error::OperationError;
use crate::executor::session::NodeSession;
use crate::hypervisor::{BondedBridge, HypervisorAdapter, HypervisorKind};

lazy_static! {
    static ref VIF_ENTRY: Regex = Regex::new(r#"['"]([^'"]*)['"]"#).unwrap();
}

/// XEN hosts, driven through `domu_maker`, `xm` and the flat `vm.cfg` of each guest.
pub struct XenAdapter;

fn vm_cfg(session: &NodeSession<'_>) -> String {
    format!("{}/vm.cfg", session.guest_dir())
}

/// Entries of a `vif = ['type=netfront,mac=..,bridge=..', ...]` line.
fn vif_entries(line: &str) -> Vec<String> {
    let list = line.find('[').map(|start| &line[start..]).unwrap_or_default();
    VIF_ENTRY.captures_iter(list).map(|c| c[1].to_string()).collect()
}

fn entry_field<'e>(entry: &'e str, key: &str) -> Option<&'e str> {
    entry.split(',')
        .filter_map(|field| field.trim().split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// MAC address of the interface attached to `bridge`, from the contents of a `vm.cfg`.
pub fn vif_mac(config: &str, bridge: &str) -> Option<String> {
    let line = config.lines().filter(|l| l.contains("vif")).last()?;
    vif_entries(line).iter()
        .find(|entry| entry_field(entry, "bridge") == Some(bridge))
        .and_then(|entry| entry_field(entry, "mac"))
        .map(String::from)
}

/// `vm.cfg` contents with every interface on `bridge` removed.
pub fn without_bridge(config: &str, bridge: &str) -> String {
    config.lines()
        .map(|line| {
            if !line.contains("vif") {
                return line.to_string();
            }
            let kept: Vec<String> = vif_entries(line).into_iter()
                .filter(|entry| entry_field(entry, "bridge") != Some(bridge))
                .map(|entry| format!("'{entry}'"))
                .collect();
            format!("vif = [{}]", kept.join(", "))
        })
        .collect::<Vec<String>>()
        .join("\n")
}

fn fail(session: &NodeSession<'_>, msg: String) -> OperationError {
    tracing::error!("{}", msg);
    session.direction.step_failure(msg)
}

#[async_trait]
impl HypervisorAdapter for XenAdapter {
    fn kind(&self) -> HypervisorKind {
        HypervisorKind::Xen
    }

    fn add_bonded_bridge_command(&self, paths: &PathSettings, bridge: &BondedBridge<'_>) -> String {
        let mut cmd = format!(
            "{} add-bonded-bridge-dom0 {} {} {} {}",
            paths.domu_maker, bridge.base, bridge.first_slave, bridge.second_slave, bridge.vlan
        );
        if bridge.lacp {
            cmd.push_str(" lacp");
        }
        cmd
    }

    fn remove_bridge_command(&self, paths: &PathSettings, bridge: &str) -> String {
        format!("{} remove-bridge-dom0 {bridge} -force", paths.domu_maker)
    }

    fn stop_domain_command(&self, _paths: &PathSettings, guest: &str) -> String {
        format!("xm shutdown {guest} -w")
    }

    fn start_domain_command(&self, paths: &PathSettings, guest: &str) -> String {
        format!("xm create {}/vm.cfg", paths.guest_dir(guest))
    }

    fn list_domains_command(&self) -> &'static str {
        "xm list | tail -n+3 | awk '{print $1}'"
    }

    fn list_domains_hint(&self) -> &'static str {
        "xm list"
    }

    async fn domain_uses_bridge(&self, session: &NodeSession<'_>, domain: &str, bridge: &str) -> Result<bool, OperationError> {
        let output = session.run_on_host(&format!("xm list {domain} --long | grep -w -F {bridge}")).await;
        if output.success() {
            return Ok(true);
        }
        // grep exits non zero without output when nothing matched
        if !output.stderr.trim().is_empty() {
            let msg = format!("Couldn't list details for domain {domain} on {}", session.host);
            tracing::error!("{}", msg);
            return Err(session.direction.stale_bridge_failure(msg));
        }
        Ok(false)
    }

    async fn backup_guest_definition(&self, session: &NodeSession<'_>, _old_bridge: &str) -> Result<(), OperationError> {
        let config = vm_cfg(session);
        tracing::debug!("Backing up {} on {}", config, session.host);
        if !session.run_on_host(&format!("/bin/cp {config} {}", session.backup_dir)).await.success() {
            return Err(fail(session, format!("Failed to take backup of {config} on {}", session.host)));
        }
        Ok(())
    }

    async fn revert_guest_definition(&self, session: &NodeSession<'_>, _current_bridge: &str, _target_bridge: &str) -> Result<(), OperationError> {
        let config = vm_cfg(session);
        let saved = format!("{}/vm.cfg", session.restore_dir);
        tracing::debug!("Reverting {} to {} on {}", saved, config, session.host);
        if !session.run_on_host(&format!("/bin/cp {saved} {config}")).await.success() {
            return Err(fail(session, format!("Failed to revert {saved} to {config} on {}", session.host)));
        }
        Ok(())
    }

    async fn allocate_bridge(&self, session: &NodeSession<'_>, base: &str, vlan: &str) -> Result<(), OperationError> {
        let bridge = format!("{base}.{vlan}");
        let cmd = format!("{} allocate-bridge-domu {bridge} {}", session.paths().domu_maker, session.guest);
        if !session.run_on_host(&cmd).await.success() {
            return Err(fail(session, format!("Couldn't allocate bridge {bridge} to domain {}", session.guest)));
        }
        Ok(())
    }

    async fn detach_bridge(&self, session: &NodeSession<'_>, bridge: &str, _tagged: bool) -> Result<(), OperationError> {
        let config = vm_cfg(session);
        let failure = || fail(session, format!("Failed to update the file {config} on {}", session.host));
        let output = session.run_on_host(&format!("/bin/cat {config}")).await;
        if !output.success() {
            return Err(failure());
        }
        session.write_on_host(&config, &without_bridge(&output.stdout, bridge)).await.map_err(|err| {
            tracing::warn!("writing {}: {:#}", config, err);
            failure()
        })
    }

    async fn interface_address(&self, session: &NodeSession<'_>, bridge: &str) -> Result<String, OperationError> {
        let config = vm_cfg(session);
        let output = session.run_on_host(&format!("/bin/cat {config}")).await;
        if !output.success() {
            return Err(fail(session, format!("Failed to read {config} on {}", session.host)));
        }
        vif_mac(&output.stdout, bridge).ok_or_else(|| fail(
            session,
            format!("Failed to determine the mac address for new bridge {bridge} from {config}"),
        ))
    }

    fn persistent_rule(&self, address: &str, master: &str) -> String {
        format!(r#"SUBSYSTEM=="net", ACTION=="add", ATTR{{address}}=="{address}", KERNEL=="e*", NAME="{master}""#)
    }
}
