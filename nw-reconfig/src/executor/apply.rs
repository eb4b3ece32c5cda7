use std::time::Duration;
use nw_reconfig_schemas::payload::OperationStatus;
use crate::direction::{Direction, VlanKey};
use crate::error::OperationError;
use crate::executor::NodeExecutor;
use crate::hypervisor::bridge_name;

const STARTED: &str = "Operation started";

/// Replaces every line mentioning `master` with `rule`.
pub fn replace_rule(rules: &str, master: &str, rule: &str) -> String {
    rules.split('\n')
        .map(|line| if line.contains(master) { rule } else { line })
        .collect::<Vec<&str>>()
        .join("\n")
}

impl NodeExecutor<'_> {
    /// Installs the new configuration on this node: snapshot everything that will change, change
    /// it, then restart and run the ip configuration tool so the changes take effect.
    pub(super) async fn apply_configuration(&mut self) -> Result<(), OperationError> {
        self.apply_pre_operations().await?;

        if self.work.ipconf_updates.is_some() {
            self.stage_cell_conf().await?;
        }
        if self.work.vlan_add.is_some() {
            self.apply_vlan_add().await?;
        }
        if self.work.vlan_delete.is_some() {
            self.apply_vlan_delete().await?;
        }

        self.apply_post_operations().await
    }

    async fn backup_on_guest(&self, file: &str) -> Result<(), OperationError> {
        tracing::debug!("Backing up {} on {}", file, self.session.guest);
        let cmd = format!("/bin/cp {file} {}", self.session.backup_dir);
        if !self.session.run_on_guest(&cmd).await.success() {
            return Err(self.step_failure(format!("Failed to take backup of {file} on {}", self.session.guest)));
        }
        Ok(())
    }

    async fn apply_pre_operations(&mut self) -> Result<(), OperationError> {
        tracing::debug!("Starting pre operations on {}", self.session.guest);
        let paths = self.session.paths().clone();

        if self.work.ipconf_updates.is_some() {
            let mut files = vec![paths.cell_conf.clone()];
            if self.work.ipconf_has_entity("dns") {
                files.push(paths.dns_conf.clone());
            }
            if self.work.ipconf_has_entity("ntp") {
                files.push(paths.ntp_conf.clone());
            }
            for file in files {
                let result = self.backup_on_guest(&file).await;
                result.map_err(|err| self.charge_ipconf(err))?;
            }
        }

        if self.work.has_vlan() {
            let result = self.backup_on_guest(&paths.net_rules).await;
            result.map_err(|err| self.charge_vlans(err))?;
        }

        if let Some(old_vlan) = self.work.vlan_delete.as_ref().map(|w| w.vlan_tag()) {
            let old_bridge = bridge_name(&self.base_bridge()?, old_vlan.as_deref());
            let result = self.adapter.backup_guest_definition(&self.session, &old_bridge).await;
            result.map_err(|err| self.charge_vlan(VlanKey::Delete, err))?;
        }
        Ok(())
    }

    /// Writes the staged cell configuration next to the live one, for the ip configuration tool.
    async fn stage_cell_conf(&mut self) -> Result<(), OperationError> {
        self.work.set_ipconf_result(OperationStatus::Failure, STARTED);
        let guest = self.session.guest.clone();
        let staged = match self.session.common.inventory.staged_ip_config(&guest).await {
            Ok(conf) => conf,
            Err(err) => {
                tracing::warn!("{:#}", err);
                let err = self.step_failure(format!("No staged ip configuration found for {guest}"));
                return Err(self.charge_ipconf(err));
            }
        };
        let path = format!("{}.nw_reconfig", self.session.paths().cell_conf);
        if let Err(err) = self.session.write_on_guest(&path, &staged).await {
            tracing::warn!("{:#}", err);
            let err = self.step_failure(format!("Failed to write {path} on {guest}"));
            return Err(self.charge_ipconf(err));
        }
        Ok(())
    }

    async fn apply_vlan_add(&mut self) -> Result<(), OperationError> {
        self.work.set_vlan_result(VlanKey::Add, OperationStatus::Failure, STARTED);
        tracing::debug!("Starting Vlan Add operation on {}", self.session.host);

        let vlan = match self.configured_vlan().await {
            Ok(Some(vlan)) => vlan,
            Ok(None) => {
                let err = self.step_failure(format!("No vlan configured for {}", self.session.guest));
                return Err(self.charge_vlan(VlanKey::Add, err));
            }
            Err(err) => return Err(self.charge_vlan(VlanKey::Add, err)),
        };
        let interface = self.interface()?.clone();
        let bridge = bridge_name(&interface.bridge, Some(&vlan));

        self.add_bonded_bridge(&vlan).await?;
        if !self.wait_for_bridge(&bridge).await {
            let err = self.step_failure(format!("Failed to bring up {bridge} on {}", self.session.host));
            return Err(self.charge_vlan(VlanKey::Add, err));
        }
        let allocated = self.adapter.allocate_bridge(&self.session, &interface.bridge, &vlan).await;
        allocated.map_err(|err| self.charge_vlan(VlanKey::Add, err))?;

        if let Err(err) = self.update_persistent_rules(&bridge, &interface.bond_master).await {
            tracing::warn!("{}", err);
            let rules = &self.session.paths().net_rules;
            let err = self.step_failure(format!("Couldn't update rules in {rules} on {}", self.session.guest));
            return Err(self.charge_vlan(VlanKey::Add, err));
        }

        let msg = format!("VLAN add {} on {}", Direction::Apply.verb(), self.session.host);
        self.work.set_vlan_result(VlanKey::Add, OperationStatus::Success, msg);
        Ok(())
    }

    /// Checks the bridge's operational state, bringing it up and checking again a few times.
    async fn wait_for_bridge(&self, bridge: &str) -> bool {
        let timings = &self.session.common.settings.timings;
        for _ in 0..timings.bridge_up_attempts {
            tracing::debug!("Checking if bridge {} is up on {}", bridge, self.session.host);
            let state = self.session.run_on_host(&format!("/bin/cat /sys/class/net/{bridge}/operstate")).await;
            if state.success() && state.stdout.contains("up") {
                return true;
            }
            tracing::debug!(
                "Bridge {} is not yet up on {}, current state: {}",
                bridge, self.session.host, state.stdout.trim()
            );
            self.session.run_on_host(&format!("/usr/sbin/ifup {bridge}")).await;
            tokio::time::sleep(Duration::from_secs(timings.bridge_up_interval_secs)).await;
        }
        false
    }

    /// Points the guest's rule for the bond master interface at the newly attached interface.
    async fn update_persistent_rules(&self, bridge: &str, master: &str) -> Result<(), OperationError> {
        let address = self.adapter.interface_address(&self.session, bridge).await?;
        let rule = self.adapter.persistent_rule(&address, master);
        let path = &self.session.paths().net_rules;
        tracing::debug!("Updating file {} on {}", path, self.session.guest);
        let current = self.session.run_on_guest(&format!("/bin/cat {path}")).await;
        if !current.success() {
            return Err(self.step_failure(format!("Failed to read {path} on {}", self.session.guest)));
        }
        self.session
            .write_on_guest(path, &replace_rule(&current.stdout, master, &rule))
            .await
            .map_err(|err| self.step_failure(format!("Failed to write {path} on {}: {err:#}", self.session.guest)))
    }

    async fn apply_vlan_delete(&mut self) -> Result<(), OperationError> {
        self.work.set_vlan_result(VlanKey::Delete, OperationStatus::Failure, STARTED);
        tracing::debug!("Starting Vlan Delete operation on {}", self.session.guest);
        let old_vlan = self.work.vlan_delete.as_ref().and_then(|w| w.vlan_tag());
        let old_bridge = bridge_name(&self.base_bridge()?, old_vlan.as_deref());
        let detached = self.adapter.detach_bridge(&self.session, &old_bridge, old_vlan.is_some()).await;
        detached.map_err(|err| self.charge_vlan(VlanKey::Delete, err))?;

        let msg = format!("VLAN delete {} on {}", Direction::Apply.verb(), self.session.host);
        self.work.set_vlan_result(VlanKey::Delete, OperationStatus::Success, msg);
        Ok(())
    }

    async fn apply_post_operations(&mut self) -> Result<(), OperationError> {
        tracing::debug!("Starting post operations on {}", self.session.guest);
        if self.work.has_vlan() {
            self.restart_domain().await?;
        }

        // the untagged base bridge stays
        if let Some(Some(old_vlan)) = self.work.vlan_delete.as_ref().map(|w| w.vlan_tag()) {
            let old_bridge = bridge_name(&self.base_bridge()?, Some(&old_vlan));
            self.delete_bridge_if_unused(&old_bridge).await?;
        }

        if self.work.ipconf_updates.is_some() {
            self.run_ipconf().await?;
            let msg = format!("IP Conf updates {} on {}", Direction::Apply.verb(), self.session.guest);
            self.work.set_ipconf_result(OperationStatus::Success, msg);
        }
        Ok(())
    }
}
