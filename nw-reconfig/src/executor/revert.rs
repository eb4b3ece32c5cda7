use std::path::Path;
use nw_reconfig_schemas::payload::OperationStatus;
use crate::direction::{Direction, VlanKey};
use crate::error::OperationError;
use crate::executor::NodeExecutor;
use crate::hypervisor::bridge_name;

impl NodeExecutor<'_> {
    /// Undoes a previous apply on this node. VLAN changes and address changes are separate repair
    /// paths, only one of them is taken.
    pub(super) async fn revert_configuration(&mut self) -> Result<(), OperationError> {
        let vlan_path = self.work.vlan_pending(VlanKey::Add, Direction::Revert)
            || self.work.vlan_pending(VlanKey::Delete, Direction::Revert);
        let ipconf_path = !vlan_path && self.work.ipconf_pending(Direction::Revert);

        if vlan_path {
            self.revert_vlan().await?;
        } else if ipconf_path {
            self.revert_cell_conf().await?;
        }
        self.revert_post_operations(ipconf_path).await
    }

    async fn revert_vlan(&mut self) -> Result<(), OperationError> {
        tracing::debug!("Starting to revert Vlan operation on {}", self.session.guest);
        for key in [VlanKey::Add, VlanKey::Delete] {
            if self.work.vlan(key).is_some() {
                self.revert_net_rules(key).await?;
            }
        }

        let base = self.base_bridge()?;
        let current = match self.configured_vlan().await {
            Ok(vlan) => vlan,
            Err(err) => return Err(self.charge_vlans(err)),
        };
        let target = self.work.vlan_delete.as_ref().and_then(|w| w.vlan_tag());
        let current_bridge = bridge_name(&base, current.as_deref());
        let target_bridge = bridge_name(&base, target.as_deref());
        let reverted = self.adapter
            .revert_guest_definition(&self.session, &current_bridge, &target_bridge)
            .await;
        reverted.map_err(|err| self.charge_vlans(err))?;

        match target {
            Some(vlan) => self.add_bonded_bridge(&vlan).await?,
            None => tracing::info!("No vlantag found. Skipping add bridge."),
        }

        if self.work.vlan_pending(VlanKey::Delete, Direction::Revert) {
            tracing::info!("Marking vlan_delete operation as reverted");
            let msg = format!("VLAN delete operation reverted successfully on {}", self.session.host);
            self.work.set_vlan_result(VlanKey::Delete, OperationStatus::Reverted, msg);
        }
        Ok(())
    }

    /// Snapshots the persistent network rules of the guest and restores the saved copy. The
    /// snapshot does not overwrite an earlier one taken by the same run.
    async fn revert_net_rules(&mut self, key: VlanKey) -> Result<(), OperationError> {
        let rules = self.session.paths().net_rules.clone();
        let name = Path::new(&rules).file_name().and_then(|n| n.to_str()).unwrap_or(rules.as_str());
        let snapshot = format!("{}/{name}", self.session.backup_dir);
        let backup = format!("test -e {snapshot} || /bin/cp {rules} {snapshot}");
        let result = self.backup_and_restore_on_guest(&backup, &rules, &rules).await;
        result.map_err(|err| self.charge_vlan(key, err))
    }

    /// Snapshots the cell configuration and stages the saved copy for the ip configuration tool.
    async fn revert_cell_conf(&mut self) -> Result<(), OperationError> {
        tracing::debug!("Starting to revert cell.conf on {}", self.session.guest);
        let cell_conf = self.session.paths().cell_conf.clone();
        let backup = format!("/bin/cp {cell_conf} {}", self.session.backup_dir);
        let staged = format!("{cell_conf}.nw_reconfig");
        let result = self.backup_and_restore_on_guest(&backup, &cell_conf, &staged).await;
        result.map_err(|err| self.charge_ipconf(err))
    }

    /// Runs `backup_cmd` to snapshot `live`, then copies the saved file of the same name from the
    /// restore dir over `target`.
    async fn backup_and_restore_on_guest(&self, backup_cmd: &str, live: &str, target: &str) -> Result<(), OperationError> {
        let guest = &self.session.guest;
        tracing::debug!("Backing up {} on {}", live, guest);
        if !self.session.run_on_guest(backup_cmd).await.success() {
            return Err(self.step_failure(format!("Failed to take backup of {live} on {guest}")));
        }
        let file_name = live.rsplit('/').next().unwrap_or(live);
        let saved = format!("{}/{file_name}", self.session.restore_dir);
        tracing::debug!("Reverting {} to {} on {}", saved, target, guest);
        if !self.session.run_on_guest(&format!("/bin/cp {saved} {target}")).await.success() {
            return Err(self.step_failure(format!("Failed to revert {saved} to {target} on {guest}")));
        }
        Ok(())
    }

    async fn revert_post_operations(&mut self, ipconf_path: bool) -> Result<(), OperationError> {
        tracing::debug!("Starting post operations on {}", self.session.guest);
        if self.work.has_vlan() {
            self.restart_domain().await?;
        }

        if self.work.vlan_pending(VlanKey::Add, Direction::Revert) {
            self.delete_stale_bridge().await?;
            tracing::info!("Marking vlan_add operation as reverted");
            let msg = format!("VLAN add operation reverted successfully on {}", self.session.host);
            self.work.set_vlan_result(VlanKey::Add, OperationStatus::Reverted, msg);
        } else if self.work.vlan_add.is_some() {
            tracing::info!("No action required for vlan_add on {}.", self.session.host);
        }

        if ipconf_path {
            self.run_ipconf().await?;
            let msg = format!("IP Conf updates reverted successfully on {}", self.session.guest);
            self.work.set_ipconf_result(OperationStatus::Reverted, msg);
        }
        Ok(())
    }

    /// Removes the bridge of the VLAN being left. The untagged base bridge is never removed.
    async fn delete_stale_bridge(&mut self) -> Result<(), OperationError> {
        let current = match self.configured_vlan().await {
            Ok(vlan) => vlan,
            Err(err) => return Err(self.charge_vlan(VlanKey::Add, err)),
        };
        let Some(vlan) = current else {
            tracing::info!("No vlan configured for the guest, no stale bridge to delete.");
            return Ok(());
        };
        let bridge = bridge_name(&self.base_bridge()?, Some(&vlan));
        self.delete_bridge_if_unused(&bridge).await
    }
}
