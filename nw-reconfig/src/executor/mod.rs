use std::time::Duration;
use nw_reconfig_schemas::inventory::InterfaceInfo;
use nw_reconfig_schemas::payload::{is_no_vlan, OperationStatus, BACKUP_NETWORK};
use crate::batch::NodeWork;
use crate::direction::{Direction, VlanKey};
use crate::error::OperationError;
use crate::executor::session::NodeSession;
use crate::hypervisor::{bridge_name, detect_shared_bridge, BondedBridge, HypervisorAdapter};
use crate::orchestration::ReconfigCommon;

pub mod apply;
pub mod revert;
pub mod session;

/// Drives the consolidated work of one host and guest pair to completion. A new executor is built
/// for every node pair and owns that node's results until it is turned back into a `NodeWork`.
pub struct NodeExecutor<'a> {
    session: NodeSession<'a>,
    adapter: &'a dyn HypervisorAdapter,
    work: NodeWork,
    interface: Option<InterfaceInfo>,
}

impl<'a> NodeExecutor<'a> {
    /// `restore_id` names the batch whose backups a revert restores from.
    pub fn new(
        common: &'a ReconfigCommon,
        adapter: &'a dyn HypervisorAdapter,
        host: &str,
        guest: &str,
        direction: Direction,
        restore_id: &str,
        work: NodeWork,
    ) -> Self {
        let session = NodeSession {
            common,
            host: host.to_string(),
            guest: guest.to_string(),
            direction,
            backup_dir: common.node_backup_dir(&common.operation_id),
            restore_dir: common.node_backup_dir(restore_id),
        };
        Self { session, adapter, work, interface: None }
    }

    pub fn work(&self) -> &NodeWork {
        &self.work
    }

    pub fn into_work(self) -> NodeWork {
        self.work
    }

    fn direction(&self) -> Direction {
        self.session.direction
    }

    /// Runs every pending step for this node. Nothing at all is done when no entry is pending,
    /// which is what makes re-submitting a batch safe.
    pub async fn run(&mut self) -> Result<(), OperationError> {
        if !self.work.has_pending(self.direction()) {
            tracing::info!("No updates found for node {}", self.session.host);
            return Ok(());
        }
        if self.work.has_vlan() {
            self.load_interface_info().await?;
        }
        self.create_backup_dirs().await?;
        match self.direction() {
            Direction::Apply => self.apply_configuration().await,
            Direction::Revert => self.revert_configuration().await,
        }
    }

    fn step_failure(&self, msg: String) -> OperationError {
        tracing::error!("{}", msg);
        self.direction().step_failure(msg)
    }

    fn charge_vlan(&mut self, key: VlanKey, err: OperationError) -> OperationError {
        self.work.set_vlan_result(key, OperationStatus::Failure, err.message());
        err
    }

    fn charge_vlans(&mut self, err: OperationError) -> OperationError {
        self.work.set_vlan_results(OperationStatus::Failure, err.message());
        err
    }

    fn charge_ipconf(&mut self, err: OperationError) -> OperationError {
        self.work.set_ipconf_result(OperationStatus::Failure, err.message());
        err
    }

    /// Marks every entry still waiting for work as failed.
    fn charge_pending(&mut self, err: OperationError) -> OperationError {
        self.work.fail_pending(self.direction(), err.message());
        err
    }

    fn charge_pending_vlans(&mut self, err: OperationError) -> OperationError {
        let direction = self.direction();
        for key in [VlanKey::Add, VlanKey::Delete] {
            if self.work.vlan_pending(key, direction) {
                self.work.set_vlan_result(key, OperationStatus::Failure, err.message());
            }
        }
        err
    }

    async fn load_interface_info(&mut self) -> Result<(), OperationError> {
        let interfaces = self.session.common.inventory.interface_info(&self.session.host).await;
        match interfaces.ok().and_then(|mut i| i.remove(BACKUP_NETWORK)) {
            Some(interface) => {
                self.interface = Some(interface);
                Ok(())
            }
            None => {
                let err = self.step_failure(format!("Cannot find network info for node {}", self.session.host));
                Err(self.charge_vlans(err))
            }
        }
    }

    fn interface(&self) -> Result<&InterfaceInfo, OperationError> {
        self.interface.as_ref().ok_or_else(|| {
            self.direction().step_failure(format!("Cannot find network info for node {}", self.session.host))
        })
    }

    fn base_bridge(&self) -> Result<String, OperationError> {
        Ok(self.interface()?.bridge.clone())
    }

    /// VLAN the guest's backup network is configured with right now, `None` when untagged.
    async fn configured_vlan(&self) -> Result<Option<String>, OperationError> {
        let inventory = &self.session.common.inventory;
        match inventory.vm_network(&self.session.guest, BACKUP_NETWORK).await {
            Ok(network) => Ok(network.vlan_tag.filter(|tag| !is_no_vlan(tag))),
            Err(err) => {
                tracing::warn!("{:#}", err);
                Err(self.step_failure(format!("Cannot find {BACKUP_NETWORK} network info for {}", self.session.guest)))
            }
        }
    }

    async fn create_backup_dirs(&mut self) -> Result<(), OperationError> {
        let cmd = format!("/bin/mkdir -p {}", self.session.backup_dir);
        tracing::debug!("Creating backup directory on {}", self.session.guest);
        if !self.session.run_on_guest(&cmd).await.success() {
            let err = self.step_failure(format!(
                "Failed to create backup dir {} on {}", self.session.backup_dir, self.session.guest
            ));
            return Err(self.charge_pending(err));
        }
        tracing::debug!("Creating backup directory on {}", self.session.host);
        if !self.session.run_on_host(&cmd).await.success() {
            let err = self.step_failure(format!(
                "Failed to create backup dir {} on {}", self.session.backup_dir, self.session.host
            ));
            return Err(self.charge_pending(err));
        }
        Ok(())
    }

    async fn bridge_exists(&self, bridge: &str) -> bool {
        self.session
            .run_on_host(&format!("/usr/sbin/brctl show | grep -w -F {bridge}"))
            .await
            .success()
    }

    /// Creates the bonded bridge for `vlan` unless it is already there.
    async fn add_bonded_bridge(&mut self, vlan: &str) -> Result<(), OperationError> {
        let key = self.direction().bridge_add_result_key();
        let interface = self.interface()?.clone();
        let bridge = bridge_name(&interface.bridge, Some(vlan));
        if self.bridge_exists(&bridge).await {
            tracing::info!("Bonded bridge {} already existing on {}.", bridge, self.session.host);
            return Ok(());
        }
        tracing::info!("Bonded bridge {} doesn't exist on {}. Trying to add", bridge, self.session.host);

        let slaves = interface.slaves();
        let [first_slave, second_slave] = slaves.as_slice() else {
            let err = self.step_failure(format!(
                "Incorrect slave interfaces {slaves:?} returned for {BACKUP_NETWORK} network."
            ));
            return Err(self.charge_vlan(key, err));
        };
        let lacp = match self.session.common.inventory.vm_network(&self.session.guest, BACKUP_NETWORK).await {
            Ok(network) => network.lacp,
            Err(_) => false,
        };
        let cmd = self.adapter.add_bonded_bridge_command(self.session.paths(), &BondedBridge {
            base: &interface.bridge,
            first_slave,
            second_slave,
            vlan,
            lacp,
        });
        if !self.session.run_on_host(&cmd).await.success() {
            let err = self.step_failure(format!("Couldn't add bonded bridge {bridge} on {}", self.session.host));
            return Err(self.charge_vlan(key, err));
        }
        Ok(())
    }

    /// Removes `bridge` when it exists and no other domain on the host uses it.
    async fn delete_bridge_if_unused(&mut self, bridge: &str) -> Result<(), OperationError> {
        let key = self.direction().bridge_delete_result_key();
        if !self.bridge_exists(bridge).await {
            tracing::info!("Bonded bridge {} doesn't exist on {}", bridge, self.session.host);
            return Ok(());
        }
        tracing::info!("Bonded bridge {} exists on {}", bridge, self.session.host);

        let shared = detect_shared_bridge(self.adapter, &self.session, bridge).await;
        match shared {
            Ok(true) => {
                tracing::info!("Skipping removal of bridge {}.", bridge);
                return Ok(());
            }
            Ok(false) => {}
            Err(err) => return Err(self.charge_vlan(key, err)),
        }

        tracing::info!("Trying to delete bonded bridge {} on {}.", bridge, self.session.host);
        let cmd = self.adapter.remove_bridge_command(self.session.paths(), bridge);
        if !self.session.run_on_host(&cmd).await.success() {
            let msg = format!("Couldn't delete bonded bridge {bridge} on {}", self.session.host);
            tracing::error!("{}", msg);
            let err = self.direction().stale_bridge_failure(msg);
            return Err(self.charge_vlan(key, err));
        }
        tracing::debug!("Removed stale bridge {}", bridge);
        Ok(())
    }

    /// Stops and starts the guest so the hypervisor picks up its new bridge attachments, then
    /// waits for the guest to accept connections again.
    async fn restart_domain(&mut self) -> Result<(), OperationError> {
        let result = self.stop_start_and_wait().await;
        result.map_err(|err| self.charge_pending_vlans(err))
    }

    async fn stop_start_and_wait(&self) -> Result<(), OperationError> {
        let session = &self.session;
        let guest = &session.guest;
        let reboot_failed = |msg: String| {
            tracing::error!("{}", msg);
            OperationError::RebootFailed { msg }
        };

        let stop = self.adapter.stop_domain_command(session.paths(), guest);
        if session.run_async_on_host(&stop).await != 0 {
            return Err(reboot_failed(format!("Failed to stop domain {guest} while attempting to restart")));
        }
        let start = self.adapter.start_domain_command(session.paths(), guest);
        if session.run_async_on_host(&start).await != 0 {
            return Err(reboot_failed(format!("Failed to start domain {guest} while attempting to restart")));
        }

        tracing::info!("Waiting for domain to be available.");
        let timings = &session.common.settings.timings;
        let timeout = timings.restart_timeout_secs;
        let decrement = timings.restart_decrement_secs.max(1);
        let mut remaining = timeout;
        while remaining > 0 {
            tokio::time::sleep(Duration::from_secs(timeout / 10)).await;
            if session.guest_reachable().await {
                tracing::info!("Successfully restarted domain {}", guest);
                return Ok(());
            }
            tracing::info!("Waiting for host:{} to be pingable", guest);
            remaining = remaining.saturating_sub(decrement);
        }
        tracing::error!("Host:{} didn't reboot after {} seconds.", guest, timeout);
        Err(reboot_failed(format!("Failed to connect to domain {guest} after restart")))
    }

    /// Runs the ip configuration tool on the guest against the staged cell configuration.
    async fn run_ipconf(&mut self) -> Result<(), OperationError> {
        let paths = self.session.paths();
        let cmd = format!("{} -newconf {}.nw_reconfig -force", paths.ipconf, paths.cell_conf);
        if !self.session.run_on_guest(&cmd).await.success() {
            let err = self.step_failure(format!("Failed to run ipconf on {}", self.session.guest));
            return Err(self.charge_ipconf(err));
        }
        Ok(())
    }
}
