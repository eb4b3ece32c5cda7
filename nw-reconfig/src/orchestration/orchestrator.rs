use std::collections::BTreeMap;
use std::sync::Arc;
use nw_reconfig_schemas::payload::{BatchPayload, BatchStatus, SUPPORTED_NETWORKS};
use crate::batch::consolidate::{consolidate, prepare_apply};
use crate::batch::merge::{batch_status, first_failure, merge_results};
use crate::batch::validate::validate_payload;
use crate::batch::NodeWork;
use crate::collaborators::{DnsService, RequestStore};
use crate::direction::Direction;
use crate::error::{BatchError, NetworkErrorCode};
use crate::executor::NodeExecutor;
use crate::hypervisor::{adapter_for, HypervisorAdapter, HypervisorKind};
use crate::orchestration::ReconfigCommon;

/// A failure that did not stop the batch but decides its final status and error code.
#[derive(Debug, Clone)]
struct BatchIssue {
    code: NetworkErrorCode,
    msg: String,
}

/// Runs a whole batch: validation, one executor per node pair in payload order, the controller's
/// hosts file, and the merge of every node's results back into the payload.
pub struct ReconfigOrchestrator {
    common: ReconfigCommon,
    dns: Arc<dyn DnsService>,
    store: Arc<dyn RequestStore>,
    direction: Option<Direction>,
}

impl ReconfigOrchestrator {
    pub fn new(common: ReconfigCommon, dns: Arc<dyn DnsService>, store: Arc<dyn RequestStore>) -> Self {
        Self { common, dns, store, direction: None }
    }

    /// Runs batches in `direction` instead of inferring it from the payload.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Applies or reverts the batch, annotating every operation of `payload` with its outcome.
    /// Only problems found before any node is touched are returned as errors, everything after
    /// that is reported through the payload and the returned status.
    pub async fn apply(&self, payload: &mut BatchPayload) -> Result<BatchStatus, BatchError> {
        let direction = self.direction.unwrap_or_else(|| Direction::infer(payload));
        tracing::info!("{}", "*".repeat(60));
        tracing::info!(
            "Starting {} for operation {} at {}",
            direction.label(),
            self.common.operation_id,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );

        if let Err(err) = validate_payload(payload, direction) {
            self.finish_early(payload, None, err.network_error(), &err.to_string()).await;
            return Err(err.into());
        }
        if direction == Direction::Apply {
            prepare_apply(payload);
            payload.uuid = Some(self.common.operation_id.clone());
        }

        let Some(kind) = self.resolve_hypervisor(payload).await? else {
            tracing::info!("No participating computes in batch");
            let ok = NetworkErrorCode::OperationSuccessful;
            self.finish_early(payload, Some(BatchStatus::Noop), ok, ok.description()).await;
            return Ok(BatchStatus::Noop);
        };
        tracing::info!("Hypervisor of the cluster: {}", kind);

        let mut work = consolidate(payload, direction);
        if work.values().all(|w| !w.has_pending(direction)) {
            tracing::info!("No updates found in batch, nothing to do");
            let ok = NetworkErrorCode::OperationSuccessful;
            self.finish_early(payload, Some(BatchStatus::Noop), ok, ok.description()).await;
            return Ok(BatchStatus::Noop);
        }
        self.store_progress(payload).await;

        let mut issues = Vec::new();
        let hosts_changed = payload.changes_dns_identity();
        let controller_dir = self.common.controller_backup_dir(&self.common.operation_id);
        if let Err(issue) = self.create_controller_backup_dir(&controller_dir, direction).await {
            issues.push(issue);
        }
        if hosts_changed && direction == Direction::Apply {
            if let Err(issue) = self.backup_hosts_file(&controller_dir, direction).await {
                issues.push(issue);
            }
        }

        let adapter = adapter_for(kind);
        let restore_id = payload.uuid.clone().unwrap_or_else(|| self.common.operation_id.clone());
        let mut results = BTreeMap::new();
        for compute in payload.node_subset.participating_computes.clone() {
            let Some(node_work) = work.remove(&compute.alias) else { continue };
            let (node_work, issue) = self.run_node(
                adapter.as_ref(), &compute.hostname, direction, &restore_id, hosts_changed, node_work,
            ).await;
            if let Some(issue) = issue {
                issues.push(issue);
            }
            results.insert(compute.alias.clone(), node_work);
        }

        if hosts_changed {
            issues.extend(self.reconcile_hosts_file(&controller_dir, &restore_id, direction).await);
        }

        merge_results(payload, &results);
        let mut status = batch_status(payload);
        if !issues.is_empty() {
            status = BatchStatus::Failure;
        }
        let (code, msg) = match (issues.first(), first_failure(payload)) {
            (Some(issue), _) => (issue.code, issue.msg.clone()),
            // no executor step failed but an entry the node could not act on is still FAILURE
            (None, Some(failed)) => (direction.network_error(), format!(
                "Operation {} for {} left in FAILURE state",
                failed.op,
                failed.compute_node_alias().unwrap_or("every node")
            )),
            (None, None) => (NetworkErrorCode::OperationSuccessful, NetworkErrorCode::OperationSuccessful.description().to_string()),
        };
        self.annotate(payload, Some(status), code, &msg);
        self.store_final(payload).await;

        tracing::info!("{} finished with status {}", direction.label(), status);
        tracing::debug!("final payload:\n{}", payload);
        tracing::info!("{}", "*".repeat(60));
        Ok(status)
    }

    /// Hypervisor family of the cluster, looked up on the first participating compute. `None`
    /// when the batch has no computes at all.
    async fn resolve_hypervisor(&self, payload: &mut BatchPayload) -> Result<Option<HypervisorKind>, BatchError> {
        let Some(first) = payload.node_subset.participating_computes.first() else {
            return Ok(None);
        };
        let host = first.hostname.clone();
        let reported = match self.common.inventory.hypervisor_type(&host).await {
            Ok(reported) => reported,
            Err(err) => {
                tracing::warn!("{:#}", err);
                String::from("unknown")
            }
        };
        match reported.trim().parse::<HypervisorKind>() {
            Ok(kind) => Ok(Some(kind)),
            Err(_) => {
                let err = BatchError::UnsupportedHypervisor {
                    msg: format!("Unsupported hypervisor {reported} found on {host}"),
                };
                tracing::error!("{}", err);
                self.finish_early(payload, Some(BatchStatus::Noop), err.network_error(), &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Runs one node pair. A failure is recorded on the node's entries and returned as an issue,
    /// the batch carries on with the next node pair.
    async fn run_node(
        &self,
        adapter: &dyn HypervisorAdapter,
        host: &str,
        direction: Direction,
        restore_id: &str,
        hosts_changed: bool,
        mut node_work: NodeWork,
    ) -> (NodeWork, Option<BatchIssue>) {
        if !node_work.has_pending(direction) {
            tracing::info!("No updates found for node {}", host);
            return (node_work, None);
        }
        let guest = match self.common.inventory.guest_for_host(host).await {
            Ok(guest) => guest,
            Err(err) => {
                tracing::warn!("{:#}", err);
                let msg = format!("Cannot find guest for node {host}");
                tracing::error!("{}", msg);
                node_work.fail_pending(direction, &msg);
                return (node_work, Some(BatchIssue { code: direction.network_error(), msg }));
            }
        };
        tracing::info!("Processing node pair {} / {}", host, guest);

        let mut executor = NodeExecutor::new(&self.common, adapter, host, &guest, direction, restore_id, node_work);
        let issue = match executor.run().await {
            Ok(()) => None,
            Err(err) => {
                tracing::error!("{} failed on {}: {}", direction.label(), host, err);
                Some(BatchIssue { code: err.network_error(), msg: err.message().to_string() })
            }
        };
        let node_work = executor.into_work();

        if issue.is_none() && hosts_changed && direction == Direction::Apply {
            if let Err(issue) = self.update_hosts_entries(&guest, &node_work).await {
                return (node_work, Some(issue));
            }
        }
        (node_work, issue)
    }

    async fn run_controller(&self, cmd: &str, failure: String, direction: Direction) -> Result<(), BatchIssue> {
        let output = match self.common.gateway.run_local(cmd).await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!("{:#}", err);
                return Err(self.issue(direction, failure));
            }
        };
        if !output.success() {
            return Err(self.issue(direction, failure));
        }
        Ok(())
    }

    fn issue(&self, direction: Direction, msg: String) -> BatchIssue {
        tracing::error!("{}", msg);
        BatchIssue { code: direction.network_error(), msg }
    }

    async fn create_controller_backup_dir(&self, dir: &str, direction: Direction) -> Result<(), BatchIssue> {
        tracing::debug!("Creating controller backup directory {}", dir);
        let failure = format!("Failed to create backup dir {dir} on {}", self.common.settings.master_cps);
        self.run_controller(&format!("/bin/mkdir -p {dir}"), failure, direction).await
    }

    async fn backup_hosts_file(&self, dir: &str, direction: Direction) -> Result<(), BatchIssue> {
        let hosts = &self.common.settings.paths.hosts_file;
        let failure = format!("Failed to take backup of {hosts} on {}", self.common.settings.master_cps);
        self.run_controller(&format!("/bin/cp {hosts} {dir}"), failure, direction).await
    }

    /// Drops the hosts entries of the guest's old backup address and publishes the new ones.
    async fn update_hosts_entries(&self, guest: &str, work: &NodeWork) -> Result<(), BatchIssue> {
        let failed = |err: anyhow::Error| {
            tracing::warn!("{:#}", err);
            self.issue(Direction::Apply, format!("Failed to update hosts entries for {guest}"))
        };
        if let Some(old) = &work.vlan_delete {
            for key in ["ip", "hostname"] {
                if let Some(entry) = old.payload_str(key) {
                    self.dns.delete_entry(&entry).await.map_err(failed)?;
                }
            }
        }
        let Some(ipconf) = &work.ipconf_updates else { return Ok(()) };
        for network in ipconf.entities.iter().filter(|e| SUPPORTED_NETWORKS.contains(&e.as_str())) {
            let config = self.common.inventory.vm_network(guest, network).await.map_err(failed)?;
            if let (Some(fqdn), Some(ip)) = (config.fqdn(), config.ip.as_ref()) {
                self.dns.add_entry(&fqdn, ip).await.map_err(failed)?;
            }
        }
        Ok(())
    }

    /// Brings the controller's hosts file in line with the nodes and reloads the DNS server. A
    /// revert puts back the copy taken by the batch being reverted.
    async fn reconcile_hosts_file(&self, dir: &str, restore_id: &str, direction: Direction) -> Vec<BatchIssue> {
        let mut issues = Vec::new();
        if direction == Direction::Revert {
            if let Err(issue) = self.restore_hosts_file(dir, restore_id).await {
                issues.push(issue);
            }
        }
        if let Err(err) = self.dns.sync_remote().await {
            tracing::warn!("{:#}", err);
            issues.push(self.issue(direction, "Failed to sync hosts file to the remote controller".to_string()));
        }
        if let Err(err) = self.dns.restart().await {
            tracing::warn!("{:#}", err);
            issues.push(self.issue(direction, "Failed to restart DNS server".to_string()));
        }
        issues
    }

    async fn restore_hosts_file(&self, dir: &str, restore_id: &str) -> Result<(), BatchIssue> {
        self.backup_hosts_file(dir, Direction::Revert).await?;
        let hosts = &self.common.settings.paths.hosts_file;
        let file_name = hosts.rsplit('/').next().unwrap_or(hosts);
        let saved = format!("{}/{file_name}", self.common.controller_backup_dir(restore_id));
        let failure = format!("Failed to revert {saved} to {hosts} on {}", self.common.settings.master_cps);
        self.run_controller(&format!("/usr/bin/sudo /bin/cp {saved} {hosts}"), failure, Direction::Revert).await
    }

    fn annotate(&self, payload: &mut BatchPayload, status: Option<BatchStatus>, code: NetworkErrorCode, msg: &str) {
        if status.is_some() {
            payload.update_network.status = status;
        }
        payload.update_network.msg = msg.to_string();
        payload.update_network.errorcode = Some(code.hex());
    }

    async fn finish_early(&self, payload: &mut BatchPayload, status: Option<BatchStatus>, code: NetworkErrorCode, msg: &str) {
        self.annotate(payload, status, code, msg);
        self.store_final(payload).await;
    }

    async fn store_progress(&self, payload: &BatchPayload) {
        if let Err(err) = self.store.store(payload).await {
            tracing::warn!("could not store request progress: {:#}", err);
        }
    }

    async fn store_final(&self, payload: &BatchPayload) {
        if let Err(err) = self.store.store(payload).await {
            tracing::error!("could not store request result: {:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nw_reconfig_schemas::payload::OperationStatus;
    use crate::testing::{
        common_with_inventory, operation, revert_payload, MemoryStore, MockInventory, RecordingDns, ScriptedGateway,
        OPERATION_ID, REVERT_UUID,
    };

    struct Harness {
        gateway: Arc<ScriptedGateway>,
        dns: Arc<RecordingDns>,
        store: Arc<MemoryStore>,
        orchestrator: ReconfigOrchestrator,
    }

    fn harness(inventory: MockInventory) -> Harness {
        let gateway = Arc::new(ScriptedGateway::default());
        let dns = Arc::new(RecordingDns::default());
        let store = Arc::new(MemoryStore::default());
        let common = common_with_inventory(gateway.clone(), Arc::new(inventory));
        let orchestrator = ReconfigOrchestrator::new(common, dns.clone(), store.clone());
        Harness { gateway, dns, store, orchestrator }
    }

    fn statuses(payload: &BatchPayload) -> Vec<String> {
        payload.operations().map(|o| o.status.clone()).collect()
    }

    #[tokio::test]
    async fn test_all_noop_batch_touches_nothing() {
        let h = harness(MockInventory::default());
        let mut payload = revert_payload();
        for node in payload.update_network.nodes.iter_mut() {
            for operation in node.networks.values_mut().flatten() {
                operation.status = "NOOP".into();
            }
        }
        for service in payload.update_network.network_services.iter_mut() {
            service.status = "REVERTED".into();
        }

        let status = h.orchestrator.apply(&mut payload).await.unwrap();
        assert_eq!(status, BatchStatus::Noop);
        assert_eq!(payload.update_network.status, Some(BatchStatus::Noop));
        assert!(h.gateway.commands().is_empty());
        assert!(h.dns.calls().is_empty());
        assert_eq!(h.store.last().unwrap().update_network.errorcode.as_deref(), Some("0x00000000"));
    }

    #[tokio::test]
    async fn test_unsupported_hypervisor_is_fatal_before_any_node() {
        let h = harness(MockInventory::with_hypervisor("hyperv"));
        let mut payload = revert_payload();
        let err = h.orchestrator.apply(&mut payload).await.unwrap_err();

        assert_eq!(err.code().to_string(), "0x8005");
        assert!(err.to_string().contains("Unsupported hypervisor"));
        assert_eq!(payload.update_network.status, Some(BatchStatus::Noop));
        assert!(h.gateway.commands().is_empty());
        assert_eq!(h.store.last().unwrap().update_network.status, Some(BatchStatus::Noop));
    }

    #[tokio::test]
    async fn test_validation_failure_is_returned() {
        let h = harness(MockInventory::default());
        let mut payload = revert_payload();
        payload.node_subset.num_participating_computes = 3;
        let err = h.orchestrator.apply(&mut payload).await.unwrap_err();
        assert_eq!(err.code().to_string(), "0x8001");
        assert_eq!(payload.update_network.errorcode.as_deref(), Some("0x02040000"));
        assert!(h.gateway.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_continues_past_failed_node() {
        let h = harness(MockInventory::default());
        h.gateway.fail_on("grep -w -F vmbondeth1.310", 1);
        h.gateway.respond("virsh list --all", "vm-a\n");
        h.gateway.fail_on("ipconf -newconf", 1);
        let mut payload = revert_payload();

        let status = h.orchestrator.apply(&mut payload).await.unwrap();
        assert_eq!(status, BatchStatus::Failure);
        assert_eq!(payload.update_network.errorcode.as_deref(), Some("0x02040006"));
        assert_eq!(payload.update_network.msg, "Failed to run ipconf on vm-b");

        // node-1 reverted, node-2 and its dns update failed
        assert_eq!(statuses(&payload), vec!["REVERTED", "REVERTED", "FAILURE", "FAILURE"]);
        let node1 = &payload.update_network.nodes[0].networks["backup"];
        assert_eq!(node1[1].msg, "VLAN delete operation reverted successfully on dom0-a");

        let log = h.gateway.commands();
        let last_node1 = log.iter().rposition(|c| c.starts_with("dom0-a:") || c.starts_with("vm-a:")).unwrap();
        let first_node2 = log.iter().position(|c| c.starts_with("vm-b:")).unwrap();
        assert!(last_node1 < first_node2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_restores_hosts_file() {
        let h = harness(MockInventory::default());
        h.gateway.respond("virsh list --all", "vm-a\n");
        let mut payload = revert_payload();

        let status = h.orchestrator.apply(&mut payload).await.unwrap();
        assert_eq!(status, BatchStatus::Success);
        assert_eq!(payload.uuid.as_deref(), Some(REVERT_UUID));

        let local: Vec<String> = h.gateway.commands().into_iter().filter(|c| c.starts_with("local:")).collect();
        assert_eq!(local, vec![
            format!("local: /bin/mkdir -p /opt/oci/exacc/exacloud/scratch/nw_reconfig/{OPERATION_ID}"),
            format!("local: /bin/cp /etc/hosts.exacc_domu /opt/oci/exacc/exacloud/scratch/nw_reconfig/{OPERATION_ID}"),
            format!("local: /usr/bin/sudo /bin/cp /opt/oci/exacc/exacloud/scratch/nw_reconfig/{REVERT_UUID}/hosts.exacc_domu /etc/hosts.exacc_domu"),
        ]);
        assert_eq!(h.dns.calls(), vec!["sync", "restart"]);
        // hosts are reconciled once every node is done
        let log = h.gateway.commands();
        assert!(log.last().unwrap().contains("hosts.exacc_domu /etc/hosts.exacc_domu"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_guest_fails_only_that_node() {
        let inventory = MockInventory::default();
        inventory.missing_guests.lock().unwrap().insert("vm-b".into());
        let h = harness(inventory);
        h.gateway.respond("virsh list --all", "vm-a\n");
        let mut payload = revert_payload();

        let status = h.orchestrator.apply(&mut payload).await.unwrap();
        assert_eq!(status, BatchStatus::Failure);
        let node2 = &payload.update_network.nodes[1].networks["backup"][0];
        assert_eq!(node2.status, "FAILURE");
        assert_eq!(node2.msg, "Cannot find guest for node dom0-b");
        assert_eq!(h.gateway.count("vm-b:"), 0);
        assert_eq!(h.gateway.count("dom0-b:"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_stamps_uuid_and_publishes_hosts() {
        let h = harness(MockInventory::default());
        h.gateway.respond("operstate", "up\n");
        h.gateway.respond(
            "/bin/cat /EXAVMIMAGES/GuestImages/vm-a/vmbondeth1.411.xml",
            "<address type='pci' domain='0x0000' bus='0x00' slot='0x0b' function='0x0'/>",
        );
        h.gateway.respond("virsh list --all", "vm-a\n");
        let mut payload = revert_payload();
        payload.uuid = None;

        let status = h.orchestrator.apply(&mut payload).await.unwrap();
        assert_eq!(status, BatchStatus::Success);
        assert_eq!(payload.uuid.as_deref(), Some(OPERATION_ID));
        assert_eq!(payload.update_network.errorcode.as_deref(), Some("0x00000000"));
        assert_eq!(statuses(&payload), vec!["SUCCESS", "SUCCESS", "SUCCESS", "SUCCESS"]);
        assert!(payload.operations().all(|o| o.parsed_status() == Some(OperationStatus::Success)));

        assert_eq!(h.gateway.count("local: /bin/cp /etc/hosts.exacc_domu"), 1);
        assert_eq!(h.gateway.count("/usr/bin/sudo /bin/cp"), 0);
        assert_eq!(h.dns.calls(), vec![
            "delete 10.0.1.5",
            "delete vm-a-bk",
            "add vm-b-bk.example.com 10.0.1.9",
            "sync",
            "restart",
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreverted_failure_carries_revert_code() {
        let h = harness(MockInventory::default());
        h.gateway.respond("virsh list --all", "vm-a\n");
        let mut payload = revert_payload();
        payload.update_network.nodes[0].networks.get_mut("backup").unwrap()
            .push(operation("cidr_update", Some("node-1"), "FAILURE"));

        let status = h.orchestrator.apply(&mut payload).await.unwrap();
        assert_eq!(status, BatchStatus::Failure);
        // the vlan path wins, the ip configuration of node-1 stays failed
        let node1 = &payload.update_network.nodes[0].networks["backup"];
        assert_eq!(node1[0].status, "REVERTED");
        assert_eq!(node1[2].status, "FAILURE");
        assert_eq!(payload.update_network.errorcode.as_deref(), Some("0x02040006"));
        assert_eq!(payload.update_network.msg, "Operation cidr_update for node-1 left in FAILURE state");
        assert_eq!(h.store.last().unwrap().update_network.errorcode.as_deref(), Some("0x02040006"));
    }

    #[tokio::test]
    async fn test_forced_revert_needs_uuid() {
        let h = harness(MockInventory::default());
        let orchestrator = h.orchestrator.with_direction(Direction::Revert);
        let mut payload = revert_payload();
        payload.uuid = None;
        let err = orchestrator.apply(&mut payload).await.unwrap_err();
        assert!(err.to_string().contains("UUID missing in payload."));
    }
}
