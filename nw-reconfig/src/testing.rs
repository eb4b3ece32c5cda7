//! Scripted collaborators and payload fixtures shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use nw_reconfig_schemas::inventory::{InterfaceInfo, VmNetworkConfig};
use nw_reconfig_schemas::payload::{BatchPayload, Operation};
use nw_reconfig_schemas::settings::ReconfigSettings;
use crate::collaborators::{ClusterInventory, DnsService, RequestStore};
use crate::direction::Direction;
use crate::executor::session::NodeSession;
use crate::gateway::{CommandOutput, RemoteCommandGateway};
use crate::orchestration::ReconfigCommon;

pub const REVERT_UUID: &str = "c0ffee00-5e1f-4d2a-9b7e-0123456789ab";
pub const OPERATION_ID: &str = "op-7f3a";

/// A reverted batch: node-1 had its backup VLAN moved from 310 to 411 (the add half failed),
/// node-2 had a failed address change together with a DNS server update.
pub fn revert_payload() -> BatchPayload {
    let payload = json!({
        "uuid": REVERT_UUID,
        "node_subset": {
            "participating_computes": [
                {"compute_node_alias": "node-1", "compute_node_hostname": "dom0-a"},
                {"compute_node_alias": "node-2", "compute_node_hostname": "dom0-b"}
            ],
            "num_participating_computes": 2
        },
        "updateNetwork": {
            "nodes": [
                {
                    "updateProperties": {"backup": ["vlantag"]},
                    "backup": [
                        {"op": "vlan_add", "payload": {"vlantag": "411", "compute_node_alias": "node-1"},
                         "status": "FAILED", "msg": "Couldn't allocate bridge vmbondeth1.411 to domain vm-a"},
                        {"op": "vlan_delete", "payload": {"vlantag": "310", "compute_node_alias": "node-1",
                         "ip": "10.0.1.5", "hostname": "vm-a-bk"},
                         "status": "SUCCESS", "msg": "VLAN delete operation successful on dom0-a"}
                    ]
                },
                {
                    "updateProperties": {"backup": ["ip"]},
                    "backup": [
                        {"op": "cidr_update", "payload": {"ip": "10.0.2.7", "compute_node_alias": "node-2"},
                         "status": "FAILURE", "msg": "Failed to run ipconf"}
                    ]
                }
            ],
            "networkServices": [
                {"op": "dns_update", "payload": {"servers": ["10.0.0.2"], "compute_node_alias": "node-2"},
                 "status": "SUCCESS", "msg": ""}
            ],
            "status": "FAILURE",
            "msg": "Failed to run ipconf"
        }
    });
    serde_json::from_value(payload).unwrap()
}

pub fn operation(op: &str, alias: Option<&str>, status: &str) -> Operation {
    let mut payload = Map::new();
    if let Some(alias) = alias {
        payload.insert("compute_node_alias".into(), Value::from(alias));
    }
    Operation { op: op.into(), payload, status: status.into(), msg: String::new() }
}

#[derive(Default)]
struct Script {
    failures: Vec<(String, i32, String)>,
    responses: Vec<(String, String)>,
    unreachable: BTreeSet<String>,
    log: Vec<String>,
    written: BTreeMap<String, String>,
}

/// Gateway that records every command as `"<host>: <cmd>"` (`"local: <cmd>"` on the controller)
/// and answers from a script. Unscripted commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<Script>,
}

impl ScriptedGateway {
    /// Commands containing `pattern` exit with `code`.
    pub fn fail_on(&self, pattern: &str, code: i32) {
        self.fail_with_stderr(pattern, code, "");
    }

    pub fn fail_with_stderr(&self, pattern: &str, code: i32, stderr: &str) {
        self.script.lock().unwrap().failures.push((pattern.into(), code, stderr.into()));
    }

    /// Commands containing `pattern` succeed printing `stdout`.
    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.script.lock().unwrap().responses.push((pattern.into(), stdout.into()));
    }

    pub fn set_unreachable(&self, host: &str) {
        self.script.lock().unwrap().unreachable.insert(host.into());
    }

    pub fn commands(&self) -> Vec<String> {
        self.script.lock().unwrap().log.clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    pub fn written(&self, path: &str) -> Option<String> {
        self.script.lock().unwrap().written.get(path).cloned()
    }

    fn answer(&self, node: &str, cmd: &str) -> anyhow::Result<CommandOutput> {
        let mut script = self.script.lock().unwrap();
        script.log.push(format!("{node}: {cmd}"));
        if script.unreachable.contains(node) {
            bail!("ssh: connect to host {node} port 22: No route to host");
        }
        if let Some((_, code, stderr)) = script.failures.iter().find(|(p, _, _)| cmd.contains(p.as_str())) {
            return Ok(CommandOutput::failed(*code, stderr.clone()));
        }
        let stdout = script.responses.iter()
            .find(|(p, _)| cmd.contains(p.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(CommandOutput::ok(stdout))
    }
}

#[async_trait]
impl RemoteCommandGateway for ScriptedGateway {
    async fn run(&self, host: &str, _user: &str, cmd: &str) -> anyhow::Result<CommandOutput> {
        self.answer(host, cmd)
    }

    async fn run_async(&self, host: &str, _user: &str, cmd: &str) -> anyhow::Result<i32> {
        Ok(self.answer(host, cmd)?.exit_code)
    }

    async fn run_local(&self, cmd: &str) -> anyhow::Result<CommandOutput> {
        self.answer("local", cmd)
    }

    async fn write_file(&self, host: &str, _user: &str, path: &str, contents: &str) -> anyhow::Result<()> {
        let output = self.answer(host, &format!("<write {path}>"))?;
        if !output.success() {
            bail!("writing {path} on {host} failed");
        }
        self.script.lock().unwrap().written.insert(path.into(), contents.into());
        Ok(())
    }

    async fn try_connect(&self, host: &str, _user: &str) -> bool {
        self.answer(host, "<connect>").is_ok_and(|o| o.success())
    }
}

/// Two host and guest pairs, `dom0-a`/`vm-a` and `dom0-b`/`vm-b`, on the same hypervisor, with
/// the backup network now on VLAN 411.
pub struct MockInventory {
    pub hypervisor: Mutex<String>,
    pub vlan_tag: Mutex<Option<String>>,
    pub missing_guests: Mutex<BTreeSet<String>>,
}

impl Default for MockInventory {
    fn default() -> Self {
        Self {
            hypervisor: Mutex::new("kvm".into()),
            vlan_tag: Mutex::new(Some("411".into())),
            missing_guests: Mutex::new(BTreeSet::new()),
        }
    }
}

impl MockInventory {
    pub fn with_hypervisor(hypervisor: &str) -> Self {
        let inventory = Self::default();
        *inventory.hypervisor.lock().unwrap() = hypervisor.into();
        inventory
    }
}

#[async_trait]
impl ClusterInventory for MockInventory {
    async fn guest_for_host(&self, host: &str) -> anyhow::Result<String> {
        let guest = host.strip_prefix("dom0-").map(|s| format!("vm-{s}")).context("unknown host")?;
        if self.missing_guests.lock().unwrap().contains(&guest) {
            bail!("no guest found for {host}");
        }
        Ok(guest)
    }

    async fn hypervisor_type(&self, _host: &str) -> anyhow::Result<String> {
        Ok(self.hypervisor.lock().unwrap().clone())
    }

    async fn interface_info(&self, _host: &str) -> anyhow::Result<BTreeMap<String, InterfaceInfo>> {
        let backup = InterfaceInfo {
            bridge: "vmbondeth1".into(),
            bond_slaves: "eth3 eth4".into(),
            bond_master: "bondeth1".into(),
        };
        Ok(BTreeMap::from([("backup".to_string(), backup)]))
    }

    async fn vm_network(&self, guest: &str, _network: &str) -> anyhow::Result<VmNetworkConfig> {
        Ok(VmNetworkConfig {
            vlan_tag: self.vlan_tag.lock().unwrap().clone(),
            lacp: false,
            ip: Some("10.0.1.9".into()),
            hostname: Some(format!("{guest}-bk")),
            domain: Some("example.com".into()),
        })
    }

    async fn staged_ip_config(&self, guest: &str) -> anyhow::Result<String> {
        Ok(format!("<Cell><Hostname>{guest}</Hostname></Cell>"))
    }
}

/// Records calls as `"delete <entry>"`, `"add <fqdn> <ip>"`, `"sync"` and `"restart"`.
#[derive(Default)]
pub struct RecordingDns {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingDns {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsService for RecordingDns {
    async fn delete_entry(&self, entry: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("delete {entry}"));
        Ok(())
    }

    async fn add_entry(&self, fqdn: &str, ip: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("add {fqdn} {ip}"));
        Ok(())
    }

    async fn sync_remote(&self) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("sync".into());
        Ok(())
    }

    async fn restart(&self) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("restart".into());
        Ok(())
    }
}

/// Keeps every stored snapshot of the payload.
#[derive(Default)]
pub struct MemoryStore {
    pub stored: Mutex<Vec<BatchPayload>>,
}

impl MemoryStore {
    pub fn last(&self) -> Option<BatchPayload> {
        self.stored.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn store(&self, payload: &BatchPayload) -> anyhow::Result<()> {
        self.stored.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

pub fn common_with(gateway: Arc<dyn RemoteCommandGateway>) -> ReconfigCommon {
    common_with_inventory(gateway, Arc::new(MockInventory::default()))
}

pub fn common_with_inventory(gateway: Arc<dyn RemoteCommandGateway>, inventory: Arc<dyn ClusterInventory>) -> ReconfigCommon {
    let mut settings = ReconfigSettings::default();
    settings.timings.restart_timeout_secs = 60;
    ReconfigCommon { settings, gateway, inventory, operation_id: OPERATION_ID.into() }
}

/// Session for `dom0-a`/`vm-a`, restoring from the backups of `REVERT_UUID`.
pub fn session(common: &ReconfigCommon, direction: Direction) -> NodeSession<'_> {
    NodeSession {
        common,
        host: "dom0-a".into(),
        guest: "vm-a".into(),
        direction,
        backup_dir: common.node_backup_dir(&common.operation_id),
        restore_dir: common.node_backup_dir(REVERT_UUID),
    }
}
