use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Formatter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};

/// The only network whose VLAN and IP configuration can currently be changed.
pub const BACKUP_NETWORK: &str = "backup";
pub const SUPPORTED_NETWORKS: [&str; 1] = [BACKUP_NETWORK];
/// VLAN tag values that denote the un-tagged base bridge.
pub const NO_VLAN_TAGS: [&str; 3] = ["UNDEFINED", "", "1"];

/// A batched reconfiguration request as exchanged with the caller. A present `uuid` marks the batch
/// as the revert of the apply that produced it.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct BatchPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub node_subset: NodeSubset,
    #[serde(rename = "updateNetwork")]
    pub update_network: UpdateNetwork,
    /// fields this engine does not interpret are carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct NodeSubset {
    #[serde(default)]
    pub participating_computes: Vec<ParticipatingCompute>,
    #[serde(default)]
    pub num_participating_computes: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct ParticipatingCompute {
    #[serde(rename = "compute_node_alias", alias = "alias")]
    pub alias: String,
    #[serde(rename = "compute_node_hostname", alias = "hostname")]
    pub hostname: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct UpdateNetwork {
    #[serde(default)]
    pub nodes: Vec<NodeUpdate>,
    #[serde(rename = "networkServices", default)]
    pub network_services: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BatchStatus>,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errorcode: Option<String>,
}

/// Operations for one node, keyed by network name, plus the list of fields each network changes.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    #[serde(rename = "updateProperties", default)]
    pub update_properties: BTreeMap<String, Vec<String>>,
    #[serde(flatten)]
    pub networks: BTreeMap<String, Vec<Operation>>,
}

impl NodeUpdate {
    /// Whether this node changes a hostname or address that is published in the hosts file.
    pub fn changes_dns_identity(&self) -> bool {
        self.update_properties
            .values()
            .any(|fields| fields.iter().any(|f| f == "hostname" || f == "ip"))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct Operation {
    pub op: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub msg: String,
}

impl Operation {
    pub fn kind(&self) -> Option<OperationKind> {
        self.op.parse().ok()
    }

    pub fn parsed_status(&self) -> Option<OperationStatus> {
        self.status.parse().ok()
    }

    pub fn set_result(&mut self, status: OperationStatus, msg: impl Into<String>) {
        self.status = status.to_string();
        self.msg = msg.into();
    }

    pub fn compute_node_alias(&self) -> Option<&str> {
        self.payload.get("compute_node_alias").and_then(Value::as_str)
    }

    pub fn payload_str(&self, key: &str) -> Option<String> {
        value_as_string(self.payload.get(key)?)
    }

    /// The VLAN tag carried by this operation, `None` for the un-tagged base bridge.
    pub fn vlan_tag(&self) -> Option<String> {
        vlan_tag_of(&self.payload)
    }

    /// Rewrites a `vlantag` that means "no VLAN" to null.
    pub fn normalize_vlan_tag(&mut self) {
        if let Some(tag) = self.payload.get("vlantag") {
            let no_vlan = match value_as_string(tag) {
                Some(tag) => is_no_vlan(&tag),
                None => false,
            };
            if no_vlan {
                self.payload.insert("vlantag".into(), Value::Null);
            }
        }
    }
}

pub fn vlan_tag_of(payload: &Map<String, Value>) -> Option<String> {
    let tag = value_as_string(payload.get("vlantag")?)?;
    if is_no_vlan(&tag) {
        None
    } else {
        Some(tag)
    }
}

pub fn is_no_vlan(tag: &str) -> bool {
    NO_VLAN_TAGS.contains(&tag.trim())
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    CidrUpdate,
    VlanAdd,
    VlanDelete,
    DnsUpdate,
    NtpUpdate,
}

impl OperationKind {
    /// Payload keys that must be present for the operation to be accepted.
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            OperationKind::VlanDelete => &["vlantag"],
            _ => &[],
        }
    }

    pub fn is_vlan(&self) -> bool {
        matches!(self, OperationKind::VlanAdd | OperationKind::VlanDelete)
    }

    /// Entity name recorded in the ip configuration work item, `dns` for `dns_update`.
    pub fn entity_key(&self) -> String {
        self.as_ref().chars().take(3).collect()
    }
}

/// Status of a single operation. `FAILED` is accepted as a legacy spelling of `FAILURE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationStatus {
    #[strum(serialize = "NOOP")]
    Noop,
    #[strum(serialize = "SUCCESS")]
    Success,
    #[strum(to_string = "FAILURE", serialize = "FAILED")]
    #[serde(alias = "FAILED")]
    Failure,
    #[strum(serialize = "REVERTED")]
    Reverted,
}

impl OperationStatus {
    /// Significance when several operations report into one result: failures dominate.
    pub fn rank(&self) -> u8 {
        match self {
            OperationStatus::Noop => 0,
            OperationStatus::Reverted => 1,
            OperationStatus::Success => 2,
            OperationStatus::Failure => 3,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::Reverted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchStatus {
    #[strum(serialize = "NOOP")]
    Noop,
    #[strum(serialize = "SUCCESS")]
    Success,
    #[strum(serialize = "FAILURE")]
    #[serde(alias = "FAILED")]
    Failure,
}

impl BatchPayload {
    pub fn from_json(text: &str) -> anyhow::Result<BatchPayload> {
        Ok(serde_json::from_str(text)?)
    }

    pub async fn read(path: &std::path::Path) -> anyhow::Result<BatchPayload> {
        let text = tokio::fs::read_to_string(path).await?;
        tracing::trace!("read payload from {:?}", path);
        Self::from_json(&text)
    }

    /// Every operation of the payload, node level first, then network services.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.update_network
            .nodes
            .iter()
            .flat_map(|n| n.networks.values().flatten())
            .chain(self.update_network.network_services.iter())
    }

    pub fn changes_dns_identity(&self) -> bool {
        self.update_network.nodes.iter().any(NodeUpdate::changes_dns_identity)
    }
}

impl fmt::Display for BatchPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_string_pretty(&self).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}
