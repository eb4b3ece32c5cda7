use serde::Serialize;
use serde_json::{Map, Value};
use nw_reconfig_schemas::payload::{vlan_tag_of, OperationStatus};
use crate::direction::{Direction, VlanKey};

pub mod consolidate;
pub mod merge;
pub mod validate;

/// The ip configuration work of a node: every `cidr_update` plus the DNS and NTP service updates
/// that apply to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpConfWork {
    /// network names and service keys (`dns`, `ntp`) folded into this entry
    pub entities: Vec<String>,
    pub status: OperationStatus,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlanWork {
    pub payload: Map<String, Value>,
    pub status: OperationStatus,
    pub msg: String,
}

impl VlanWork {
    pub fn vlan_tag(&self) -> Option<String> {
        vlan_tag_of(&self.payload)
    }

    pub fn payload_str(&self, key: &str) -> Option<String> {
        self.payload.get(key).and_then(Value::as_str).map(String::from)
    }
}

/// Consolidated per node view of a batch for the `backup` network. It is owned by the executor
/// while the node is processed and carries the authoritative per operation results back.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeWork {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipconf_updates: Option<IpConfWork>,
    #[serde(rename = "vlan_add_backup", skip_serializing_if = "Option::is_none")]
    pub vlan_add: Option<VlanWork>,
    #[serde(rename = "vlan_delete_backup", skip_serializing_if = "Option::is_none")]
    pub vlan_delete: Option<VlanWork>,
}

impl NodeWork {
    pub fn is_empty(&self) -> bool {
        self.ipconf_updates.is_none() && !self.has_vlan()
    }

    pub fn has_vlan(&self) -> bool {
        self.vlan_add.is_some() || self.vlan_delete.is_some()
    }

    pub fn vlan(&self, key: VlanKey) -> Option<&VlanWork> {
        match key {
            VlanKey::Add => self.vlan_add.as_ref(),
            VlanKey::Delete => self.vlan_delete.as_ref(),
        }
    }

    pub fn vlan_mut(&mut self, key: VlanKey) -> Option<&mut VlanWork> {
        match key {
            VlanKey::Add => self.vlan_add.as_mut(),
            VlanKey::Delete => self.vlan_delete.as_mut(),
        }
    }

    pub fn vlan_pending(&self, key: VlanKey, direction: Direction) -> bool {
        self.vlan(key).is_some_and(|w| direction.is_pending(w.status))
    }

    pub fn ipconf_pending(&self, direction: Direction) -> bool {
        self.ipconf_updates.as_ref().is_some_and(|w| direction.is_pending(w.status))
    }

    /// Whether anything in this item still needs work in the given direction.
    pub fn has_pending(&self, direction: Direction) -> bool {
        self.ipconf_pending(direction)
            || self.vlan_pending(VlanKey::Add, direction)
            || self.vlan_pending(VlanKey::Delete, direction)
    }

    pub fn set_vlan_result(&mut self, key: VlanKey, status: OperationStatus, msg: impl Into<String>) {
        if let Some(work) = self.vlan_mut(key) {
            work.status = status;
            work.msg = msg.into();
        }
    }

    /// Records the result on both VLAN entries, for steps that serve both.
    pub fn set_vlan_results(&mut self, status: OperationStatus, msg: &str) {
        self.set_vlan_result(VlanKey::Add, status, msg);
        self.set_vlan_result(VlanKey::Delete, status, msg);
    }

    pub fn set_ipconf_result(&mut self, status: OperationStatus, msg: impl Into<String>) {
        if let Some(work) = self.ipconf_updates.as_mut() {
            work.status = status;
            work.msg = msg.into();
        }
    }

    /// Marks every entry still waiting for work in `direction` as failed.
    pub fn fail_pending(&mut self, direction: Direction, msg: &str) {
        for key in [VlanKey::Add, VlanKey::Delete] {
            if self.vlan_pending(key, direction) {
                self.set_vlan_result(key, OperationStatus::Failure, msg);
            }
        }
        if self.ipconf_pending(direction) {
            self.set_ipconf_result(OperationStatus::Failure, msg);
        }
    }

    pub fn ipconf_has_entity(&self, entity: &str) -> bool {
        self.ipconf_updates.as_ref().is_some_and(|w| w.entities.iter().any(|e| e == entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vlan(status: OperationStatus) -> Option<VlanWork> {
        Some(VlanWork { payload: Map::new(), status, msg: String::new() })
    }

    #[test]
    fn test_pending_by_direction() {
        let work = NodeWork {
            vlan_add: vlan(OperationStatus::Noop),
            vlan_delete: vlan(OperationStatus::Reverted),
            ..Default::default()
        };
        assert!(!work.is_empty());
        assert!(!work.has_pending(Direction::Revert));
        assert!(work.has_pending(Direction::Apply));
        assert!(!NodeWork::default().has_pending(Direction::Apply));
    }

    #[test]
    fn test_vlan_results_only_touch_present_entries() {
        let mut work = NodeWork { vlan_add: vlan(OperationStatus::Success), ..Default::default() };
        work.set_vlan_results(OperationStatus::Failure, "Failed to revert");
        assert_eq!(work.vlan_add.as_ref().unwrap().status, OperationStatus::Failure);
        assert!(work.vlan_delete.is_none());
    }

    #[test]
    fn test_serialized_keys() {
        let work = NodeWork { vlan_delete: vlan(OperationStatus::Failure), ..Default::default() };
        let json = serde_json::to_value(&work).unwrap();
        assert_eq!(json["vlan_delete_backup"]["status"], "FAILURE");
        assert!(json.get("ipconf_updates").is_none());
    }
}
