use std::collections::BTreeMap;
use nw_reconfig_schemas::payload::{BatchPayload, BatchStatus, Operation, OperationKind, OperationStatus};
use crate::batch::NodeWork;

fn copy_result(operation: &mut Operation, status: OperationStatus, msg: &str) {
    operation.set_result(status, msg);
}

/// Writes the per node results back into the operations of the original payload.
pub fn merge_results(payload: &mut BatchPayload, results: &BTreeMap<String, NodeWork>) {
    for operation in payload.update_network.nodes.iter_mut().flat_map(|n| n.networks.values_mut().flatten()) {
        let Some(work) = operation.compute_node_alias().and_then(|a| results.get(a)) else { continue };
        let result = match operation.kind() {
            Some(OperationKind::VlanAdd) => work.vlan_add.as_ref().map(|w| (w.status, w.msg.clone())),
            Some(OperationKind::VlanDelete) => work.vlan_delete.as_ref().map(|w| (w.status, w.msg.clone())),
            Some(_) => work.ipconf_updates.as_ref().map(|w| (w.status, w.msg.clone())),
            None => None,
        };
        if let Some((status, msg)) = result {
            copy_result(operation, status, &msg);
        }
    }

    for service in payload.update_network.network_services.iter_mut() {
        let result = match service.compute_node_alias() {
            Some(alias) => results.get(alias)
                .and_then(|w| w.ipconf_updates.as_ref())
                .map(|w| (w.status, w.msg.clone())),
            // shared by every node, report the most significant outcome
            None => results.values()
                .filter_map(|w| w.ipconf_updates.as_ref())
                .max_by_key(|w| w.status.rank())
                .map(|w| (w.status, w.msg.clone())),
        };
        if let Some((status, msg)) = result {
            copy_result(service, status, &msg);
        }
    }
}

/// `FAILURE` when any operation failed, `SUCCESS` when something was applied or reverted,
/// otherwise `NOOP`.
pub fn batch_status(payload: &BatchPayload) -> BatchStatus {
    let statuses: Vec<OperationStatus> = payload.operations().filter_map(Operation::parsed_status).collect();
    if statuses.contains(&OperationStatus::Failure) {
        BatchStatus::Failure
    } else if statuses.iter().any(OperationStatus::is_completed) {
        BatchStatus::Success
    } else {
        BatchStatus::Noop
    }
}

/// First operation still marked `FAILURE` once the results are merged.
pub fn first_failure(payload: &BatchPayload) -> Option<&Operation> {
    payload.operations().find(|o| o.parsed_status() == Some(OperationStatus::Failure))
}
