use std::collections::BTreeMap;
use serde_json::Value;
use nw_reconfig_schemas::payload::{BatchPayload, Operation, OperationKind, OperationStatus};
use crate::batch::{IpConfWork, NodeWork, VlanWork};
use crate::direction::Direction;

/// Status and message a consolidated entry starts from. An apply starts every entry from scratch.
fn initial_result(operation: &Operation, direction: Direction) -> (OperationStatus, String) {
    match direction {
        Direction::Apply => (OperationStatus::Noop, String::new()),
        Direction::Revert => (
            operation.parsed_status().unwrap_or(OperationStatus::Noop),
            operation.msg.clone(),
        ),
    }
}

fn fold_into_ipconf(work: &mut NodeWork, entity: &str, status: OperationStatus, msg: &str) {
    match work.ipconf_updates.as_mut() {
        None => {
            work.ipconf_updates = Some(IpConfWork {
                entities: vec![entity.to_string()],
                status,
                msg: msg.to_string(),
            });
        }
        Some(ipconf) => {
            if !ipconf.entities.iter().any(|e| e == entity) {
                ipconf.entities.push(entity.to_string());
            }
            if status.rank() > ipconf.status.rank() {
                ipconf.status = status;
                ipconf.msg = msg.to_string();
            }
        }
    }
}

/// Builds the per node work items of a validated batch, keyed by compute node alias. Every
/// participating compute gets an entry, possibly empty.
pub fn consolidate(payload: &BatchPayload, direction: Direction) -> BTreeMap<String, NodeWork> {
    let mut work: BTreeMap<String, NodeWork> = payload.node_subset.participating_computes
        .iter()
        .map(|c| (c.alias.clone(), NodeWork::default()))
        .collect();

    for node in &payload.update_network.nodes {
        for (network, operations) in &node.networks {
            for operation in operations {
                let Some(alias) = operation.compute_node_alias() else { continue };
                let Some(node_work) = work.get_mut(alias) else {
                    tracing::warn!("operation {} for unknown node {} ignored", operation.op, alias);
                    continue;
                };
                let (status, msg) = initial_result(operation, direction);
                let vlan = || VlanWork { payload: operation.payload.clone(), status, msg: msg.clone() };
                match operation.kind() {
                    Some(OperationKind::CidrUpdate) => fold_into_ipconf(node_work, network, status, &msg),
                    Some(OperationKind::VlanAdd) => node_work.vlan_add = Some(vlan()),
                    Some(OperationKind::VlanDelete) => node_work.vlan_delete = Some(vlan()),
                    Some(kind) => fold_into_ipconf(node_work, &kind.entity_key(), status, &msg),
                    None => {}
                }
            }
        }
    }

    for service in &payload.update_network.network_services {
        let Some(kind) = service.kind() else { continue };
        let (status, msg) = initial_result(service, direction);
        for (alias, node_work) in work.iter_mut() {
            if service.compute_node_alias().is_some_and(|a| a != alias) {
                continue;
            }
            fold_into_ipconf(node_work, &kind.entity_key(), status, &msg);
        }
    }

    work
}

/// Resets every operation of an apply batch to `NOOP` and gives each node its own copy of service
/// operations that do not name a node, so results can be reported per node.
pub fn prepare_apply(payload: &mut BatchPayload) {
    for operation in payload.update_network.nodes.iter_mut().flat_map(|n| n.networks.values_mut().flatten()) {
        operation.set_result(OperationStatus::Noop, "");
    }
    let aliases: Vec<String> = payload.node_subset.participating_computes.iter().map(|c| c.alias.clone()).collect();
    let services = std::mem::take(&mut payload.update_network.network_services);
    for mut service in services {
        service.set_result(OperationStatus::Noop, "");
        if service.compute_node_alias().is_some() {
            payload.update_network.network_services.push(service);
            continue;
        }
        for alias in &aliases {
            let mut copy = service.clone();
            copy.payload.insert("compute_node_alias".into(), Value::from(alias.clone()));
            payload.update_network.network_services.push(copy);
        }
    }
}
