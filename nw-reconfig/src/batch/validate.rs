use std::collections::BTreeSet;
use nw_reconfig_schemas::payload::{BatchPayload, Operation, SUPPORTED_NETWORKS};
use crate::direction::Direction;
use crate::error::ValidationError;

fn invalid_input(msg: String) -> ValidationError {
    tracing::error!("{}", msg);
    ValidationError::InvalidInput { msg }
}

fn invalid_operation(msg: String) -> ValidationError {
    tracing::error!("{}", msg);
    ValidationError::InvalidOperation { msg }
}

/// Checks a batch before anything is touched and normalizes `vlantag` values meaning "no VLAN" to
/// null.
pub fn validate_payload(payload: &mut BatchPayload, direction: Direction) -> Result<(), ValidationError> {
    let node_count = payload.update_network.nodes.len();
    if payload.node_subset.num_participating_computes != node_count {
        return Err(invalid_input(format!(
            "Node count mismatch in updateNetwork section of payload with num_participating_computes ({} != {})",
            node_count, payload.node_subset.num_participating_computes
        )));
    }

    if direction.is_revert() && payload.uuid.as_deref().map_or(true, |u| u.trim().is_empty()) {
        return Err(invalid_input("UUID missing in payload.".to_string()));
    }

    for operation in payload.operations() {
        if operation.status.trim().is_empty() {
            return Err(invalid_input(format!(
                "Status missing for the operation. Operation: {}", describe(operation)
            )));
        }
        if operation.parsed_status().is_none() {
            return Err(invalid_input(format!(
                "Unknown status {} for the operation {}", operation.status, describe(operation)
            )));
        }
    }

    let aliases: BTreeSet<String> = payload.node_subset.participating_computes
        .iter()
        .map(|c| c.alias.clone())
        .collect();

    for node in payload.update_network.nodes.iter_mut() {
        for (network, operations) in node.networks.iter_mut() {
            if !SUPPORTED_NETWORKS.contains(&network.as_str()) {
                if operations.is_empty() {
                    continue;
                }
                return Err(invalid_operation(format!(
                    "Changes in unsupported network {network} identified. Exiting."
                )));
            }
            for operation in operations.iter_mut() {
                check_operation(operation)?;
                match operation.compute_node_alias() {
                    Some(alias) if aliases.contains(alias) => {}
                    Some(alias) => return Err(invalid_input(format!(
                        "Operation {} names unknown compute node {alias}", operation.op
                    ))),
                    None => return Err(invalid_input(format!(
                        "compute_node_alias missing for the operation {}", describe(operation)
                    ))),
                }
                operation.normalize_vlan_tag();
            }
        }
    }

    for service in payload.update_network.network_services.iter_mut() {
        check_operation(service)?;
        if let Some(alias) = service.compute_node_alias() {
            if !aliases.contains(alias) {
                return Err(invalid_input(format!(
                    "Network service operation {} names unknown compute node {alias}", service.op
                )));
            }
        }
        service.normalize_vlan_tag();
    }

    Ok(())
}

fn check_operation(operation: &Operation) -> Result<(), ValidationError> {
    let Some(kind) = operation.kind() else {
        return Err(invalid_operation(format!(
            "Invalid network reconfiguration operation {}", operation.op
        )));
    };
    let missing: Vec<&str> = kind.required_keys()
        .iter()
        .copied()
        .filter(|key| !operation.payload.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(invalid_operation(format!(
            "Missing data {:?} in payload to perform operation {}", missing, operation.op
        )));
    }
    Ok(())
}

fn describe(operation: &Operation) -> String {
    serde_json::to_string(operation).unwrap_or_else(|_| operation.op.clone())
}
