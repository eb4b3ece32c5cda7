use nw_reconfig_schemas::payload::{BatchPayload, OperationStatus};
use strum_macros::Display;
use crate::error::{ErrorCode, NetworkErrorCode, OperationError};

/// Whether a batch installs a new configuration or undoes a previous one. Every direction
/// dependent choice in the engine is derived from this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Direction {
    Apply,
    Revert,
}

/// The two VLAN result entries tracked per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VlanKey {
    Add,
    Delete,
}

impl VlanKey {
    pub fn result_key(&self, network: &str) -> String {
        match self {
            VlanKey::Add => format!("vlan_add_{network}"),
            VlanKey::Delete => format!("vlan_delete_{network}"),
        }
    }
}

impl Direction {
    /// A payload carrying a non empty `uuid` reverts the batch identified by it.
    pub fn infer(payload: &BatchPayload) -> Direction {
        match payload.uuid.as_deref() {
            Some(uuid) if !uuid.trim().is_empty() => Direction::Revert,
            _ => Direction::Apply,
        }
    }

    pub fn is_revert(&self) -> bool {
        matches!(self, Direction::Revert)
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Direction::Apply => ErrorCode::APPLY_FAILED,
            Direction::Revert => ErrorCode::REVERT_FAILED,
        }
    }

    pub fn network_error(&self) -> NetworkErrorCode {
        match self {
            Direction::Apply => NetworkErrorCode::ReconfigurationFailed,
            Direction::Revert => NetworkErrorCode::ReconfigurationRevertFailed,
        }
    }

    /// Generic failure of a step in this direction.
    pub fn step_failure(&self, msg: impl Into<String>) -> OperationError {
        let msg = msg.into();
        match self {
            Direction::Apply => OperationError::ApplyFailed { msg },
            Direction::Revert => OperationError::RevertFailed { msg },
        }
    }

    pub fn stale_bridge_failure(&self, msg: impl Into<String>) -> OperationError {
        OperationError::StaleBridgeDeleteFailed { direction: *self, msg: msg.into() }
    }

    /// Status an operation ends in when its work completed.
    pub fn completed_status(&self) -> OperationStatus {
        match self {
            Direction::Apply => OperationStatus::Success,
            Direction::Revert => OperationStatus::Reverted,
        }
    }

    /// Whether an entry with this status needs work. Reverts only touch entries that were applied
    /// or half applied, so a revert can be re-submitted safely.
    pub fn is_pending(&self, status: OperationStatus) -> bool {
        match self {
            Direction::Apply => true,
            Direction::Revert => matches!(status, OperationStatus::Success | OperationStatus::Failure),
        }
    }

    /// Result entry charged when creating a bonded bridge fails. A revert creates the bridge the
    /// deleted VLAN used, an apply creates the bridge of the added VLAN.
    pub fn bridge_add_result_key(&self) -> VlanKey {
        match self {
            Direction::Apply => VlanKey::Add,
            Direction::Revert => VlanKey::Delete,
        }
    }

    /// Result entry charged when removing a bonded bridge fails.
    pub fn bridge_delete_result_key(&self) -> VlanKey {
        match self {
            Direction::Apply => VlanKey::Delete,
            Direction::Revert => VlanKey::Add,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Direction::Apply => "Network Reconfiguration",
            Direction::Revert => "REVERT Network Reconfiguration",
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Direction::Apply => "operation successful",
            Direction::Revert => "reverted successfully",
        }
    }
}
