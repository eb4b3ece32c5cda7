use std::fmt;
use thiserror::Error;
use crate::direction::Direction;

/// Numeric engine error code, printed as `0x8001` style hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const INVALID_INPUT: ErrorCode = ErrorCode(0x8001);
    pub const REBOOT_FAILED: ErrorCode = ErrorCode(0x8002);
    pub const UNSUPPORTED: ErrorCode = ErrorCode(0x8005);
    pub const APPLY_FAILED: ErrorCode = ErrorCode(0x8006);
    pub const REVERT_FAILED: ErrorCode = ErrorCode(0x8007);
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Operator facing classification written into `updateNetwork.errorcode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorCode {
    OperationSuccessful,
    InvalidInputParameter,
    InvalidOperation,
    InvalidReconfigOperation,
    ReconfigurationFailed,
    RebootFailed,
    StaleBridgeDeleteFailed,
    ReconfigurationRevertFailed,
}

impl NetworkErrorCode {
    pub fn code(&self) -> u32 {
        match self {
            NetworkErrorCode::OperationSuccessful => 0x0000_0000,
            NetworkErrorCode::InvalidInputParameter => 0x0204_0000,
            NetworkErrorCode::InvalidOperation => 0x0204_0001,
            NetworkErrorCode::InvalidReconfigOperation => 0x0204_0002,
            NetworkErrorCode::ReconfigurationFailed => 0x0204_0003,
            NetworkErrorCode::RebootFailed => 0x0204_0004,
            NetworkErrorCode::StaleBridgeDeleteFailed => 0x0204_0005,
            NetworkErrorCode::ReconfigurationRevertFailed => 0x0204_0006,
        }
    }

    pub fn hex(&self) -> String {
        format!("0x{:08X}", self.code())
    }

    pub fn description(&self) -> &'static str {
        match self {
            NetworkErrorCode::OperationSuccessful => "Operation successful",
            NetworkErrorCode::InvalidInputParameter => "Failed due to input payload missing or not proper",
            NetworkErrorCode::InvalidOperation => "This action is supported only for OCI EXACC environment",
            NetworkErrorCode::InvalidReconfigOperation => "Invalid network reconfiguration operation",
            NetworkErrorCode::ReconfigurationFailed => "Network reconfiguration operation failed",
            NetworkErrorCode::RebootFailed => "Failed to reboot the Guest VM",
            NetworkErrorCode::StaleBridgeDeleteFailed => "Failed to delete stale bridge",
            NetworkErrorCode::ReconfigurationRevertFailed => "Network reconfiguration revert operation failed",
        }
    }

    /// Whether re-submitting the same batch can be expected to help.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            NetworkErrorCode::ReconfigurationFailed
                | NetworkErrorCode::RebootFailed
                | NetworkErrorCode::StaleBridgeDeleteFailed
        )
    }
}

/// Schema or consistency problems found before anything is mutated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{msg}")]
    InvalidInput {
        msg: String,
    },
    #[error("{msg}")]
    InvalidOperation {
        msg: String,
    },
}

impl ValidationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ValidationError::InvalidInput { .. } => ErrorCode::INVALID_INPUT,
            ValidationError::InvalidOperation { .. } => ErrorCode::UNSUPPORTED,
        }
    }

    pub fn network_error(&self) -> NetworkErrorCode {
        match self {
            ValidationError::InvalidInput { .. } => NetworkErrorCode::InvalidInputParameter,
            ValidationError::InvalidOperation { .. } => NetworkErrorCode::InvalidReconfigOperation,
        }
    }
}

/// Failure of a step while working on one node pair. The orchestrator folds these into the batch
/// result and moves on to the next node pair.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("{msg}")]
    ApplyFailed {
        msg: String,
    },
    #[error("{msg}")]
    RevertFailed {
        msg: String,
    },
    #[error("{msg}")]
    StaleBridgeDeleteFailed {
        direction: Direction,
        msg: String,
    },
    #[error("{msg}")]
    RebootFailed {
        msg: String,
    },
}

impl OperationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OperationError::ApplyFailed { .. } => ErrorCode::APPLY_FAILED,
            OperationError::RevertFailed { .. } => ErrorCode::REVERT_FAILED,
            OperationError::StaleBridgeDeleteFailed { direction, .. } => direction.error_code(),
            OperationError::RebootFailed { .. } => ErrorCode::REBOOT_FAILED,
        }
    }

    pub fn network_error(&self) -> NetworkErrorCode {
        match self {
            OperationError::ApplyFailed { .. } => NetworkErrorCode::ReconfigurationFailed,
            OperationError::RevertFailed { .. } => NetworkErrorCode::ReconfigurationRevertFailed,
            OperationError::StaleBridgeDeleteFailed { .. } => NetworkErrorCode::StaleBridgeDeleteFailed,
            OperationError::RebootFailed { .. } => NetworkErrorCode::RebootFailed,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            OperationError::ApplyFailed { msg }
            | OperationError::RevertFailed { msg }
            | OperationError::StaleBridgeDeleteFailed { msg, .. }
            | OperationError::RebootFailed { msg } => msg,
        }
    }
}

/// Errors that abort a whole batch before any node is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{msg}")]
    UnsupportedHypervisor {
        msg: String,
    },
}

impl BatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BatchError::Validation(err) => err.code(),
            BatchError::UnsupportedHypervisor { .. } => ErrorCode::UNSUPPORTED,
        }
    }

    pub fn network_error(&self) -> NetworkErrorCode {
        match self {
            BatchError::Validation(err) => err.network_error(),
            BatchError::UnsupportedHypervisor { .. } => NetworkErrorCode::InvalidOperation,
        }
    }
}
