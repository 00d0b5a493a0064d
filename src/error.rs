use std::time::Duration;

use thiserror::Error;

use crate::wir::{TransportKind, TransportOp};

pub type RepairResult<T> = Result<T, RepairError>;

/// A remap value that does not follow the generation's wrapper encoding.
///
/// This is a programming-data corruption condition and is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unsupported remap encoding {value:#06x}: byte pair {byte_pair} carries type code {type_code:#x}")]
    UnsupportedEncoding {
        value: u16,
        byte_pair: u8,
        type_code: u8,
    },
    #[error("unsupported remap encoding {value:#06x}: byte pair {byte_pair} has fill nibble {fill:#x}")]
    UnexpectedFill { value: u16, byte_pair: u8, fill: u8 },
    #[error("two repairs requested in byte pair {byte_pair}")]
    PairConflict { byte_pair: u8 },
}

#[derive(Debug, Error)]
pub enum RepairError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The selected transport or sequencer does not implement this operation.
    #[error("{op:?} is not supported on the {transport:?} transport")]
    Unsupported {
        op: TransportOp,
        transport: TransportKind,
    },

    #[error("unsupported MBIST operation: {0}")]
    UnsupportedPattern(String),

    /// Register write rejected by the privilege checker; an unlock credential is missing.
    #[error("privilege violation on site {site} (status {status:#010x})")]
    PrivilegeViolation { site: u32, status: u32 },

    #[error("site {site} wrapper still busy after {waited:?}")]
    Timeout { site: u32, waited: Duration },

    #[error("lane already repaired")]
    AlreadyRepaired,

    #[error("no spare lane left in the targeted byte pair")]
    SpareLanesNotAvailable,

    #[error("no spare rows left in the targeted bank")]
    SpareRowsNotAvailable,

    #[error("repair impossible: {0}")]
    RepairImpossible(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Register bus I/O failure.
    #[error(transparent)]
    Bus(#[from] anyhow::Error),
}

impl RepairError {
    /// Only polling timeouts may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepairError::Timeout { .. })
    }

    pub fn unsupported(op: TransportOp, transport: TransportKind) -> Self {
        RepairError::Unsupported { op, transport }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        RepairError::InvalidArgument(msg.into())
    }
}
